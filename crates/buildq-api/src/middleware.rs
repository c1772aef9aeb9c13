//! HTTP middleware for the API server.

use axum::{
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Create CORS middleware layer.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .allow_origin(Any)
}

/// Tag each request and its response with an id, reusing the caller's when
/// one is supplied.
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let id = match request.headers().get(REQUEST_ID_HEADER) {
        Some(value) => value.clone(),
        None => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(request).await,
        },
    };
    request.headers_mut().insert(REQUEST_ID_HEADER, id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(REQUEST_ID_HEADER, id);
    response
}
