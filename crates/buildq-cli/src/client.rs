//! HTTP client for the administration API.

use buildq_api::handlers::admin::{CancelBuildResponse, ListBuildsResponse, ListWorkersResponse};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Server error ({status}): {message}")]
    Server { status: StatusCode, message: String },
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ApiError::NotFound(message),
            StatusCode::BAD_REQUEST => ApiError::BadRequest(message),
            _ => ApiError::Server { status, message },
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request(Method::GET, path).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_builds(&self, tasks: bool) -> Result<ListBuildsResponse, ApiError> {
        self.get_json(&format!("/api/v1/builds?tasks={tasks}")).await
    }

    pub async fn list_workers(&self) -> Result<ListWorkersResponse, ApiError> {
        self.get_json("/api/v1/workers").await
    }

    pub async fn cancel_build(&self, build_id: &str) -> Result<CancelBuildResponse, ApiError> {
        let response = self
            .request(Method::POST, &format!("/api/v1/builds/{build_id}/cancel"))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn reschedule(&self) -> Result<(), ApiError> {
        let response = self.request(Method::POST, "/api/v1/reschedule").send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn get_log(&self, instance: &str) -> Result<String, ApiError> {
        let response = self
            .request(Method::GET, &format!("/logs/{instance}"))
            .send()
            .await?;
        Ok(Self::check(response).await?.text().await?)
    }
}
