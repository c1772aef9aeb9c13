//! Mapping of scheduler errors onto HTTP responses.

use axum::http::StatusCode;
use buildq_core::Error;

pub fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::BadRequest(_) => StatusCode::BAD_REQUEST,
        Error::TerminalBuild(_) => StatusCode::PRECONDITION_FAILED,
        Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Handler error in the `(StatusCode, String)` form returned by every route.
pub fn api_error(err: Error) -> (StatusCode, String) {
    (status_code(&err), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (Error::build_not_found("b1"), StatusCode::NOT_FOUND),
            (Error::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (Error::TerminalBuild("b1".into()), StatusCode::PRECONDITION_FAILED),
            (Error::Unavailable("none".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, code) in cases {
            assert_eq!(status_code(&err), code, "{err}");
        }
    }
}
