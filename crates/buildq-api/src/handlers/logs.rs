//! Task log retrieval.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use buildq_core::protocol::LogLine;

use crate::error::api_error;
use crate::state::AppState;

/// Render the log of a task instance as plain text.
pub async fn get_log(
    State(state): State<Arc<AppState>>,
    Path(instance): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut reader = state.logs.read(&instance).map_err(api_error)?;
    let mut body = String::new();
    loop {
        match reader.read_line() {
            Ok(Some(line)) => body.push_str(&format_line(&line)),
            Ok(None) => break,
            Err(err) => {
                reader.close();
                return Err(api_error(err));
            }
        }
    }
    reader.close();
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}

pub fn format_line(line: &LogLine) -> String {
    format!(
        "{} [{:>7}] {}\n",
        line.time.format("%Y-%m-%d %H:%M:%S%.3f"),
        line.level.label(),
        line.message
    )
}
