//! Key check for the management API

use crate::{ApiError, AppState};
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::debug;

/// Require `Authorization: <key>` on every request
pub async fn require_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if presented != Some(state.key.as_str()) {
        debug!(path = %request.uri().path(), "Rejected API request without valid key");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}
