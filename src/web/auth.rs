//! Pre-shared key authentication
//!
//! When `auth.api_key` is configured every request must carry the key in
//! the `X-API-Key` header; no other header is accepted.

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::error::AppError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    // CORS preflights never carry credentials
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    if let Some(expected) = state.config.auth.api_key.as_deref() {
        let presented = request
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected) {
            return Err(AppError::Unauthorized);
        }
    }

    Ok(next.run(request).await)
}
