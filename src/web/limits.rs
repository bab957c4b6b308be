//! Request body size cap.
//!
//! The declared Content-Length is checked before anything reads or parses
//! the body; chunked uploads without a length are caught by the router's
//! body-limit layer instead.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::{ApiError, AppState};

pub async fn enforce_body_cap(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if let Some(length) = declared {
        if length > state.settings.body_max_bytes as u64 {
            warn!(
                length,
                cap = state.settings.body_max_bytes,
                "rejecting oversized request body"
            );
            return ApiError::RequestTooLarge.into_response();
        }
    }

    next.run(req).await
}
