//! Per-request correlation IDs.
//!
//! A client-supplied `X-Request-ID` is honored only when it is UUID-shaped;
//! anything else is replaced with a fresh v4. The id rides a task-local for
//! the life of the request so error responses and log lines can reach it
//! without threading it through every signature.

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// The correlation id of the request currently being handled, or `-` when
/// called outside a request scope (startup, workers).
pub fn current_request_id() -> String {
    REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| "-".to_string())
}

pub fn is_uuid_shaped(candidate: &str) -> bool {
    Uuid::try_parse(candidate).is_ok()
}

pub async fn propagate_request_id(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| is_uuid_shaped(v))
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path(),
    );

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(req).instrument(span))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_shaped_ids_are_accepted() {
        assert!(is_uuid_shaped("2c9a4b1e-43a1-4f8e-9d7e-0a1b2c3d4e5f"));
        assert!(is_uuid_shaped(&Uuid::new_v4().to_string()));
    }

    #[test]
    fn non_uuid_ids_are_rejected() {
        assert!(!is_uuid_shaped("trace-me-please"));
        assert!(!is_uuid_shaped(""));
        assert!(!is_uuid_shaped("2c9a4b1e-43a1-4f8e-9d7e"));
        assert!(!is_uuid_shaped("not!a@uuid#at$all"));
    }

    #[tokio::test]
    async fn outside_a_request_scope_the_id_is_a_dash() {
        assert_eq!(current_request_id(), "-");
    }

    #[tokio::test]
    async fn scoped_id_is_visible_to_nested_calls() {
        let id = Uuid::new_v4().to_string();
        let seen = REQUEST_ID
            .scope(id.clone(), async { current_request_id() })
            .await;
        assert_eq!(seen, id);
    }
}
