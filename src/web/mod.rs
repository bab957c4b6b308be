//! HTTP route assembly and the per-request middleware chain.

pub mod analysis;
pub mod auth;
pub mod extract;
pub mod health;
pub mod limits;
pub mod users;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tracing::warn;

use crate::persistence::User;
use crate::{correlation, ip, ApiError, AppState};

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/process", post(analysis::process))
        .route("/analyze-async", post(analysis::submit_async))
        .route(
            "/analyze-async/:job_id",
            get(analysis::job_status).delete(analysis::cancel_job),
        )
        .route("/me", get(users::me))
        .route("/me/usage", get(users::usage))
        // route_layer order: the last layer added runs first, so requests
        // authenticate before they spend rate-limit tokens.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            enforce_rate_limits,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/live", get(health::live))
        .route("/ready", get(health::ready))
        .route("/version", get(health::version))
        .route("/services", get(health::services))
        .route("/services/health", get(health::services_health))
        .merge(protected)
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(state.settings.body_max_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            limits::enforce_body_cap,
        ))
        .layer(middleware::from_fn(correlation::propagate_request_id))
        .with_state(state)
}

/// Routing-level 404 in the uniform envelope.
async fn not_found() -> Response {
    crate::error_response(
        axum::http::StatusCode::NOT_FOUND,
        "HTTP_EXCEPTION",
        "Not Found",
    )
}

/// User bucket first, then the IP bucket; the first denial short-circuits.
/// A request whose client address cannot be established is denied at the IP
/// tier rather than sharing an "unknown" bucket with every other stray.
async fn enforce_rate_limits(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let user = req.extensions().get::<User>().cloned();
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    let (limit, remaining) = if let Some(user) = &user {
        let decision = state
            .user_limiter
            .consume(&format!("user:{}", user.id), 1);
        if !decision.allowed {
            return ApiError::RateLimitExceeded {
                retry_after: decision.retry_after,
            }
            .into_response();
        }
        (state.user_limiter.limit_per_minute(), decision.remaining)
    } else {
        (state.ip_limiter.limit_per_minute(), 0)
    };

    match ip::client_ip(peer, req.headers()) {
        Some(addr) => {
            let decision = state.ip_limiter.consume(&format!("ip:{addr}"), 1);
            if !decision.allowed {
                return ApiError::RateLimitExceeded {
                    retry_after: decision.retry_after,
                }
                .into_response();
            }
        }
        None => {
            warn!("denying request without an attributable client address");
            return ApiError::RateLimitExceeded { retry_after: None }.into_response();
        }
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    response
}
