//! Bearer authentication middleware for protected routes.
//!
//! Verification failures are always surfaced as the same opaque 401; the
//! logs keep the failure class (never the token). A verified subject is
//! resolved to a `User` row, auto-provisioning on first contact, and the
//! user rides request extensions from here on.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::jwt;
use crate::persistence::Identity;
use crate::{ApiError, AppState};

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = match jwt::bearer_token(req.headers()) {
        Ok(token) => token.to_string(),
        Err(e) => {
            warn!("authentication failed: {e}");
            return ApiError::AuthenticationFailed.into_response();
        }
    };

    let claims = match state.verifier.verify(&token).await {
        Ok(claims) => claims,
        Err(e) => {
            warn!("authentication failed: {e}");
            return ApiError::AuthenticationFailed.into_response();
        }
    };

    let identity = Identity {
        subject: claims.sub,
        email: claims.email,
    };
    let user = match state.db.get_or_create_user(&identity).await {
        Ok(user) => user,
        Err(e) => {
            error!("user lookup failed during authentication: {e}");
            return ApiError::UserAccessFailed.into_response();
        }
    };
    if !user.active {
        warn!(user = %user.id, "rejected inactive account");
        return ApiError::AuthenticationFailed.into_response();
    }

    req.extensions_mut().insert(user);
    next.run(req).await
}
