//! JSON extractor that speaks the error envelope.
//!
//! Framework-level payload problems (bad JSON, wrong types, missing fields,
//! over-limit bodies) are mapped to the envelope in one place instead of
//! leaking axum's default plain-text rejections.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::ApiError;

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => {
                warn!("request payload rejected: {rejection}");
                if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    Err(ApiError::RequestTooLarge)
                } else {
                    Err(ApiError::ValidationFailed)
                }
            }
        }
    }
}
