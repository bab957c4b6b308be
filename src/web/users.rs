//! Authenticated user profile endpoints.

use axum::{Extension, Json};
use serde_json::{json, Value};

use crate::persistence::User;

pub async fn me(Extension(user): Extension<User>) -> Json<Value> {
    Json(json!({
        "id": user.id,
        "email": user.email,
        "tier": user.tier,
        "active": user.active,
        "created_at": user.created_at,
    }))
}

pub async fn usage(Extension(user): Extension<User>) -> Json<Value> {
    Json(json!({
        "queries_used": user.queries_used,
        "queries_limit": user.queries_limit,
        "tier": user.tier,
    }))
}
