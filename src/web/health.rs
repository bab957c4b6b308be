//! Operational endpoints: probes, version, and the service catalog.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use crate::templates::AnalysisType;
use crate::{ApiError, AppState};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let active_jobs = state.jobs.active_count().await.map_err(|e| {
        warn!("health check could not count jobs: {e}");
        ApiError::ServiceUnavailable
    })?;
    Ok(Json(json!({
        "status": "ok",
        "active_jobs": active_jobs,
    })))
}

pub async fn live() -> Json<Value> {
    Json(json!({"status": "live"}))
}

/// Ready only when persistence answers and at least one analyzer is healthy.
pub async fn ready(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    if let Err(e) = state.db.ping().await {
        warn!("readiness: persistence unreachable: {e}");
        return Err(ApiError::ServiceUnavailable);
    }
    if !state.registry.has_healthy_analyzer() {
        warn!("readiness: no healthy analyzer registered");
        return Err(ApiError::ServiceUnavailable);
    }
    Ok(Json(json!({
        "status": "ready",
        "checks": {"db": "ok", "analyzer": "ok"},
    })))
}

pub async fn version(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": state.settings.app_name,
        "version": state.settings.app_version,
        "git_sha": state.settings.git_sha,
    }))
}

pub async fn services(State(state): State<Arc<AppState>>) -> Json<Value> {
    let descriptors = state.registry.list();
    let analysis_types: Value = AnalysisType::ALL
        .iter()
        .map(|t| {
            (
                t.as_str().to_string(),
                json!({"capability": t.capability()}),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "services": descriptors,
        "analysis_types": analysis_types,
    }))
}

pub async fn services_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let results = state.registry.health_check_all(PROBE_TIMEOUT).await;

    let descriptors = state.registry.list();
    let optimizer_up = descriptors.iter().any(|d| {
        d.available
            && d.service_types
                .contains(&crate::registry::ServiceType::PromptOptimizer)
    });
    let analyzer_up = state.registry.has_healthy_analyzer();

    Json(json!({
        "overall_healthy": optimizer_up && analyzer_up,
        "services": results,
    }))
}
