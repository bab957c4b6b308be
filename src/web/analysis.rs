//! Analysis endpoints: synchronous processing and async job handling.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::extract::ApiJson;
use crate::persistence::{JobRecord, User};
use crate::templates::AnalysisType;
use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub user_input: String,
    #[serde(default)]
    pub analysis_type: Option<AnalysisType>,
}

#[derive(Debug, Deserialize)]
pub struct AsyncRequest {
    pub user_input: String,
}

pub async fn process(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    ApiJson(req): ApiJson<ProcessRequest>,
) -> Result<Json<Value>, ApiError> {
    let analysis_type = req.analysis_type.unwrap_or(AnalysisType::Custom);
    info!(
        user = %user.id,
        %analysis_type,
        input_len = req.user_input.len(),
        "processing analysis request"
    );

    let outcome = state
        .pipeline
        .process(&user, &req.user_input, analysis_type)
        .await?;

    Ok(Json(json!({
        "analysis_type": outcome.analysis_type,
        "optimized_prompt": outcome.optimized_prompt,
        "analysis_result": outcome.analysis_result,
        "services_used": {
            "prompt_optimizer": outcome.optimizer,
            "analyzer": outcome.analyzer,
        },
    })))
}

pub async fn submit_async(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    ApiJson(req): ApiJson<AsyncRequest>,
) -> Result<Json<Value>, ApiError> {
    state.pipeline.validate_input(&req.user_input)?;

    let job = state.jobs.submit(&req.user_input, Some(user.id)).await?;
    Ok(Json(json!({
        "job_id": job.job_id,
        "status": job.status,
        "created_at": job.created_at,
    })))
}

pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state
        .db
        .get_job(job_id)
        .await?
        .filter(|job| job.owner_user_id == Some(user.id))
        .ok_or(ApiError::JobNotFound)?;
    Ok(Json(job_snapshot(&job)))
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    // Ownership check before the cancel flip.
    state
        .db
        .get_job(job_id)
        .await?
        .filter(|job| job.owner_user_id == Some(user.id))
        .ok_or(ApiError::JobNotFound)?;

    let job = state.jobs.cancel(job_id).await?;
    Ok(Json(job_snapshot(&job)))
}

/// Job ids are UUID v4 by construction; anything else is a payload error,
/// not a missing record.
fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .ok()
        .filter(|id| id.get_version_num() == 4)
        .ok_or(ApiError::ValidationFailed)
}

fn job_snapshot(job: &JobRecord) -> Value {
    json!({
        "job_id": job.job_id,
        "status": job.status,
        "created_at": job.created_at,
        "completed_at": job.completed_at,
        "optimized_prompt": job.stage1_output,
        "final_output": job.final_output,
        "error_code": job.error_code,
    })
}
