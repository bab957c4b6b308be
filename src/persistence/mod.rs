//! The narrow persistence port the service plane depends on.
//!
//! The port exposes no transaction object; where the orchestrator needs
//! multi-row atomicity (usage increment + query log) the adapter provides it
//! behind `record_completion`.

pub mod memory;
pub mod postgres;
mod schema;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Default monthly quota for auto-provisioned accounts.
pub const DEFAULT_QUERIES_LIMIT: i32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("user not found")]
    UserNotFound,
    #[error("job not found")]
    JobNotFound,
    #[error("query limit exhausted")]
    QuotaExhausted,
    #[error("stale update: row state changed underneath")]
    Conflict,
    #[error("database error: {0}")]
    Backend(String),
}

/// Verified identity handed down by the auth layer.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub external_id: Option<String>,
    pub tier: String,
    pub queries_used: i32,
    pub queries_limit: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    #[serde(rename = "PROCESSING_STAGE1")]
    ProcessingStage1,
    #[serde(rename = "PROCESSING_STAGE2")]
    ProcessingStage2,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::ProcessingStage1 => "PROCESSING_STAGE1",
            JobStatus::ProcessingStage2 => "PROCESSING_STAGE2",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<JobStatus> {
        match raw {
            "QUEUED" => Some(JobStatus::Queued),
            "PROCESSING_STAGE1" => Some(JobStatus::ProcessingStage1),
            "PROCESSING_STAGE2" => Some(JobStatus::ProcessingStage2),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Legal forward moves: the happy path is strictly ordered and FAILED is
    /// reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, ProcessingStage1)
            | (ProcessingStage1, ProcessingStage2)
            | (ProcessingStage2, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub owner_user_id: Option<Uuid>,
    pub status: JobStatus,
    pub input: String,
    pub stage1_output: Option<String>,
    pub final_output: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One stage write: the transition plus its payload, applied only when the
/// row still holds `expected_status`.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub expected_status: JobStatus,
    pub status: JobStatus,
    pub stage1_output: Option<String>,
    pub final_output: Option<String>,
    pub error_code: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewQueryLog {
    pub user_id: Option<Uuid>,
    pub input: String,
    pub optimized_prompt: Option<String>,
    pub result: Option<String>,
    pub latency_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepCounts {
    pub deleted: u64,
    pub stale_failed: u64,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Look the identity up by external subject, then by email (backfilling
    /// the subject), and auto-provision a free-tier account otherwise.
    async fn get_or_create_user(&self, identity: &Identity) -> Result<User, DbError>;

    /// Atomic, conditional quota increment. Fails with `QuotaExhausted` when
    /// `queries_used` already reached `queries_limit`.
    async fn increment_usage(&self, user_id: Uuid) -> Result<i32, DbError>;

    async fn insert_query_log(&self, entry: NewQueryLog) -> Result<(), DbError>;

    /// Usage increment and success log in one transaction: both commit or
    /// neither does. Returns the new usage count.
    async fn record_completion(&self, user_id: Uuid, entry: NewQueryLog) -> Result<i32, DbError>;

    async fn create_job(&self, input: &str, owner: Option<Uuid>) -> Result<JobRecord, DbError>;

    /// Hand the oldest QUEUED job to the caller, flipping it to
    /// PROCESSING_STAGE1 in the same conditional step so no two workers ever
    /// claim the same job.
    async fn claim_next_job(&self) -> Result<Option<JobRecord>, DbError>;

    /// Optimistic stage write; `Conflict` when the job no longer holds the
    /// expected status.
    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<(), DbError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, DbError>;

    /// Delete terminal jobs older than `retention` and fail jobs stuck in a
    /// non-terminal state for longer than `liveness`.
    async fn sweep_jobs(&self, retention: Duration, liveness: Duration)
        -> Result<SweepCounts, DbError>;

    async fn count_active_jobs(&self) -> Result<i64, DbError>;

    /// Cheap readiness probe.
    async fn ping(&self) -> Result<(), DbError>;
}
