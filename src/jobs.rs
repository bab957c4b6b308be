//! Background job manager for asynchronous analysis.
//!
//! Submission only inserts a QUEUED row and rings the worker pool; all
//! provider work happens on the workers. A job is owned by exactly one
//! worker (the store's conditional claim) and every stage write is
//! optimistic on the status it expects, so a concurrent cancel always wins
//! and a cancelled stage never writes again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::orchestrator::AnalysisPipeline;
use crate::persistence::{DbError, JobRecord, JobStatus, JobUpdate, NewQueryLog, Persistence};
use crate::templates::AnalysisType;
use crate::ApiError;

/// How long an idle worker sleeps before re-polling the queue even without a
/// submission signal. Covers jobs revived by the stale sweeper.
const IDLE_POLL: Duration = Duration::from_millis(500);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct JobManager {
    db: Arc<dyn Persistence>,
    pipeline: Arc<AnalysisPipeline>,
    notify: Notify,
    shutdown: watch::Sender<bool>,
}

impl JobManager {
    pub fn new(db: Arc<dyn Persistence>, pipeline: Arc<AnalysisPipeline>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            db,
            pipeline,
            notify: Notify::new(),
            shutdown,
        })
    }

    /// O(1): persist the QUEUED record and wake a worker. No provider call
    /// happens before the handle is returned.
    pub async fn submit(&self, input: &str, owner: Option<Uuid>) -> Result<JobRecord, DbError> {
        let job = self.db.create_job(input, owner).await?;
        info!(job_id = %job.job_id, "queued analysis job");
        self.notify.notify_one();
        Ok(job)
    }

    /// Advisory cancellation: flips the job to FAILED/CANCELLED unless it
    /// already reached a terminal state. An in-flight stage observes the
    /// flip at its next write and stops.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobRecord, DbError> {
        for _ in 0..2 {
            let Some(job) = self.db.get_job(job_id).await? else {
                return Err(DbError::JobNotFound);
            };
            if job.status.is_terminal() {
                return Ok(job);
            }
            let update = JobUpdate {
                expected_status: job.status,
                status: JobStatus::Failed,
                stage1_output: None,
                final_output: None,
                error_code: Some("CANCELLED".to_string()),
                completed_at: Some(Utc::now()),
            };
            match self.db.update_job(job_id, update).await {
                Ok(()) => {
                    info!(job_id = %job_id, "job cancelled");
                    return self
                        .db
                        .get_job(job_id)
                        .await?
                        .ok_or(DbError::JobNotFound);
                }
                // The worker advanced the job between the read and the
                // write; retry against the new status.
                Err(DbError::Conflict) => continue,
                Err(e) => return Err(e),
            }
        }
        self.db.get_job(job_id).await?.ok_or(DbError::JobNotFound)
    }

    pub fn spawn_workers(self: &Arc<Self>, count: usize) {
        for worker_id in 0..count {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.worker_loop(worker_id).await;
            });
        }
        info!(count, "started job workers");
    }

    pub fn spawn_sweeper(self: &Arc<Self>, retention: Duration, liveness: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut shutdown = manager.shutdown.subscribe();
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match manager.db.sweep_jobs(retention, liveness).await {
                    Ok(counts) if counts.deleted > 0 || counts.stale_failed > 0 => {
                        info!(
                            deleted = counts.deleted,
                            stale_failed = counts.stale_failed,
                            "swept analysis jobs"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("job sweep failed: {e}"),
                }
            }
        });
    }

    /// Stop workers and the sweeper at their next suspension point.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.notify.notify_waiters();
    }

    pub async fn active_count(&self) -> Result<i64, DbError> {
        self.db.count_active_jobs().await
    }

    async fn worker_loop(&self, worker_id: usize) {
        let mut shutdown = self.shutdown.subscribe();
        debug!(worker_id, "job worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.db.claim_next_job().await {
                Ok(Some(job)) => {
                    debug!(worker_id, job_id = %job.job_id, "claimed job");
                    self.run_job(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    error!(worker_id, "claim failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!(worker_id, "job worker stopped");
    }

    /// Drive a claimed job through both stages. The job arrives holding
    /// PROCESSING_STAGE1.
    async fn run_job(&self, job: JobRecord) {
        let job_id = job.job_id;
        let analysis_type = AnalysisType::Custom;
        let started = std::time::Instant::now();

        let optimized = match self.pipeline.optimize_stage(&job.input, analysis_type).await {
            Ok((optimized, _)) => optimized,
            Err(e) => {
                self.fail_job(job_id, JobStatus::ProcessingStage1, &e).await;
                return;
            }
        };

        let advanced = self
            .db
            .update_job(
                job_id,
                JobUpdate {
                    expected_status: JobStatus::ProcessingStage1,
                    status: JobStatus::ProcessingStage2,
                    stage1_output: Some(optimized.clone()),
                    final_output: None,
                    error_code: None,
                    completed_at: None,
                },
            )
            .await;
        if let Err(e) = advanced {
            self.abandon(job_id, e);
            return;
        }

        let analysis = match self.pipeline.analyze_stage(&optimized, analysis_type).await {
            Ok((analysis, _)) => analysis,
            Err(e) => {
                self.fail_job(job_id, JobStatus::ProcessingStage2, &e).await;
                return;
            }
        };

        // Quota and the audit log commit together; only then does the job
        // turn COMPLETED.
        if let Some(owner) = job.owner_user_id {
            let entry = NewQueryLog {
                user_id: Some(owner),
                input: job.input.clone(),
                optimized_prompt: Some(optimized.clone()),
                result: Some(analysis.clone()),
                latency_ms: started.elapsed().as_millis() as i64,
                success: true,
                error_message: None,
            };
            match self.db.record_completion(owner, entry).await {
                Ok(_) => {}
                Err(DbError::QuotaExhausted) => {
                    let err = ApiError::QueryLimitExceeded("query limit exceeded".to_string());
                    self.fail_job(job_id, JobStatus::ProcessingStage2, &err).await;
                    return;
                }
                Err(e) => {
                    warn!(job_id = %job_id, "completion accounting failed: {e}");
                    let err = ApiError::Database;
                    self.fail_job(job_id, JobStatus::ProcessingStage2, &err).await;
                    return;
                }
            }
        }

        let finished = self
            .db
            .update_job(
                job_id,
                JobUpdate {
                    expected_status: JobStatus::ProcessingStage2,
                    status: JobStatus::Completed,
                    stage1_output: None,
                    final_output: Some(analysis),
                    error_code: None,
                    completed_at: Some(Utc::now()),
                },
            )
            .await;
        match finished {
            Ok(()) => info!(job_id = %job_id, "job completed"),
            Err(e) => self.abandon(job_id, e),
        }
    }

    async fn fail_job(&self, job_id: Uuid, expected: JobStatus, error: &ApiError) {
        warn!(job_id = %job_id, code = error.code(), "job failed");
        let update = JobUpdate {
            expected_status: expected,
            status: JobStatus::Failed,
            stage1_output: None,
            final_output: None,
            error_code: Some(error.code().to_string()),
            completed_at: Some(Utc::now()),
        };
        match self.db.update_job(job_id, update).await {
            Ok(()) => {}
            Err(e) => self.abandon(job_id, e),
        }
    }

    /// A stage write bounced: someone else (cancel, sweeper) owns the final
    /// word on this job. Log and walk away without touching it again.
    fn abandon(&self, job_id: Uuid, reason: DbError) {
        debug!(job_id = %job_id, "dropping job after state moved underneath: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::AnalysisPipeline;
    use crate::persistence::memory::MemoryPersistence;
    use crate::providers::ProviderError;
    use crate::registry::ServiceRegistry;
    use crate::testutil::{optimizer_entry, MockService};

    fn manager_with(
        registry: Arc<ServiceRegistry>,
    ) -> (Arc<JobManager>, Arc<MemoryPersistence>) {
        let db = Arc::new(MemoryPersistence::new());
        let pipeline = Arc::new(AnalysisPipeline::new(registry, db.clone(), 5000));
        let manager = JobManager::new(db.clone(), pipeline);
        (manager, db)
    }

    fn healthy_registry() -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        let (plugin, descriptor) = optimizer_entry("opt", 1);
        registry.register(plugin, descriptor).unwrap();
        let (plugin, descriptor) = MockService::analyzer("analyzer", 1);
        registry.register(plugin, descriptor).unwrap();
        registry
    }

    async fn wait_terminal(db: &MemoryPersistence, job_id: Uuid) -> JobRecord {
        for _ in 0..400 {
            let job = db.get_job(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    fn status_rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Queued => 0,
            JobStatus::ProcessingStage1 => 1,
            JobStatus::ProcessingStage2 => 2,
            JobStatus::Completed | JobStatus::Failed => 3,
        }
    }

    #[tokio::test]
    async fn submitted_job_completes_and_charges_the_owner() {
        let (manager, db) = manager_with(healthy_registry());
        let user = db.seed_user("jobs@example.com", 0, 10);
        manager.spawn_workers(2);

        let job = manager.submit("x", Some(user.id)).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let done = wait_terminal(&db, job.job_id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.stage1_output.is_some());
        assert!(done.final_output.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(done.error_code, None);

        assert_eq!(db.user(user.id).unwrap().queries_used, 1);
        assert_eq!(db.logs().len(), 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn observed_statuses_are_monotonic() {
        let registry = Arc::new(ServiceRegistry::new());
        let (plugin, descriptor) = optimizer_entry("opt", 1);
        registry.register(plugin, descriptor).unwrap();
        let (plugin, descriptor) =
            MockService::slow_analyzer("analyzer", 1, Duration::from_millis(20));
        registry.register(plugin, descriptor).unwrap();

        let (manager, db) = manager_with(registry);
        let user = db.seed_user("mono@example.com", 0, 10);
        manager.spawn_workers(1);

        let job = manager.submit("watch me", Some(user.id)).await.unwrap();

        let mut observed = Vec::new();
        for _ in 0..400 {
            let snapshot = db.get_job(job.job_id).await.unwrap().unwrap();
            observed.push(snapshot.status);
            if snapshot.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(observed.last().unwrap().is_terminal());
        for pair in observed.windows(2) {
            assert!(
                status_rank(pair[0]) <= status_rank(pair[1]),
                "status went backwards: {observed:?}"
            );
        }
        manager.shutdown();
    }

    #[tokio::test]
    async fn failing_stage_marks_the_job_failed_without_charging() {
        let registry = Arc::new(ServiceRegistry::new());
        let (plugin, descriptor) = optimizer_entry("opt", 1);
        registry.register(plugin, descriptor).unwrap();
        let (plugin, descriptor) = MockService::failing_analyzer(
            "analyzer",
            1,
            ProviderError::Status { status: 502 },
        );
        registry.register(plugin, descriptor).unwrap();

        let (manager, db) = manager_with(registry);
        let user = db.seed_user("fail@example.com", 0, 10);
        manager.spawn_workers(1);

        let job = manager.submit("doomed", Some(user.id)).await.unwrap();
        let done = wait_terminal(&db, job.job_id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error_code.as_deref(), Some("AI_SERVICE_ERROR"));
        assert_eq!(db.user(user.id).unwrap().queries_used, 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn exhausted_owner_fails_the_job_with_quota_code() {
        let (manager, db) = manager_with(healthy_registry());
        let user = db.seed_user("broke@example.com", 10, 10);
        manager.spawn_workers(1);

        let job = manager.submit("over budget", Some(user.id)).await.unwrap();
        let done = wait_terminal(&db, job.job_id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error_code.as_deref(), Some("QUERY_LIMIT_EXCEEDED"));
        assert_eq!(db.user(user.id).unwrap().queries_used, 10);
        manager.shutdown();
    }

    #[tokio::test]
    async fn cancel_wins_against_a_running_stage() {
        let registry = Arc::new(ServiceRegistry::new());
        let (plugin, descriptor) = optimizer_entry("opt", 1);
        registry.register(plugin, descriptor).unwrap();
        let (plugin, descriptor) =
            MockService::slow_analyzer("analyzer", 1, Duration::from_millis(150));
        registry.register(plugin, descriptor).unwrap();

        let (manager, db) = manager_with(registry);
        let user = db.seed_user("cancel@example.com", 0, 10);
        manager.spawn_workers(1);

        let job = manager.submit("slow ride", Some(user.id)).await.unwrap();

        // Wait for a worker to pick the job up, then cancel mid-stage.
        for _ in 0..200 {
            let snapshot = db.get_job(job.job_id).await.unwrap().unwrap();
            if snapshot.status != JobStatus::Queued {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let cancelled = manager.cancel(job.job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.error_code.as_deref(), Some("CANCELLED"));

        // Give the in-flight stage time to finish and try its write; the
        // terminal record must not change.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let after = db.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.error_code.as_deref(), Some("CANCELLED"));
        assert_eq!(after.final_output, None);
        manager.shutdown();
    }

    #[tokio::test]
    async fn cancelling_a_missing_job_is_not_found() {
        let (manager, _db) = manager_with(healthy_registry());
        let err = manager.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DbError::JobNotFound));
    }

    #[tokio::test]
    async fn cancelling_a_completed_job_keeps_it_completed() {
        let (manager, db) = manager_with(healthy_registry());
        let user = db.seed_user("done@example.com", 0, 10);
        manager.spawn_workers(1);

        let job = manager.submit("quick", Some(user.id)).await.unwrap();
        wait_terminal(&db, job.job_id).await;

        let after = manager.cancel(job.job_id).await.unwrap();
        assert_eq!(after.status, JobStatus::Completed);
        manager.shutdown();
    }
}
