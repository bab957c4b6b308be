//! In-memory persistence adapter.
//!
//! Implements the same contract as the Postgres adapter behind one mutex,
//! which makes every operation trivially atomic. Used by the test suite and
//! handy for local experiments without a database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{
    DbError, Identity, JobRecord, JobStatus, JobUpdate, NewQueryLog, Persistence, SweepCounts,
    User, DEFAULT_QUERIES_LIMIT,
};

#[derive(Debug, Clone)]
pub struct StoredQueryLog {
    pub entry: NewQueryLog,
}

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    jobs: HashMap<Uuid, JobRecord>,
    logs: Vec<StoredQueryLog>,
}

#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<State>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: insert a user with explicit quota state.
    pub fn seed_user(&self, email: &str, queries_used: i32, queries_limit: i32) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_lowercase(),
            external_id: None,
            tier: "free".to_string(),
            queries_used,
            queries_limit,
            active: true,
            created_at: Utc::now(),
        };
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.users.insert(user.id, user.clone());
        user
    }

    /// Test helper: snapshot of every query log written so far.
    pub fn logs(&self) -> Vec<StoredQueryLog> {
        self.state
            .lock()
            .expect("memory store lock poisoned")
            .logs
            .clone()
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.state
            .lock()
            .expect("memory store lock poisoned")
            .users
            .get(&id)
            .cloned()
    }

    fn increment_locked(state: &mut State, user_id: Uuid) -> Result<i32, DbError> {
        let user = state.users.get_mut(&user_id).ok_or(DbError::UserNotFound)?;
        if user.queries_used >= user.queries_limit {
            return Err(DbError::QuotaExhausted);
        }
        user.queries_used += 1;
        Ok(user.queries_used)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn get_or_create_user(&self, identity: &Identity) -> Result<User, DbError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");

        if let Some(user) = state
            .users
            .values()
            .find(|u| u.external_id.as_deref() == Some(identity.subject.as_str()))
        {
            return Ok(user.clone());
        }

        if let Some(email) = &identity.email {
            let normalized = email.to_lowercase();
            if let Some(id) = state
                .users
                .values()
                .find(|u| u.email == normalized)
                .map(|u| u.id)
            {
                let user = state.users.get_mut(&id).expect("looked up above");
                if user.external_id.is_none() {
                    user.external_id = Some(identity.subject.clone());
                }
                return Ok(user.clone());
            }
        }

        let user = User {
            id: Uuid::new_v4(),
            email: identity
                .email
                .as_ref()
                .map(|e| e.to_lowercase())
                .unwrap_or_else(|| format!("user-{}@unknown.local", identity.subject)),
            external_id: Some(identity.subject.clone()),
            tier: "free".to_string(),
            queries_used: 0,
            queries_limit: DEFAULT_QUERIES_LIMIT,
            active: true,
            created_at: Utc::now(),
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn increment_usage(&self, user_id: Uuid) -> Result<i32, DbError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        Self::increment_locked(&mut state, user_id)
    }

    async fn insert_query_log(&self, entry: NewQueryLog) -> Result<(), DbError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.logs.push(StoredQueryLog { entry });
        Ok(())
    }

    async fn record_completion(&self, user_id: Uuid, entry: NewQueryLog) -> Result<i32, DbError> {
        // Single lock scope: the increment and the log land together or not
        // at all, mirroring the SQL transaction.
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let count = Self::increment_locked(&mut state, user_id)?;
        state.logs.push(StoredQueryLog { entry });
        Ok(count)
    }

    async fn create_job(&self, input: &str, owner: Option<Uuid>) -> Result<JobRecord, DbError> {
        let now = Utc::now();
        let job = JobRecord {
            job_id: Uuid::new_v4(),
            owner_user_id: owner,
            status: JobStatus::Queued,
            input: input.to_string(),
            stage1_output: None,
            final_output: None,
            error_code: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    async fn claim_next_job(&self) -> Result<Option<JobRecord>, DbError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let candidate = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by_key(|j| j.created_at)
            .map(|j| j.job_id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&job_id).expect("selected above");
        job.status = JobStatus::ProcessingStage1;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<(), DbError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let job = state.jobs.get_mut(&job_id).ok_or(DbError::JobNotFound)?;
        if job.status != update.expected_status {
            return Err(DbError::Conflict);
        }
        job.status = update.status;
        if update.stage1_output.is_some() {
            job.stage1_output = update.stage1_output;
        }
        if update.final_output.is_some() {
            job.final_output = update.final_output;
        }
        if update.error_code.is_some() {
            job.error_code = update.error_code;
        }
        if update.completed_at.is_some() {
            job.completed_at = update.completed_at;
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, DbError> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn sweep_jobs(
        &self,
        retention: Duration,
        liveness: Duration,
    ) -> Result<SweepCounts, DbError> {
        let now = Utc::now();
        let retention_cutoff =
            now - chrono::Duration::from_std(retention).map_err(|e| DbError::Backend(e.to_string()))?;
        let liveness_cutoff =
            now - chrono::Duration::from_std(liveness).map_err(|e| DbError::Backend(e.to_string()))?;

        let mut counts = SweepCounts::default();
        let mut state = self.state.lock().expect("memory store lock poisoned");

        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| {
                j.status.is_terminal()
                    && j.completed_at
                        .map(|t| t < retention_cutoff)
                        .unwrap_or(false)
            })
            .map(|j| j.job_id)
            .collect();
        for id in expired {
            state.jobs.remove(&id);
            counts.deleted += 1;
        }

        for job in state.jobs.values_mut() {
            if !job.status.is_terminal() && job.updated_at < liveness_cutoff {
                job.status = JobStatus::Failed;
                job.error_code = Some("STALE".to_string());
                job.completed_at = Some(now);
                job.updated_at = now;
                counts.stale_failed += 1;
            }
        }

        Ok(counts)
    }

    async fn count_active_jobs(&self) -> Result<i64, DbError> {
        let state = self.state.lock().expect("memory store lock poisoned");
        Ok(state
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .count() as i64)
    }

    async fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn identity(subject: &str, email: Option<&str>) -> Identity {
        Identity {
            subject: subject.to_string(),
            email: email.map(ToString::to_string),
        }
    }

    #[tokio::test]
    async fn auto_provision_is_idempotent() {
        let store = MemoryPersistence::new();
        let a = store
            .get_or_create_user(&identity("sub-1", Some("A@Example.com")))
            .await
            .unwrap();
        let b = store
            .get_or_create_user(&identity("sub-1", Some("a@example.com")))
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.email, "a@example.com");
        assert_eq!(a.queries_limit, DEFAULT_QUERIES_LIMIT);
    }

    #[tokio::test]
    async fn email_match_backfills_external_id() {
        let store = MemoryPersistence::new();
        let seeded = store.seed_user("b@example.com", 0, 10);
        let resolved = store
            .get_or_create_user(&identity("sub-2", Some("B@example.com")))
            .await
            .unwrap();
        assert_eq!(resolved.id, seeded.id);
        assert_eq!(resolved.external_id.as_deref(), Some("sub-2"));
    }

    #[tokio::test]
    async fn increment_stops_at_the_limit() {
        let store = MemoryPersistence::new();
        let user = store.seed_user("c@example.com", 1, 2);
        assert_eq!(store.increment_usage(user.id).await.unwrap(), 2);
        assert!(matches!(
            store.increment_usage(user.id).await,
            Err(DbError::QuotaExhausted)
        ));
    }

    #[tokio::test]
    async fn record_completion_is_all_or_nothing() {
        let store = MemoryPersistence::new();
        let user = store.seed_user("d@example.com", 2, 2);
        let entry = NewQueryLog {
            user_id: Some(user.id),
            input: "in".to_string(),
            optimized_prompt: None,
            result: None,
            latency_ms: 5,
            success: true,
            error_message: None,
        };
        assert!(matches!(
            store.record_completion(user.id, entry).await,
            Err(DbError::QuotaExhausted)
        ));
        assert!(store.logs().is_empty(), "failed completion must not log");
    }

    #[tokio::test]
    async fn exactly_k_of_n_concurrent_completions_succeed() {
        let store = Arc::new(MemoryPersistence::new());
        let user = store.seed_user("e@example.com", 0, 3);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let user_id = user.id;
            handles.push(tokio::spawn(async move {
                store
                    .record_completion(
                        user_id,
                        NewQueryLog {
                            user_id: Some(user_id),
                            input: format!("req-{i}"),
                            optimized_prompt: None,
                            result: None,
                            latency_ms: 1,
                            success: true,
                            error_message: None,
                        },
                    )
                    .await
                    .is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 3);
        assert_eq!(store.user(user.id).unwrap().queries_used, 3);
        assert_eq!(store.logs().len(), 3);
    }

    #[tokio::test]
    async fn at_most_one_worker_claims_a_job() {
        let store = Arc::new(MemoryPersistence::new());
        store.create_job("solo", None).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next_job().await.unwrap().is_some()
            }));
        }
        let mut claims = 0;
        for handle in handles {
            if handle.await.unwrap() {
                claims += 1;
            }
        }
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn claims_hand_out_the_oldest_job_first() {
        let store = MemoryPersistence::new();
        let first = store.create_job("first", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let _second = store.create_job("second", None).await.unwrap();

        let claimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.job_id, first.job_id);
        assert_eq!(claimed.status, JobStatus::ProcessingStage1);
    }

    #[tokio::test]
    async fn stage_updates_are_optimistic() {
        let store = MemoryPersistence::new();
        let job = store.create_job("x", None).await.unwrap();
        store.claim_next_job().await.unwrap().unwrap();

        // Cancel wins the race.
        store
            .update_job(
                job.job_id,
                JobUpdate {
                    expected_status: JobStatus::ProcessingStage1,
                    status: JobStatus::Failed,
                    stage1_output: None,
                    final_output: None,
                    error_code: Some("CANCELLED".to_string()),
                    completed_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();

        // The worker's late stage write must bounce off.
        let err = store
            .update_job(
                job.job_id,
                JobUpdate {
                    expected_status: JobStatus::ProcessingStage1,
                    status: JobStatus::ProcessingStage2,
                    stage1_output: Some("late".to_string()),
                    final_output: None,
                    error_code: None,
                    completed_at: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict));

        let job = store.get_job(job.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("CANCELLED"));
        assert_eq!(job.stage1_output, None);
    }

    #[tokio::test]
    async fn sweep_deletes_old_terminal_and_fails_stuck_jobs() {
        let store = MemoryPersistence::new();

        let done = store.create_job("done", None).await.unwrap();
        store.claim_next_job().await.unwrap();
        store
            .update_job(
                done.job_id,
                JobUpdate {
                    expected_status: JobStatus::ProcessingStage1,
                    status: JobStatus::Failed,
                    stage1_output: None,
                    final_output: None,
                    error_code: Some("AI_SERVICE_ERROR".to_string()),
                    completed_at: Some(Utc::now() - chrono::Duration::hours(2)),
                },
            )
            .await
            .unwrap();

        let stuck = store.create_job("stuck", None).await.unwrap();
        store.claim_next_job().await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let counts = store
            .sweep_jobs(Duration::from_secs(3600), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(counts.deleted, 1);
        assert_eq!(counts.stale_failed, 1);

        assert!(store.get_job(done.job_id).await.unwrap().is_none());
        let stuck = store.get_job(stuck.job_id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Failed);
        assert_eq!(stuck.error_code.as_deref(), Some("STALE"));
    }
}
