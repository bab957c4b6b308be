//! Diesel/Postgres adapter for the persistence port.
//!
//! Diesel is synchronous; every operation hops onto the blocking pool with a
//! connection from r2d2. Quota arithmetic and job claims are expressed as
//! conditional updates so correctness does not depend on caller discipline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use tracing::{info, warn};
use uuid::Uuid;

use super::schema::{analysis_jobs, query_logs, users};
use super::{
    DbError, Identity, JobRecord, JobStatus, JobUpdate, NewQueryLog, Persistence, SweepCounts,
    User, DEFAULT_QUERIES_LIMIT,
};

type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgConn = PooledConnection<ConnectionManager<PgConnection>>;

impl From<diesel::result::Error> for DbError {
    fn from(e: diesel::result::Error) -> Self {
        DbError::Backend(e.to_string())
    }
}

#[derive(Queryable)]
struct UserRow {
    id: Uuid,
    email: String,
    external_id: Option<String>,
    tier: String,
    queries_used: i32,
    queries_limit: i32,
    active: bool,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            external_id: row.external_id,
            tier: row.tier,
            queries_used: row.queries_used,
            queries_limit: row.queries_limit,
            active: row.active,
            created_at: row.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct NewUserRow {
    id: Uuid,
    email: String,
    external_id: Option<String>,
    tier: String,
    queries_used: i32,
    queries_limit: i32,
    active: bool,
    created_at: DateTime<Utc>,
}

#[derive(Queryable)]
struct JobRow {
    job_id: Uuid,
    owner_user_id: Option<Uuid>,
    status: String,
    input: String,
    stage1_output: Option<String>,
    final_output: Option<String>,
    error_code: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, DbError> {
        let status = JobStatus::parse(&row.status)
            .ok_or_else(|| DbError::Backend(format!("unknown job status '{}'", row.status)))?;
        Ok(JobRecord {
            job_id: row.job_id,
            owner_user_id: row.owner_user_id,
            status,
            input: row.input,
            stage1_output: row.stage1_output,
            final_output: row.final_output,
            error_code: row.error_code,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = analysis_jobs)]
struct NewJobRow {
    job_id: Uuid,
    owner_user_id: Option<Uuid>,
    status: String,
    input: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(AsChangeset)]
#[diesel(table_name = analysis_jobs)]
struct JobChanges {
    status: Option<String>,
    stage1_output: Option<String>,
    final_output: Option<String>,
    error_code: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Insertable)]
#[diesel(table_name = query_logs)]
struct NewQueryLogRow {
    user_id: Option<Uuid>,
    input: String,
    optimized_prompt: Option<String>,
    result: Option<String>,
    latency_ms: i64,
    success: bool,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<NewQueryLog> for NewQueryLogRow {
    fn from(entry: NewQueryLog) -> Self {
        NewQueryLogRow {
            user_id: entry.user_id,
            input: entry.input,
            optimized_prompt: entry.optimized_prompt,
            result: entry.result,
            latency_ms: entry.latency_ms,
            success: entry.success,
            error_message: entry.error_message,
            created_at: Utc::now(),
        }
    }
}

pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub fn connect(database_url: &str, max_size: u32) -> Result<Self, DbError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| DbError::Backend(e.to_string()))?;
        info!(max_size, "connected database pool");
        Ok(Self { pool })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConn) -> Result<T, DbError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            // One retry for transient pool acquisition failures.
            let mut conn = match pool.get() {
                Ok(conn) => conn,
                Err(first) => {
                    warn!("connection acquisition failed, retrying once: {first}");
                    pool.get().map_err(|e| DbError::Backend(e.to_string()))?
                }
            };
            op(&mut conn)
        })
        .await
        .map_err(|e| DbError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn increment_usage_on(conn: &mut PgConn, user_id: Uuid) -> Result<i32, DbError> {
    let updated: Option<i32> = diesel::update(
        users::table
            .filter(users::id.eq(user_id))
            .filter(users::queries_used.lt(users::queries_limit)),
    )
    .set(users::queries_used.eq(users::queries_used + 1))
    .returning(users::queries_used)
    .get_result(conn)
    .optional()?;

    match updated {
        Some(count) => Ok(count),
        None => {
            let exists: Option<Uuid> = users::table
                .filter(users::id.eq(user_id))
                .select(users::id)
                .first(conn)
                .optional()?;
            if exists.is_some() {
                Err(DbError::QuotaExhausted)
            } else {
                Err(DbError::UserNotFound)
            }
        }
    }
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn get_or_create_user(&self, identity: &Identity) -> Result<User, DbError> {
        let subject = identity.subject.clone();
        let email = identity.email.clone();
        self.blocking(move |conn| {
            if let Some(row) = users::table
                .filter(users::external_id.eq(&subject))
                .first::<UserRow>(conn)
                .optional()?
            {
                return Ok(row.into());
            }

            if let Some(email) = &email {
                let normalized = email.to_lowercase();
                if let Some(row) = users::table
                    .filter(users::email.eq(&normalized))
                    .first::<UserRow>(conn)
                    .optional()?
                {
                    if row.external_id.is_none() {
                        let row: UserRow = diesel::update(users::table.filter(users::id.eq(row.id)))
                            .set(users::external_id.eq(&subject))
                            .get_result(conn)?;
                        info!(email = %row.email, "linked existing account to external identity");
                        return Ok(row.into());
                    }
                    return Ok(row.into());
                }
            }

            let new_row = NewUserRow {
                id: Uuid::new_v4(),
                email: email
                    .map(|e| e.to_lowercase())
                    .unwrap_or_else(|| format!("user-{subject}@unknown.local")),
                external_id: Some(subject),
                tier: "free".to_string(),
                queries_used: 0,
                queries_limit: DEFAULT_QUERIES_LIMIT,
                active: true,
                created_at: Utc::now(),
            };
            let row: UserRow = diesel::insert_into(users::table)
                .values(&new_row)
                .get_result(conn)?;
            info!(email = %row.email, "auto-provisioned user");
            Ok(row.into())
        })
        .await
    }

    async fn increment_usage(&self, user_id: Uuid) -> Result<i32, DbError> {
        self.blocking(move |conn| increment_usage_on(conn, user_id)).await
    }

    async fn insert_query_log(&self, entry: NewQueryLog) -> Result<(), DbError> {
        self.blocking(move |conn| {
            diesel::insert_into(query_logs::table)
                .values(NewQueryLogRow::from(entry))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn record_completion(&self, user_id: Uuid, entry: NewQueryLog) -> Result<i32, DbError> {
        self.blocking(move |conn| {
            conn.transaction::<i32, DbError, _>(|conn| {
                let count = increment_usage_on(conn, user_id)?;
                diesel::insert_into(query_logs::table)
                    .values(NewQueryLogRow::from(entry))
                    .execute(conn)?;
                Ok(count)
            })
        })
        .await
    }

    async fn create_job(&self, input: &str, owner: Option<Uuid>) -> Result<JobRecord, DbError> {
        let input = input.to_string();
        self.blocking(move |conn| {
            let now = Utc::now();
            let row: JobRow = diesel::insert_into(analysis_jobs::table)
                .values(&NewJobRow {
                    job_id: Uuid::new_v4(),
                    owner_user_id: owner,
                    status: JobStatus::Queued.as_str().to_string(),
                    input,
                    created_at: now,
                    updated_at: now,
                })
                .get_result(conn)?;
            row.try_into()
        })
        .await
    }

    async fn claim_next_job(&self) -> Result<Option<JobRecord>, DbError> {
        self.blocking(move |conn| {
            conn.transaction::<Option<JobRecord>, DbError, _>(|conn| {
                let candidate: Option<Uuid> = analysis_jobs::table
                    .filter(analysis_jobs::status.eq(JobStatus::Queued.as_str()))
                    .order(analysis_jobs::created_at.asc())
                    .select(analysis_jobs::job_id)
                    .for_update()
                    .skip_locked()
                    .first(conn)
                    .optional()?;

                let Some(job_id) = candidate else {
                    return Ok(None);
                };

                let row: JobRow =
                    diesel::update(analysis_jobs::table.filter(analysis_jobs::job_id.eq(job_id)))
                        .set((
                            analysis_jobs::status
                                .eq(JobStatus::ProcessingStage1.as_str()),
                            analysis_jobs::updated_at.eq(Utc::now()),
                        ))
                        .get_result(conn)?;
                Ok(Some(row.try_into()?))
            })
        })
        .await
    }

    async fn update_job(&self, job_id: Uuid, update: JobUpdate) -> Result<(), DbError> {
        self.blocking(move |conn| {
            let affected = diesel::update(
                analysis_jobs::table
                    .filter(analysis_jobs::job_id.eq(job_id))
                    .filter(analysis_jobs::status.eq(update.expected_status.as_str())),
            )
            .set(&JobChanges {
                status: Some(update.status.as_str().to_string()),
                stage1_output: update.stage1_output,
                final_output: update.final_output,
                error_code: update.error_code,
                completed_at: update.completed_at,
                updated_at: Some(Utc::now()),
            })
            .execute(conn)?;

            if affected == 1 {
                return Ok(());
            }
            let exists: Option<Uuid> = analysis_jobs::table
                .filter(analysis_jobs::job_id.eq(job_id))
                .select(analysis_jobs::job_id)
                .first(conn)
                .optional()?;
            if exists.is_some() {
                Err(DbError::Conflict)
            } else {
                Err(DbError::JobNotFound)
            }
        })
        .await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, DbError> {
        self.blocking(move |conn| {
            analysis_jobs::table
                .filter(analysis_jobs::job_id.eq(job_id))
                .first::<JobRow>(conn)
                .optional()?
                .map(JobRecord::try_from)
                .transpose()
        })
        .await
    }

    async fn sweep_jobs(
        &self,
        retention: Duration,
        liveness: Duration,
    ) -> Result<SweepCounts, DbError> {
        self.blocking(move |conn| {
            let now = Utc::now();
            let retention_cutoff = now
                - chrono::Duration::from_std(retention)
                    .map_err(|e| DbError::Backend(e.to_string()))?;
            let liveness_cutoff = now
                - chrono::Duration::from_std(liveness)
                    .map_err(|e| DbError::Backend(e.to_string()))?;

            let terminal = [
                JobStatus::Completed.as_str(),
                JobStatus::Failed.as_str(),
            ];

            let deleted = diesel::delete(
                analysis_jobs::table
                    .filter(analysis_jobs::status.eq_any(terminal))
                    .filter(analysis_jobs::completed_at.lt(retention_cutoff)),
            )
            .execute(conn)?;

            let stale_failed = diesel::update(
                analysis_jobs::table
                    .filter(analysis_jobs::status.ne_all(terminal))
                    .filter(analysis_jobs::updated_at.lt(liveness_cutoff)),
            )
            .set((
                analysis_jobs::status.eq(JobStatus::Failed.as_str()),
                analysis_jobs::error_code.eq("STALE"),
                analysis_jobs::completed_at.eq(now),
                analysis_jobs::updated_at.eq(now),
            ))
            .execute(conn)?;

            Ok(SweepCounts {
                deleted: deleted as u64,
                stale_failed: stale_failed as u64,
            })
        })
        .await
    }

    async fn count_active_jobs(&self) -> Result<i64, DbError> {
        self.blocking(move |conn| {
            let terminal = [
                JobStatus::Completed.as_str(),
                JobStatus::Failed.as_str(),
            ];
            Ok(analysis_jobs::table
                .filter(analysis_jobs::status.ne_all(terminal))
                .count()
                .get_result(conn)?)
        })
        .await
    }

    async fn ping(&self) -> Result<(), DbError> {
        self.blocking(move |conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }
}
