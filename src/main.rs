mod config;
mod correlation;
mod ip;
mod jobs;
mod jwt;
mod orchestrator;
mod persistence;
mod providers;
mod ratelimit;
mod registry;
mod templates;
#[cfg(test)]
mod testutil;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::jobs::JobManager;
use crate::jwt::{JwksVerifier, TokenVerifier};
use crate::orchestrator::AnalysisPipeline;
use crate::persistence::postgres::PgPersistence;
use crate::persistence::{DbError, Persistence};
use crate::providers::argus::ArgusService;
use crate::providers::lumen::LumenService;
use crate::ratelimit::RateLimiter;
use crate::registry::{AiService, ServiceRegistry};

const DB_POOL_SIZE: u32 = 10;
const STARTUP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Invalid request payload.")]
    ValidationFailed,

    #[error("Authentication failed. Please check your credentials.")]
    AuthenticationFailed,

    #[error("Requested job was not found.")]
    JobNotFound,

    #[error("User not found.")]
    UserNotFound,

    #[error("Request body too large.")]
    RequestTooLarge,

    #[error("Too many requests. Please try again later.")]
    RateLimitExceeded { retry_after: Option<u64> },

    #[error("{0}")]
    QueryLimitExceeded(String),

    #[error("User account access failed. Please try again.")]
    UserAccessFailed,

    #[error("Database operation failed. Please try again.")]
    Database,

    #[error("External AI service temporarily unavailable. Please try again.")]
    AiService,

    #[error("Service temporarily unavailable. Please try again later.")]
    ServiceUnavailable,

    #[error("No service is registered for the requested operation.")]
    NoServiceAvailable,

    #[error("Internal server error. Please contact support if the issue persists.")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ApiError::JobNotFound | ApiError::UserNotFound => StatusCode::NOT_FOUND,
            ApiError::RequestTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimitExceeded { .. } | ApiError::QueryLimitExceeded(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::UserAccessFailed | ApiError::Database | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::AiService => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable | ApiError::NoServiceAvailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidInput(_) | ApiError::ValidationFailed => "INVALID_INPUT",
            ApiError::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ApiError::JobNotFound => "JOB_NOT_FOUND",
            ApiError::UserNotFound => "USER_NOT_FOUND",
            ApiError::RequestTooLarge => "REQUEST_TOO_LARGE",
            ApiError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::QueryLimitExceeded(_) => "QUERY_LIMIT_EXCEEDED",
            ApiError::UserAccessFailed => "USER_ACCESS_FAILED",
            ApiError::Database => "DATABASE_ERROR",
            ApiError::AiService => "AI_SERVICE_ERROR",
            ApiError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ApiError::NoServiceAvailable => "NO_SERVICE_AVAILABLE",
            ApiError::Internal => "INTERNAL_SERVER_ERROR",
        }
    }
}

/// The single envelope every error response wears.
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "code": code,
                "correlation_id": correlation::current_request_id(),
            }
        })),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), "{self}");
        } else {
            warn!(code = self.code(), "{self}");
        }

        let mut response = error_response(status, self.code(), &self.to_string());
        if let ApiError::RateLimitExceeded {
            retry_after: Some(seconds),
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::UserNotFound => ApiError::UserNotFound,
            DbError::JobNotFound => ApiError::JobNotFound,
            DbError::QuotaExhausted => {
                ApiError::QueryLimitExceeded("Query limit exceeded.".to_string())
            }
            DbError::Conflict | DbError::Backend(_) => {
                error!("database error: {e}");
                ApiError::Database
            }
        }
    }
}

pub struct AppState {
    pub settings: Settings,
    pub db: Arc<dyn Persistence>,
    pub registry: Arc<ServiceRegistry>,
    pub pipeline: Arc<AnalysisPipeline>,
    pub jobs: Arc<JobManager>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub user_limiter: RateLimiter,
    pub ip_limiter: RateLimiter,
}

impl AppState {
    pub fn assemble(
        settings: Settings,
        db: Arc<dyn Persistence>,
        registry: Arc<ServiceRegistry>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Arc<AppState> {
        let pipeline = Arc::new(AnalysisPipeline::new(
            registry.clone(),
            db.clone(),
            settings.max_user_input_length,
        ));
        let jobs = JobManager::new(db.clone(), pipeline.clone());
        let user_limiter =
            RateLimiter::new(settings.rate_limit_per_min, settings.rate_limit_burst);
        let ip_limiter =
            RateLimiter::new(settings.rate_limit_ip_per_min, settings.rate_limit_ip_burst);

        Arc::new(AppState {
            settings,
            db,
            registry,
            pipeline,
            jobs,
            verifier,
            user_limiter,
            ip_limiter,
        })
    }
}

fn init_tracing() {
    if tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish(),
    )
    .is_err()
    {
        // Subscriber already installed by tests or an embedding runtime.
    }
}

fn build_persistence(settings: &Settings) -> Result<Arc<dyn Persistence>, String> {
    if settings.database_url.starts_with("postgresql://")
        || settings.database_url.starts_with("postgres://")
    {
        let db = PgPersistence::connect(&settings.database_url, DB_POOL_SIZE)
            .map_err(|e| format!("database connection failed: {e}"))?;
        Ok(Arc::new(db))
    } else {
        Err(format!(
            "DATABASE_URL scheme is recognized but this build only enables the postgres backend: {}",
            settings.database_url.chars().take(20).collect::<String>()
        ))
    }
}

fn build_registry(settings: &Settings) -> Result<Arc<ServiceRegistry>, String> {
    let registry = Arc::new(ServiceRegistry::new());

    let lumen = LumenService::from_settings(settings)
        .map_err(|e| format!("failed to build Lumen client: {e}"))?;
    let descriptor = lumen.descriptor();
    registry
        .register(Arc::new(lumen), descriptor)
        .map_err(|e| e.to_string())?;

    let argus = ArgusService::from_settings(settings)
        .map_err(|e| format!("failed to build Argus client: {e}"))?;
    let descriptor = argus.descriptor();
    registry
        .register(Arc::new(argus), descriptor)
        .map_err(|e| e.to_string())?;

    Ok(registry)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    init_tracing();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let db = match build_persistence(&settings) {
        Ok(db) => db,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let registry = match build_registry(&settings) {
        Ok(registry) => registry,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let verifier: Arc<dyn TokenVerifier> = match JwksVerifier::new(
        settings.oidc_jwks_url.clone(),
        settings.oidc_issuer.clone(),
        settings.oidc_audience.clone(),
    ) {
        Ok(verifier) => Arc::new(verifier),
        Err(e) => {
            error!("failed to build token verifier: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState::assemble(settings, db, registry, verifier);

    state.jobs.spawn_workers(state.settings.job_workers);
    state
        .jobs
        .spawn_sweeper(state.settings.job_retention, state.settings.job_stale_after);

    // Seed availability flags before traffic arrives; later refreshes come
    // through /services/health.
    {
        let registry = state.registry.clone();
        tokio::spawn(async move {
            registry.health_check_all(STARTUP_PROBE_TIMEOUT).await;
        });
    }

    let app = web::router(state.clone());
    let addr = state.settings.bind_addr;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!(
        %addr,
        name = %state.settings.app_name,
        version = %state.settings.app_version,
        "gateway listening"
    );

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!("server failure: {e}");
        std::process::exit(1);
    }

    state.jobs.shutdown();
}
