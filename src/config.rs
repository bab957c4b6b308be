//! Environment-driven settings with fail-fast validation.
//!
//! Every recognized option is read once at startup. Violations are collected
//! and reported together so an operator can fix a broken deployment in one
//! pass instead of playing whack-a-mole.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

/// Issuer hosts we accept tokens from. The identity provider is external;
/// anything outside this list is a misconfiguration, not a runtime decision.
const RECOGNIZED_ISSUER_SUFFIXES: &[&str] = &[
    "accounts.google.com",
    ".auth0.com",
    ".okta.com",
];

const DEFAULT_LUMEN_API_URL: &str = "https://api.lumen.ai/v1/chat/completions";
const DEFAULT_ARGUS_API_URL: &str = "https://api.argus.dev/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: String,
    pub app_version: String,
    pub git_sha: String,
    pub bind_addr: SocketAddr,
    pub debug: bool,
    pub testing: bool,

    // Provider credentials and endpoints
    pub lumen_api_key: String,
    pub lumen_api_url: Url,
    pub lumen_model: String,
    pub argus_api_key: String,
    pub argus_api_url: Url,
    pub argus_model: String,

    // Token verification
    pub oidc_issuer: String,
    pub oidc_audience: String,
    pub oidc_jwks_url: Url,

    // CORS allow-list (validated here, enforced by the edge layer)
    pub cors_origins: Vec<String>,

    // Outbound HTTP
    pub http_timeout: Duration,
    pub http_max_retries: u32,
    pub http_retry_backoff: Duration,
    pub http_max_connections: usize,
    pub http_max_keepalive: usize,

    // Analyzer (stage 2) granular timeouts
    pub argus_connect_timeout: Duration,
    pub argus_read_timeout: Duration,
    pub argus_write_timeout: Duration,
    pub argus_pool_timeout: Duration,

    // Rate limiting
    pub rate_limit_per_min: u32,
    pub rate_limit_burst: u32,
    pub rate_limit_ip_per_min: u32,
    pub rate_limit_ip_burst: u32,

    // Input limits
    pub max_user_input_length: usize,
    pub body_max_bytes: usize,

    // Async jobs
    pub job_retention: Duration,
    pub job_stale_after: Duration,
    pub job_workers: usize,

    pub database_url: String,
}

impl Settings {
    /// Load settings from the environment, validating everything up front.
    ///
    /// Returns the complete list of violations joined into one error so the
    /// process can refuse to start with a single actionable message.
    pub fn from_env() -> Result<Self, String> {
        let mut errors: Vec<String> = Vec::new();

        let testing = env_str("TESTING", "0") == "1";
        let debug = env_str("DEBUG", "false").to_ascii_lowercase() == "true";

        let mut lumen_api_key = env::var("LUMEN_API_KEY").unwrap_or_default();
        let mut argus_api_key = env::var("ARGUS_API_KEY").unwrap_or_default();
        if testing {
            if lumen_api_key.is_empty() {
                lumen_api_key = "test-lumen-key".to_string();
            }
            if argus_api_key.is_empty() {
                argus_api_key = "test-argus-key".to_string();
            }
        } else {
            if lumen_api_key.trim().len() < 10 {
                errors.push(
                    "LUMEN_API_KEY is missing or too short (minimum 10 characters)".to_string(),
                );
            }
            if argus_api_key.trim().len() < 10 {
                errors.push(
                    "ARGUS_API_KEY is missing or too short (minimum 10 characters)".to_string(),
                );
            }
        }

        let lumen_api_url = parse_http_url("LUMEN_API_URL", DEFAULT_LUMEN_API_URL, &mut errors);
        let argus_api_url = parse_http_url("ARGUS_API_URL", DEFAULT_ARGUS_API_URL, &mut errors);

        let lumen_model = env_str("LUMEN_MODEL", "lumen-large");
        let argus_model = env_str("ARGUS_MODEL", "argus-1");
        if lumen_model.trim().is_empty() {
            errors.push("LUMEN_MODEL cannot be empty".to_string());
        }
        if argus_model.trim().is_empty() {
            errors.push("ARGUS_MODEL cannot be empty".to_string());
        }

        let mut oidc_issuer = env::var("OIDC_ISSUER").unwrap_or_default();
        let mut oidc_audience = env::var("OIDC_AUDIENCE").unwrap_or_default();
        if testing {
            if oidc_issuer.is_empty() {
                oidc_issuer = "https://accounts.google.com".to_string();
            }
            if oidc_audience.is_empty() {
                oidc_audience = "test-audience".to_string();
            }
        } else {
            if oidc_issuer.is_empty() {
                errors.push("OIDC_ISSUER is required".to_string());
            } else {
                let https = Url::parse(&oidc_issuer)
                    .map(|u| u.scheme() == "https")
                    .unwrap_or(false);
                let suffix_ok = RECOGNIZED_ISSUER_SUFFIXES
                    .iter()
                    .any(|s| oidc_issuer.trim_end_matches('/').ends_with(s));
                if !https || !suffix_ok {
                    errors.push(format!(
                        "OIDC_ISSUER must be an https URL ending with a recognized identity provider suffix: {oidc_issuer}"
                    ));
                }
            }
            if oidc_audience.is_empty() {
                errors.push("OIDC_AUDIENCE is required".to_string());
            }
        }

        let default_jwks = format!(
            "{}/.well-known/jwks.json",
            oidc_issuer.trim_end_matches('/')
        );
        let jwks_default: &str = if oidc_issuer.is_empty() {
            "https://accounts.google.com/.well-known/jwks.json"
        } else {
            &default_jwks
        };
        let oidc_jwks_url = parse_http_url("OIDC_JWKS_URL", jwks_default, &mut errors);

        let mut cors_origins: Vec<String> = env::var("CORS_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if cors_origins.is_empty() && debug {
            cors_origins = vec!["http://localhost:3000".to_string()];
        }
        if !debug && !testing {
            if cors_origins.is_empty() {
                errors.push("CORS_ORIGINS is required in production mode".to_string());
            }
            for origin in &cors_origins {
                if origin == "*" {
                    errors.push(
                        "Wildcard (*) CORS origin is not allowed in production mode".to_string(),
                    );
                }
            }
        }
        for origin in &cors_origins {
            if origin != "*" && !origin.starts_with("http://") && !origin.starts_with("https://") {
                errors.push(format!("Invalid CORS origin: {origin}"));
            }
        }

        let http_timeout_secs = parse_u64("HTTP_TIMEOUT_SECONDS", 120, &mut errors);
        if !(1..=300).contains(&http_timeout_secs) {
            errors.push(format!(
                "HTTP_TIMEOUT_SECONDS must be 1-300, got: {http_timeout_secs}"
            ));
        }
        let http_max_retries = parse_u64("HTTP_MAX_RETRIES", 1, &mut errors);
        if http_max_retries > 10 {
            errors.push(format!(
                "HTTP_MAX_RETRIES must be 0-10, got: {http_max_retries}"
            ));
        }
        let http_retry_backoff_ms = parse_u64("HTTP_RETRY_BACKOFF_MS", 500, &mut errors);
        if http_retry_backoff_ms == 0 {
            errors.push("HTTP_RETRY_BACKOFF_MS must be positive".to_string());
        }
        let http_max_connections = parse_u64("HTTP_MAX_CONNECTIONS", 100, &mut errors);
        if !(1..=10_000).contains(&http_max_connections) {
            errors.push(format!(
                "HTTP_MAX_CONNECTIONS must be 1-10000, got: {http_max_connections}"
            ));
        }
        let http_max_keepalive = parse_u64("HTTP_MAX_KEEPALIVE", 10, &mut errors);
        if !(1..=10_000).contains(&http_max_keepalive) {
            errors.push(format!(
                "HTTP_MAX_KEEPALIVE must be 1-10000, got: {http_max_keepalive}"
            ));
        }

        let argus_connect = parse_f64("ARGUS_CONNECT_TIMEOUT", 10.0, &mut errors);
        if !(0.1..=60.0).contains(&argus_connect) {
            errors.push(format!(
                "ARGUS_CONNECT_TIMEOUT must be 0.1-60, got: {argus_connect}"
            ));
        }
        let argus_read = parse_f64("ARGUS_READ_TIMEOUT", 200.0, &mut errors);
        if !(0.1..=600.0).contains(&argus_read) {
            errors.push(format!(
                "ARGUS_READ_TIMEOUT must be 0.1-600, got: {argus_read}"
            ));
        }
        let argus_write = parse_f64("ARGUS_WRITE_TIMEOUT", 30.0, &mut errors);
        if !(0.1..=120.0).contains(&argus_write) {
            errors.push(format!(
                "ARGUS_WRITE_TIMEOUT must be 0.1-120, got: {argus_write}"
            ));
        }
        let argus_pool = parse_f64("ARGUS_POOL_TIMEOUT", 5.0, &mut errors);
        if !(0.1..=30.0).contains(&argus_pool) {
            errors.push(format!(
                "ARGUS_POOL_TIMEOUT must be 0.1-30, got: {argus_pool}"
            ));
        }

        let rate_limit_per_min = parse_u64("RATE_LIMIT_PER_MIN", 60, &mut errors);
        if !(1..=10_000).contains(&rate_limit_per_min) {
            errors.push(format!(
                "RATE_LIMIT_PER_MIN must be 1-10000, got: {rate_limit_per_min}"
            ));
        }
        let rate_limit_burst = parse_u64("RATE_LIMIT_BURST", 120, &mut errors);
        if rate_limit_burst < rate_limit_per_min {
            errors.push(format!(
                "RATE_LIMIT_BURST ({rate_limit_burst}) must be >= RATE_LIMIT_PER_MIN ({rate_limit_per_min})"
            ));
        }
        let rate_limit_ip_per_min = parse_u64("RATE_LIMIT_IP_PER_MIN", 300, &mut errors);
        let rate_limit_ip_burst = parse_u64("RATE_LIMIT_IP_BURST", 600, &mut errors);
        if rate_limit_ip_burst < rate_limit_ip_per_min {
            errors.push(format!(
                "RATE_LIMIT_IP_BURST ({rate_limit_ip_burst}) must be >= RATE_LIMIT_IP_PER_MIN ({rate_limit_ip_per_min})"
            ));
        }

        let max_user_input_length = parse_u64("MAX_USER_INPUT_LENGTH", 5000, &mut errors);
        if max_user_input_length == 0 {
            errors.push("MAX_USER_INPUT_LENGTH must be positive".to_string());
        }
        let body_max_bytes = parse_u64("BODY_MAX_BYTES", 1_000_000, &mut errors);
        if body_max_bytes == 0 {
            errors.push("BODY_MAX_BYTES must be positive".to_string());
        }

        let job_retention_secs = parse_u64("JOB_RETENTION_SECS", 3600, &mut errors);
        if job_retention_secs == 0 {
            errors.push("JOB_RETENTION_SECS must be positive".to_string());
        }
        let job_stale_secs = parse_u64("JOB_STALE_SECS", 900, &mut errors);
        if job_stale_secs == 0 {
            errors.push("JOB_STALE_SECS must be positive".to_string());
        }
        let job_workers = parse_u64("JOB_WORKERS", 2, &mut errors);
        if !(1..=64).contains(&job_workers) {
            errors.push(format!("JOB_WORKERS must be 1-64, got: {job_workers}"));
        }

        let database_url = env_str("DATABASE_URL", "postgresql://localhost/mindgate");
        if !is_valid_database_url(&database_url) {
            errors.push(format!(
                "DATABASE_URL scheme is not recognized: {}",
                database_url.chars().take(50).collect::<String>()
            ));
        }

        let bind_addr_raw = env_str("BIND_ADDR", "127.0.0.1:8000");
        let bind_addr = match bind_addr_raw.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(_) => {
                errors.push(format!("BIND_ADDR is not a valid socket address: {bind_addr_raw}"));
                SocketAddr::from(([127, 0, 0, 1], 8000))
            }
        };

        if !errors.is_empty() {
            return Err(format!(
                "configuration validation failed:\n{}",
                errors
                    .iter()
                    .map(|e| format!("  - {e}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            ));
        }

        Ok(Settings {
            app_name: env_str("APP_NAME", "MindGate API"),
            app_version: env_str("APP_VERSION", env!("CARGO_PKG_VERSION")),
            git_sha: env_str("GIT_SHA", "-"),
            bind_addr,
            debug,
            testing,
            lumen_api_key,
            lumen_api_url,
            lumen_model,
            argus_api_key,
            argus_api_url,
            argus_model,
            oidc_issuer,
            oidc_audience,
            oidc_jwks_url,
            cors_origins,
            http_timeout: Duration::from_secs(http_timeout_secs),
            http_max_retries: http_max_retries as u32,
            http_retry_backoff: Duration::from_millis(http_retry_backoff_ms),
            http_max_connections: http_max_connections as usize,
            http_max_keepalive: http_max_keepalive as usize,
            argus_connect_timeout: Duration::from_secs_f64(argus_connect),
            argus_read_timeout: Duration::from_secs_f64(argus_read),
            argus_write_timeout: Duration::from_secs_f64(argus_write),
            argus_pool_timeout: Duration::from_secs_f64(argus_pool),
            rate_limit_per_min: rate_limit_per_min as u32,
            rate_limit_burst: rate_limit_burst as u32,
            rate_limit_ip_per_min: rate_limit_ip_per_min as u32,
            rate_limit_ip_burst: rate_limit_ip_burst as u32,
            max_user_input_length: max_user_input_length as usize,
            body_max_bytes: body_max_bytes as usize,
            job_retention: Duration::from_secs(job_retention_secs),
            job_stale_after: Duration::from_secs(job_stale_secs),
            job_workers: job_workers as usize,
            database_url,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn parse_u64(key: &str, default: u64, errors: &mut Vec<String>) -> u64 {
    let raw = env_str(key, &default.to_string());
    match raw.trim().parse::<u64>() {
        Ok(v) => v,
        Err(_) => {
            errors.push(format!("Invalid {key}: must be an integer, got '{raw}'"));
            default
        }
    }
}

fn parse_f64(key: &str, default: f64, errors: &mut Vec<String>) -> f64 {
    let raw = env_str(key, &default.to_string());
    match raw.trim().parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            errors.push(format!("Invalid {key}: must be a number, got '{raw}'"));
            default
        }
    }
}

fn parse_http_url(key: &str, default: &str, errors: &mut Vec<String>) -> Url {
    let raw = env_str(key, default);
    match Url::parse(&raw) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => url,
        _ => {
            errors.push(format!("{key} is not a valid http(s) URL: {raw}"));
            Url::parse(default).expect("default URL is well-formed")
        }
    }
}

fn is_valid_database_url(url: &str) -> bool {
    const SCHEMES: &[&str] = &["postgresql://", "postgres://", "sqlite://", "mysql://"];
    SCHEMES.iter().any(|s| url.starts_with(s))
}
