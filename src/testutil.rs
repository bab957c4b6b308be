//! Shared fixtures for unit tests: scripted provider plugins, a static token
//! verifier, and a fully assembled router over the in-memory store.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use url::Url;

use crate::config::Settings;
use crate::jwt::{AuthError, Claims, TokenVerifier};
use crate::persistence::memory::MemoryPersistence;
use crate::providers::ProviderError;
use crate::registry::{
    AiService, Capability, InvokeOptions, InvokeOutput, ServiceDescriptor, ServiceRegistry,
    ServiceType,
};
use crate::{web, AppState};

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_SUBJECT: &str = "test-subject";

type Responder = Box<dyn Fn(&str) -> Result<String, ProviderError> + Send + Sync>;

pub struct MockService {
    descriptor: ServiceDescriptor,
    delay: Duration,
    respond: Responder,
}

impl MockService {
    fn entry(
        descriptor: ServiceDescriptor,
        delay: Duration,
        respond: Responder,
    ) -> (Arc<dyn AiService>, ServiceDescriptor) {
        let plugin: Arc<dyn AiService> = Arc::new(MockService {
            descriptor: descriptor.clone(),
            delay,
            respond,
        });
        (plugin, descriptor)
    }

    fn analyzer_descriptor(id: &str, priority: i32) -> ServiceDescriptor {
        ServiceDescriptor {
            id: id.to_string(),
            provider: "mock".to_string(),
            model: "mock-1".to_string(),
            capabilities: [
                Capability::GenericAnalysis,
                Capability::DocumentAnalysis,
                Capability::ChatProcessing,
                Capability::SeoGeneration,
                Capability::CryptoAnalysis,
            ]
            .into_iter()
            .collect(),
            service_types: [ServiceType::Analyzer].into_iter().collect(),
            priority,
            available: true,
        }
    }

    pub fn analyzer(id: &str, priority: i32) -> (Arc<dyn AiService>, ServiceDescriptor) {
        Self::entry(
            Self::analyzer_descriptor(id, priority),
            Duration::ZERO,
            Box::new(|input| Ok(format!("analysis: {input}"))),
        )
    }

    pub fn slow_analyzer(
        id: &str,
        priority: i32,
        delay: Duration,
    ) -> (Arc<dyn AiService>, ServiceDescriptor) {
        Self::entry(
            Self::analyzer_descriptor(id, priority),
            delay,
            Box::new(|input| Ok(format!("analysis: {input}"))),
        )
    }

    pub fn failing_analyzer(
        id: &str,
        priority: i32,
        error: ProviderError,
    ) -> (Arc<dyn AiService>, ServiceDescriptor) {
        Self::entry(
            Self::analyzer_descriptor(id, priority),
            Duration::ZERO,
            Box::new(move |_| Err(clone_provider_error(&error))),
        )
    }
}

#[async_trait]
impl AiService for MockService {
    async fn invoke(
        &self,
        input: &str,
        _opts: &InvokeOptions,
    ) -> Result<InvokeOutput, ProviderError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(input).map(|content| InvokeOutput {
            content,
            prompt_tokens: Some(10),
            completion_tokens: Some(20),
        })
    }

    async fn health(&self) -> bool {
        true
    }

    fn descriptor(&self) -> ServiceDescriptor {
        self.descriptor.clone()
    }
}

pub fn optimizer_entry(id: &str, priority: i32) -> (Arc<dyn AiService>, ServiceDescriptor) {
    let descriptor = ServiceDescriptor {
        id: id.to_string(),
        provider: "mock".to_string(),
        model: "mock-opt".to_string(),
        capabilities: [
            Capability::PromptOptimization,
            Capability::GenericAnalysis,
            Capability::DocumentAnalysis,
            Capability::ChatProcessing,
            Capability::SeoGeneration,
        ]
        .into_iter()
        .collect(),
        service_types: [ServiceType::PromptOptimizer].into_iter().collect(),
        priority,
        available: true,
    };
    MockService::entry(
        descriptor,
        Duration::ZERO,
        Box::new(|input| Ok(format!("optimized: {input}"))),
    )
}

fn clone_provider_error(error: &ProviderError) -> ProviderError {
    match error {
        ProviderError::RateLimited { retry_after } => ProviderError::RateLimited {
            retry_after: *retry_after,
        },
        ProviderError::Timeout => ProviderError::Timeout,
        ProviderError::Transport(msg) => ProviderError::Transport(msg.clone()),
        ProviderError::Status { status } => ProviderError::Status { status: *status },
        ProviderError::InvalidResponse => ProviderError::InvalidResponse,
    }
}

pub struct StaticVerifier {
    tokens: HashMap<String, Claims>,
}

impl StaticVerifier {
    pub fn single(token: &str, sub: &str, email: Option<&str>) -> Arc<Self> {
        let claims = Claims {
            sub: sub.to_string(),
            email: email.map(ToString::to_string),
            exp: 4_102_444_800,
            iss: Some("https://accounts.google.com".to_string()),
        };
        Arc::new(Self {
            tokens: HashMap::from([(token.to_string(), claims)]),
        })
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::Rejected("unknown test token"))
    }
}

pub fn test_settings() -> Settings {
    Settings {
        app_name: "MindGate API".to_string(),
        app_version: "0.0.0-test".to_string(),
        git_sha: "deadbeef".to_string(),
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        debug: true,
        testing: true,
        lumen_api_key: "test-lumen-key".to_string(),
        lumen_api_url: Url::parse("https://api.lumen.ai/v1/chat/completions").unwrap(),
        lumen_model: "lumen-large".to_string(),
        argus_api_key: "test-argus-key".to_string(),
        argus_api_url: Url::parse("https://api.argus.dev/v1/chat/completions").unwrap(),
        argus_model: "argus-1".to_string(),
        oidc_issuer: "https://accounts.google.com".to_string(),
        oidc_audience: "mindgate-test".to_string(),
        oidc_jwks_url: Url::parse("https://accounts.google.com/.well-known/jwks.json").unwrap(),
        cors_origins: vec!["http://localhost:3000".to_string()],
        http_timeout: Duration::from_secs(5),
        http_max_retries: 1,
        http_retry_backoff: Duration::from_millis(10),
        http_max_connections: 10,
        http_max_keepalive: 2,
        argus_connect_timeout: Duration::from_secs(1),
        argus_read_timeout: Duration::from_secs(5),
        argus_write_timeout: Duration::from_secs(1),
        argus_pool_timeout: Duration::from_secs(1),
        rate_limit_per_min: 60,
        rate_limit_burst: 120,
        rate_limit_ip_per_min: 300,
        rate_limit_ip_burst: 600,
        max_user_input_length: 5000,
        body_max_bytes: 4096,
        job_retention: Duration::from_secs(3600),
        job_stale_after: Duration::from_secs(900),
        job_workers: 1,
        database_url: "postgresql://localhost/mindgate-test".to_string(),
    }
}

pub struct Harness {
    pub state: Arc<AppState>,
    pub db: Arc<MemoryPersistence>,
    pub registry: Arc<ServiceRegistry>,
}

impl Harness {
    pub fn app(&self) -> Router {
        web::router(self.state.clone())
    }
}

/// A healthy two-provider gateway over the in-memory store.
pub fn harness() -> Harness {
    harness_with_settings(test_settings())
}

pub fn harness_with_settings(settings: Settings) -> Harness {
    let registry = Arc::new(ServiceRegistry::new());
    let (plugin, descriptor) = optimizer_entry("mock-optimizer", 1);
    registry.register(plugin, descriptor).unwrap();
    let (plugin, descriptor) = MockService::analyzer("mock-analyzer", 1);
    registry.register(plugin, descriptor).unwrap();
    harness_custom(settings, registry)
}

pub fn harness_custom(settings: Settings, registry: Arc<ServiceRegistry>) -> Harness {
    let db = Arc::new(MemoryPersistence::new());
    let verifier = StaticVerifier::single(TEST_TOKEN, TEST_SUBJECT, Some("test@example.com"));
    let state = AppState::assemble(settings, db.clone(), registry.clone(), verifier);
    Harness {
        state,
        db,
        registry,
    }
}

/// Drive one request through the router and decode the JSON body.
pub async fn send(
    app: Router,
    method: &str,
    uri: &str,
    auth: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        // oneshot never opens a socket, so attribute the client the way a
        // proxy would.
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(token) = auth {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }

    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, value)
}

/// Assert the uniform error envelope: shape, code, and the correlation id
/// matching the response header.
pub fn assert_error_envelope(body: &Value, headers: &HeaderMap, code: &str) {
    let error = body
        .get("error")
        .unwrap_or_else(|| panic!("missing error envelope: {body}"));
    assert_eq!(error["code"], code, "body: {body}");
    assert!(
        error["message"].as_str().is_some_and(|m| !m.is_empty()),
        "empty message: {body}"
    );
    let correlation = error["correlation_id"].as_str().expect("correlation_id");
    let header_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("x-request-id header");
    assert_eq!(correlation, header_id);
    assert_eq!(
        error.as_object().unwrap().len(),
        3,
        "envelope must carry exactly message/code/correlation_id: {body}"
    );
}
