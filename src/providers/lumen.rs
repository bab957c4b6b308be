//! Lumen provider plugin.
//!
//! Lumen fronts the prompt-optimization stage and doubles as a fallback
//! analyzer. Wire format is the usual chat-completions shape with bearer
//! auth; the whole call shares the global outbound timeout budget.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use super::http::{ClientOptions, ResilientClient};
use super::{parse_chat_content, ProviderError};
use crate::config::Settings;
use crate::registry::{
    AiService, Capability, InvokeOptions, InvokeOutput, ServiceDescriptor, ServiceType,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_BUDGET: Duration = Duration::from_secs(10);
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2000;

pub struct LumenService {
    client: ResilientClient,
    endpoint: Url,
    api_key: String,
    model: String,
    budget: Duration,
}

impl LumenService {
    pub fn from_settings(settings: &Settings) -> Result<Self, reqwest::Error> {
        let client = ResilientClient::new(ClientOptions {
            connect_timeout: CONNECT_TIMEOUT,
            pool_max_idle: settings.http_max_keepalive,
            pool_idle_timeout: Duration::from_secs(60),
            max_retries: settings.http_max_retries,
            backoff_base: settings.http_retry_backoff,
        })?;
        Ok(Self {
            client,
            endpoint: settings.lumen_api_url.clone(),
            api_key: settings.lumen_api_key.clone(),
            model: settings.lumen_model.clone(),
            budget: settings.http_timeout,
        })
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(header::AUTHORIZATION, value);
        }
        headers
    }

    fn build_payload(&self, input: &str, opts: &InvokeOptions) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &opts.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": input}));

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": opts.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            "max_tokens": opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        })
    }
}

#[async_trait]
impl AiService for LumenService {
    async fn invoke(
        &self,
        input: &str,
        opts: &InvokeOptions,
    ) -> Result<InvokeOutput, ProviderError> {
        let payload = self.build_payload(input, opts);
        let body = self
            .client
            .post_json(&self.endpoint, self.auth_headers(), &payload, self.budget)
            .await?;
        parse_chat_content(&body)
    }

    async fn health(&self) -> bool {
        let payload = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });
        match self
            .client
            .post_json(&self.endpoint, self.auth_headers(), &payload, HEALTH_BUDGET)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Lumen health check failed: {e}");
                false
            }
        }
    }

    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            id: "lumen-chat".to_string(),
            provider: "Lumen".to_string(),
            model: self.model.clone(),
            capabilities: [
                Capability::PromptOptimization,
                Capability::GenericAnalysis,
                Capability::DocumentAnalysis,
                Capability::ChatProcessing,
                Capability::SeoGeneration,
            ]
            .into_iter()
            .collect(),
            service_types: [ServiceType::PromptOptimizer, ServiceType::Analyzer]
                .into_iter()
                .collect(),
            priority: 2,
            available: true,
        }
    }
}
