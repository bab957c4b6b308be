//! Argus provider plugin.
//!
//! Argus serves the analysis stage. It differs from Lumen only in wire
//! details: `x-api-key` auth instead of a bearer header, and a granular
//! timeout profile because analysis responses run long.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use super::http::{ClientOptions, ResilientClient};
use super::{parse_chat_content, ProviderError};
use crate::config::Settings;
use crate::registry::{
    AiService, Capability, InvokeOptions, InvokeOutput, ServiceDescriptor, ServiceType,
};

const HEALTH_BUDGET: Duration = Duration::from_secs(10);
const DEFAULT_TEMPERATURE: f32 = 0.8;
const DEFAULT_MAX_TOKENS: u32 = 3000;

pub struct ArgusService {
    client: ResilientClient,
    endpoint: Url,
    api_key: String,
    model: String,
    budget: Duration,
}

impl ArgusService {
    pub fn from_settings(settings: &Settings) -> Result<Self, reqwest::Error> {
        let client = ResilientClient::new(ClientOptions {
            connect_timeout: settings.argus_connect_timeout,
            pool_max_idle: settings.http_max_keepalive,
            pool_idle_timeout: settings.argus_pool_timeout,
            max_retries: settings.http_max_retries,
            backoff_base: settings.http_retry_backoff,
        })?;
        // Stage-2 requests budget the read and write legs together; connect
        // and pool waits are bounded by the client options above.
        let budget = settings.argus_read_timeout + settings.argus_write_timeout;
        Ok(Self {
            client,
            endpoint: settings.argus_api_url.clone(),
            api_key: settings.argus_api_key.clone(),
            model: settings.argus_model.clone(),
            budget,
        })
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&self.api_key) {
            headers.insert("x-api-key", value);
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
impl AiService for ArgusService {
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
                warn!("Argus health check failed: {e}");
                false
            }
        }
    }

    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            id: "argus-analysis".to_string(),
            provider: "Argus".to_string(),
            model: self.model.clone(),
            capabilities: [
                Capability::GenericAnalysis,
                Capability::DocumentAnalysis,
                Capability::CryptoAnalysis,
            ]
            .into_iter()
            .collect(),
            service_types: [ServiceType::Analyzer].into_iter().collect(),
            priority: 1,
            available: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ArgusService {
        ArgusService {
            client: ResilientClient::new(ClientOptions {
                connect_timeout: Duration::from_secs(10),
                pool_max_idle: 2,
                pool_idle_timeout: Duration::from_secs(5),
                max_retries: 0,
                backoff_base: Duration::from_millis(10),
            })
            .unwrap(),
            endpoint: Url::parse("https://api.argus.dev/v1/chat/completions").unwrap(),
            api_key: "test-argus-key".to_string(),
            model: "argus-1".to_string(),
            budget: Duration::from_secs(5),
        }
    }

    #[test]
    fn payload_uses_analysis_defaults() {
        let svc = service();
        let payload = svc.build_payload("analyze this", &InvokeOptions::default());
        assert_eq!(payload["model"], "argus-1");
        assert_eq!(payload["max_tokens"], 3000);
        assert!((payload["temperature"].as_f64().unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn auth_uses_api_key_header_not_bearer() {
        let svc = service();
        let headers = svc.auth_headers();
        assert!(headers.contains_key("x-api-key"));
        assert!(!headers.contains_key("authorization"));
    }

    #[test]
    fn descriptor_is_the_preferred_analyzer() {
        let descriptor = service().descriptor();
        assert_eq!(descriptor.priority, 1);
        assert_eq!(
            descriptor.service_types.iter().collect::<Vec<_>>(),
            vec![&ServiceType::Analyzer]
        );
        assert!(descriptor.capabilities.contains(&Capability::CryptoAnalysis));
    }
}
