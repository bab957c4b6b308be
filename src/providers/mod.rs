//! Provider plugins and their shared outbound HTTP plumbing.

pub mod argus;
pub mod http;
pub mod lumen;

use serde_json::Value;

use crate::registry::InvokeOutput;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rate limited")]
    RateLimited { retry_after: Option<u64> },
    #[error("provider request timed out")]
    Timeout,
    #[error("provider transport error: {0}")]
    Transport(String),
    #[error("provider returned status {status}")]
    Status { status: u16 },
    #[error("provider response missing expected fields")]
    InvalidResponse,
}

/// Pull `choices[0].message.content` and the usage counters out of a
/// chat-completion-shaped body. Anything else is an invalid response.
pub(crate) fn parse_chat_content(body: &Value) -> Result<InvokeOutput, ProviderError> {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(ProviderError::InvalidResponse)?;

    let usage = body.get("usage");
    let prompt_tokens = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_i64);
    let completion_tokens = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_i64);

    Ok(InvokeOutput {
        content: content.to_string(),
        prompt_tokens,
        completion_tokens,
    })
}
