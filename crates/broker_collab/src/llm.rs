//! LLM gateway client and JSON extraction helpers.

use crate::http::HttpClient;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Opaque text generation. The orchestrator never sees provider details.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Chat-completions style gateway over the shared HTTP core.
pub struct HttpLlmClient {
    http: HttpClient,
    model: String,
}

impl HttpLlmClient {
    pub fn new(http: HttpClient, model: &str) -> Self {
        tracing::info!("LLM client initialized with model {}", model);
        Self {
            http,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let response = self
            .http
            .post_json("/v1/chat/completions", &body)
            .await?
            .ok_or_else(|| anyhow!("LLM gateway returned no content"))?;

        response
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow!("Malformed LLM gateway response"))
    }
}

/// Pull a JSON object out of model output: fenced ```json blocks first, then
/// bare fences, then the outermost brace span.
pub fn extract_json(text: &str) -> Option<Value> {
    let candidate = if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        let end = rest.find("```")?;
        rest[..end].trim().to_string()
    } else if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        let end = rest.find("```")?;
        rest[..end].trim().to_string()
    } else {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        text[start..=end].to_string()
    };
    serde_json::from_str(&candidate).ok()
}
