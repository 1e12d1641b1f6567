use crate::config::UpstreamConfig;
use crate::dispatch::size::size_of;
use crate::error::{GatewayError, Result};
use crate::providers::{CompletionProvider, ReplyOutcome, Usage};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error};

/// Anthropic Messages API client.
pub struct ClaudeProvider {
    api_key: String,
    base_url: String,
    client: Client,
    model: String,
    version: String,
    max_tokens: u32,
    temperature: f32,
}

impl ClaudeProvider {
    pub fn new(config: &UpstreamConfig, api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            api_key: api_key.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            model: config.model.clone(),
            version: config.api_version.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn build_body(&self, chunk_text: &str, system_prompt: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [
                { "role": "user", "content": chunk_text }
            ],
        });

        if !system_prompt.is_empty() {
            body["system"] = serde_json::json!(system_prompt);
        }

        body
    }
}

/// Pull the reply text and usage counters out of a Messages API response body.
fn parse_reply(data: &serde_json::Value) -> Result<ReplyOutcome> {
    let blocks = data["content"].as_array().ok_or_else(|| {
        GatewayError::MalformedUpstreamResponse("response has no content array".to_string())
    })?;

    let texts: Vec<&str> = blocks
        .iter()
        .filter(|block| block["type"].as_str() == Some("text"))
        .filter_map(|block| block["text"].as_str())
        .collect();

    if texts.is_empty() {
        return Err(GatewayError::MalformedUpstreamResponse(
            "response contains no text blocks".to_string(),
        ));
    }

    let usage = data.get("usage").and_then(|usage| {
        Some(Usage {
            input_tokens: usage["input_tokens"].as_u64()?,
            output_tokens: usage["output_tokens"].as_u64()?,
        })
    });

    Ok(ReplyOutcome {
        text: texts.concat(),
        usage,
    })
}

#[async_trait]
impl CompletionProvider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn complete(&self, chunk_text: &str, system_prompt: &str) -> Result<ReplyOutcome> {
        let body = self.build_body(chunk_text, system_prompt);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let detail = if e.is_timeout() {
                    format!("request timed out: {}", e)
                } else {
                    e.to_string()
                };
                GatewayError::upstream(None, detail)
            })?;

        let status = response.status();

        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(GatewayError::ChunkTooLarge {
                index: 0,
                size: size_of(chunk_text),
            });
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GatewayError::upstream(
                Some(status.as_u16()),
                format!("Claude API error: {}", error_text),
            ));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| GatewayError::upstream(Some(status.as_u16()), e.to_string()))?;

        let outcome = serde_json::from_str::<serde_json::Value>(&raw)
            .map_err(|e| GatewayError::MalformedUpstreamResponse(format!("invalid JSON: {}", e)))
            .and_then(|data| parse_reply(&data));

        match &outcome {
            Ok(reply) => debug!(
                bytes = reply.text.len(),
                has_usage = reply.usage.is_some(),
                "Claude reply received"
            ),
            Err(e) => error!(kind = "malformed", error = %e, "Unusable response from Claude API"),
        }

        outcome
    }
}
