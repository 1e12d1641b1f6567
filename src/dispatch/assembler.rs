use crate::dispatch::chunker::{Chunk, chunk};
use crate::dispatch::size::estimate_tokens;
use crate::error::{GatewayError, Result};
use crate::providers::CompletionProvider;
use crate::providers::retry::retry_with_backoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Placed between the replies of consecutive chunks.
const REPLY_SEPARATOR: &str = "\n\n";

/// One completed user-message-in, assistant-reply-out round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatExchange {
    pub id: Uuid,
    pub user_message: String,
    pub assistant_reply: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub chunk_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Sends a message to the upstream chunk by chunk and stitches the replies
/// back together.
pub struct ReplyAssembler {
    provider: Arc<dyn CompletionProvider>,
    ceiling: usize,
    max_retries: u32,
    retry_delay: Duration,
}

impl ReplyAssembler {
    pub fn new(provider: Arc<dyn CompletionProvider>, ceiling: usize) -> Self {
        Self {
            provider,
            ceiling,
            max_retries: 0,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Allow up to `max_retries` extra attempts per chunk on transient failures.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Run one exchange. Chunks are dispatched strictly in order, one at a
    /// time; the first failing chunk aborts the exchange and discards any
    /// replies already received.
    pub async fn assemble_reply(&self, message: &str, system_prompt: &str) -> Result<ChatExchange> {
        let chunks = chunk(message, system_prompt, self.ceiling);
        if chunks.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }

        let chunk_count = chunks.len();
        if chunk_count > 1 {
            info!(
                chunks = chunk_count,
                ceiling = self.ceiling,
                provider = self.provider.name(),
                "Message exceeds ceiling, dispatching in chunks"
            );
        }

        let mut replies = Vec::with_capacity(chunk_count);
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        for c in &chunks {
            let reply = self.dispatch(c, system_prompt).await.map_err(|e| {
                warn!(chunk = c.index, chunks = chunk_count, error = %e, "Chunk failed, aborting exchange");
                e
            })?;

            match reply.usage {
                Some(usage) => {
                    input_tokens = input_tokens.saturating_add(usage.input_tokens);
                    output_tokens = output_tokens.saturating_add(usage.output_tokens);
                }
                None => {
                    debug!(chunk = c.index, "No usage reported, estimating from word counts");
                    input_tokens = input_tokens.saturating_add(estimate_tokens(&c.text));
                    output_tokens = output_tokens.saturating_add(estimate_tokens(&reply.text));
                }
            }

            replies.push(reply.text);
        }

        Ok(ChatExchange {
            id: Uuid::new_v4(),
            user_message: message.to_string(),
            assistant_reply: replies.join(REPLY_SEPARATOR),
            input_tokens,
            output_tokens,
            chunk_count,
            timestamp: Utc::now(),
        })
    }

    async fn dispatch(&self, c: &Chunk, system_prompt: &str) -> Result<crate::providers::ReplyOutcome> {
        let provider = self.provider.as_ref();
        retry_with_backoff(self.max_retries, self.retry_delay, || async move {
            provider.complete(&c.text, system_prompt).await
        })
        .await
        .map_err(|e| match e {
            GatewayError::ChunkTooLarge { size, .. } => GatewayError::ChunkTooLarge {
                index: c.index,
                size,
            },
            other => other,
        })
    }
}
