use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod claude;
pub mod retry;

/// Token counters as reported by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Result of one successful completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyOutcome {
    /// Concatenation of every text content block, in response order.
    pub text: String,
    /// `None` when the upstream response carried no usage object.
    pub usage: Option<Usage>,
}

/// A completion API that answers one user turn under a system prompt.
///
/// Each call is independent: no conversation history is sent, and callers
/// that split a message into chunks concatenate the replies themselves.
/// Implementations must not retry internally.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, chunk_text: &str, system_prompt: &str) -> Result<ReplyOutcome>;
}
