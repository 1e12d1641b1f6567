//! Durable storage ports.
//!
//! The gateway only ever talks to [`BlobStore`] and [`UsageStore`]; which
//! backend sits behind them is decided once at startup.

pub mod fs;
pub mod memory;

use crate::config::{GatewayConfig, StorageBackend};
use crate::error::{GatewayError, Result};
use crate::usage::WeeklyUsageRecord;
use async_trait::async_trait;
use std::sync::Arc;

/// Container holding the chats saved by the client.
pub const CHAT_CONTAINER: &str = "chathistory";
/// Container holding one transcript per completed exchange.
pub const TRANSCRIPT_CONTAINER: &str = "transcripts";
/// File name of the weekly usage log inside the data dir.
pub const USAGE_LOG: &str = "token_usage.ndjson";

/// Flat namespace of named byte blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create or overwrite `name`.
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// All blob names, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&self, name: &str) -> Result<bool>;
}

/// Append-only log of closed accounting weeks.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append(&self, record: &WeeklyUsageRecord) -> Result<()>;

    /// Every record, newest `start_date` first.
    async fn list_desc(&self) -> Result<Vec<WeeklyUsageRecord>>;
}

/// Reject names that could escape a container or collide with temp files.
pub fn validate_blob_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.contains("..");
    if bad {
        return Err(GatewayError::InvalidRequest(format!(
            "invalid blob name: {:?}",
            name
        )));
    }
    Ok(())
}

/// The set of stores the server runs against.
#[derive(Clone)]
pub struct Storage {
    pub chats: Arc<dyn BlobStore>,
    pub transcripts: Arc<dyn BlobStore>,
    pub usage: Arc<dyn UsageStore>,
}

impl Storage {
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::Fs => {
                let root = config.data_dir()?;
                Ok(Self {
                    chats: Arc::new(fs::FsBlobStore::new(root.join(CHAT_CONTAINER))),
                    transcripts: Arc::new(fs::FsBlobStore::new(root.join(TRANSCRIPT_CONTAINER))),
                    usage: Arc::new(fs::FsUsageStore::new(root.join(USAGE_LOG))),
                })
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            chats: Arc::new(memory::MemoryBlobStore::new()),
            transcripts: Arc::new(memory::MemoryBlobStore::new()),
            usage: Arc::new(memory::MemoryUsageStore::new()),
        }
    }
}
