//! Filesystem-backed stores.
//!
//! Blobs live one file per name inside a container directory. Weekly usage is
//! an append-only NDJSON log, one record per line.

use crate::error::{GatewayError, Result};
use crate::storage::{BlobStore, UsageStore, validate_blob_name};
use crate::usage::WeeklyUsageRecord;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

fn persistence(action: &str, path: &std::path::Path, e: std::io::Error) -> GatewayError {
    GatewayError::Persistence(format!("{} {}: {}", action, path.display(), e))
}

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// The directory is created on the first write.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
        validate_blob_name(name)?;
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| persistence("create", &self.root, e))?;

        // Write-then-rename so readers never see a half-written blob. Each
        // write gets its own temp file; concurrent puts to one name race only
        // on the final rename.
        let path = self.root.join(name);
        let tmp = self.root.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));
        fs::write(&tmp, &data)
            .await
            .map_err(|e| persistence("write", &tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| persistence("rename", &path, e))?;

        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        validate_blob_name(name)?;
        let path = self.root.join(name);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(persistence("read", &path, e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(persistence("list", &self.root, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| persistence("list", &self.root, e))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_file && !name.starts_with('.') {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_blob_name(name)?;
        let path = self.root.join(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(persistence("delete", &path, e)),
        }
    }
}

pub struct FsUsageStore {
    path: PathBuf,
    // Serializes appends from request handlers and the rollover ticker.
    write_lock: Mutex<()>,
}

impl FsUsageStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl UsageStore for FsUsageStore {
    async fn append(&self, record: &WeeklyUsageRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence("create", parent, e))?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| persistence("open", &self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| persistence("append", &self.path, e))?;
        file.flush()
            .await
            .map_err(|e| persistence("flush", &self.path, e))?;

        Ok(())
    }

    async fn list_desc(&self) -> Result<Vec<WeeklyUsageRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(persistence("read", &self.path, e)),
        };

        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WeeklyUsageRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = n + 1, error = %e, "Skipping unreadable usage record"),
            }
        }

        records.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(records)
    }
}
