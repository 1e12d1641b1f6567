//! In-process stores. Nothing survives a restart.

use crate::error::Result;
use crate::storage::{BlobStore, UsageStore, validate_blob_name};
use crate::usage::WeeklyUsageRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
        validate_blob_name(name)?;
        self.blobs.write().await.insert(name.to_string(), data);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        validate_blob_name(name)?;
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_blob_name(name)?;
        Ok(self.blobs.write().await.remove(name).is_some())
    }
}

#[derive(Default)]
pub struct MemoryUsageStore {
    records: RwLock<Vec<WeeklyUsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn append(&self, record: &WeeklyUsageRecord) -> Result<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn list_desc(&self) -> Result<Vec<WeeklyUsageRecord>> {
        let mut records = self.records.read().await.clone();
        records.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_memory_blob_store() {
        let store = MemoryBlobStore::new();
        store.put("b", vec![2]).await.unwrap();
        store.put("a", vec![1]).await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.get("b").await.unwrap(), Some(vec![2]));
        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.put("../a", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_usage_store_orders_newest_first() {
        let store = MemoryUsageStore::new();
        let d = |day| NaiveDate::from_ymd_opt(2024, 10, day).unwrap();
        store.append(&WeeklyUsageRecord::new(d(6), 1, 0, 1.0)).await.unwrap();
        store.append(&WeeklyUsageRecord::new(d(20), 3, 0, 1.0)).await.unwrap();
        store.append(&WeeklyUsageRecord::new(d(13), 2, 0, 1.0)).await.unwrap();

        let starts: Vec<u32> = store
            .list_desc()
            .await
            .unwrap()
            .iter()
            .map(|r| chrono::Datelike::day(&r.start_date))
            .collect();
        assert_eq!(starts, vec![20, 13, 6]);
    }
}
