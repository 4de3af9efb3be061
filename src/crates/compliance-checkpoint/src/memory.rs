//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointSaver`] keeps every checkpoint in a `HashMap` keyed by
//! `(thread_id, checkpoint_ns)` behind a `tokio::sync::RwLock`. Writes take the write
//! lock, so id assignment for a key is strictly sequential even when many executions
//! share one saver.
//!
//! ```text
//! ("thread-1", "")          -> [#1, #2, #3]   (parent links #2->#1, #3->#2)
//! ("thread-1", "scheduler") -> [#1]
//! ("thread-2", "")          -> [#1, #2]
//! ```
//!
//! Data is lost on restart; use [`crate::FileCheckpointSaver`] when snapshots must
//! survive the process.

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple},
    error::{CheckpointError, Result},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Storage entry for in-memory checkpoints
#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
}

type CheckpointKey = (String, String);

/// Thread-safe in-memory checkpoint storage
type CheckpointStorage = Arc<RwLock<HashMap<CheckpointKey, Vec<CheckpointEntry>>>>;

/// In-memory checkpoint saver implementation
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointSaver {
    storage: CheckpointStorage,
}

fn require_key(config: &CheckpointConfig) -> Result<CheckpointKey> {
    config
        .key()
        .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
}

impl InMemoryCheckpointSaver {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of distinct threads being tracked
    pub async fn thread_count(&self) -> usize {
        let storage = self.storage.read().await;
        let mut threads: Vec<&String> = storage.keys().map(|(thread, _)| thread).collect();
        threads.sort();
        threads.dedup();
        threads.len()
    }

    /// Get the total number of checkpoints across all keys
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointSaver for InMemoryCheckpointSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let key = require_key(config)?;
        let storage = self.storage.read().await;

        let Some(entries) = storage.get(&key) else {
            return Ok(None);
        };

        let entry = match config.checkpoint_id {
            Some(id) => entries.iter().find(|e| e.checkpoint.id == id),
            None => entries.last(),
        };

        Ok(entry.map(|e| {
            CheckpointTuple::from_stored(&key.0, &key.1, e.checkpoint.clone(), e.metadata.clone())
        }))
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<CheckpointId>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let key = require_key(config)?;
        let storage = self.storage.read().await;

        let results: Vec<Result<CheckpointTuple>> = storage
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .filter(|e| before.map_or(true, |b| e.checkpoint.id < b))
                    .take(limit.unwrap_or(usize::MAX))
                    .map(|e| {
                        Ok(CheckpointTuple::from_stored(
                            &key.0,
                            &key.1,
                            e.checkpoint.clone(),
                            e.metadata.clone(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        mut checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        let key = require_key(config)?;
        let mut storage = self.storage.write().await;
        let entries = storage.entry(key.clone()).or_default();

        let parent_id = entries.last().map(|e| e.checkpoint.id);
        checkpoint.id = parent_id.map_or(1, |id| id + 1);
        checkpoint.parent_id = parent_id;

        let saved = CheckpointConfig::new()
            .with_thread_id(key.0)
            .with_checkpoint_ns(key.1)
            .with_checkpoint_id(checkpoint.id);

        entries.push(CheckpointEntry { checkpoint, metadata });

        Ok(saved)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.retain(|(thread, _), _| thread != thread_id);
        Ok(())
    }
}
