//! Checkpoint storage trait
//!
//! [`CheckpointSaver`] is the only seam between the graph execution engine and the
//! storage that backs resume-after-interruption and audit. The engine never assumes a
//! particular storage engine; anything that can keep versioned blobs per
//! `(thread_id, checkpoint_ns)` key can implement it.
//!
//! # Ordering contract
//!
//! Implementations assign the [`CheckpointId`](crate::CheckpointId) themselves. Ids must
//! be strictly increasing per key, and "latest" always means the highest id, never the
//! newest wall-clock timestamp. Writes are at-least-once: callers may write the same
//! snapshot twice and the later write simply becomes the newest version.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use compliance_checkpoint::*;
//! use async_trait::async_trait;
//!
//! struct SqlCheckpointSaver { pool: sqlx::SqlitePool }
//!
//! #[async_trait]
//! impl CheckpointSaver for SqlCheckpointSaver {
//!     async fn put(
//!         &self,
//!         config: &CheckpointConfig,
//!         checkpoint: Checkpoint,
//!         metadata: CheckpointMetadata,
//!     ) -> Result<CheckpointConfig> {
//!         // BEGIN; SELECT MAX(checkpoint_id) ... ; INSERT ... ; COMMIT
//!         todo!()
//!     }
//!
//!     async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
//!         todo!()
//!     }
//!
//!     async fn list(
//!         &self,
//!         config: &CheckpointConfig,
//!         before: Option<CheckpointId>,
//!         limit: Option<usize>,
//!     ) -> Result<CheckpointStream> {
//!         todo!()
//!     }
//!
//!     async fn delete_thread(&self, thread_id: &str) -> Result<()> {
//!         todo!()
//!     }
//! }
//! ```

use crate::checkpoint::{Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple};
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of checkpoint tuples, newest first
pub type CheckpointStream = BoxStream<'static, Result<CheckpointTuple>>;

/// Storage backend for workflow checkpoints
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch a checkpoint using the given configuration
    ///
    /// Returns the checkpoint named by `config.checkpoint_id`, or the latest one for the
    /// `(thread_id, checkpoint_ns)` key when no id is given.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        if let Some(tuple) = self.get_tuple(config).await? {
            Ok(Some(tuple.checkpoint))
        } else {
            Ok(None)
        }
    }

    /// Retrieve a complete checkpoint tuple with metadata
    ///
    /// - `Ok(Some(_))` - checkpoint found
    /// - `Ok(None)` - no checkpoint matches (never an error)
    /// - `Err(_)` - storage failure or a config without `thread_id`
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Stream the history of a key, newest first
    ///
    /// * `before` - only return checkpoints with an id strictly lower than this
    /// * `limit` - maximum number of results
    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<CheckpointId>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Store a new checkpoint
    ///
    /// The store assigns the next id for the key, links the previous latest checkpoint as
    /// parent, and returns the config naming the stored checkpoint.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig>;

    /// Delete every checkpoint of a thread across all namespaces
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
