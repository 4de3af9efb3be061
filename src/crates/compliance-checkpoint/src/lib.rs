//! # compliance-checkpoint - State persistence for workflow execution
//!
//! Checkpoints are **immutable snapshots of a workflow state record**, written by the
//! graph execution engine after every node transition. They enable:
//!
//! - **Resume after interruption** - continue a thread paused for human review
//! - **Audit** - reconstruct the linear history of a compliance assessment
//! - **Inspection** - look at the partial state of a cancelled or failed run
//!
//! ## Core Concepts
//!
//! - [`CheckpointSaver`] - storage trait: `put`, `get`, `get_tuple`, `list`, `delete_thread`
//! - [`Checkpoint`] - snapshot blob with a store-assigned, per-key increasing id and a
//!   parent back-reference
//! - [`CheckpointConfig`] - `(thread_id, checkpoint_ns, checkpoint_id?)` address
//! - [`CheckpointMetadata`] - step, node, status and source of a snapshot
//!
//! ## Backends
//!
//! - [`InMemoryCheckpointSaver`] - development and tests
//! - [`FileCheckpointSaver`] - one file per snapshot, JSON or bincode records
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use compliance_checkpoint::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, InMemoryCheckpointSaver,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let saver = InMemoryCheckpointSaver::new();
//!     let config = CheckpointConfig::new().with_thread_id("thread-123");
//!
//!     let checkpoint = Checkpoint::from_state(&json!({"workflow_status": "pending"}))?;
//!     let saved = saver.put(&config, checkpoint, CheckpointMetadata::new()).await?;
//!     println!("Checkpoint saved with ID: {:?}", saved.checkpoint_id);
//!
//!     if let Some(tuple) = saver.get_tuple(&config).await? {
//!         let state: serde_json::Value = tuple.checkpoint.state()?;
//!         println!("Latest state: {}", state);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod file;
pub mod memory;
pub mod serializer;
pub mod traits;

// Re-export main types
pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointSource,
    CheckpointTuple, DEFAULT_NAMESPACE,
};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointSaver;
pub use memory::InMemoryCheckpointSaver;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use traits::{CheckpointSaver, CheckpointStream};
