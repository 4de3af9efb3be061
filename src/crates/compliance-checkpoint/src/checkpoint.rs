//! Core checkpoint types
//!
//! A [`Checkpoint`] is an immutable snapshot of a workflow state record. Snapshots are
//! grouped by `(thread_id, checkpoint_ns)` and ordered by a store-assigned, strictly
//! increasing [`CheckpointId`]. Each snapshot remembers the id of the snapshot it
//! superseded, so the linear history of a thread can be rebuilt from any point.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;

/// Checkpoint ID type. Assigned by the store, monotonically increasing per key.
pub type CheckpointId = u64;

/// Namespace used when a config does not name one
pub const DEFAULT_NAMESPACE: &str = "";

/// Metadata source type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from the initial input of an execution
    Input,
    /// Checkpoint created inside the execution loop after a node transition
    Loop,
    /// Checkpoint created when execution was resumed with external input
    Resume,
    /// Checkpoint created when an execution terminated (completed, failed, interrupted)
    Terminal,
}

/// Metadata associated with a checkpoint
///
/// Kept free of `#[serde(flatten)]` and skipped fields so the same record can be
/// written with either serializer in [`crate::serializer`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    pub source: Option<CheckpointSource>,

    /// Execution step (turn count) at which the checkpoint was taken
    pub step: Option<u32>,

    /// Node that produced the transition
    pub node: Option<String>,

    /// Workflow status recorded in the snapshot
    pub status: Option<String>,
}

impl CheckpointMetadata {
    /// Create a new checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the step number
    pub fn with_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    /// Set the node that produced this checkpoint
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Set the recorded workflow status
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// The version of the checkpoint format
    pub v: i32,

    /// Store-assigned id; `0` until the checkpoint has been written
    pub id: CheckpointId,

    /// Id of the checkpoint this one superseded
    pub parent_id: Option<CheckpointId>,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// Serialized state record
    pub blob: Vec<u8>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create an unsaved checkpoint around an already-encoded blob
    pub fn new(blob: Vec<u8>) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: 0,
            parent_id: None,
            ts: Utc::now(),
            blob,
        }
    }

    /// Encode a state value as JSON and wrap it in an unsaved checkpoint
    pub fn from_state<T: Serialize>(state: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(state)?))
    }

    /// Decode the snapshot back into a typed state
    pub fn state<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.blob)?)
    }

    /// Create an empty checkpoint
    pub fn empty() -> Self {
        Self::new(b"null".to_vec())
    }
}

/// Configuration for checkpoint operations
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Thread ID for grouping related checkpoints
    pub thread_id: Option<String>,

    /// Checkpoint namespace
    #[serde(default)]
    pub checkpoint_ns: String,

    /// Specific checkpoint ID to retrieve. `None` means latest.
    pub checkpoint_id: Option<CheckpointId>,
}

impl CheckpointConfig {
    /// Create a new checkpoint configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread ID
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    /// Set the checkpoint namespace
    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = checkpoint_ns.into();
        self
    }

    /// The `(thread_id, namespace)` key, if a thread id is set
    pub fn key(&self) -> Option<(String, String)> {
        self.thread_id
            .as_ref()
            .map(|t| (t.clone(), self.checkpoint_ns.clone()))
    }
}

/// A tuple containing a checkpoint and its associated data
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTuple {
    /// Configuration for this checkpoint (with the real checkpoint id)
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Parent configuration (if any)
    pub parent_config: Option<CheckpointConfig>,
}

impl CheckpointTuple {
    /// Build a tuple from a stored checkpoint and the key it lives under
    pub fn from_stored(
        thread_id: &str,
        checkpoint_ns: &str,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        let base = CheckpointConfig::new()
            .with_thread_id(thread_id)
            .with_checkpoint_ns(checkpoint_ns);
        let parent_config = checkpoint
            .parent_id
            .map(|id| base.clone().with_checkpoint_id(id));

        Self {
            config: base.with_checkpoint_id(checkpoint.id),
            checkpoint,
            metadata,
            parent_config,
        }
    }
}
