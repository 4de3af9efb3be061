//! File-backed checkpoint storage
//!
//! One file per checkpoint under `<root>/t-<thread>/ns-<namespace>/<id>.<ext>`, where
//! thread and namespace are hex-encoded so any identifier maps to a valid directory
//! name. The zero-padded id in the file name is the version; the highest id in a
//! directory is the latest checkpoint for that key.
//!
//! Files are written to a temporary name and renamed into place, so readers never see
//! a partial record. Writers are serialized by an async mutex to keep id assignment
//! strictly ordered.

use crate::{
    checkpoint::{Checkpoint, CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointTuple},
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

/// Checkpoint saver that persists snapshots as files on local disk
#[derive(Debug)]
pub struct FileCheckpointSaver<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
    write_lock: Mutex<()>,
}

fn hex(value: &str) -> String {
    value.bytes().map(|b| format!("{:02x}", b)).collect()
}

impl FileCheckpointSaver<JsonSerializer> {
    /// Create a saver rooted at `root` using JSON records
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_serializer(root, JsonSerializer)
    }
}

impl<S: SerializerProtocol> FileCheckpointSaver<S> {
    /// Create a saver with an explicit serializer
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Self {
        Self {
            root: root.into(),
            serializer,
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory of this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(format!("t-{}", hex(thread_id)))
    }

    fn key_dir(&self, config: &CheckpointConfig) -> Result<(String, String, PathBuf)> {
        let (thread_id, ns) = config
            .key()
            .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))?;
        let dir = self.thread_dir(&thread_id).join(format!("ns-{}", hex(&ns)));
        Ok((thread_id, ns, dir))
    }

    fn file_name(&self, id: CheckpointId) -> String {
        format!("{:020}.{}", id, self.serializer.extension())
    }

    /// Ids stored under a key directory, ascending
    async fn stored_ids(&self, dir: &Path) -> Result<Vec<CheckpointId>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{}", self.serializer.extension());
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_suffix(&suffix)
                .and_then(|stem| stem.parse::<CheckpointId>().ok())
            {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        Ok(ids)
    }

    async fn read_record(&self, dir: &Path, id: CheckpointId) -> Result<(Checkpoint, CheckpointMetadata)> {
        let bytes = fs::read(dir.join(self.file_name(id))).await?;
        self.serializer.loads(&bytes)
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointSaver for FileCheckpointSaver<S> {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let (thread_id, ns, dir) = self.key_dir(config)?;
        let ids = self.stored_ids(&dir).await?;

        let id = match config.checkpoint_id {
            Some(id) if ids.contains(&id) => id,
            Some(_) => return Ok(None),
            None => match ids.last() {
                Some(id) => *id,
                None => return Ok(None),
            },
        };

        let (checkpoint, metadata) = self.read_record(&dir, id).await?;
        Ok(Some(CheckpointTuple::from_stored(&thread_id, &ns, checkpoint, metadata)))
    }

    async fn list(
        &self,
        config: &CheckpointConfig,
        before: Option<CheckpointId>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let (thread_id, ns, dir) = self.key_dir(config)?;
        let ids = self.stored_ids(&dir).await?;

        let mut results = Vec::new();
        for id in ids
            .into_iter()
            .rev()
            .filter(|id| before.map_or(true, |b| *id < b))
            .take(limit.unwrap_or(usize::MAX))
        {
            let record = self
                .read_record(&dir, id)
                .await
                .map(|(checkpoint, metadata)| {
                    CheckpointTuple::from_stored(&thread_id, &ns, checkpoint, metadata)
                });
            results.push(record);
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        mut checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Result<CheckpointConfig> {
        let (thread_id, ns, dir) = self.key_dir(config)?;
        let _guard = self.write_lock.lock().await;

        fs::create_dir_all(&dir).await?;
        let parent_id = self.stored_ids(&dir).await?.last().copied();
        checkpoint.id = parent_id.map_or(1, |id| id + 1);
        checkpoint.parent_id = parent_id;

        let bytes = self.serializer.dumps(&(&checkpoint, &metadata))?;
        let final_path = dir.join(self.file_name(checkpoint.id));
        let tmp_path = dir.join(format!(".{}.tmp", checkpoint.id));
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;

        debug!(
            thread_id = %thread_id,
            checkpoint_ns = %ns,
            checkpoint_id = checkpoint.id,
            "Checkpoint written"
        );

        Ok(CheckpointConfig::new()
            .with_thread_id(thread_id)
            .with_checkpoint_ns(ns)
            .with_checkpoint_id(checkpoint.id))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_dir_all(self.thread_dir(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
