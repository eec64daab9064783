//! Checkpointing
//!
//! A checkpoint is the serialized state plus a minimal run header,
//! enough to resume at the node that was current, with the successor
//! queue and attempt counters intact. Storage goes through the abstract
//! `CheckpointStore`; an in-memory store is provided for development
//! and tests.

use crate::codec::{StateCodec, StateEnvelope, CURRENT_SCHEMA};
use crate::error::{GraphError, Result};
use crate::state::{ExecutionState, StateVersion, ATTEMPTS_METADATA_PREFIX};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use skein_core::CheckpointStore;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// One restorable point of an execution.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub schema_version: StateVersion,
    pub created_at: DateTime<Utc>,
    pub execution_id: String,
    pub checkpoint_id: String,
    /// Label from an explicit `create_checkpoint(name)` trigger
    pub name: Option<String>,
    /// Node the run was at when the checkpoint was taken
    pub current_node: Option<String>,
    /// Successor queue to resume with
    pub pending_successors: Vec<String>,
    /// Per-node attempt counters at checkpoint time
    pub attempt_counters: BTreeMap<String, u32>,
    pub state: ExecutionState,
}

impl Checkpoint {
    pub fn new(
        execution_id: &str,
        state: ExecutionState,
        current_node: Option<String>,
        pending_successors: Vec<String>,
    ) -> Self {
        let attempt_counters = state
            .metadata_entries()
            .iter()
            .filter_map(|(key, value)| {
                let node = key.strip_prefix(ATTEMPTS_METADATA_PREFIX)?;
                Some((node.to_string(), value.parse().ok()?))
            })
            .collect();

        Self {
            schema_version: CURRENT_SCHEMA,
            created_at: Utc::now(),
            execution_id: execution_id.to_string(),
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            name: None,
            current_node,
            pending_successors,
            attempt_counters,
            state,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Wire form of a checkpoint.
#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    schema_version: StateVersion,
    created_at: DateTime<Utc>,
    execution_id: String,
    checkpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_node: Option<String>,
    #[serde(default)]
    pending_successors: Vec<String>,
    #[serde(default)]
    attempt_counters: BTreeMap<String, u32>,
    compressed: bool,
    state: serde_json::Value,
}

/// Saves, lists, restores, and prunes checkpoints for executions.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    codec: Mutex<StateCodec>,
    /// Per-execution monotonic sequence for ordered store keys
    sequences: Mutex<HashMap<String, u64>>,
    every_n: usize,
    retain: usize,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            codec: Mutex::new(StateCodec::new()),
            sequences: Mutex::new(HashMap::new()),
            every_n: 5,
            retain: 10,
        }
    }

    /// Checkpoint after every `n` completed nodes.
    pub fn with_interval(mut self, n: usize) -> Self {
        self.every_n = n.max(1);
        self
    }

    /// Keep at most `k` checkpoints per execution.
    pub fn with_retain(mut self, k: usize) -> Self {
        self.retain = k.max(1);
        self
    }

    /// Replace the codec (to register migrations or disable compression).
    pub fn with_codec(mut self, codec: StateCodec) -> Self {
        self.codec = Mutex::new(codec);
        self
    }

    pub fn interval(&self) -> usize {
        self.every_n
    }

    /// Explicit named checkpoint of the current state.
    pub async fn create_checkpoint(
        &self,
        execution_id: &str,
        state: &ExecutionState,
        name: &str,
    ) -> Result<String> {
        let checkpoint =
            Checkpoint::new(execution_id, state.clone(), None, vec![]).with_name(name);
        self.save(&checkpoint).await
    }

    /// Persist a checkpoint and prune old ones. Returns the checkpoint id.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<String> {
        let state_envelope = StateCodec::to_envelope(&checkpoint.state);
        let bytes = self.encode(checkpoint, &state_envelope)?;

        let sequence = {
            let mut sequences = self.sequences.lock().unwrap_or_else(|e| e.into_inner());
            let counter = sequences.entry(checkpoint.execution_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let key = format!("{}/{:012}", checkpoint.execution_id, sequence);

        let mut metadata = BTreeMap::new();
        metadata.insert("checkpoint_id".to_string(), checkpoint.checkpoint_id.clone());
        if let Some(name) = &checkpoint.name {
            metadata.insert("name".to_string(), name.clone());
        }

        self.store.put(&key, bytes, metadata).await?;
        self.prune(&checkpoint.execution_id).await?;

        tracing::debug!(
            execution_id = %checkpoint.execution_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            %key,
            "checkpoint saved"
        );
        Ok(checkpoint.checkpoint_id.clone())
    }

    /// Latest checkpoint for an execution.
    pub async fn load_latest(&self, execution_id: &str) -> Result<Option<Checkpoint>> {
        let keys = self.store.list(execution_id).await?;
        let Some(key) = keys.last() else {
            return Ok(None);
        };
        let bytes = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| GraphError::CheckpointNotFound(key.clone()))?;
        Ok(Some(self.decode(&bytes)?))
    }

    /// A specific checkpoint by id (time travel).
    pub async fn load_by_id(
        &self,
        execution_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>> {
        for key in self.store.list(execution_id).await? {
            if let Some(bytes) = self.store.get(&key).await? {
                let checkpoint = self.decode(&bytes)?;
                if checkpoint.checkpoint_id == checkpoint_id {
                    return Ok(Some(checkpoint));
                }
            }
        }
        Ok(None)
    }

    /// All retained checkpoints, oldest first.
    pub async fn list(&self, execution_id: &str) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = vec![];
        for key in self.store.list(execution_id).await? {
            if let Some(bytes) = self.store.get(&key).await? {
                checkpoints.push(self.decode(&bytes)?);
            }
        }
        Ok(checkpoints)
    }

    /// Drop everything stored for an execution.
    pub async fn delete_all(&self, execution_id: &str) -> Result<()> {
        for key in self.store.list(execution_id).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn prune(&self, execution_id: &str) -> Result<()> {
        let keys = self.store.list(execution_id).await?;
        if keys.len() <= self.retain {
            return Ok(());
        }
        for key in &keys[..keys.len() - self.retain] {
            self.store.delete(key).await?;
        }
        Ok(())
    }

    fn encode(&self, checkpoint: &Checkpoint, state: &StateEnvelope) -> Result<Vec<u8>> {
        let mut envelope = CheckpointEnvelope {
            schema_version: checkpoint.schema_version,
            created_at: checkpoint.created_at,
            execution_id: checkpoint.execution_id.clone(),
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            name: checkpoint.name.clone(),
            current_node: checkpoint.current_node.clone(),
            pending_successors: checkpoint.pending_successors.clone(),
            attempt_counters: checkpoint.attempt_counters.clone(),
            compressed: false,
            state: serde_json::to_value(state)?,
        };

        let raw = serde_json::to_vec(&envelope)?;
        let compress = {
            let codec = self.codec.lock().unwrap_or_else(|e| e.into_inner());
            codec.compression_threshold() <= raw.len()
        };
        if !compress {
            return Ok(raw);
        }

        envelope.compressed = true;
        let raw = serde_json::to_vec(&envelope)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;
        Ok(if compressed.len() < raw.len() { compressed } else { raw })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Checkpoint> {
        let raw = if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
            let mut decoder = GzDecoder::new(bytes);
            let mut buf = Vec::new();
            decoder.read_to_end(&mut buf)?;
            buf
        } else {
            bytes.to_vec()
        };

        let envelope: CheckpointEnvelope = serde_json::from_slice(&raw)?;
        let state = {
            let codec = self.codec.lock().unwrap_or_else(|e| e.into_inner());
            codec.decode_value(envelope.state)?
        };

        Ok(Checkpoint {
            schema_version: envelope.schema_version,
            created_at: envelope.created_at,
            execution_id: envelope.execution_id,
            checkpoint_id: envelope.checkpoint_id,
            name: envelope.name,
            current_node: envelope.current_node,
            pending_successors: envelope.pending_successors,
            attempt_counters: envelope.attempt_counters,
            state,
        })
    }
}

/// In-memory checkpoint store for development and tests. Keys are kept
/// sorted, preserving the manager's monotonic ordering.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _metadata: BTreeMap<String, String>,
    ) -> skein_core::Result<()> {
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> skein_core::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn list(&self, execution_id: &str) -> skein_core::Result<Vec<String>> {
        let prefix = format!("{execution_id}/");
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> skein_core::Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
