//! State serialization, schema versioning, and adaptive compression
//!
//! States serialize into a self-describing JSON envelope with a SHA-256
//! checksum over the canonical bytes. Loading an envelope older than
//! [`MINIMUM_SUPPORTED`] fails; anything between that and
//! [`CURRENT_SCHEMA`] runs through registered pure migrations first.

use crate::error::{GraphError, Result};
use crate::state::{ExecutionState, ExecutionStep, StateVersion};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use skein_core::Value;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;

/// Schema version written by this build.
pub const CURRENT_SCHEMA: StateVersion = StateVersion::new(1, 1, 0);

/// Oldest schema version this build can still load.
pub const MINIMUM_SUPPORTED: StateVersion = StateVersion::new(1, 0, 0);

/// Serialized state payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateEnvelope {
    pub version: StateVersion,
    pub state_id: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub entries: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<ExecutionStep>,
    pub checksum: String,
}

/// A pure payload transform registered for one version step.
#[derive(Clone)]
pub struct Migration {
    pub from: StateVersion,
    pub to: StateVersion,
    apply: Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync>,
}

impl Migration {
    pub fn new<F>(from: StateVersion, to: StateVersion, apply: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self { from, to, apply: Arc::new(apply) }
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Migration({} -> {})", self.from, self.to)
    }
}

/// Rolling observation of whether compressing recent payloads paid off.
///
/// When the benefit rate over the window falls below the floor, the
/// size threshold doubles so small or incompressible payloads skip the
/// compressor; when the rate recovers, the threshold halves back down.
#[derive(Debug, Clone)]
pub struct AdaptiveCompression {
    threshold: usize,
    min_threshold: usize,
    max_threshold: usize,
    /// Minimum size reduction for an attempt to count as beneficial
    min_gain: f64,
    /// Benefit rate below which the threshold is raised
    benefit_floor: f64,
    window: VecDeque<bool>,
    window_len: usize,
}

impl AdaptiveCompression {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            min_threshold: 256,
            max_threshold: 1 << 20,
            min_gain: 0.10,
            benefit_floor: 0.5,
            window: VecDeque::new(),
            window_len: 32,
        }
    }

    /// Whether a payload of `len` bytes should be compressed right now.
    pub fn should_compress(&self, len: usize) -> bool {
        len >= self.threshold
    }

    /// Current size threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one compression attempt and adapt the threshold.
    pub fn record(&mut self, original: usize, compressed: usize) {
        let gain = 1.0 - compressed as f64 / original.max(1) as f64;
        self.window.push_back(gain >= self.min_gain);
        while self.window.len() > self.window_len {
            self.window.pop_front();
        }
        if self.window.len() < self.window_len / 2 {
            return;
        }

        let rate = self.window.iter().filter(|b| **b).count() as f64 / self.window.len() as f64;
        if rate < self.benefit_floor {
            self.threshold = (self.threshold * 2).min(self.max_threshold);
        } else {
            self.threshold = (self.threshold / 2).max(self.min_threshold);
        }
    }
}

impl Default for AdaptiveCompression {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Encodes and decodes [`ExecutionState`] payloads.
pub struct StateCodec {
    migrations: Vec<Migration>,
    compression: AdaptiveCompression,
    compress: bool,
}

impl StateCodec {
    pub fn new() -> Self {
        Self { migrations: vec![], compression: AdaptiveCompression::default(), compress: true }
    }

    /// Disable compression entirely (checkpoints then always store raw
    /// JSON).
    pub fn without_compression(mut self) -> Self {
        self.compress = false;
        self
    }

    /// Register a migration step. Steps chain by exact version match.
    pub fn register_migration(&mut self, migration: Migration) {
        self.migrations.push(migration);
    }

    /// Observed compression threshold, for diagnostics.
    pub fn compression_threshold(&self) -> usize {
        self.compression.threshold()
    }

    /// Build the self-describing envelope for a state.
    pub fn to_envelope(state: &ExecutionState) -> StateEnvelope {
        StateEnvelope {
            version: state.version(),
            state_id: state.state_id().to_string(),
            created_at: state.created_at(),
            last_modified: state.last_modified(),
            entries: state.entries().clone(),
            metadata: state.metadata_entries().clone(),
            history: state.history().to_vec(),
            checksum: state.checksum(),
        }
    }

    /// Serialize a state into its envelope bytes, gzip-compressed when
    /// the adaptive threshold says it is worth it.
    pub fn encode(&mut self, state: &ExecutionState) -> Result<Vec<u8>> {
        let envelope = Self::to_envelope(state);
        let raw = serde_json::to_vec(&envelope)?;

        if self.compress && self.compression.should_compress(raw.len()) {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            let compressed = encoder.finish()?;
            self.compression.record(raw.len(), compressed.len());
            if compressed.len() < raw.len() {
                return Ok(compressed);
            }
        }
        Ok(raw)
    }

    /// Deserialize envelope bytes back into a state, running migrations
    /// and verifying the checksum.
    pub fn decode(&self, bytes: &[u8]) -> Result<ExecutionState> {
        let raw = if is_gzip(bytes) {
            let mut decoder = GzDecoder::new(bytes);
            let mut buf = Vec::new();
            decoder.read_to_end(&mut buf)?;
            buf
        } else {
            bytes.to_vec()
        };

        let payload: serde_json::Value = serde_json::from_slice(&raw)?;
        self.decode_value(payload)
    }

    /// Decode an already-parsed envelope value (used for states nested
    /// inside checkpoint payloads).
    pub fn decode_value(&self, mut payload: serde_json::Value) -> Result<ExecutionState> {
        let mut version = envelope_version(&payload)?;

        if version < MINIMUM_SUPPORTED {
            return Err(GraphError::VersionIncompatible {
                found: version.to_string(),
                minimum: MINIMUM_SUPPORTED.to_string(),
            });
        }

        let mut migrated = false;
        while version < CURRENT_SCHEMA {
            let step = self
                .migrations
                .iter()
                .find(|m| m.from == version)
                .ok_or_else(|| GraphError::MigrationMissing {
                    from: version.to_string(),
                    to: CURRENT_SCHEMA.to_string(),
                })?;
            payload = (step.apply)(payload)?;
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("version".to_string(), serde_json::json!(step.to.to_string()));
            }
            version = step.to;
            migrated = true;
        }

        let envelope: StateEnvelope = serde_json::from_value(payload)?;
        let state = ExecutionState::from_parts(
            envelope.state_id,
            envelope.version,
            envelope.created_at,
            envelope.last_modified,
            envelope.entries,
            envelope.metadata,
            envelope.history,
        );

        // A migration rewrites the canonical bytes, so the stored
        // checksum only binds unmigrated payloads.
        if !migrated && state.checksum() != envelope.checksum {
            return Err(GraphError::ChecksumMismatch);
        }
        Ok(state)
    }
}

impl Default for StateCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn envelope_version(payload: &serde_json::Value) -> Result<StateVersion> {
    payload
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GraphError::InvalidGraph("state envelope has no version".to_string()))?
        .parse()
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}
