//! Execution state container
//!
//! An [`ExecutionState`] is the shared, typed key/value store one
//! execution mutates as it walks the graph. It carries a stable id, a
//! semantic version, metadata, and an append-only step history. Scalar
//! types are stable per key: once `count` is an int it stays numeric
//! unless [`ExecutionState::replace`] is used.

use crate::error::{GraphError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skein_core::{ErrorKind, Value};
use std::collections::BTreeMap;

/// Metadata key prefix reserved for engine-written entries.
pub const ENGINE_METADATA_PREFIX: &str = "skein.";

/// Metadata key under which per-node attempt counters persist, so that
/// retries survive checkpoint round-trips.
pub const ATTEMPTS_METADATA_PREFIX: &str = "skein.attempts.";

/// Semantic version of a serialized state payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl StateVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl std::fmt::Display for StateVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl std::str::FromStr for StateVersion {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let mut next = |name: &str| -> Result<u32> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| GraphError::InvalidGraph(format!("bad {name} in version {s:?}")))
        };
        let version = Self::new(next("major")?, next("minor")?, next("patch")?);
        if parts.next().is_some() {
            return Err(GraphError::InvalidGraph(format!("bad version {s:?}")));
        }
        Ok(version)
    }
}

impl Serialize for StateVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for StateVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    Skipped,
    Retried,
    Canceled,
}

/// One entry in the append-only execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: StepStatus,
    /// 1-based attempt number for this step
    pub attempt: u32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionStep {
    /// Record a step that just finished.
    pub fn finished(
        node_id: impl Into<String>,
        started_at: DateTime<Utc>,
        status: StepStatus,
        attempt: u32,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            node_id: node_id.into(),
            started_at,
            finished_at,
            status,
            attempt,
            duration_ms,
            error_kind: None,
        }
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }
}

/// Point-in-time copy used by snapshots and transactions.
///
/// History is deliberately absent: it is append-only and survives
/// rollbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub entries: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

/// Handle for an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId(u64);

/// The shared, typed key/value state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    state_id: String,
    version: StateVersion,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
    entries: BTreeMap<String, Value>,
    metadata: BTreeMap<String, String>,
    history: Vec<ExecutionStep>,
    #[serde(skip)]
    txn_stack: Vec<(TxnId, StateSnapshot)>,
    #[serde(skip)]
    next_txn: u64,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionState {
    /// Fresh empty state at the current schema version.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            state_id: uuid::Uuid::new_v4().to_string(),
            version: crate::codec::CURRENT_SCHEMA,
            created_at: now,
            last_modified: now,
            entries: BTreeMap::new(),
            metadata: BTreeMap::new(),
            history: vec![],
            txn_stack: vec![],
            next_txn: 0,
        }
    }

    /// Builder-style entry insertion for callers seeding initial state.
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Rebuild a state from its serialized parts (codec and checkpoint
    /// restore path).
    pub(crate) fn from_parts(
        state_id: String,
        version: StateVersion,
        created_at: DateTime<Utc>,
        last_modified: DateTime<Utc>,
        entries: BTreeMap<String, Value>,
        metadata: BTreeMap<String, String>,
        history: Vec<ExecutionStep>,
    ) -> Self {
        Self {
            state_id,
            version,
            created_at,
            last_modified,
            entries,
            metadata,
            history,
            txn_stack: vec![],
            next_txn: 0,
        }
    }

    pub fn state_id(&self) -> &str {
        &self.state_id
    }

    pub fn version(&self) -> StateVersion {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Borrow a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Borrow a value or fail with `KeyNotFound`.
    pub fn try_get(&self, key: &str) -> Result<&Value> {
        self.entries.get(key).ok_or_else(|| GraphError::KeyNotFound(key.to_string()))
    }

    /// String accessor shorthand.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Integer accessor shorthand.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_int)
    }

    /// Float accessor shorthand; integers widen.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_float)
    }

    /// Bool accessor shorthand.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Deserialize a value into a caller type via its plain JSON view.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        serde_json::from_value(self.get(key)?.to_json()).ok()
    }

    /// Write a value. The key must be non-empty and the value kind must
    /// match any existing entry; use [`replace`](Self::replace) for an
    /// explicit type change.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() {
            return Err(GraphError::EmptyKey);
        }
        if let Some(existing) = self.entries.get(&key) {
            if !existing.same_kind_as(&value) {
                return Err(GraphError::TypeMismatch {
                    key,
                    expected: existing.kind(),
                    actual: value.kind(),
                });
            }
        }
        self.entries.insert(key, value);
        self.touch();
        Ok(())
    }

    /// Write a value, discarding any previous type constraint for the key.
    pub fn replace(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(GraphError::EmptyKey);
        }
        self.entries.insert(key, value.into());
        self.touch();
        Ok(())
    }

    /// Remove a key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Keys in canonical (sorted) order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, for merging and serialization.
    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    /// Metadata accessor.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// All metadata entries.
    pub fn metadata_entries(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Set a metadata entry. Keys under the `skein.` prefix are reserved
    /// for the engine.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        if key.is_empty() {
            return Err(GraphError::EmptyKey);
        }
        self.metadata.insert(key, value.into());
        self.touch();
        Ok(())
    }

    /// Remove a metadata entry, returning its value.
    pub fn remove_metadata(&mut self, key: &str) -> Option<String> {
        let removed = self.metadata.remove(key);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Engine-internal metadata write, bypassing no checks but naming the
    /// caller's intent.
    pub(crate) fn set_engine_metadata(&mut self, key: &str, value: impl Into<String>) {
        debug_assert!(key.starts_with(ENGINE_METADATA_PREFIX));
        self.metadata.insert(key.to_string(), value.into());
        self.touch();
    }

    /// Persisted attempt counter for a node, defaulting to zero.
    pub fn attempt_counter(&self, node_id: &str) -> u32 {
        self.metadata
            .get(&format!("{ATTEMPTS_METADATA_PREFIX}{node_id}"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Persist a node's attempt counter.
    pub(crate) fn set_attempt_counter(&mut self, node_id: &str, attempts: u32) {
        self.metadata
            .insert(format!("{ATTEMPTS_METADATA_PREFIX}{node_id}"), attempts.to_string());
        self.touch();
    }

    /// Append-only step history.
    pub fn history(&self) -> &[ExecutionStep] {
        &self.history
    }

    /// Append a step record. Engine-only: nodes never see `&mut` state
    /// history.
    pub(crate) fn record_step(&mut self, step: ExecutionStep) {
        self.history.push(step);
        self.touch();
    }

    /// Point-in-time copy of entries and metadata.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            entries: self.entries.clone(),
            metadata: self.metadata.clone(),
            last_modified: self.last_modified,
        }
    }

    /// Restore entries and metadata from a snapshot. History is kept.
    pub fn restore(&mut self, snapshot: StateSnapshot) {
        self.entries = snapshot.entries;
        self.metadata = snapshot.metadata;
        self.last_modified = snapshot.last_modified;
    }

    /// Open a transaction; pairs with [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback). Nested transactions are LIFO.
    pub fn begin_transaction(&mut self) -> TxnId {
        let id = TxnId(self.next_txn);
        self.next_txn += 1;
        self.txn_stack.push((id, self.snapshot()));
        id
    }

    /// Drop the innermost transaction's snapshot, keeping all writes.
    pub fn commit(&mut self, txn: TxnId) -> Result<()> {
        match self.txn_stack.last() {
            Some((innermost, _)) if *innermost == txn => {
                self.txn_stack.pop();
                Ok(())
            }
            Some(_) => Err(GraphError::Transaction(format!(
                "transaction {txn:?} is not innermost"
            ))),
            None => Err(GraphError::Transaction("no open transaction".to_string())),
        }
    }

    /// Restore the innermost transaction's snapshot, discarding writes
    /// made since `begin_transaction`.
    pub fn rollback(&mut self, txn: TxnId) -> Result<()> {
        match self.txn_stack.pop() {
            Some((innermost, snapshot)) if innermost == txn => {
                self.restore(snapshot);
                Ok(())
            }
            Some(other) => {
                self.txn_stack.push(other);
                Err(GraphError::Transaction(format!("transaction {txn:?} is not innermost")))
            }
            None => Err(GraphError::Transaction("no open transaction".to_string())),
        }
    }

    /// Roll back the innermost open transaction, if any. Used by the
    /// executor's `Rollback` recovery action.
    pub(crate) fn rollback_innermost(&mut self) -> bool {
        match self.txn_stack.pop() {
            Some((_, snapshot)) => {
                self.restore(snapshot);
                true
            }
            None => false,
        }
    }

    /// SHA-256 over the canonical bytes of id, version, entries,
    /// metadata, and history.
    pub fn checksum(&self) -> String {
        let canonical = self.canonical_bytes();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Canonical byte form used by [`checksum`](Self::checksum).
    /// Ordered maps make this deterministic.
    pub(crate) fn canonical_bytes(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            state_id: &'a str,
            version: StateVersion,
            entries: &'a BTreeMap<String, Value>,
            metadata: &'a BTreeMap<String, String>,
            history: &'a [ExecutionStep],
        }
        // BTreeMap iteration order is total, so this cannot fail and the
        // bytes are stable across processes.
        serde_json::to_vec(&Canonical {
            state_id: &self.state_id,
            version: self.version,
            entries: &self.entries,
            metadata: &self.metadata,
            history: &self.history,
        })
        .unwrap_or_default()
    }

    /// Structural integrity check: non-empty keys and monotonic history.
    pub fn validate_integrity(&self) -> Result<()> {
        if self.entries.keys().any(String::is_empty) {
            return Err(GraphError::EmptyKey);
        }
        for pair in self.history.windows(2) {
            if pair[1].started_at < pair[0].started_at {
                return Err(GraphError::InvalidGraph(
                    "execution history is not monotonic".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Derive a copy-on-write scope for a parallel branch: same entries
    /// and metadata, fresh history, same id and version.
    pub(crate) fn branch_scope(&self) -> ExecutionState {
        ExecutionState {
            state_id: self.state_id.clone(),
            version: self.version,
            created_at: self.created_at,
            last_modified: self.last_modified,
            entries: self.entries.clone(),
            metadata: self.metadata.clone(),
            history: vec![],
            txn_stack: vec![],
            next_txn: 0,
        }
    }

    fn touch(&mut self) {
        self.last_modified = Utc::now();
    }
}

impl PartialEq for ExecutionState {
    /// Equality over persistent content: id, version, entries, metadata,
    /// and history. Envelope timestamps are excluded.
    fn eq(&self, other: &Self) -> bool {
        self.state_id == other.state_id
            && self.version == other.version
            && self.entries == other.entries
            && self.metadata == other.metadata
            && self.history.len() == other.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::ValueKind;

    #[test]
    fn test_set_get_remove() {
        let mut state = ExecutionState::new();
        state.set("input", "hello").unwrap();
        assert_eq!(state.get_str("input"), Some("hello"));
        assert!(state.contains("input"));

        state.remove("input");
        assert!(!state.contains("input"));
    }

    #[test]
    fn test_empty_key_rejected() {
        let mut state = ExecutionState::new();
        assert!(matches!(state.set("", 1i64), Err(GraphError::EmptyKey)));
    }

    #[test]
    fn test_scalar_type_is_stable() {
        let mut state = ExecutionState::new();
        state.set("count", 1i64).unwrap();

        // Numeric widening is allowed
        state.set("count", 2.5).unwrap();

        // Changing to a different kind is not
        let err = state.set("count", "three").unwrap_err();
        assert!(matches!(
            err,
            GraphError::TypeMismatch { expected: ValueKind::Float, actual: ValueKind::String, .. }
        ));

        // Unless explicitly replaced
        state.replace("count", "three").unwrap();
        assert_eq!(state.get_str("count"), Some("three"));
    }

    #[test]
    fn test_get_as_deserializes_plain_values() {
        let mut state = ExecutionState::new();
        state
            .set("tags", Value::List(vec![Value::from("a"), Value::from("b")]))
            .unwrap();

        let tags: Vec<String> = state.get_as("tags").unwrap();
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(state.get_as::<i64>("missing"), None);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut state = ExecutionState::new();
        state.set("a", 1i64).unwrap();
        let snapshot = state.snapshot();

        state.set("a", 2i64).unwrap();
        state.set("b", "x").unwrap();

        state.restore(snapshot);
        assert_eq!(state.get_int("a"), Some(1));
        assert!(!state.contains("b"));
    }

    #[test]
    fn test_transactions_are_lifo() {
        let mut state = ExecutionState::new();
        state.set("n", 0i64).unwrap();

        let outer = state.begin_transaction();
        state.set("n", 1i64).unwrap();
        let inner = state.begin_transaction();
        state.set("n", 2i64).unwrap();

        // Outer is not innermost
        assert!(state.rollback(outer).is_err());

        state.rollback(inner).unwrap();
        assert_eq!(state.get_int("n"), Some(1));

        state.commit(outer).unwrap();
        assert_eq!(state.get_int("n"), Some(1));
    }

    #[test]
    fn test_rollback_keeps_history() {
        let mut state = ExecutionState::new();
        let txn = state.begin_transaction();
        state.record_step(ExecutionStep::finished("n1", Utc::now(), StepStatus::Ok, 1));
        state.rollback(txn).unwrap();
        assert_eq!(state.history().len(), 1);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut state = ExecutionState::new();
        state.set("k", "v").unwrap();
        let first = state.checksum();
        assert_eq!(first, state.checksum());

        state.set("k", "w").unwrap();
        assert_ne!(first, state.checksum());
    }

    #[test]
    fn test_attempt_counter_round_trip() {
        let mut state = ExecutionState::new();
        assert_eq!(state.attempt_counter("flaky"), 0);
        state.set_attempt_counter("flaky", 2);
        assert_eq!(state.attempt_counter("flaky"), 2);
    }

    #[test]
    fn test_version_parse() {
        let version: StateVersion = "1.2.3".parse().unwrap();
        assert_eq!(version, StateVersion::new(1, 2, 3));
        assert!("1.2".parse::<StateVersion>().is_err());
        assert!("1.2.3.4".parse::<StateVersion>().is_err());
    }
}
