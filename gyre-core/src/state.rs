//! State Store
//!
//! Checkpoint persistence keyed by task id. A checkpoint is a snapshot
//! sufficient to resume the task on another worker; a task has at most one
//! current checkpoint, guarded by a monotonic version counter for
//! optimistic concurrency (conflict → caller retries load-modify-save).
//!
//! Variants: the in-memory store here, the durable SQLite store in
//! `gyre-storage-sqlite`, and the remote key-value adapter below.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{AgentStatus, AgentTask, CycleRecord, JsonMap, Message};

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Durable snapshot of a task between cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub task: AgentTask,
    /// Index of the last completed cycle (0 before the first cycle).
    pub cycle_index: u32,
    pub status: AgentStatus,
    pub messages: Vec<Message>,
    pub cycles: Vec<CycleRecord>,
    #[serde(default)]
    pub shared_state: JsonMap,
}

impl Checkpoint {
    pub fn task_id(&self) -> &str {
        &self.task.task_id
    }

    /// Stable serialized form. `serde_json` object keys are ordered, so
    /// serializing an equivalent checkpoint twice yields identical bytes.
    pub fn to_json(&self) -> Result<String, StateStoreError> {
        serde_json::to_string(self).map_err(|e| StateStoreError::Serialization(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, StateStoreError> {
        serde_json::from_str(raw).map_err(|e| StateStoreError::Serialization(e.to_string()))
    }
}

/// A checkpoint together with its store version.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedCheckpoint {
    pub checkpoint: Checkpoint,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StateStoreError {
    /// The stored version does not match `expected_version`; another
    /// writer advanced the checkpoint first.
    #[error("version conflict for task '{task_id}': expected {expected}, found {found}")]
    VersionConflict {
        task_id: String,
        expected: u64,
        found: u64,
    },
    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),
    #[error("state store backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// StateStore trait
// ---------------------------------------------------------------------------

/// Checkpoint persistence. Implementations must be safe for concurrent
/// invocation across tasks, and must reject a save whose
/// `expected_version` does not match the stored version.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a checkpoint.
    ///
    /// `expected_version` of `None` requires that no checkpoint exists yet;
    /// `Some(v)` requires the stored version to be exactly `v`. Returns the
    /// new version.
    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<u64, StateStoreError>;

    async fn load(&self, task_id: &str) -> Result<Option<VersionedCheckpoint>, StateStoreError>;

    async fn delete(&self, task_id: &str) -> Result<(), StateStoreError>;

    /// Task ids with a current checkpoint, sorted.
    async fn list(&self) -> Result<Vec<String>, StateStoreError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<String, (Checkpoint, u64)>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<u64, StateStoreError> {
        let mut entries = self.entries.write().await;
        let current = entries.get(checkpoint.task_id()).map(|(_, v)| *v);
        let next = match (expected_version, current) {
            (None, None) => 1,
            (Some(expected), Some(found)) if expected == found => found + 1,
            (expected, found) => {
                return Err(StateStoreError::VersionConflict {
                    task_id: checkpoint.task_id().to_string(),
                    expected: expected.unwrap_or(0),
                    found: found.unwrap_or(0),
                })
            }
        };
        entries.insert(checkpoint.task_id().to_string(), (checkpoint.clone(), next));
        Ok(next)
    }

    async fn load(&self, task_id: &str) -> Result<Option<VersionedCheckpoint>, StateStoreError> {
        let entries = self.entries.read().await;
        Ok(entries.get(task_id).map(|(cp, version)| VersionedCheckpoint {
            checkpoint: cp.clone(),
            version: *version,
        }))
    }

    async fn delete(&self, task_id: &str) -> Result<(), StateStoreError> {
        self.entries.write().await.remove(task_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StateStoreError> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Remote key-value adapter
// ---------------------------------------------------------------------------

/// Minimal key-value contract a remote store (Redis and friends) exposes.
/// The concrete client is an external collaborator; only these operations
/// are consumed.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError>;
    /// Set `key` only when its current value equals `expected` (`None` for
    /// "must not exist"). Returns false on mismatch.
    async fn set_if(
        &self,
        key: &str,
        value: &str,
        expected: Option<&str>,
    ) -> Result<bool, StateStoreError>;
    async fn remove(&self, key: &str) -> Result<(), StateStoreError>;
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StateStoreError>;
}

const KV_KEY_PREFIX: &str = "gyre:checkpoint:";

#[derive(Serialize, Deserialize)]
struct KvEnvelope {
    version: u64,
    checkpoint: Checkpoint,
}

/// `StateStore` over any [`KeyValue`] backend. Versioning rides inside the
/// stored envelope; conditional writes give the compare-and-swap the
/// version counter needs.
pub struct KvStateStore {
    kv: Arc<dyn KeyValue>,
}

impl KvStateStore {
    pub fn new(kv: Arc<dyn KeyValue>) -> Self {
        Self { kv }
    }

    fn key(task_id: &str) -> String {
        format!("{KV_KEY_PREFIX}{task_id}")
    }
}

#[async_trait]
impl StateStore for KvStateStore {
    async fn save(
        &self,
        checkpoint: &Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<u64, StateStoreError> {
        let key = Self::key(checkpoint.task_id());
        let current_raw = self.kv.get(&key).await?;
        let current_version = match &current_raw {
            Some(raw) => {
                let envelope: KvEnvelope = serde_json::from_str(raw)
                    .map_err(|e| StateStoreError::Serialization(e.to_string()))?;
                Some(envelope.version)
            }
            None => None,
        };

        if expected_version != current_version {
            return Err(StateStoreError::VersionConflict {
                task_id: checkpoint.task_id().to_string(),
                expected: expected_version.unwrap_or(0),
                found: current_version.unwrap_or(0),
            });
        }

        let next = current_version.unwrap_or(0) + 1;
        let envelope = KvEnvelope {
            version: next,
            checkpoint: checkpoint.clone(),
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| StateStoreError::Serialization(e.to_string()))?;

        let stored = self
            .kv
            .set_if(&key, &payload, current_raw.as_deref())
            .await?;
        if !stored {
            // Lost the race between read and conditional write.
            return Err(StateStoreError::VersionConflict {
                task_id: checkpoint.task_id().to_string(),
                expected: expected_version.unwrap_or(0),
                found: next,
            });
        }
        Ok(next)
    }

    async fn load(&self, task_id: &str) -> Result<Option<VersionedCheckpoint>, StateStoreError> {
        let raw = match self.kv.get(&Self::key(task_id)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let envelope: KvEnvelope =
            serde_json::from_str(&raw).map_err(|e| StateStoreError::Serialization(e.to_string()))?;
        Ok(Some(VersionedCheckpoint {
            checkpoint: envelope.checkpoint,
            version: envelope.version,
        }))
    }

    async fn delete(&self, task_id: &str) -> Result<(), StateStoreError> {
        self.kv.remove(&Self::key(task_id)).await
    }

    async fn list(&self) -> Result<Vec<String>, StateStoreError> {
        let mut ids: Vec<String> = self
            .kv
            .keys(KV_KEY_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(KV_KEY_PREFIX).map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentTask;
    use std::sync::Mutex;

    fn checkpoint(task_id: &str, cycle_index: u32) -> Checkpoint {
        Checkpoint {
            task: AgentTask::new(task_id, "test-model", "sys", "user"),
            cycle_index,
            status: AgentStatus::Running,
            messages: vec![Message::system("sys"), Message::user("user")],
            cycles: Vec::new(),
            shared_state: JsonMap::new(),
        }
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let store = InMemoryStateStore::new();
        let cp = checkpoint("t1", 2);

        let version = store.save(&cp, None).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.checkpoint, cp);
        // Byte-identical re-serialization of the equivalent checkpoint.
        assert_eq!(loaded.checkpoint.to_json().unwrap(), cp.to_json().unwrap());
    }

    #[tokio::test]
    async fn version_counter_is_monotonic() {
        let store = InMemoryStateStore::new();
        let v1 = store.save(&checkpoint("t1", 1), None).await.unwrap();
        let v2 = store.save(&checkpoint("t1", 2), Some(v1)).await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn stale_writer_conflicts() {
        let store = InMemoryStateStore::new();
        let v1 = store.save(&checkpoint("t1", 1), None).await.unwrap();
        store.save(&checkpoint("t1", 2), Some(v1)).await.unwrap();

        // A writer still holding v1 must not clobber cycle 2.
        let err = store.save(&checkpoint("t1", 2), Some(v1)).await.unwrap_err();
        assert!(matches!(err, StateStoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn create_requires_absence() {
        let store = InMemoryStateStore::new();
        store.save(&checkpoint("t1", 1), None).await.unwrap();
        let err = store.save(&checkpoint("t1", 1), None).await.unwrap_err();
        assert!(matches!(err, StateStoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn delete_then_load_is_none() {
        let store = InMemoryStateStore::new();
        store.save(&checkpoint("t1", 1), None).await.unwrap();
        store.delete("t1").await.unwrap();
        assert!(store.load("t1").await.unwrap().is_none());
    }

    // -- KV adapter --------------------------------------------------------

    #[derive(Default)]
    struct MemoryKv {
        data: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl KeyValue for MemoryKv {
        async fn get(&self, key: &str) -> Result<Option<String>, StateStoreError> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        async fn set_if(
            &self,
            key: &str,
            value: &str,
            expected: Option<&str>,
        ) -> Result<bool, StateStoreError> {
            let mut data = self.data.lock().unwrap();
            if data.get(key).map(String::as_str) != expected {
                return Ok(false);
            }
            data.insert(key.to_string(), value.to_string());
            Ok(true)
        }

        async fn remove(&self, key: &str) -> Result<(), StateStoreError> {
            self.data.lock().unwrap().remove(key);
            Ok(())
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, StateStoreError> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn kv_store_versions_and_lists() {
        let store = KvStateStore::new(Arc::new(MemoryKv::default()));

        let v1 = store.save(&checkpoint("kv1", 1), None).await.unwrap();
        let v2 = store.save(&checkpoint("kv1", 2), Some(v1)).await.unwrap();
        store.save(&checkpoint("kv2", 1), None).await.unwrap();
        assert_eq!((v1, v2), (1, 2));

        let ids = store.list().await.unwrap();
        assert_eq!(ids, vec!["kv1".to_string(), "kv2".to_string()]);

        let err = store.save(&checkpoint("kv1", 3), Some(v1)).await.unwrap_err();
        assert!(matches!(err, StateStoreError::VersionConflict { .. }));

        let loaded = store.load("kv1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.checkpoint.cycle_index, 2);
    }
}
