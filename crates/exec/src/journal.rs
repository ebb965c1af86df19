//! Append-only rollback journal: pre-images of every mutation, replayed
//! in reverse on abort.

use std::sync::Mutex;

use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use piceli_core::ObjectId;

use crate::transport::{ClusterClient, TransportError};

/// One mutation record: the live object as read immediately before the
/// mutation (`None` for creations) and the verb that was applied.
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub id: ObjectId,
    pub pre_image: Option<Value>,
    pub action: String,
}

/// A rollback step that could not be undone. Replay continues past it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("rollback step failed for {id}: {reason}")]
pub struct RollbackStepFailed {
    pub id: ObjectId,
    pub reason: String,
}

/// In-memory ordered log of mutations. Appends are serialized by a
/// single lock; entries are ordered by mutation submission. Never
/// persisted: a crashed run reconciles through the normal diff path.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: JournalEntry) {
        self.entries.lock().expect("journal lock poisoned").push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("journal lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot for diagnostic output, oldest first.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().expect("journal lock poisoned").clone()
    }

    /// Undo every recorded mutation, newest first: creations are
    /// deleted, everything else is restored from its pre-image.
    /// Best-effort; failures are reported and replay continues.
    pub async fn replay(&self, client: &dyn ClusterClient) -> Vec<RollbackStepFailed> {
        let entries = self.entries();
        let mut failures = Vec::new();
        for entry in entries.iter().rev() {
            counter!("rollback_steps_total", 1u64);
            let result = match &entry.pre_image {
                None => match client.delete(&entry.id).await {
                    Ok(()) | Err(TransportError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                },
                Some(image) => {
                    let restored = strip_server_fields(image.clone());
                    client.replace(&entry.id, &restored).await
                }
            };
            match result {
                Ok(()) => info!(id = %entry.id, action = %entry.action, "rolled back"),
                Err(e) => {
                    counter!("rollback_step_failures_total", 1u64);
                    warn!(id = %entry.id, error = %e, "rollback step failed");
                    failures.push(RollbackStepFailed { id: entry.id.clone(), reason: e.to_string() });
                }
            }
        }
        failures
    }
}

/// Pre-images carry server bookkeeping the cluster will not accept
/// back; prune it before restoring.
fn strip_server_fields(mut v: Value) -> Value {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("generation");
        meta.remove("creationTimestamp");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_server_fields_prunes_bookkeeping() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "uid": "0001",
                "resourceVersion": "9",
                "managedFields": [{"manager": "x"}],
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": {"x": 1},
            "data": {"a": "1"}
        });
        let pruned = strip_server_fields(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("uid"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("managedFields"));
        assert!(!pruned.as_object().unwrap().contains_key("status"));
        assert_eq!(pruned.get("data"), Some(&json!({"a": "1"})));
    }

    #[test]
    fn entries_snapshot_preserves_append_order() {
        let journal = Journal::new();
        for name in ["a", "b", "c"] {
            journal.append(JournalEntry {
                id: ObjectId {
                    group: String::new(),
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                    namespace: Some("demo".into()),
                    name: name.into(),
                },
                pre_image: None,
                action: "create".into(),
            });
        }
        let names: Vec<String> = journal.entries().iter().map(|e| e.id.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(journal.len(), 3);
    }
}
