//! Minimal cluster transport consumed by the executor. Implementations
//! must be concurrent-safe; the kube-backed one lives in
//! `piceli_kubehub`.

use async_trait::async_trait;
use serde_json::Value;

use piceli_core::ObjectId;

/// Transport failure taxonomy. Transient errors are retried with
/// backoff; terminal errors abort the level.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("not found")]
    NotFound,
    #[error("transient: {0}")]
    Transient(String),
    #[error("terminal: {0}")]
    Terminal(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Read the live object; `Ok(None)` when it does not exist.
    async fn get(&self, id: &ObjectId) -> Result<Option<Value>, TransportError>;

    async fn create(&self, id: &ObjectId, body: &Value) -> Result<(), TransportError>;

    async fn patch_merge(&self, id: &ObjectId, patch: &Value) -> Result<(), TransportError>;

    /// Full-body replacement of an existing object. Used by rollback
    /// to restore pre-images; the forward path replaces by
    /// delete-then-create.
    async fn replace(&self, id: &ObjectId, body: &Value) -> Result<(), TransportError>;

    /// Delete the object. Deleting an absent object is not an error.
    async fn delete(&self, id: &ObjectId) -> Result<(), TransportError>;
}
