//! Commit records: an immutable snapshot of a tree plus bound metadata.
//!
//! Commits are serialized as canonical JSON (sorted metadata keys, fixed
//! field order) and stored content-addressed; the commit id is the sha-256
//! of those bytes, so the same tree, metadata and timestamp always produce
//! the same id. Partial-pull state is a sidecar marker, never part of the
//! hashed record.

use crate::objects::ObjectStore;
use crate::StoreError;
use freight_schema::CommitMetadata;
use serde::{Deserialize, Serialize};

/// A stored commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub metadata: CommitMetadata,
    pub root_tree: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

impl CommitRecord {
    /// Canonical serialized form; the commit id is the sha-256 of these bytes.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn compute_id(&self) -> Result<String, StoreError> {
        Ok(crate::sha256_hex(&self.to_canonical_bytes()?))
    }

    /// Store the commit object and return its id.
    pub fn store(&self, objects: &ObjectStore) -> Result<String, StoreError> {
        let data = self.to_canonical_bytes()?;
        objects.put(&data)
    }

    pub fn load(objects: &ObjectStore, commit_id: &str) -> Result<Self, StoreError> {
        let data = objects
            .get(commit_id)
            .map_err(|_| StoreError::CommitNotFound(commit_id.to_owned()))?;
        Ok(serde_json::from_slice(&data)?)
    }
}
