//! Content-addressed store: blobs, trees, commits and an advanceable branch ref.
//!
//! `ObjectStore` is the raw backend seam (GitHub Git Data API or the
//! in-process store). `ContentAddressedStore` in `graph` is the client the
//! sync engine talks to.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod github;
pub mod graph;
pub mod memory;

pub use graph::{ContentAddressedStore, ObjectGraph};

/// Store-assigned identifier of a blob, tree or commit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub name: String,
    pub default_branch: String,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub id: ObjectId,
    pub tree: ObjectId,
    pub parent: Option<ObjectId>,
}

/// One entry of a new tree built on top of a base tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeChange {
    Upsert { path: String, blob: ObjectId },
    Delete { path: String },
}

impl TreeChange {
    pub fn path(&self) -> &str {
        match self {
            TreeChange::Upsert { path, .. } | TreeChange::Delete { path } => path,
        }
    }
}

/// Result of a conditional ref advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdate {
    Advanced,
    /// The ref no longer pointed at the expected commit.
    Conflict { actual: Option<ObjectId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store rejected credentials: {0}")]
    Unauthorized(String),

    #[error("store rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected store response: {0}")]
    Unexpected(String),
}

impl StoreError {
    /// Transport-level failures worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Primitive operations of a git-like object store scoped to one repository.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_repository(&self) -> Result<Option<RepoInfo>, StoreError>;

    /// Creates the repository with an initial commit on its default branch.
    async fn create_repository(&self) -> Result<RepoInfo, StoreError>;

    async fn get_ref(&self, branch: &str) -> Result<Option<ObjectId>, StoreError>;

    async fn get_commit(&self, commit: &ObjectId) -> Result<CommitInfo, StoreError>;

    /// Flattened listing of every blob reachable from `tree`, keyed by path.
    async fn get_tree(&self, tree: &ObjectId) -> Result<BTreeMap<String, ObjectId>, StoreError>;

    async fn get_blob(&self, blob: &ObjectId) -> Result<Bytes, StoreError>;

    async fn create_blob(&self, content: Bytes) -> Result<ObjectId, StoreError>;

    async fn create_tree(
        &self,
        base_tree: &ObjectId,
        changes: &[TreeChange],
    ) -> Result<ObjectId, StoreError>;

    async fn create_commit(
        &self,
        message: &str,
        tree: &ObjectId,
        parent: &ObjectId,
    ) -> Result<ObjectId, StoreError>;

    /// Moves `branch` from `expected` to `new`.
    async fn update_ref(
        &self,
        branch: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> Result<RefUpdate, StoreError>;

    /// Whether `update_ref` is an atomic compare-and-swap on `expected`.
    fn supports_compare_and_swap(&self) -> bool {
        true
    }
}
