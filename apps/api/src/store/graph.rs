use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{CommitInfo, ObjectId, ObjectStore, RefUpdate, RepoInfo, StoreError, TreeChange};

/// A commit resolved down to its flattened tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectGraph {
    pub commit: ObjectId,
    pub tree: ObjectId,
    pub paths: BTreeMap<String, ObjectId>,
}

/// Client over an [`ObjectStore`] backend.
///
/// The one guarantee the sync engine relies on is that [`advance_ref`] only
/// moves the branch from the expected commit. Backends without an atomic
/// compare-and-swap get it emulated by re-reading the ref immediately before
/// the update and rejecting on mismatch.
///
/// [`advance_ref`]: ContentAddressedStore::advance_ref
#[derive(Clone)]
pub struct ContentAddressedStore {
    backend: Arc<dyn ObjectStore>,
}

impl ContentAddressedStore {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self { backend }
    }

    pub async fn repository(&self) -> Result<Option<RepoInfo>, StoreError> {
        self.backend.get_repository().await
    }

    pub async fn create_repository(&self) -> Result<RepoInfo, StoreError> {
        self.backend.create_repository().await
    }

    pub async fn head(&self, branch: &str) -> Result<Option<ObjectId>, StoreError> {
        self.backend.get_ref(branch).await
    }

    pub async fn commit(&self, commit: &ObjectId) -> Result<CommitInfo, StoreError> {
        self.backend.get_commit(commit).await
    }

    pub async fn read_object_graph(&self, commit: &ObjectId) -> Result<ObjectGraph, StoreError> {
        let info = self.backend.get_commit(commit).await?;
        let paths = self.backend.get_tree(&info.tree).await?;
        debug!(commit = %commit, files = paths.len(), "Read object graph");
        Ok(ObjectGraph {
            commit: commit.clone(),
            tree: info.tree,
            paths,
        })
    }

    pub async fn read_blob(&self, blob: &ObjectId) -> Result<Bytes, StoreError> {
        self.backend.get_blob(blob).await
    }

    /// Writes every blob and returns their ids keyed like the input.
    pub async fn write_objects(
        &self,
        blobs: &BTreeMap<String, Bytes>,
    ) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        let mut ids = BTreeMap::new();
        for (path, content) in blobs {
            let id = self.backend.create_blob(content.clone()).await?;
            ids.insert(path.clone(), id);
        }
        Ok(ids)
    }

    pub async fn write_tree(
        &self,
        base_tree: &ObjectId,
        changes: &[TreeChange],
    ) -> Result<ObjectId, StoreError> {
        self.backend.create_tree(base_tree, changes).await
    }

    pub async fn write_commit(
        &self,
        message: &str,
        tree: &ObjectId,
        parent: &ObjectId,
    ) -> Result<ObjectId, StoreError> {
        self.backend.create_commit(message, tree, parent).await
    }

    pub async fn advance_ref(
        &self,
        branch: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> Result<RefUpdate, StoreError> {
        if !self.backend.supports_compare_and_swap() {
            let current = self.backend.get_ref(branch).await?;
            if current.as_ref() != Some(expected) {
                warn!(
                    branch,
                    expected = %expected,
                    actual = ?current,
                    "Branch moved before ref update, rejecting"
                );
                return Ok(RefUpdate::Conflict { actual: current });
            }
        }
        self.backend.update_ref(branch, expected, new).await
    }
}
