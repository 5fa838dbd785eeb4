//! In-process object store.
//!
//! Backs `STORE_BACKEND=memory` and doubles as the store for tests: it counts
//! calls per primitive and can inject ref conflicts, transport failures and
//! tampered tree listings.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::{CommitInfo, ObjectId, ObjectStore, RefUpdate, RepoInfo, StoreError, TreeChange};

const DEFAULT_BRANCH: &str = "main";

/// Number of calls made to each primitive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_repository: usize,
    pub create_repository: usize,
    pub get_ref: usize,
    pub get_commit: usize,
    pub get_tree: usize,
    pub get_blob: usize,
    pub create_blob: usize,
    pub create_tree: usize,
    pub create_commit: usize,
    pub update_ref: usize,
}

impl CallCounts {
    /// Calls that create objects or move refs.
    pub fn writes(&self) -> usize {
        self.create_blob + self.create_tree + self.create_commit + self.update_ref
    }

    pub fn total(&self) -> usize {
        self.writes()
            + self.get_repository
            + self.create_repository
            + self.get_ref
            + self.get_commit
            + self.get_tree
            + self.get_blob
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable_calls: usize,
    ref_conflicts: usize,
    corrupted_paths: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct StoredCommit {
    tree: ObjectId,
    parent: Option<ObjectId>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    repo: Option<RepoInfo>,
    refs: HashMap<String, ObjectId>,
    blobs: HashMap<ObjectId, Bytes>,
    trees: HashMap<ObjectId, BTreeMap<String, ObjectId>>,
    commits: HashMap<ObjectId, StoredCommit>,
    commit_seq: u64,
    counts: CallCounts,
    faults: Faults,
    compare_and_swap: bool,
}

pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// An empty store with no repository.
    pub fn new() -> Self {
        Self::named("career-corpus-memory")
    }

    pub fn named(name: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                name: name.to_string(),
                repo: None,
                refs: HashMap::new(),
                blobs: HashMap::new(),
                trees: HashMap::new(),
                commits: HashMap::new(),
                commit_seq: 0,
                counts: CallCounts::default(),
                faults: Faults::default(),
                compare_and_swap: true,
            }),
        }
    }

    /// A store whose repository already exists with an initial commit.
    pub fn with_repository(name: &str) -> Self {
        let store = Self::named(name);
        store.lock().init_repository();
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn call_counts(&self) -> CallCounts {
        self.lock().counts
    }

    pub fn reset_counts(&self) {
        self.lock().counts = CallCounts::default();
    }

    /// The next `n` primitive calls fail as unavailable.
    pub fn fail_next_calls(&self, n: usize) {
        self.lock().faults.unavailable_calls = n;
    }

    /// The next `n` ref updates report a conflict without moving the ref.
    pub fn inject_ref_conflicts(&self, n: usize) {
        self.lock().faults.ref_conflicts = n;
    }

    /// Tree listings report a bogus blob id for `path`.
    pub fn corrupt_path(&self, path: &str) {
        self.lock().faults.corrupted_paths.insert(path.to_string());
    }

    pub fn set_compare_and_swap(&self, enabled: bool) {
        self.lock().compare_and_swap = enabled;
    }

    /// Commits files straight onto `branch`, as another writer would.
    /// Not counted as calls and not subject to faults.
    pub async fn commit_files(
        &self,
        branch: &str,
        upserts: &BTreeMap<String, Bytes>,
        deletes: &[&str],
    ) -> Result<ObjectId, StoreError> {
        let mut inner = self.lock();
        let head = inner
            .refs
            .get(branch)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("ref heads/{branch}")))?;
        let base = inner.commit(&head)?.tree;

        let mut changes: Vec<TreeChange> = upserts
            .iter()
            .map(|(path, content)| TreeChange::Upsert {
                path: path.clone(),
                blob: inner.put_blob(content.clone()),
            })
            .collect();
        changes.extend(deletes.iter().map(|p| TreeChange::Delete {
            path: p.to_string(),
        }));

        let tree = inner.put_tree(&base, &changes)?;
        let commit = inner.put_commit("external change", &tree, Some(&head));
        inner.refs.insert(branch.to_string(), commit.clone());
        Ok(commit)
    }
}

fn digest(kind: &str, parts: &[&[u8]]) -> ObjectId {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    for part in parts {
        hasher.update(part);
    }
    ObjectId::new(hex::encode(hasher.finalize()))
}

impl Inner {
    /// Counts the call and applies pending transport faults.
    fn enter(&mut self, count: fn(&mut CallCounts) -> &mut usize) -> Result<(), StoreError> {
        *count(&mut self.counts) += 1;
        if self.faults.unavailable_calls > 0 {
            self.faults.unavailable_calls -= 1;
            return Err(StoreError::Unavailable("injected transport failure".into()));
        }
        Ok(())
    }

    fn require_repo(&self) -> Result<(), StoreError> {
        match self.repo {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("repository {}", self.name))),
        }
    }

    fn init_repository(&mut self) -> RepoInfo {
        if let Some(repo) = &self.repo {
            return repo.clone();
        }
        let readme = self.put_blob(Bytes::from(format!("# {}\n", self.name)));
        let tree = self.trees_insert(BTreeMap::from([("README.md".to_string(), readme)]));
        let commit = self.put_commit("Initial commit", &tree, None);
        self.refs.insert(DEFAULT_BRANCH.to_string(), commit);
        let repo = RepoInfo {
            name: self.name.clone(),
            default_branch: DEFAULT_BRANCH.to_string(),
            private: true,
        };
        self.repo = Some(repo.clone());
        repo
    }

    fn put_blob(&mut self, content: Bytes) -> ObjectId {
        let id = digest("blob", &[&content]);
        self.blobs.insert(id.clone(), content);
        id
    }

    fn trees_insert(&mut self, entries: BTreeMap<String, ObjectId>) -> ObjectId {
        let listing: String = entries
            .iter()
            .map(|(path, blob)| format!("{path}\t{blob}\n"))
            .collect();
        let id = digest("tree", &[listing.as_bytes()]);
        self.trees.insert(id.clone(), entries);
        id
    }

    fn put_tree(&mut self, base: &ObjectId, changes: &[TreeChange]) -> Result<ObjectId, StoreError> {
        let mut entries = self
            .trees
            .get(base)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("tree {base}")))?;
        for change in changes {
            match change {
                TreeChange::Upsert { path, blob } => {
                    if !self.blobs.contains_key(blob) {
                        return Err(StoreError::Rejected(format!("unknown blob {blob}")));
                    }
                    entries.insert(path.clone(), blob.clone());
                }
                TreeChange::Delete { path } => {
                    entries.remove(path);
                }
            }
        }
        Ok(self.trees_insert(entries))
    }

    fn put_commit(&mut self, message: &str, tree: &ObjectId, parent: Option<&ObjectId>) -> ObjectId {
        self.commit_seq += 1;
        let seq = self.commit_seq.to_string();
        let parent_str = parent.map(ObjectId::as_str).unwrap_or_default();
        let id = digest(
            "commit",
            &[
                tree.as_str().as_bytes(),
                parent_str.as_bytes(),
                message.as_bytes(),
                seq.as_bytes(),
            ],
        );
        self.commits.insert(
            id.clone(),
            StoredCommit {
                tree: tree.clone(),
                parent: parent.cloned(),
            },
        );
        id
    }

    fn commit(&self, id: &ObjectId) -> Result<StoredCommit, StoreError> {
        self.commits
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("commit {id}")))
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_repository(&self) -> Result<Option<RepoInfo>, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.get_repository)?;
        Ok(inner.repo.clone())
    }

    async fn create_repository(&self) -> Result<RepoInfo, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.create_repository)?;
        if inner.repo.is_some() {
            return Err(StoreError::Rejected(format!(
                "repository {} already exists",
                inner.name
            )));
        }
        Ok(inner.init_repository())
    }

    async fn get_ref(&self, branch: &str) -> Result<Option<ObjectId>, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.get_ref)?;
        inner.require_repo()?;
        Ok(inner.refs.get(branch).cloned())
    }

    async fn get_commit(&self, commit: &ObjectId) -> Result<CommitInfo, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.get_commit)?;
        let stored = inner.commit(commit)?;
        Ok(CommitInfo {
            id: commit.clone(),
            tree: stored.tree,
            parent: stored.parent,
        })
    }

    async fn get_tree(&self, tree: &ObjectId) -> Result<BTreeMap<String, ObjectId>, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.get_tree)?;
        let mut entries = inner
            .trees
            .get(tree)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("tree {tree}")))?;
        for path in &inner.faults.corrupted_paths {
            if let Some(blob) = entries.get_mut(path) {
                *blob = ObjectId::new(format!("corrupt-{blob}"));
            }
        }
        Ok(entries)
    }

    async fn get_blob(&self, blob: &ObjectId) -> Result<Bytes, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.get_blob)?;
        inner
            .blobs
            .get(blob)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("blob {blob}")))
    }

    async fn create_blob(&self, content: Bytes) -> Result<ObjectId, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.create_blob)?;
        inner.require_repo()?;
        Ok(inner.put_blob(content))
    }

    async fn create_tree(
        &self,
        base_tree: &ObjectId,
        changes: &[TreeChange],
    ) -> Result<ObjectId, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.create_tree)?;
        inner.put_tree(base_tree, changes)
    }

    async fn create_commit(
        &self,
        message: &str,
        tree: &ObjectId,
        parent: &ObjectId,
    ) -> Result<ObjectId, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.create_commit)?;
        if !inner.trees.contains_key(tree) {
            return Err(StoreError::Rejected(format!("unknown tree {tree}")));
        }
        inner.commit(parent)?;
        Ok(inner.put_commit(message, tree, Some(parent)))
    }

    async fn update_ref(
        &self,
        branch: &str,
        expected: &ObjectId,
        new: &ObjectId,
    ) -> Result<RefUpdate, StoreError> {
        let mut inner = self.lock();
        inner.enter(|c| &mut c.update_ref)?;
        inner.require_repo()?;
        inner.commit(new)?;

        let current = inner.refs.get(branch).cloned();
        if inner.faults.ref_conflicts > 0 {
            inner.faults.ref_conflicts -= 1;
            return Ok(RefUpdate::Conflict { actual: current });
        }
        if inner.compare_and_swap && current.as_ref() != Some(expected) {
            return Ok(RefUpdate::Conflict { actual: current });
        }
        inner.refs.insert(branch.to_string(), new.clone());
        Ok(RefUpdate::Advanced)
    }

    fn supports_compare_and_swap(&self) -> bool {
        self.lock().compare_and_swap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_repository() {
        let store = InMemoryStore::new();
        assert_eq!(store.get_repository().await.unwrap(), None);
        assert!(matches!(
            store.get_ref("main").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_repository_once() {
        let store = InMemoryStore::new();
        let repo = store.create_repository().await.unwrap();
        assert_eq!(repo.default_branch, "main");
        assert!(repo.private);
        assert!(store.get_ref("main").await.unwrap().is_some());
        assert!(matches!(
            store.create_repository().await,
            Err(StoreError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_blobs_are_content_addressed() {
        let store = InMemoryStore::with_repository("r");
        let a = store.create_blob(Bytes::from_static(b"x")).await.unwrap();
        let b = store.create_blob(Bytes::from_static(b"x")).await.unwrap();
        let c = store.create_blob(Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.call_counts().create_blob, 3);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let store = InMemoryStore::with_repository("r");
        store.fail_next_calls(1);
        assert!(store.get_repository().await.unwrap_err().is_transient());
        assert!(store.get_repository().await.is_ok());

        let head = store.get_ref("main").await.unwrap().unwrap();
        store.inject_ref_conflicts(1);
        assert!(matches!(
            store.update_ref("main", &head, &head).await.unwrap(),
            RefUpdate::Conflict { .. }
        ));
        assert_eq!(
            store.update_ref("main", &head, &head).await.unwrap(),
            RefUpdate::Advanced
        );
    }

    #[tokio::test]
    async fn test_corrupted_path_changes_listing() {
        let store = InMemoryStore::with_repository("r");
        let head = store.get_ref("main").await.unwrap().unwrap();
        let tree = store.get_commit(&head).await.unwrap().tree;
        let clean = store.get_tree(&tree).await.unwrap();
        store.corrupt_path("README.md");
        let tampered = store.get_tree(&tree).await.unwrap();
        assert_ne!(clean["README.md"], tampered["README.md"]);
    }
}
