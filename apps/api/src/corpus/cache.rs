use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::models::{Document, PatchError, SectionId, SectionPatch};
use crate::store::ObjectId;

pub const CACHE_FILE: &str = "corpus_cache.json";
pub const DRAFT_FILE: &str = "corpus_draft.json";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("staged patch cannot be applied: {0}")]
    Patch(#[from] PatchError),
}

/// What the cache knows about the remote copy it was last synced with.
///
/// Only a successful pull or push replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub branch: Option<String>,
    pub commit_id: Option<ObjectId>,
    pub manifest_id: Option<ObjectId>,
    /// Store object id of every corpus file at `commit_id`.
    #[serde(default)]
    pub remote_paths: BTreeMap<String, ObjectId>,
    /// Canonical JSON SHA-256 of every corpus file at `commit_id`.
    #[serde(default)]
    pub content_hashes: BTreeMap<String, String>,
    pub last_verified: Option<DateTime<Utc>>,
    pub last_pulled: Option<DateTime<Utc>>,
    pub last_pushed: Option<DateTime<Utc>>,
    pub method: Option<String>,
    /// Set when a push landed on a commit this cache never pulled.
    #[serde(default)]
    pub refresh_required: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    document: Option<Document>,
    metadata: SyncMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
struct DraftFile {
    saved_at: DateTime<Utc>,
    patches: Vec<SectionPatch>,
}

/// Last-known-good document, its sync metadata, and staged patches.
///
/// Writes go to disk before memory so that a failed write leaves the
/// in-memory cache unchanged.
#[derive(Debug, Default)]
pub struct LocalCache {
    dir: Option<PathBuf>,
    document: Option<Document>,
    metadata: SyncMetadata,
    staged: BTreeMap<SectionId, SectionPatch>,
    last_checkpoint: Option<DateTime<Utc>>,
}

impl LocalCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens (or creates) a cache mirrored to `dir`, loading any saved state.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut cache = Self {
            dir: Some(dir.clone()),
            ..Self::default()
        };
        if let Some(saved) = read_json::<CacheFile>(&dir.join(CACHE_FILE))? {
            cache.document = saved.document;
            cache.metadata = saved.metadata;
        }
        if let Some(draft) = read_json::<DraftFile>(&dir.join(DRAFT_FILE))? {
            cache.last_checkpoint = Some(draft.saved_at);
            cache.staged = draft
                .patches
                .into_iter()
                .map(|p| (p.section.clone(), p))
                .collect();
        }
        info!(
            dir = %dir.display(),
            has_document = cache.document.is_some(),
            staged = cache.staged.len(),
            "Opened local cache"
        );
        Ok(cache)
    }

    /// The document as last synced with the remote store.
    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn metadata(&self) -> &SyncMetadata {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.document.is_none()
    }

    /// The draft differs from the last synced state.
    pub fn is_dirty(&self) -> bool {
        !self.staged.is_empty()
    }

    pub fn staged(&self) -> &BTreeMap<SectionId, SectionPatch> {
        &self.staged
    }

    pub fn last_checkpoint(&self) -> Option<DateTime<Utc>> {
        self.last_checkpoint
    }

    fn base(&self, schema_version: &str) -> Document {
        self.document
            .clone()
            .unwrap_or_else(|| Document::empty(schema_version))
    }

    /// Synced document with every staged patch applied, normalized.
    pub fn draft(&self, schema_version: &str) -> Result<Document, PatchError> {
        let mut draft = self.base(schema_version);
        for patch in self.staged.values() {
            draft.apply(patch)?;
        }
        draft.normalize();
        Ok(draft)
    }

    /// Synced document with only the staged patches for `targets` applied.
    pub fn working_copy(
        &self,
        targets: &BTreeSet<SectionId>,
        schema_version: &str,
    ) -> Result<Document, PatchError> {
        let mut copy = self.base(schema_version);
        for patch in self.staged.values().filter(|p| targets.contains(&p.section)) {
            copy.apply(patch)?;
        }
        copy.normalize();
        Ok(copy)
    }

    /// Staged record patches a patch for `section` replaces: a whole
    /// collection supersedes every staged record of the same kind.
    pub fn superseded_by(&self, section: &SectionId) -> BTreeSet<SectionId> {
        if section.record_id().is_some() {
            return BTreeSet::new();
        }
        self.staged
            .keys()
            .filter(|id| id.kind() == section.kind() && id.record_id().is_some())
            .cloned()
            .collect()
    }

    /// Stages a patch, replacing any earlier patch for the same section and
    /// the record patches it supersedes, and checkpoints the draft.
    pub fn stage(&mut self, patch: SectionPatch) -> Result<Option<SectionPatch>, CacheError> {
        let superseded = self.superseded_by(&patch.section);
        let mut staged = self.staged.clone();
        staged.retain(|id, _| !superseded.contains(id));
        let previous = staged.insert(patch.section.clone(), patch);
        let saved_at = self.write_draft(&staged)?;
        self.staged = staged;
        self.last_checkpoint = saved_at.or(self.last_checkpoint);
        Ok(previous)
    }

    /// Drops staged patches for `sections`.
    pub fn unstage(&mut self, sections: &BTreeSet<SectionId>) -> Result<(), CacheError> {
        if !sections.iter().any(|s| self.staged.contains_key(s)) {
            return Ok(());
        }
        let mut staged = self.staged.clone();
        staged.retain(|id, _| !sections.contains(id));
        let saved_at = self.write_draft(&staged)?;
        self.staged = staged;
        self.last_checkpoint = saved_at.or(self.last_checkpoint);
        Ok(())
    }

    /// Writes the staged patches to the draft file. This is the local-only
    /// save used when the remote write fails.
    pub fn checkpoint(&mut self) -> Result<Option<DateTime<Utc>>, CacheError> {
        let saved_at = self.write_draft(&self.staged)?;
        if saved_at.is_some() {
            self.last_checkpoint = saved_at;
        }
        Ok(saved_at)
    }

    /// Replaces the synced state after a pull. Staged patches are discarded
    /// and returned.
    pub fn replace(
        &mut self,
        document: Document,
        metadata: SyncMetadata,
    ) -> Result<Vec<SectionId>, CacheError> {
        self.write_cache(Some(&document), &metadata)?;
        self.write_draft(&BTreeMap::new())?;
        self.document = Some(document);
        self.metadata = metadata;
        let discarded = std::mem::take(&mut self.staged).into_keys().collect();
        Ok(discarded)
    }

    /// Records a verified push: the pushed document becomes the synced one and
    /// the patches it carried are no longer staged.
    pub fn record_push(
        &mut self,
        document: Document,
        metadata: SyncMetadata,
        pushed: &BTreeSet<SectionId>,
    ) -> Result<(), CacheError> {
        let mut staged = self.staged.clone();
        staged.retain(|id, _| !pushed.contains(id));
        self.write_cache(Some(&document), &metadata)?;
        let saved_at = self.write_draft(&staged)?;
        self.document = Some(document);
        self.metadata = metadata;
        self.staged = staged;
        self.last_checkpoint = saved_at.or(self.last_checkpoint);
        Ok(())
    }

    /// Updates metadata only, keeping the synced document.
    pub fn update_metadata(&mut self, metadata: SyncMetadata) -> Result<(), CacheError> {
        self.write_cache(self.document.as_ref(), &metadata)?;
        self.metadata = metadata;
        Ok(())
    }

    fn write_cache(
        &self,
        document: Option<&Document>,
        metadata: &SyncMetadata,
    ) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let file = CacheFile {
            document: document.cloned(),
            metadata: metadata.clone(),
        };
        atomic_write_json(&dir.join(CACHE_FILE), &file)
    }

    fn write_draft(
        &self,
        staged: &BTreeMap<SectionId, SectionPatch>,
    ) -> Result<Option<DateTime<Utc>>, CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let saved_at = Utc::now();
        let file = DraftFile {
            saved_at,
            patches: staged.values().cloned().collect(),
        };
        atomic_write_json(&dir.join(DRAFT_FILE), &file)?;
        debug!(patches = staged.len(), "Checkpointed draft");
        Ok(Some(saved_at))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| CacheError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write to a temp file in the same directory, then rename over `path`.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheError> {
    let io_err = |source: io::Error| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| io_err(io::Error::other(e)))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    fs::write(temp.path(), bytes).map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::fixtures::valid_document;
    use crate::corpus::models::{Provenance, SectionKind};
    use serde_json::json;

    fn patch(section: &str, content: serde_json::Value) -> SectionPatch {
        SectionPatch {
            section: section.parse().unwrap(),
            content,
            provenance: Provenance::ChatConfirmed,
        }
    }

    fn metadata(commit: &str) -> SyncMetadata {
        SyncMetadata {
            branch: Some("main".into()),
            commit_id: Some(ObjectId::new(commit)),
            ..SyncMetadata::default()
        }
    }

    #[test]
    fn test_empty_cache_drafts_from_empty_document() {
        let cache = LocalCache::in_memory();
        assert!(cache.is_empty());
        assert!(!cache.is_dirty());
        let draft = cache.draft("1.0.0").unwrap();
        assert_eq!(draft, Document::empty("1.0.0"));
    }

    #[test]
    fn test_stage_marks_dirty_and_replaces_same_section() {
        let mut cache = LocalCache::in_memory();
        assert!(cache.stage(patch("profile", json!({"full_name": "A"}))).unwrap().is_none());
        let previous = cache.stage(patch("profile", json!({"full_name": "B"}))).unwrap();
        assert_eq!(previous.unwrap().content["full_name"], "A");
        assert!(cache.is_dirty());
        assert_eq!(
            cache.draft("1.0.0").unwrap().section(SectionKind::Profile).unwrap()["full_name"],
            "B"
        );
    }

    #[test]
    fn test_collection_patch_supersedes_staged_records() {
        let mut cache = LocalCache::in_memory();
        cache.replace(valid_document(), metadata("c1")).unwrap();
        cache.stage(patch("experience/exp_1", json!({"employer": "A"}))).unwrap();
        cache.stage(patch("projects/proj_1", json!({"name": "P"}))).unwrap();
        assert!(cache.superseded_by(&"experience/exp_1".parse().unwrap()).is_empty());

        let collection: SectionId = "experience".parse().unwrap();
        assert_eq!(
            cache.superseded_by(&collection),
            BTreeSet::from(["experience/exp_1".parse().unwrap()])
        );
        cache.stage(patch("experience", json!([]))).unwrap();
        assert_eq!(
            cache.staged().keys().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["experience", "projects/proj_1"]
        );
        assert!(cache.draft("1.0.0").unwrap().records(SectionKind::Experience).is_empty());
    }

    #[test]
    fn test_working_copy_applies_only_targets() {
        let mut cache = LocalCache::in_memory();
        cache.replace(valid_document(), metadata("c1")).unwrap();
        cache.stage(patch("profile", json!({"full_name": "New"}))).unwrap();
        cache.stage(patch("skills", json!({"technical": ["Go"]}))).unwrap();

        let targets = BTreeSet::from(["profile".parse().unwrap()]);
        let copy = cache.working_copy(&targets, "1.0.0").unwrap();
        assert_eq!(copy.section(SectionKind::Profile).unwrap()["full_name"], "New");
        assert_eq!(
            copy.section(SectionKind::Skills),
            valid_document().section(SectionKind::Skills)
        );
    }

    #[test]
    fn test_replace_discards_staged_patches() {
        let mut cache = LocalCache::in_memory();
        cache.stage(patch("skills", json!({}))).unwrap();
        let discarded = cache.replace(valid_document(), metadata("c1")).unwrap();
        assert_eq!(discarded, vec!["skills".parse().unwrap()]);
        assert!(!cache.is_dirty());
        assert_eq!(cache.metadata().commit_id, Some(ObjectId::new("c1")));
    }

    #[test]
    fn test_record_push_keeps_other_staged_patches() {
        let mut cache = LocalCache::in_memory();
        cache.replace(valid_document(), metadata("c1")).unwrap();
        cache.stage(patch("profile", json!({"full_name": "New"}))).unwrap();
        cache.stage(patch("skills", json!({}))).unwrap();
        let pushed = BTreeSet::from(["profile".parse().unwrap()]);
        let doc = cache.working_copy(&pushed, "1.0.0").unwrap();
        cache.record_push(doc, metadata("c2"), &pushed).unwrap();

        assert_eq!(
            cache.staged().keys().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["skills"]
        );
        assert_eq!(
            cache.document().unwrap().section(SectionKind::Profile).unwrap()["full_name"],
            "New"
        );
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = LocalCache::open(dir.path()).unwrap();
            cache.replace(valid_document(), metadata("c1")).unwrap();
            cache.stage(patch("profile", json!({"full_name": "Draft"}))).unwrap();
            assert!(cache.last_checkpoint().is_some());
        }
        let cache = LocalCache::open(dir.path()).unwrap();
        assert_eq!(cache.document(), Some(&valid_document()));
        assert_eq!(cache.metadata().commit_id, Some(ObjectId::new("c1")));
        assert!(cache.staged().contains_key(&"profile".parse().unwrap()));
        assert!(cache.last_checkpoint().is_some());
    }

    #[test]
    fn test_corrupt_cache_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CACHE_FILE), b"{not json").unwrap();
        assert!(matches!(
            LocalCache::open(dir.path()),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = LocalCache::open(dir.path()).unwrap();
        cache.replace(valid_document(), metadata("c1")).unwrap();
        drop(dir);

        let result = cache.replace(Document::empty("1.0.0"), metadata("c2"));
        assert!(matches!(result, Err(CacheError::Io { .. })));
        assert_eq!(cache.document(), Some(&valid_document()));
        assert_eq!(cache.metadata().commit_id, Some(ObjectId::new("c1")));
    }
}
