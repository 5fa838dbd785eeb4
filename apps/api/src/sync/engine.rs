use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::error::SyncError;
use super::reports::{BootstrapOutcome, PullOutcome, PushFailure, PushReport, Verification, METHOD_SPLIT};
use crate::corpus::approval::ApprovalRecord;
use crate::corpus::cache::{LocalCache, SyncMetadata};
use crate::corpus::canonical::{canonical_json_sha256, canonical_json_text};
use crate::corpus::layout::{self, MANIFEST_PATH};
use crate::corpus::models::{Document, SectionId};
use crate::corpus::validation::SchemaValidator;
use crate::store::{
    ContentAddressedStore, ObjectGraph, ObjectId, RefUpdate, StoreError, TreeChange,
};

/// First attempt plus one retry.
pub const MAX_PUSH_ATTEMPTS: u32 = 2;

/// Guards that hold for the duration of one conversational turn.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub repo_create_attempted: bool,
}

/// Files to write for one push, computed against the last synced state.
struct WritePlan {
    hashes: BTreeMap<String, String>,
    blobs: BTreeMap<String, Bytes>,
    deleted: Vec<String>,
}

impl WritePlan {
    fn new(document: &Document, recorded: &SyncMetadata) -> Result<Self, SyncError> {
        let files = layout::split(document)?;
        let mut hashes = BTreeMap::new();
        let mut blobs = BTreeMap::new();
        for (path, content) in &files {
            let hash = canonical_json_sha256(content);
            let unchanged = recorded.remote_paths.contains_key(path)
                && recorded.content_hashes.get(path) == Some(&hash);
            if !unchanged {
                blobs.insert(path.clone(), Bytes::from(canonical_json_text(content)));
            }
            hashes.insert(path.clone(), hash);
        }
        let deleted = recorded
            .remote_paths
            .keys()
            .filter(|p| !files.contains_key(*p))
            .cloned()
            .collect();
        Ok(Self {
            hashes,
            blobs,
            deleted,
        })
    }

    fn is_empty(&self) -> bool {
        self.blobs.is_empty() && self.deleted.is_empty()
    }

    fn changed_paths(&self) -> Vec<String> {
        self.blobs.keys().cloned().collect()
    }

    fn touched(&self) -> impl Iterator<Item = &String> {
        self.blobs.keys().chain(self.deleted.iter())
    }

    fn uncovered(&self, targets: &BTreeSet<SectionId>) -> Vec<String> {
        self.touched()
            .filter(|p| !targets.iter().any(|t| layout::covers(t, p)))
            .cloned()
            .collect()
    }

    /// Fails when the branch head changed any path this plan writes since
    /// the state the plan was computed from.
    fn check_overlap(
        &self,
        branch: &str,
        head: &BTreeMap<String, ObjectId>,
        recorded: &BTreeMap<String, ObjectId>,
        written: Option<&BTreeMap<String, ObjectId>>,
    ) -> Result<(), SyncError> {
        for path in self.touched() {
            let remote = head.get(path);
            if remote == recorded.get(path) {
                continue;
            }
            // an earlier attempt of this push may already have landed
            let already_ours = match remote {
                Some(id) => written.and_then(|w| w.get(path)) == Some(id),
                None => self.deleted.contains(path),
            };
            if !already_ours {
                return Err(SyncError::RefConflict {
                    branch: branch.to_string(),
                    reason: format!("{path} was changed by another writer"),
                });
            }
        }
        Ok(())
    }
}

/// Corpus content decoded from one commit.
struct Snapshot {
    document: Document,
    remote_paths: BTreeMap<String, ObjectId>,
    content_hashes: BTreeMap<String, String>,
}

/// A ref advance that was verified by reading the commit back.
struct Landed {
    branch: String,
    base_commit: ObjectId,
    commit: ObjectId,
    blob_ids: BTreeMap<String, ObjectId>,
    verification: Verification,
}

/// Pull and push transactions between the local cache and the remote store.
///
/// The engine borrows the cache for one transaction at a time and leaves it
/// either fully updated or untouched.
#[derive(Clone)]
pub struct SyncEngine {
    store: ContentAddressedStore,
    validator: Arc<dyn SchemaValidator>,
    schema_version: String,
}

impl SyncEngine {
    pub fn new(
        store: ContentAddressedStore,
        validator: Arc<dyn SchemaValidator>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            validator,
            schema_version: schema_version.into(),
        }
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn validator(&self) -> &dyn SchemaValidator {
        self.validator.as_ref()
    }

    /// Finds the memory repository, creating it at most once per turn.
    pub async fn ensure_repository(
        &self,
        turn: &mut TurnState,
    ) -> Result<BootstrapOutcome, SyncError> {
        if let Some(repo) = self.store.repository().await? {
            return Ok(BootstrapOutcome {
                repo,
                created: false,
            });
        }
        if turn.repo_create_attempted {
            warn!("Repository still missing, creation already attempted this turn");
            return Err(SyncError::RepoMissing);
        }
        turn.repo_create_attempted = true;

        match self.store.create_repository().await {
            Ok(repo) => info!(repo = %repo.name, "Created memory repository"),
            // created concurrently; the confirm read below settles it
            Err(StoreError::Rejected(message)) => {
                warn!(%message, "Repository creation rejected")
            }
            Err(e) => return Err(e.into()),
        }

        let repo = self
            .store
            .repository()
            .await?
            .ok_or(SyncError::RepoMissing)?;
        Ok(BootstrapOutcome {
            repo,
            created: true,
        })
    }

    pub async fn pull(&self, cache: &mut LocalCache, force: bool) -> Result<PullOutcome, SyncError> {
        let repo = self
            .store
            .repository()
            .await?
            .ok_or(SyncError::RepoMissing)?;
        let branch = repo.default_branch;
        let head = self
            .store
            .head(&branch)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                branch: branch.clone(),
            })?;

        let recorded = cache.metadata().clone();
        let trust_cache = !force
            && !cache.is_empty()
            && !recorded.refresh_required
            && recorded.branch.as_deref() == Some(branch.as_str());
        if trust_cache && recorded.commit_id.as_ref() == Some(&head) {
            debug!(commit = %head, "Pull skipped, cache is current");
            return Ok(PullOutcome::Unchanged { commit_id: head });
        }

        let graph = self.store.read_object_graph(&head).await?;
        let Some(manifest_id) = graph.paths.get(MANIFEST_PATH).cloned() else {
            info!(branch = %branch, commit = %head, "No corpus manifest on branch");
            return Err(SyncError::NotFound { branch });
        };

        let corpus_untouched = !recorded.remote_paths.is_empty()
            && recorded
                .remote_paths
                .iter()
                .all(|(path, id)| graph.paths.get(path) == Some(id));
        if trust_cache && corpus_untouched {
            info!(commit = %head, "Branch moved without corpus changes");
            let metadata = SyncMetadata {
                commit_id: Some(head.clone()),
                last_pulled: Some(Utc::now()),
                ..recorded
            };
            cache.update_metadata(metadata)?;
            return Ok(PullOutcome::Unchanged { commit_id: head });
        }

        let snapshot = self.load_snapshot(&graph, manifest_id).await?;
        let now = Utc::now();
        let metadata = SyncMetadata {
            branch: Some(branch.clone()),
            commit_id: Some(head.clone()),
            manifest_id: snapshot.remote_paths.get(MANIFEST_PATH).cloned(),
            remote_paths: snapshot.remote_paths,
            content_hashes: snapshot.content_hashes,
            last_verified: Some(now),
            last_pulled: Some(now),
            last_pushed: recorded.last_pushed,
            method: Some(METHOD_SPLIT.to_string()),
            refresh_required: false,
        };
        let file_count = metadata.remote_paths.len();
        let discarded = cache.replace(snapshot.document, metadata)?;
        if !discarded.is_empty() {
            warn!(
                count = discarded.len(),
                "Pull replaced the synced document, staged patches discarded"
            );
        }
        info!(branch = %branch, commit = %head, files = file_count, "Pulled corpus");

        Ok(PullOutcome::Updated {
            commit_id: head,
            files: file_count,
            discarded_patches: discarded,
        })
    }

    /// Decodes the corpus files a commit's manifest references.
    async fn load_snapshot(
        &self,
        graph: &ObjectGraph,
        manifest_id: ObjectId,
    ) -> Result<Snapshot, SyncError> {
        let manifest_value = self.read_json(MANIFEST_PATH, &manifest_id).await?;
        let manifest = layout::decode_manifest(&manifest_value)?;

        let mut files = BTreeMap::new();
        let mut remote_paths = BTreeMap::new();
        for path in manifest.referenced_paths() {
            if !layout::is_corpus_path(path) {
                return Err(SyncError::DecodeError {
                    path: path.to_string(),
                    reason: "manifest references a file outside the corpus directory".into(),
                });
            }
            let id = graph
                .paths
                .get(path)
                .ok_or_else(|| SyncError::DecodeError {
                    path: path.to_string(),
                    reason: "referenced file is missing".into(),
                })?;
            files.insert(path.to_string(), self.read_json(path, id).await?);
            remote_paths.insert(path.to_string(), id.clone());
        }
        let document = layout::assemble(&manifest, &files)?;

        files.insert(MANIFEST_PATH.to_string(), manifest_value);
        remote_paths.insert(MANIFEST_PATH.to_string(), manifest_id.clone());
        let content_hashes = files
            .iter()
            .map(|(path, value)| (path.clone(), canonical_json_sha256(value)))
            .collect();

        Ok(Snapshot {
            document,
            remote_paths,
            content_hashes,
        })
    }

    /// Reads back a commit this engine just landed on top of another
    /// writer's changes.
    async fn reload(&self, commit: &ObjectId) -> Result<Snapshot, SyncError> {
        let graph = self.store.read_object_graph(commit).await?;
        let manifest_id = graph
            .paths
            .get(MANIFEST_PATH)
            .cloned()
            .ok_or_else(|| SyncError::DecodeError {
                path: MANIFEST_PATH.to_string(),
                reason: "manifest missing from the landed commit".into(),
            })?;
        self.load_snapshot(&graph, manifest_id).await
    }

    async fn read_json(&self, path: &str, id: &ObjectId) -> Result<Value, SyncError> {
        let bytes = self.store.read_blob(id).await?;
        serde_json::from_slice(&bytes).map_err(|e| SyncError::DecodeError {
            path: path.to_string(),
            reason: format!("invalid JSON: {e}"),
        })
    }

    /// Writes the staged patches for `targets` as one commit.
    ///
    /// Gates run in order before any store call: every target approved, the
    /// merged document schema-valid, something staged that changes a file,
    /// and every changed file covered by a target.
    pub async fn push(
        &self,
        cache: &mut LocalCache,
        targets: &BTreeSet<SectionId>,
        approvals: &ApprovalRecord,
        message: &str,
    ) -> Result<PushReport, PushFailure> {
        if targets.is_empty() {
            return Err(PushFailure::rejected(SyncError::NoTargetSections));
        }
        let unapproved = approvals.unapproved(targets);
        if !unapproved.is_empty() {
            warn!(count = unapproved.len(), "Push rejected, sections not approved");
            return Err(PushFailure::rejected(SyncError::UnapprovedWrite {
                sections: unapproved,
                paths: Vec::new(),
            }));
        }

        let working = cache
            .working_copy(targets, &self.schema_version)
            .map_err(PushFailure::rejected)?;
        let validation = self.validator.validate(&working, &self.schema_version);
        if !validation.valid {
            warn!(errors = validation.errors.len(), "Push rejected, schema invalid");
            return Err(PushFailure::rejected(SyncError::SchemaInvalid {
                errors: validation.errors,
            }));
        }

        let sections: Vec<SectionId> = targets.iter().cloned().collect();
        let staged: BTreeSet<SectionId> = targets
            .iter()
            .filter(|t| cache.staged().contains_key(*t))
            .cloned()
            .collect();
        if staged.is_empty() {
            info!("Push skipped, nothing staged for the target sections");
            return Ok(PushReport::nothing_to_do(sections));
        }

        let recorded = cache.metadata().clone();
        if recorded.refresh_required {
            // the synced document no longer describes the branch; a plan
            // against it could drop another writer's files
            warn!("Push rejected, branch has changes this cache has not pulled");
            return Err(PushFailure::rejected(SyncError::RefConflict {
                branch: recorded.branch.clone().unwrap_or_default(),
                reason: "the branch has changes that must be pulled first".into(),
            }));
        }
        let plan = WritePlan::new(&working, &recorded).map_err(PushFailure::rejected)?;
        if plan.is_empty() {
            info!("Push skipped, staged patches match the remote content");
            cache.unstage(&staged).map_err(PushFailure::rejected)?;
            return Ok(PushReport::nothing_to_do(sections));
        }
        let uncovered = plan.uncovered(targets);
        if !uncovered.is_empty() {
            warn!(?uncovered, "Push rejected, changes outside the approved sections");
            return Err(PushFailure::rejected(SyncError::UnapprovedWrite {
                sections: Vec::new(),
                paths: uncovered,
            }));
        }

        let local_checkpoint = cache
            .checkpoint()
            .map_err(PushFailure::rejected)?
            .or(cache.last_checkpoint());

        let mut blob_ids = None;
        let mut attempts = 0;
        let landed = loop {
            attempts += 1;
            match self
                .attempt(&plan, &recorded, attempts, message, &mut blob_ids)
                .await
            {
                Ok(landed) => break landed,
                Err(e) if e.is_retryable() && attempts < MAX_PUSH_ATTEMPTS => {
                    warn!(attempt = attempts, error = %e, "Push attempt failed, retrying with fresh branch state");
                }
                Err(e) => {
                    error!(attempts, error = %e, "Push failed");
                    return Err(PushFailure {
                        error: e,
                        attempts,
                        retry_count: attempts - 1,
                        local_checkpoint,
                    });
                }
            }
        };

        let now = Utc::now();
        let mut remote_paths = recorded.remote_paths.clone();
        for path in &plan.deleted {
            remote_paths.remove(path);
        }
        remote_paths.extend(landed.blob_ids.clone());
        let mut synced = Snapshot {
            document: working,
            remote_paths,
            content_hashes: plan.hashes.clone(),
        };
        let mut refresh_required = false;

        // Landed on a head this cache never pulled: the commit also holds the
        // other writer's files, so the synced state is read back from it.
        let rebased = recorded
            .commit_id
            .as_ref()
            .is_some_and(|c| *c != landed.base_commit);
        if rebased {
            match self.reload(&landed.commit).await {
                Ok(snapshot) => synced = snapshot,
                Err(e) => {
                    warn!(error = %e, commit = %landed.commit, "Could not read back the rebased commit, pull required");
                    refresh_required = true;
                }
            }
        }

        let metadata = SyncMetadata {
            branch: Some(landed.branch.clone()),
            commit_id: Some(landed.commit.clone()),
            manifest_id: synced.remote_paths.get(MANIFEST_PATH).cloned(),
            remote_paths: synced.remote_paths,
            content_hashes: synced.content_hashes,
            last_verified: Some(now),
            last_pulled: recorded.last_pulled,
            last_pushed: Some(now),
            method: Some(METHOD_SPLIT.to_string()),
            refresh_required,
        };

        if let Err(e) = cache.record_push(synced.document, metadata, &staged) {
            error!(error = %e, commit = %landed.commit, "Push landed but the local cache could not be updated");
            return Err(PushFailure {
                error: e.into(),
                attempts,
                retry_count: attempts - 1,
                local_checkpoint,
            });
        }

        info!(
            branch = %landed.branch,
            commit = %landed.commit,
            files = plan.blobs.len(),
            deleted = plan.deleted.len(),
            retries = attempts - 1,
            "Pushed corpus"
        );

        Ok(PushReport {
            persisted: true,
            nothing_to_do: false,
            branch: Some(landed.branch),
            commit_id: Some(landed.commit),
            sections,
            changed_paths: plan.changed_paths(),
            deleted_paths: plan.deleted.clone(),
            attempts,
            retry_count: attempts - 1,
            verification: Some(landed.verification),
            method: Some(METHOD_SPLIT.to_string()),
            refresh_required,
            written_at: Some(now),
        })
    }

    async fn attempt(
        &self,
        plan: &WritePlan,
        recorded: &SyncMetadata,
        attempt: u32,
        message: &str,
        blob_ids: &mut Option<BTreeMap<String, ObjectId>>,
    ) -> Result<Landed, SyncError> {
        let branch = match &recorded.branch {
            Some(branch) => branch.clone(),
            None => {
                self.store
                    .repository()
                    .await?
                    .ok_or(SyncError::RepoMissing)?
                    .default_branch
            }
        };

        // The first attempt trusts the last synced commit; the compare-and-swap
        // catches a moved branch. A retry starts from the current head.
        let (base_commit, base_tree) = match &recorded.commit_id {
            Some(commit) if attempt == 1 => {
                (commit.clone(), self.store.commit(commit).await?.tree)
            }
            _ => {
                let head = self
                    .store
                    .head(&branch)
                    .await?
                    .ok_or_else(|| SyncError::NotFound {
                        branch: branch.clone(),
                    })?;
                let graph = self.store.read_object_graph(&head).await?;
                if recorded.commit_id.as_ref() != Some(&head) {
                    plan.check_overlap(
                        &branch,
                        &graph.paths,
                        &recorded.remote_paths,
                        blob_ids.as_ref(),
                    )?;
                }
                (head, graph.tree)
            }
        };

        let ids = match blob_ids {
            Some(ids) => ids.clone(),
            None => {
                let ids = self.store.write_objects(&plan.blobs).await?;
                *blob_ids = Some(ids.clone());
                ids
            }
        };
        let changes: Vec<TreeChange> = ids
            .iter()
            .map(|(path, blob)| TreeChange::Upsert {
                path: path.clone(),
                blob: blob.clone(),
            })
            .chain(plan.deleted.iter().map(|path| TreeChange::Delete {
                path: path.clone(),
            }))
            .collect();

        let tree = self.store.write_tree(&base_tree, &changes).await?;
        let commit = self.store.write_commit(message, &tree, &base_commit).await?;

        match self.store.advance_ref(&branch, &base_commit, &commit).await? {
            RefUpdate::Advanced => {}
            RefUpdate::Conflict { actual } => {
                let reason = match actual {
                    Some(actual) => format!("expected {base_commit}, found {actual}"),
                    None => format!("ref is no longer at {base_commit}"),
                };
                return Err(SyncError::RefConflict { branch, reason });
            }
        }

        let verification = self.verify(&commit, &ids, &plan.deleted).await?;
        Ok(Landed {
            branch,
            base_commit,
            commit,
            blob_ids: ids,
            verification,
        })
    }

    /// Reads the new commit back and checks every written and deleted path.
    async fn verify(
        &self,
        commit: &ObjectId,
        written: &BTreeMap<String, ObjectId>,
        deleted: &[String],
    ) -> Result<Verification, SyncError> {
        let graph = self.store.read_object_graph(commit).await?;
        for (path, expected) in written {
            let actual = graph.paths.get(path);
            if actual != Some(expected) {
                error!(path = %path, commit = %commit, "Read-back mismatch after push");
                return Err(SyncError::VerificationMismatch {
                    path: path.clone(),
                    expected: Some(expected.clone()),
                    actual: actual.cloned(),
                });
            }
        }
        for path in deleted {
            if let Some(actual) = graph.paths.get(path) {
                error!(path = %path, commit = %commit, "Deleted path still present after push");
                return Err(SyncError::VerificationMismatch {
                    path: path.clone(),
                    expected: None,
                    actual: Some(actual.clone()),
                });
            }
        }
        Ok(Verification {
            verified: true,
            commit_id: commit.clone(),
            checked_paths: written.len() + deleted.len(),
        })
    }
}
