//! One user's corpus session: the local cache, the approval gate, turn
//! guards, and the facts the persistence state is derived from.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::corpus::approval::{ApprovalRecord, SectionApprovalGate};
use crate::corpus::cache::{CacheError, LocalCache};
use crate::corpus::models::{Document, PatchError, Provenance, SectionId, SectionKind, SectionPatch};
use crate::corpus::state::{Operation, PersistenceState, StateInputs};
use crate::corpus::validation::ValidationResult;
use crate::sync::{
    BootstrapOutcome, PullOutcome, PushFailure, PushReport, SyncEngine, SyncError, TurnState,
    Verification,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation:?} is not allowed while the corpus is {}", .state.as_str())]
    NotAllowed {
        operation: Operation,
        state: PersistenceState,
    },

    #[error("onboarding cannot be completed: {reason}")]
    OnboardingIncomplete {
        reason: String,
        sections: Vec<SectionId>,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Push(#[from] PushFailure),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Outcome of the most recent push that reached the store.
#[derive(Debug, Clone, Default)]
struct LastWrite {
    persisted: bool,
    fallback_used: bool,
    method: Option<String>,
    retry_count: u32,
    verification: Option<Verification>,
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: PersistenceState,
    pub repo_exists: bool,
    pub document_exists: bool,
    pub onboarding_complete: bool,
    /// The current draft passes schema validation.
    pub validated: bool,
    /// The draft is fully persisted remotely.
    pub persisted: bool,
    pub fallback_used: bool,
    pub method: Option<String>,
    pub retry_count: u32,
    pub verification: Option<Verification>,
    pub last_written_timestamp: Option<DateTime<Utc>>,
    pub dirty: bool,
    pub staged_sections: Vec<SectionId>,
    pub approved_sections: Vec<SectionId>,
    pub branch: Option<String>,
    pub commit_id: Option<String>,
    pub requires_repair: bool,
    pub next_step: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub section: SectionId,
    pub replaced_previous: bool,
    /// Approval for this section was withdrawn because its content changed.
    pub approval_revoked: bool,
    pub validation: ValidationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftView {
    pub document: Document,
    pub validation: ValidationResult,
    pub staged_sections: Vec<SectionId>,
}

pub struct CorpusSession {
    engine: SyncEngine,
    cache: LocalCache,
    gate: SectionApprovalGate,
    turn: TurnState,
    /// `None` until a store call has told us.
    repo_exists: Option<bool>,
    remote_document: Option<bool>,
    last_write_failed: bool,
    last_write: LastWrite,
}

impl CorpusSession {
    pub fn new(engine: SyncEngine, cache: LocalCache) -> Self {
        Self {
            engine,
            cache,
            gate: SectionApprovalGate::new(),
            turn: TurnState::default(),
            repo_exists: None,
            remote_document: None,
            last_write_failed: false,
            last_write: LastWrite::default(),
        }
    }

    /// Resets per-turn guards.
    pub fn begin_turn(&mut self) {
        self.turn = TurnState::default();
    }

    fn inputs(&self) -> StateInputs {
        let synced = self.cache.document();
        StateInputs {
            repo_exists: self
                .repo_exists
                .unwrap_or(self.cache.metadata().commit_id.is_some()),
            document_exists: self.remote_document.unwrap_or(synced.is_some()),
            schema_valid: synced.is_some_and(|doc| {
                self.engine
                    .validator()
                    .validate(doc, self.engine.schema_version())
                    .valid
            }),
            onboarding_complete: synced.is_some_and(Document::onboarding_complete),
            last_write_failed: self.last_write_failed,
        }
    }

    /// Recomputed on every call.
    pub fn state(&self) -> PersistenceState {
        PersistenceState::derive(self.inputs())
    }

    fn check(&self, operation: Operation) -> Result<PersistenceState, SessionError> {
        let state = self.state();
        if state.allows(operation) {
            Ok(state)
        } else {
            warn!(?operation, state = state.as_str(), "Operation refused");
            Err(SessionError::NotAllowed { operation, state })
        }
    }

    pub async fn bootstrap(&mut self) -> Result<BootstrapOutcome, SessionError> {
        self.check(Operation::Bootstrap)?;
        match self.engine.ensure_repository(&mut self.turn).await {
            Ok(outcome) => {
                self.repo_exists = Some(true);
                Ok(outcome)
            }
            Err(e) => {
                if matches!(e, SyncError::RepoMissing) {
                    self.repo_exists = Some(false);
                }
                Err(e.into())
            }
        }
    }

    pub async fn pull(&mut self, force: bool) -> Result<PullOutcome, SessionError> {
        self.check(Operation::Pull)?;
        match self.engine.pull(&mut self.cache, force).await {
            Ok(outcome) => {
                self.repo_exists = Some(true);
                self.remote_document = Some(true);
                if let PullOutcome::Updated {
                    discarded_patches, ..
                } = &outcome
                {
                    for section in discarded_patches {
                        self.gate.revoke(section);
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                match &e {
                    SyncError::RepoMissing => self.repo_exists = Some(false),
                    SyncError::NotFound { .. } => {
                        self.repo_exists = Some(true);
                        self.remote_document = Some(false);
                    }
                    _ => {}
                }
                Err(e.into())
            }
        }
    }

    pub fn draft(&self) -> Result<DraftView, SessionError> {
        let schema_version = self.engine.schema_version();
        let document = self.cache.draft(schema_version)?;
        let validation = self.engine.validator().validate(&document, schema_version);
        Ok(DraftView {
            document,
            validation,
            staged_sections: self.cache.staged().keys().cloned().collect(),
        })
    }

    /// Stages a patch locally. Schema-invalid patches are kept so onboarding
    /// can proceed incrementally; they cannot be pushed until corrected. A
    /// patch that cannot apply to the draft at all, such as deleting a
    /// missing record, is refused and nothing is staged.
    pub fn stage(&mut self, mut patch: SectionPatch) -> Result<StageReport, SessionError> {
        self.check(Operation::Stage)?;
        let schema_version = self.engine.schema_version();
        patch.assign_record_ids();

        let superseded = self.cache.superseded_by(&patch.section);
        let others: BTreeSet<SectionId> = self
            .cache
            .staged()
            .keys()
            .filter(|id| **id != patch.section && !superseded.contains(*id))
            .cloned()
            .collect();
        let base = self.cache.working_copy(&others, schema_version)?;
        let mut merged = base.clone();
        merged.apply(&patch)?;
        let validation = self
            .engine
            .validator()
            .validate_patch(&base, &patch, schema_version);

        let section = patch.section.clone();
        let replaced_previous = self.cache.stage(patch)?.is_some();
        let mut approval_revoked = self.gate.revoke(&section);
        for record in &superseded {
            approval_revoked |= self.gate.revoke(record);
        }
        info!(
            section = %section,
            valid = validation.valid,
            superseded = superseded.len(),
            approval_revoked,
            "Staged patch"
        );
        Ok(StageReport {
            section,
            replaced_previous,
            approval_revoked,
            validation,
        })
    }

    pub fn approve(&mut self, section: SectionId) -> Result<ApprovalRecord, SessionError> {
        self.check(Operation::Approve)?;
        info!(section = %section, "Section approved");
        self.gate.approve(section);
        Ok(self.gate.record())
    }

    pub fn approvals(&self) -> ApprovalRecord {
        self.gate.record()
    }

    pub async fn push(
        &mut self,
        targets: &BTreeSet<SectionId>,
        message: &str,
    ) -> Result<PushReport, SessionError> {
        self.check(Operation::Push)?;
        let approvals = self.gate.record();
        match self
            .engine
            .push(&mut self.cache, targets, &approvals, message)
            .await
        {
            Ok(report) => {
                if report.persisted {
                    self.repo_exists = Some(true);
                    self.remote_document = Some(true);
                    self.last_write_failed = false;
                    self.last_write = LastWrite {
                        persisted: true,
                        fallback_used: false,
                        method: report.method.clone(),
                        retry_count: report.retry_count,
                        verification: report.verification.clone(),
                        at: report.written_at,
                    };
                }
                Ok(report)
            }
            Err(failure) => {
                if failure.is_write_failure() {
                    self.last_write_failed = true;
                    self.last_write = LastWrite {
                        persisted: false,
                        fallback_used: failure.fallback_used(),
                        method: failure.method().map(str::to_string),
                        retry_count: failure.retry_count,
                        verification: None,
                        at: failure.local_checkpoint,
                    };
                }
                Err(failure.into())
            }
        }
    }

    /// Marks onboarding complete once every required section is approved and
    /// saved. The request itself is the approval of the metadata change, which
    /// is pushed straight away.
    pub async fn complete_onboarding(&mut self, message: &str) -> Result<PushReport, SessionError> {
        self.check(Operation::CompleteOnboarding)?;

        let draft = self.cache.draft(self.engine.schema_version())?;
        let unapproved: Vec<SectionId> = SectionKind::ALL
            .into_iter()
            .filter(|kind| !self.section_approved(*kind, &draft))
            .map(SectionId::section)
            .collect();
        if !unapproved.is_empty() {
            return Err(SessionError::OnboardingIncomplete {
                reason: "required sections are not approved".into(),
                sections: unapproved,
            });
        }
        let unsaved: Vec<SectionId> = self.cache.staged().keys().cloned().collect();
        if !unsaved.is_empty() {
            return Err(SessionError::OnboardingIncomplete {
                reason: "staged changes have not been saved".into(),
                sections: unsaved,
            });
        }

        let now = Utc::now().to_rfc3339();
        let mut metadata = draft
            .section(SectionKind::Metadata)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_else(Map::new);
        metadata.insert("onboarding_complete".into(), Value::Bool(true));
        metadata.insert("onboarding_completed_utc".into(), Value::String(now.clone()));
        metadata.insert("last_updated_utc".into(), Value::String(now));

        let section = SectionId::section(SectionKind::Metadata);
        self.stage(SectionPatch {
            section: section.clone(),
            content: Value::Object(metadata),
            provenance: Provenance::UserCorrection,
        })?;
        self.gate.approve(section.clone());
        self.push(&BTreeSet::from([section]), message).await
    }

    /// Collection approval, or for record sections every record approved.
    fn section_approved(&self, kind: SectionKind, draft: &Document) -> bool {
        if self.gate.is_approved(&SectionId::section(kind)) {
            return true;
        }
        if !kind.is_record_addressable() {
            return false;
        }
        let records = draft.records(kind);
        !records.is_empty()
            && records.iter().all(|record| {
                crate::corpus::models::record_id(record)
                    .and_then(|id| SectionId::record(kind, id).ok())
                    .is_some_and(|id| self.gate.is_approved(&id))
            })
    }

    pub fn status(&self) -> StatusSnapshot {
        let inputs = self.inputs();
        let state = PersistenceState::derive(inputs);
        let schema_version = self.engine.schema_version();
        let validated = self
            .cache
            .draft(schema_version)
            .map(|d| self.engine.validator().validate(&d, schema_version).valid)
            .unwrap_or(false);
        let metadata = self.cache.metadata();
        let dirty = self.cache.is_dirty();

        StatusSnapshot {
            state,
            repo_exists: inputs.repo_exists,
            document_exists: inputs.document_exists,
            onboarding_complete: inputs.onboarding_complete,
            validated,
            persisted: inputs.document_exists && !dirty && !self.last_write_failed,
            fallback_used: self.last_write.fallback_used,
            method: self.last_write.method.clone().or_else(|| metadata.method.clone()),
            retry_count: self.last_write.retry_count,
            verification: self.last_write.verification.clone(),
            last_written_timestamp: self.last_write.at.or(metadata.last_pushed),
            dirty,
            staged_sections: self.cache.staged().keys().cloned().collect(),
            approved_sections: self.gate.approved_set().into_iter().collect(),
            branch: metadata.branch.clone(),
            commit_id: metadata.commit_id.as_ref().map(ToString::to_string),
            requires_repair: state.requires_repair(),
            next_step: state.next_step(),
        }
    }
}
