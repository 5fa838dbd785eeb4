use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::error::SyncError;
use crate::corpus::models::SectionId;
use crate::store::{ObjectId, RepoInfo};

/// Method label for a durable split-file write.
pub const METHOD_SPLIT: &str = "git_data_split";
/// Method label for the local-only draft save after a failed push.
pub const METHOD_LOCAL_CHECKPOINT: &str = "local_checkpoint";

const MSG_SAVED: &str = "Saved to memory.";
const MSG_NOTHING: &str = "No memory changes to save.";
const MSG_FAILED: &str = "Couldn't save to memory.";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PullOutcome {
    Unchanged {
        commit_id: ObjectId,
    },
    Updated {
        commit_id: ObjectId,
        files: usize,
        /// Staged patches dropped because the synced document was replaced.
        discarded_patches: Vec<SectionId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub verified: bool,
    pub commit_id: ObjectId,
    pub checked_paths: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushReport {
    pub persisted: bool,
    pub nothing_to_do: bool,
    pub branch: Option<String>,
    pub commit_id: Option<ObjectId>,
    pub sections: Vec<SectionId>,
    pub changed_paths: Vec<String>,
    pub deleted_paths: Vec<String>,
    pub attempts: u32,
    pub retry_count: u32,
    pub verification: Option<Verification>,
    pub method: Option<String>,
    pub refresh_required: bool,
    pub written_at: Option<DateTime<Utc>>,
}

impl PushReport {
    pub(crate) fn nothing_to_do(sections: Vec<SectionId>) -> Self {
        Self {
            persisted: false,
            nothing_to_do: true,
            branch: None,
            commit_id: None,
            sections,
            changed_paths: Vec::new(),
            deleted_paths: Vec::new(),
            attempts: 0,
            retry_count: 0,
            verification: None,
            method: None,
            refresh_required: false,
            written_at: None,
        }
    }

    pub fn user_message(&self, details: bool) -> String {
        let headline = if self.persisted { MSG_SAVED } else { MSG_NOTHING };
        if !details || !self.persisted {
            return headline.to_string();
        }
        format!(
            "{headline} (branch: {}, commit: {}, retries: {})",
            self.branch.as_deref().unwrap_or("-"),
            self.commit_id.as_ref().map(ObjectId::as_str).unwrap_or("-"),
            self.retry_count
        )
    }
}

/// A push that did not persist.
///
/// `attempts == 0` means the write was rejected before touching the store.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct PushFailure {
    #[source]
    pub error: SyncError,
    pub attempts: u32,
    pub retry_count: u32,
    /// When the staged draft was last saved locally, if the cache is on disk.
    pub local_checkpoint: Option<DateTime<Utc>>,
}

impl PushFailure {
    pub(crate) fn rejected(error: impl Into<SyncError>) -> Self {
        Self {
            error: error.into(),
            attempts: 0,
            retry_count: 0,
            local_checkpoint: None,
        }
    }

    /// The store was contacted and the write did not land.
    pub fn is_write_failure(&self) -> bool {
        self.attempts > 0
    }

    pub fn fallback_used(&self) -> bool {
        self.is_write_failure() && self.local_checkpoint.is_some()
    }

    pub fn method(&self) -> Option<&'static str> {
        self.fallback_used().then_some(METHOD_LOCAL_CHECKPOINT)
    }

    pub fn user_message(&self, details: bool) -> String {
        if !details {
            return MSG_FAILED.to_string();
        }
        let mut message = format!("{MSG_FAILED} Reason: {}", self.error);
        if self.fallback_used() {
            message.push_str(" Your draft is kept locally.");
        }
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapOutcome {
    pub repo: RepoInfo,
    pub created: bool,
}
