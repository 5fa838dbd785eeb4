use thiserror::Error;

use crate::corpus::cache::CacheError;
use crate::corpus::layout::{DecodeFailure, LayoutError};
use crate::corpus::models::{PatchError, SectionId};
use crate::corpus::validation::PathedError;
use crate::store::{ObjectId, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("branch '{branch}' moved during the write: {reason}")]
    RefConflict { branch: String, reason: String },

    #[error("document failed schema validation with {} error(s)", .errors.len())]
    SchemaInvalid { errors: Vec<PathedError> },

    #[error("write is not approved: {}", describe_unapproved(.sections, .paths))]
    UnapprovedWrite {
        sections: Vec<SectionId>,
        paths: Vec<String>,
    },

    #[error("could not decode {path}: {reason}")]
    DecodeError { path: String, reason: String },

    #[error("read-back of {path} did not match (expected {expected:?}, found {actual:?})")]
    VerificationMismatch {
        path: String,
        expected: Option<ObjectId>,
        actual: Option<ObjectId>,
    },

    #[error("no corpus manifest on branch '{branch}'")]
    NotFound { branch: String },

    #[error("memory repository does not exist")]
    RepoMissing,

    #[error("no target sections given")]
    NoTargetSections,

    #[error("staged patch cannot be applied: {0}")]
    Patch(#[from] PatchError),

    #[error("document cannot be laid out: {0}")]
    Layout(#[from] LayoutError),

    #[error("remote store error: {0}")]
    Remote(StoreError),

    #[error(transparent)]
    Local(#[from] CacheError),
}

fn describe_unapproved(sections: &[SectionId], paths: &[String]) -> String {
    if !sections.is_empty() {
        let ids: Vec<String> = sections.iter().map(ToString::to_string).collect();
        format!("sections [{}] have no approval", ids.join(", "))
    } else {
        format!("paths [{}] are outside the approved sections", paths.join(", "))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(message) => SyncError::RemoteUnavailable(message),
            other => SyncError::Remote(other),
        }
    }
}

impl From<DecodeFailure> for SyncError {
    fn from(e: DecodeFailure) -> Self {
        SyncError::DecodeError {
            path: e.path,
            reason: e.reason,
        }
    }
}

impl SyncError {
    /// Transport failures and lost ref races get one more attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable(_) | SyncError::RefConflict { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::RemoteUnavailable(_) => "REMOTE_UNAVAILABLE",
            SyncError::RefConflict { .. } => "REF_CONFLICT",
            SyncError::SchemaInvalid { .. } => "SCHEMA_INVALID",
            SyncError::UnapprovedWrite { .. } => "UNAPPROVED_WRITE",
            SyncError::DecodeError { .. } => "DECODE_ERROR",
            SyncError::VerificationMismatch { .. } => "VERIFICATION_MISMATCH",
            SyncError::NotFound { .. } => "NOT_FOUND",
            SyncError::RepoMissing => "REPO_MISSING",
            SyncError::NoTargetSections => "NO_TARGET_SECTIONS",
            SyncError::Patch(_) => "PATCH_INVALID",
            SyncError::Layout(_) => "LAYOUT_ERROR",
            SyncError::Remote(_) => "REMOTE_ERROR",
            SyncError::Local(_) => "LOCAL_CACHE_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_and_conflict_retry() {
        assert!(SyncError::RemoteUnavailable("x".into()).is_retryable());
        assert!(SyncError::RefConflict {
            branch: "main".into(),
            reason: "moved".into()
        }
        .is_retryable());
        assert!(!SyncError::SchemaInvalid { errors: vec![] }.is_retryable());
        assert!(!SyncError::VerificationMismatch {
            path: "p".into(),
            expected: None,
            actual: None
        }
        .is_retryable());
    }

    #[test]
    fn test_store_unavailable_maps_to_remote_unavailable() {
        let e: SyncError = StoreError::Unavailable("timeout".into()).into();
        assert_eq!(e.code(), "REMOTE_UNAVAILABLE");
        let e: SyncError = StoreError::Unauthorized("bad token".into()).into();
        assert_eq!(e.code(), "REMOTE_ERROR");
    }

    #[test]
    fn test_unapproved_message_names_sections() {
        let e = SyncError::UnapprovedWrite {
            sections: vec!["certifications".parse().unwrap()],
            paths: vec![],
        };
        assert_eq!(
            e.to_string(),
            "write is not approved: sections [certifications] have no approval"
        );
    }
}
