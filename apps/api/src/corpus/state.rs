use serde::{Deserialize, Serialize};

/// Top-level persistence state, derived from facts and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceState {
    NoRepo,
    RepoNoDocument,
    Partial,
    Ready,
    Invalid,
    PersistFailed,
}

/// Observed facts the state is a function of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateInputs {
    pub repo_exists: bool,
    pub document_exists: bool,
    /// The synced (persisted) document passes schema validation.
    pub schema_valid: bool,
    /// The synced document records completed onboarding.
    pub onboarding_complete: bool,
    /// The most recent push failed after its retry.
    pub last_write_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Status,
    Bootstrap,
    Pull,
    Stage,
    Approve,
    Push,
    CompleteOnboarding,
}

impl PersistenceState {
    pub fn derive(inputs: StateInputs) -> Self {
        if !inputs.repo_exists {
            PersistenceState::NoRepo
        } else if inputs.last_write_failed {
            PersistenceState::PersistFailed
        } else if !inputs.document_exists {
            PersistenceState::RepoNoDocument
        } else if !inputs.schema_valid {
            PersistenceState::Invalid
        } else if inputs.onboarding_complete {
            PersistenceState::Ready
        } else {
            PersistenceState::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceState::NoRepo => "NO_REPO",
            PersistenceState::RepoNoDocument => "REPO_NO_DOCUMENT",
            PersistenceState::Partial => "PARTIAL",
            PersistenceState::Ready => "READY",
            PersistenceState::Invalid => "INVALID",
            PersistenceState::PersistFailed => "PERSIST_FAILED",
        }
    }

    /// Drafting and reads are always legal; remote writes need a repository,
    /// and completing onboarding needs a document to complete.
    pub fn allows(&self, operation: Operation) -> bool {
        match operation {
            Operation::Status
            | Operation::Bootstrap
            | Operation::Pull
            | Operation::Stage
            | Operation::Approve => true,
            Operation::Push => *self != PersistenceState::NoRepo,
            Operation::CompleteOnboarding => !matches!(
                self,
                PersistenceState::NoRepo | PersistenceState::RepoNoDocument
            ),
        }
    }

    /// States that hand over to the onboarding / repair workflow.
    pub fn requires_repair(&self) -> bool {
        matches!(
            self,
            PersistenceState::RepoNoDocument | PersistenceState::Invalid
        )
    }

    pub fn next_step(&self) -> &'static str {
        match self {
            PersistenceState::NoRepo => "create the memory repository",
            PersistenceState::RepoNoDocument => "start onboarding to create the corpus",
            PersistenceState::Partial => "approve and save the remaining sections",
            PersistenceState::Ready => "none",
            PersistenceState::Invalid => "repair the stored corpus",
            PersistenceState::PersistFailed => "retry the save",
        }
    }
}
