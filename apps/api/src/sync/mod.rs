pub mod engine;
pub mod error;
pub mod reports;

pub use engine::{SyncEngine, TurnState, MAX_PUSH_ATTEMPTS};
pub use error::SyncError;
pub use reports::{BootstrapOutcome, PullOutcome, PushFailure, PushReport, Verification};
