use std::collections::BTreeSet;

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::corpus::approval::ApprovalRecord;
use crate::corpus::models::{SectionId, SectionPatch};
use crate::errors::AppError;
use crate::session::{DraftView, StageReport, StatusSnapshot};
use crate::state::AppState;
use crate::sync::{BootstrapOutcome, PullOutcome, PushReport};

const DEFAULT_PUSH_MESSAGE: &str = "Update career corpus";
const ONBOARDING_MESSAGE: &str = "Complete onboarding";

#[derive(Debug, Default, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub sections: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub sections: Vec<String>,
    pub message: Option<String>,
    /// Append branch, commit and reason to the user message.
    #[serde(default)]
    pub details: bool,
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    #[serde(flatten)]
    pub report: PushReport,
    pub user_message: String,
}

fn parse_sections(raw: &[String]) -> Result<BTreeSet<SectionId>, AppError> {
    raw.iter()
        .map(|s| {
            s.parse::<SectionId>()
                .map_err(|e| AppError::Validation(format!("'{s}': {e}")))
        })
        .collect()
}

/// GET /api/v1/corpus/status
pub async fn handle_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.session.lock().await.status())
}

/// POST /api/v1/corpus/bootstrap
///
/// Each request is its own turn, so a missing repository is created at most
/// once per request.
pub async fn handle_bootstrap(
    State(state): State<AppState>,
) -> Result<Json<BootstrapOutcome>, AppError> {
    let mut session = state.session.lock().await;
    session.begin_turn();
    Ok(Json(session.bootstrap().await?))
}

impl PullRequest {
    /// An empty body means a plain pull; anything else must be a valid
    /// request object.
    fn from_body(body: &[u8]) -> Result<Self, AppError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("invalid pull request body: {e}")))
    }
}

/// POST /api/v1/corpus/pull
pub async fn handle_pull(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<PullOutcome>, AppError> {
    let req = PullRequest::from_body(&body)?;
    let outcome = state.session.lock().await.pull(req.force).await?;
    Ok(Json(outcome))
}

/// GET /api/v1/corpus/document
pub async fn handle_get_document(
    State(state): State<AppState>,
) -> Result<Json<DraftView>, AppError> {
    Ok(Json(state.session.lock().await.draft()?))
}

/// POST /api/v1/corpus/patches
pub async fn handle_stage_patch(
    State(state): State<AppState>,
    Json(patch): Json<SectionPatch>,
) -> Result<Json<StageReport>, AppError> {
    Ok(Json(state.session.lock().await.stage(patch)?))
}

/// GET /api/v1/corpus/approvals
pub async fn handle_list_approvals(State(state): State<AppState>) -> Json<ApprovalRecord> {
    Json(state.session.lock().await.approvals())
}

/// POST /api/v1/corpus/approvals
pub async fn handle_approve_many(
    State(state): State<AppState>,
    Json(req): Json<ApproveRequest>,
) -> Result<Json<ApprovalRecord>, AppError> {
    let sections = parse_sections(&req.sections)?;
    if sections.is_empty() {
        return Err(AppError::Validation("no sections given".into()));
    }
    let mut session = state.session.lock().await;
    let mut record = session.approvals();
    for section in sections {
        record = session.approve(section)?;
    }
    Ok(Json(record))
}

/// POST /api/v1/corpus/approvals/*section
pub async fn handle_approve(
    State(state): State<AppState>,
    Path(section): Path<String>,
) -> Result<Json<ApprovalRecord>, AppError> {
    let raw = section.trim_start_matches('/').to_string();
    let section = parse_sections(&[raw])?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::Validation("no section given".into()))?;
    Ok(Json(state.session.lock().await.approve(section)?))
}

/// POST /api/v1/corpus/push
pub async fn handle_push(
    State(state): State<AppState>,
    Json(req): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    let sections = parse_sections(&req.sections)?;
    let message = req.message.as_deref().unwrap_or(DEFAULT_PUSH_MESSAGE);
    let report = state.session.lock().await.push(&sections, message).await?;
    let user_message = report.user_message(req.details);
    Ok(Json(PushResponse {
        report,
        user_message,
    }))
}

/// POST /api/v1/corpus/onboarding/complete
pub async fn handle_complete_onboarding(
    State(state): State<AppState>,
) -> Result<Json<PushResponse>, AppError> {
    let report = state
        .session
        .lock()
        .await
        .complete_onboarding(ONBOARDING_MESSAGE)
        .await?;
    let user_message = report.user_message(false);
    Ok(Json(PushResponse {
        report,
        user_message,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_body_parsing() {
        assert!(!PullRequest::from_body(b"").unwrap().force);
        assert!(!PullRequest::from_body(b" \n").unwrap().force);
        assert!(!PullRequest::from_body(b"{}").unwrap().force);
        assert!(PullRequest::from_body(br#"{"force": true}"#).unwrap().force);
        assert!(matches!(
            PullRequest::from_body(br#"{"force":"#),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            PullRequest::from_body(br#"{"force": "yes"}"#),
            Err(AppError::Validation(_))
        ));
    }
}
