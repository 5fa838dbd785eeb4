use axum::{extract::State, Json};
use serde::Deserialize;
use tracing::info;

use crate::errors::AppError;
use crate::render::{RenderOutcome, RenderPolicy};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub text: String,
    /// Defaults to the configured page limit.
    pub max_pages: Option<u32>,
}

/// POST /api/v1/render
pub async fn handle_render(
    State(state): State<AppState>,
    Json(req): Json<RenderRequest>,
) -> Result<Json<RenderOutcome>, AppError> {
    let policy = RenderPolicy {
        max_pages: req.max_pages.unwrap_or(state.config.max_pages),
    };
    let renderer = state.renderer.clone();
    let outcome = tokio::task::spawn_blocking(move || renderer.render(&req.text, policy))
        .await
        .map_err(|e| AppError::Internal(e.into()))??;

    if let RenderOutcome::ExceedsPageLimit { page_count, max_pages } = &outcome {
        info!(page_count, max_pages, "Rendered text exceeds page limit");
    }
    Ok(Json(outcome))
}
