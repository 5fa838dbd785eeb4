use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::render::RenderError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::sync::SyncError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

struct ErrorParts {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ErrorParts {
    fn new(status: StatusCode, code: &'static str, message: String) -> Self {
        Self {
            status,
            code,
            message,
            details: None,
        }
    }

    fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn sync_error_parts(error: &SyncError) -> ErrorParts {
    let message = error.to_string();
    let code = error.code();
    match error {
        SyncError::RemoteUnavailable(reason) => {
            tracing::error!("Remote store unavailable: {reason}");
            ErrorParts::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
        }
        SyncError::RefConflict { .. } => ErrorParts::new(StatusCode::CONFLICT, code, message),
        SyncError::SchemaInvalid { errors } => {
            ErrorParts::new(StatusCode::UNPROCESSABLE_ENTITY, code, message)
                .with_details(json!({ "errors": errors }))
        }
        SyncError::UnapprovedWrite { sections, paths } => {
            ErrorParts::new(StatusCode::FORBIDDEN, code, message)
                .with_details(json!({ "sections": sections, "paths": paths }))
        }
        SyncError::DecodeError { path, .. } => {
            tracing::error!("Undecodable corpus file {path}: {message}");
            ErrorParts::new(StatusCode::BAD_GATEWAY, code, message)
                .with_details(json!({ "path": path }))
        }
        SyncError::VerificationMismatch { path, .. } => {
            tracing::error!("Read-back verification failed: {message}");
            ErrorParts::new(StatusCode::BAD_GATEWAY, code, message)
                .with_details(json!({ "path": path }))
        }
        SyncError::NotFound { .. } | SyncError::RepoMissing => {
            ErrorParts::new(StatusCode::NOT_FOUND, code, message)
        }
        SyncError::NoTargetSections => ErrorParts::new(StatusCode::BAD_REQUEST, code, message),
        SyncError::Patch(_) | SyncError::Layout(_) => {
            ErrorParts::new(StatusCode::UNPROCESSABLE_ENTITY, code, message)
        }
        SyncError::Remote(StoreError::Unauthorized(_)) => {
            tracing::error!("Remote store rejected credentials: {message}");
            ErrorParts::new(StatusCode::BAD_GATEWAY, code, message)
        }
        SyncError::Remote(e) => {
            tracing::error!("Remote store error: {e}");
            ErrorParts::new(StatusCode::BAD_GATEWAY, code, message)
        }
        SyncError::Local(e) => {
            tracing::error!("Local cache error: {e}");
            ErrorParts::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
        }
    }
}

fn session_error_parts(error: &SessionError) -> ErrorParts {
    match error {
        SessionError::NotAllowed { operation, state } => ErrorParts::new(
            StatusCode::CONFLICT,
            "OPERATION_NOT_ALLOWED",
            error.to_string(),
        )
        .with_details(json!({
            "operation": operation,
            "state": state,
            "next_step": state.next_step(),
        })),
        SessionError::OnboardingIncomplete { sections, .. } => ErrorParts::new(
            StatusCode::CONFLICT,
            "ONBOARDING_INCOMPLETE",
            error.to_string(),
        )
        .with_details(json!({ "sections": sections })),
        SessionError::Sync(e) => sync_error_parts(e),
        SessionError::Push(failure) => {
            let mut parts = sync_error_parts(&failure.error);
            let mut details = match parts.details.take() {
                Some(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            details.insert("attempts".into(), json!(failure.attempts));
            details.insert("retry_count".into(), json!(failure.retry_count));
            details.insert("fallback_used".into(), json!(failure.fallback_used()));
            details.insert("method".into(), json!(failure.method()));
            details.insert("user_message".into(), json!(failure.user_message(true)));
            parts.with_details(Value::Object(details))
        }
        SessionError::Cache(e) => {
            tracing::error!("Local cache error: {e}");
            ErrorParts::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "LOCAL_CACHE_ERROR",
                error.to_string(),
            )
        }
        SessionError::Patch(_) => ErrorParts::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "PATCH_INVALID",
            error.to_string(),
        ),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let parts = match &self {
            AppError::Validation(msg) => {
                ErrorParts::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Session(e) => session_error_parts(e),
            AppError::Render(e) => {
                ErrorParts::new(StatusCode::BAD_REQUEST, "RENDER_POLICY_INVALID", e.to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                ErrorParts::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let mut error = json!({
            "code": parts.code,
            "message": parts.message,
        });
        if let (Some(details), Value::Object(map)) = (parts.details, &mut error) {
            map.insert("details".into(), details);
        }

        (parts.status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        AppError::Session(SessionError::Sync(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::state::{Operation, PersistenceState};
    use crate::corpus::validation::PathedError;
    use crate::sync::PushFailure;

    async fn body(error: AppError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_schema_errors_are_listed_in_details() {
        let error: AppError = SyncError::SchemaInvalid {
            errors: vec![PathedError::new("profile.full_name", "is required")],
        }
        .into();
        let (status, body) = body(error).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "SCHEMA_INVALID");
        assert_eq!(
            body["error"]["details"]["errors"][0]["path"],
            "profile.full_name"
        );
    }

    #[tokio::test]
    async fn test_not_allowed_names_state() {
        let error = AppError::Session(SessionError::NotAllowed {
            operation: Operation::Push,
            state: PersistenceState::NoRepo,
        });
        let (status, body) = body(error).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["details"]["state"], "NO_REPO");
    }

    #[tokio::test]
    async fn test_push_failure_carries_retry_details() {
        let mut failure = PushFailure::rejected(SyncError::RefConflict {
            branch: "main".into(),
            reason: "moved".into(),
        });
        failure.attempts = 2;
        failure.retry_count = 1;
        let (status, body) = body(AppError::Session(failure.into())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "REF_CONFLICT");
        assert_eq!(body["error"]["details"]["retry_count"], 1);
        assert_eq!(body["error"]["details"]["fallback_used"], false);
    }

    #[tokio::test]
    async fn test_validation_has_no_details() {
        let (status, body) = body(AppError::Validation("bad section".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].get("details").is_none());
    }
}
