pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::corpus::handlers;
use crate::render::handlers::handle_render;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Corpus sync
        .route("/api/v1/corpus/status", get(handlers::handle_status))
        .route("/api/v1/corpus/bootstrap", post(handlers::handle_bootstrap))
        .route("/api/v1/corpus/pull", post(handlers::handle_pull))
        .route("/api/v1/corpus/document", get(handlers::handle_get_document))
        .route("/api/v1/corpus/patches", post(handlers::handle_stage_patch))
        .route(
            "/api/v1/corpus/approvals",
            get(handlers::handle_list_approvals).post(handlers::handle_approve_many),
        )
        .route(
            "/api/v1/corpus/approvals/*section",
            post(handlers::handle_approve),
        )
        .route("/api/v1/corpus/push", post(handlers::handle_push))
        .route(
            "/api/v1/corpus/onboarding/complete",
            post(handlers::handle_complete_onboarding),
        )
        // Rendering
        .route("/api/v1/render", post(handle_render))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use crate::config::{Config, StoreBackend};
    use crate::corpus::cache::LocalCache;
    use crate::corpus::fixtures::valid_document;
    use crate::corpus::models::SectionKind;
    use crate::corpus::validation::CorpusSchemaValidator;
    use crate::render::MarkdownRenderer;
    use crate::session::CorpusSession;
    use crate::store::memory::InMemoryStore;
    use crate::store::ContentAddressedStore;
    use crate::sync::SyncEngine;

    fn app() -> Router {
        let engine = SyncEngine::new(
            ContentAddressedStore::new(Arc::new(InMemoryStore::named("mem"))),
            Arc::new(CorpusSchemaValidator::new()),
            "1.0.0",
        );
        let config = Config {
            store_backend: StoreBackend::Memory,
            github_token: None,
            github_owner: None,
            github_api_url: "http://localhost".into(),
            memory_repo: "mem".into(),
            cache_dir: PathBuf::from(".unused"),
            schema_version: "1.0.0".into(),
            max_pages: 1,
            port: 0,
            rust_log: "info".into(),
        };
        build_router(AppState {
            session: Arc::new(Mutex::new(CorpusSession::new(
                engine,
                LocalCache::in_memory(),
            ))),
            renderer: Arc::new(MarkdownRenderer::new()),
            config,
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let raw = body.map(|b| b.to_string()).unwrap_or_default();
        call_raw(app, method, uri, raw).await
    }

    async fn call_raw(app: &Router, method: &str, uri: &str, raw: String) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(raw))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_push_refused_without_repository() {
        let app = app();
        let (status, body) = call(&app, "GET", "/api/v1/corpus/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "NO_REPO");

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/corpus/push",
            Some(json!({"sections": ["profile"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "OPERATION_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn test_onboarding_over_http() {
        let app = app();
        let (status, body) = call(&app, "POST", "/api/v1/corpus/bootstrap", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["created"], true);

        let (status, body) = call(&app, "POST", "/api/v1/corpus/pull", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let doc = valid_document();
        let mut sections = Vec::new();
        for kind in SectionKind::ALL {
            let (status, body) = call(
                &app,
                "POST",
                "/api/v1/corpus/patches",
                Some(json!({
                    "section": kind.as_str(),
                    "content": doc.section(kind).cloned().unwrap(),
                    "provenance": "chat_confirmed",
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["validation"]["valid"], true);
            sections.push(kind.as_str());
        }

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/corpus/push",
            Some(json!({"sections": sections})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/corpus/approvals",
            Some(json!({"sections": sections})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/corpus/push",
            Some(json!({"sections": sections, "message": "onboarding"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["persisted"], true);
        assert_eq!(body["user_message"], "Saved to memory.");

        let (status, _) = call(&app, "POST", "/api/v1/corpus/onboarding/complete", None).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", "/api/v1/corpus/status", None).await;
        assert_eq!(body["state"], "READY");
        assert_eq!(body["persisted"], true);
    }

    #[tokio::test]
    async fn test_malformed_pull_body_is_rejected() {
        let app = app();
        call(&app, "POST", "/api/v1/corpus/bootstrap", None).await;

        let (status, body) =
            call_raw(&app, "POST", "/api/v1/corpus/pull", r#"{"force":"#.into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, body) = call_raw(&app, "POST", "/api/v1/corpus/pull", String::new()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");

        let (status, _) = call(
            &app,
            "POST",
            "/api/v1/corpus/pull",
            Some(json!({"force": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_approve_record_section_by_path() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/corpus/approvals/experience/exp_1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["experience/exp_1"]["approved"], true);

        let (status, _) = call(&app, "POST", "/api/v1/corpus/approvals/hobbies", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_render_reports_page_overflow() {
        let text = "- bullet\n".repeat(200);
        let (status, body) = call(
            &app(),
            "POST",
            "/api/v1/render",
            Some(json!({"text": text})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "exceeds_page_limit");
        assert_eq!(body["max_pages"], 1);
    }
}
