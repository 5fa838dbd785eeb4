mod config;
mod corpus;
mod errors;
mod render;
mod routes;
mod session;
mod state;
mod store;
mod sync;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, StoreBackend};
use crate::corpus::cache::LocalCache;
use crate::corpus::validation::CorpusSchemaValidator;
use crate::render::MarkdownRenderer;
use crate::routes::build_router;
use crate::session::CorpusSession;
use crate::state::AppState;
use crate::store::github::GithubStore;
use crate::store::memory::InMemoryStore;
use crate::store::{ContentAddressedStore, ObjectStore};
use crate::sync::SyncEngine;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting corpus API v{}", env!("CARGO_PKG_VERSION"));

    let backend = build_store(&config)?;
    let cache = LocalCache::open(&config.cache_dir)
        .with_context(|| format!("opening cache at {}", config.cache_dir.display()))?;
    if cache.is_dirty() {
        warn!(
            staged = cache.staged().len(),
            "Restored staged changes from a previous session"
        );
    }
    info!(cache_dir = %config.cache_dir.display(), "Local cache loaded");

    let engine = SyncEngine::new(
        ContentAddressedStore::new(backend),
        Arc::new(CorpusSchemaValidator::new()),
        config.schema_version.clone(),
    );

    let state = AppState {
        session: Arc::new(Mutex::new(CorpusSession::new(engine, cache))),
        renderer: Arc::new(MarkdownRenderer::new()),
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_store(config: &Config) -> Result<Arc<dyn ObjectStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!(repo = %config.memory_repo, "Using in-memory store");
            Ok(Arc::new(InMemoryStore::named(&config.memory_repo)))
        }
        StoreBackend::Github => {
            let token = config
                .github_token
                .clone()
                .context("GITHUB_TOKEN is required for the github backend")?;
            let owner = config
                .github_owner
                .clone()
                .context("GITHUB_OWNER is required for the github backend")?;
            info!(owner = %owner, repo = %config.memory_repo, "Using GitHub store");
            let store = GithubStore::new(
                &config.github_api_url,
                token,
                owner,
                config.memory_repo.clone(),
            )?;
            Ok(Arc::new(store))
        }
    }
}
