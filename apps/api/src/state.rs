use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::render::Renderer;
use crate::session::CorpusSession;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// One writer at a time per document; every corpus handler holds the lock
    /// for the whole operation.
    pub session: Arc<Mutex<CorpusSession>>,
    pub renderer: Arc<dyn Renderer>,
    pub config: Config,
}
