// Text-to-page layout used to enforce page limits on generated resumes.
// Layout is CPU-bound; handlers run it inside tokio::task::spawn_blocking.

pub mod handlers;
pub mod metrics;
pub mod paginate;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use metrics::Font;
pub use paginate::MarkdownRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderPolicy {
    pub max_pages: u32,
}

impl Default for RenderPolicy {
    fn default() -> Self {
        Self { max_pages: 1 }
    }
}

/// One positioned element. Coordinates are points measured from the top-left
/// corner of the page; `y` is the baseline for text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacedItem {
    Text {
        x: f32,
        y: f32,
        font: Font,
        size: f32,
        text: String,
    },
    Bullet {
        x: f32,
        y: f32,
        size: f32,
    },
    Rule {
        x: f32,
        y: f32,
        width: f32,
        thickness: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub number: u32,
    pub items: Vec<PlacedItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedDocument {
    pub page_width: f32,
    pub page_height: f32,
    pub pages: Vec<Page>,
}

impl RenderedDocument {
    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RenderOutcome {
    Rendered(RenderedDocument),
    ExceedsPageLimit { page_count: u32, max_pages: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("max_pages must be at least 1")]
    InvalidPolicy,
}

/// Lays out text and checks it against a page-limit policy.
pub trait Renderer: Send + Sync {
    fn render(&self, text: &str, policy: RenderPolicy) -> Result<RenderOutcome, RenderError>;
}
