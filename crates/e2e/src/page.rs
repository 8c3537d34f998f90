//! Browser page abstraction
//!
//! [`NavigablePage`] is the narrow capability the readiness wrapper
//! decorates; [`Page`] is everything fixtures and tests drive a tab with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::E2eResult;

/// Page handle as shared between fixtures
pub type SharedPage = Arc<dyn Page>;

/// Viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// Element box relative to the viewport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Whether any vertical part of the box lies inside the viewport
    pub fn intersects(&self, viewport: Viewport) -> bool {
        self.y < f64::from(viewport.height) && self.y + self.height > 0.0
    }
}

/// Result of a navigation that produced a new history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Navigation {
    pub url: String,
}

/// The three navigation-triggering operations
#[async_trait]
pub trait NavigablePage: Send + Sync {
    /// Navigate to `url`, resolving once the document has loaded
    async fn goto(&self, url: &str) -> E2eResult<Option<Navigation>>;

    /// Go one entry back in history; `None` when there is nowhere to go
    async fn go_back(&self) -> E2eResult<Option<Navigation>>;

    /// Reload the current document
    async fn reload(&self) -> E2eResult<Option<Navigation>>;
}

/// A remote-controllable browser tab
#[async_trait]
pub trait Page: NavigablePage {
    fn javascript_enabled(&self) -> bool;

    fn viewport(&self) -> Viewport;

    /// Evaluate an expression in the page, awaiting promises
    ///
    /// Exceptions thrown in the page surface verbatim as
    /// [`E2eError::Evaluation`](crate::error::E2eError::Evaluation).
    async fn evaluate(&self, expression: &str) -> E2eResult<serde_json::Value>;

    /// Run `source` in every document before its own scripts
    async fn add_init_script(&self, source: &str) -> E2eResult<()>;

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> E2eResult<()>;

    /// Wait for a console message whose text contains `fragment`
    async fn wait_for_console(&self, fragment: &str, timeout: Duration) -> E2eResult<()>;

    /// Wait for the main frame to navigate, including same-document changes
    async fn wait_for_navigation(&self, timeout: Duration) -> E2eResult<()>;

    async fn click(&self, selector: &str) -> E2eResult<()>;

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>>;

    async fn close(&self) -> E2eResult<()>;
}
