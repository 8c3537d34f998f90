//! In-memory page used by the integration tests
//!
//! Timing is driven by tokio's clock so tests run with `start_paused`.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use kit_e2e::page::{BoundingBox, Navigation, Viewport};
use kit_e2e::{E2eError, E2eResult, NavigablePage, Page, SharedPage};

pub struct FakePage {
    pub javascript_enabled: bool,
    pub viewport: Viewport,
    /// Load time of every navigation
    pub navigation_delay: Duration,
    /// Marker appears this long after a navigation finishes; `None` = never
    pub marker_after: Option<Duration>,
    /// Dev signal is logged this long after subscribing; `None` = never
    pub console_after: Option<Duration>,
    pub boxes: HashMap<String, BoundingBox>,
    pub evaluate_result: Value,
    calls: Mutex<Vec<String>>,
    loaded_at: Mutex<Option<Instant>>,
}

impl FakePage {
    pub fn new(javascript_enabled: bool) -> Self {
        Self {
            javascript_enabled,
            viewport: Viewport { width: 1280, height: 720 },
            navigation_delay: Duration::from_millis(100),
            marker_after: Some(Duration::from_millis(50)),
            console_after: Some(Duration::from_millis(50)),
            boxes: HashMap::new(),
            evaluate_result: Value::Null,
            calls: Mutex::new(Vec::new()),
            loaded_at: Mutex::new(None),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    async fn navigate(&self, call: String, url: &str) -> E2eResult<Option<Navigation>> {
        self.record(call);
        tokio::time::sleep(self.navigation_delay).await;
        *self.loaded_at.lock() = Some(Instant::now());
        Ok(Some(Navigation { url: url.to_string() }))
    }
}

/// Resolve at `at`, or fail with a timeout if that is past `timeout`
async fn appear(at: Option<Instant>, timeout: Duration, what: &str) -> E2eResult<()> {
    let deadline = Instant::now() + timeout;
    match at {
        Some(at) if at <= deadline => {
            tokio::time::sleep_until(at).await;
            Ok(())
        }
        _ => {
            tokio::time::sleep_until(deadline).await;
            Err(E2eError::Timeout(what.to_string()))
        }
    }
}

pub fn as_page(fake: &Arc<FakePage>) -> SharedPage {
    fake.clone()
}

#[async_trait]
impl NavigablePage for FakePage {
    async fn goto(&self, url: &str) -> E2eResult<Option<Navigation>> {
        self.navigate(format!("goto {}", url), url).await
    }

    async fn go_back(&self) -> E2eResult<Option<Navigation>> {
        self.navigate("go_back".to_string(), "about:back").await
    }

    async fn reload(&self) -> E2eResult<Option<Navigation>> {
        self.navigate("reload".to_string(), "about:reload").await
    }
}

#[async_trait]
impl Page for FakePage {
    fn javascript_enabled(&self) -> bool {
        self.javascript_enabled
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn evaluate(&self, expression: &str) -> E2eResult<Value> {
        self.record(format!("evaluate {}", expression));
        Ok(self.evaluate_result.clone())
    }

    async fn add_init_script(&self, source: &str) -> E2eResult<()> {
        self.record(format!("add_init_script {}", source));
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> E2eResult<()> {
        self.record(format!("wait_for_selector {}", selector));
        let loaded_at = *self.loaded_at.lock();
        let at = match (loaded_at, self.marker_after) {
            (Some(loaded), Some(after)) => Some(loaded + after),
            _ => None,
        };
        appear(at, timeout, selector).await
    }

    async fn wait_for_console(&self, fragment: &str, timeout: Duration) -> E2eResult<()> {
        self.record(format!("wait_for_console {}", fragment));
        let at = self.console_after.map(|after| Instant::now() + after);
        appear(at, timeout, fragment).await
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> E2eResult<()> {
        self.record("wait_for_navigation".to_string());
        appear(Some(Instant::now() + self.navigation_delay), timeout, "navigation").await
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.record(format!("click {}", selector));
        Ok(())
    }

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>> {
        Ok(self.boxes.get(selector).copied())
    }

    async fn close(&self) -> E2eResult<()> {
        self.record("close".to_string());
        Ok(())
    }
}
