//! Navigation readiness
//!
//! Client-side hydration finishes some time after the browser reports a
//! navigation complete. [`ReadyPage`] decorates a page so that `goto`,
//! `go_back` and `reload` only resolve once the application has signalled
//! that it started:
//!
//! - the start marker selector (`body.started`) matches, and
//! - against a dev server, for anything but `go_back`, the dev client has
//!   logged its reconnect message. A history pop restores in-memory state
//!   and does not always reconnect, so it is never awaited there.
//!
//! With script execution disabled the wrapper is a pure passthrough.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::page::{BoundingBox, NavigablePage, Navigation, Page, SharedPage, Viewport};

pub const START_MARKER: &str = "body.started";
pub const DEV_CONNECTED_SIGNAL: &str = "[vite] connected.";
pub const DEFAULT_READINESS_TIMEOUT_MS: u64 = 5_000;

/// Outer bound on listening for the dev signal; the readiness timeout
/// itself starts when the navigation resolves
const SIGNAL_LISTEN_LIMIT: Duration = Duration::from_secs(300);

/// Init script that sets the start marker on the application's start event
pub const START_MARKER_SCRIPT: &str =
    "addEventListener('sveltekit:start', () => { document.body.classList.add('started'); });";

/// Which server the application under test runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Live development server with a reconnecting client
    Dev,
    /// Built application behind a preview server
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationKind {
    Goto,
    Back,
    Reload,
}

impl NavigationKind {
    fn as_str(&self) -> &'static str {
        match self {
            NavigationKind::Goto => "goto",
            NavigationKind::Back => "go_back",
            NavigationKind::Reload => "reload",
        }
    }
}

/// What "the application has started" means
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    /// Selector that matches once the application started
    pub marker: String,

    /// Console fragment logged by the dev client on (re)connect
    pub dev_signal: Option<String>,

    /// Bound for each wait
    pub timeout_ms: u64,
}

impl ReadinessPolicy {
    pub fn for_mode(mode: ServerMode) -> Self {
        Self {
            marker: START_MARKER.to_string(),
            dev_signal: match mode {
                ServerMode::Dev => Some(DEV_CONNECTED_SIGNAL.to_string()),
                ServerMode::Build => None,
            },
            timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The console fragment to await for `kind`, if any
    pub fn dev_signal_for(&self, kind: NavigationKind) -> Option<&str> {
        match kind {
            NavigationKind::Back => None,
            NavigationKind::Goto | NavigationKind::Reload => self.dev_signal.as_deref(),
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::for_mode(ServerMode::Build)
    }
}

/// A page whose navigations wait for the application to start
pub struct ReadyPage {
    inner: SharedPage,
    policy: ReadinessPolicy,
}

impl ReadyPage {
    pub fn new(inner: SharedPage, policy: ReadinessPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Run `navigation` joined with the readiness condition for `kind`
    ///
    /// The dev signal is subscribed to alongside the navigation so a
    /// reconnect logged during load is not missed. Both waits are bounded
    /// by the readiness timeout counted from when the navigation resolved,
    /// and the marker is checked against the document it produced.
    async fn settle<F>(&self, kind: NavigationKind, navigation: F) -> E2eResult<Option<Navigation>>
    where
        F: Future<Output = E2eResult<Option<Navigation>>> + Send,
    {
        if !self.inner.javascript_enabled() {
            return navigation.await;
        }

        let timeout = self.policy.timeout();
        let (loaded_tx, loaded_rx) = oneshot::channel::<Instant>();

        let signal = async {
            let Some(fragment) = self.policy.dev_signal_for(kind) else {
                return Ok(());
            };
            debug!("{}: waiting for console '{}'", kind.as_str(), fragment);
            let mut console = self.inner.wait_for_console(fragment, SIGNAL_LISTEN_LIMIT);

            let loaded_at = tokio::select! {
                seen = &mut console => return seen,
                loaded_at = loaded_rx => loaded_at,
            };
            match loaded_at {
                Ok(at) => tokio::time::timeout_at(at + timeout, console)
                    .await
                    .unwrap_or_else(|_| Err(E2eError::Timeout(fragment.to_string()))),
                // The navigation failed and its error ends the join
                Err(_) => Ok(()),
            }
        };

        let started = async {
            let result = navigation.await?;
            // The signal may already have arrived and stopped listening
            let _ = loaded_tx.send(Instant::now());
            debug!("{}: waiting for '{}'", kind.as_str(), self.policy.marker);
            self.inner.wait_for_selector(&self.policy.marker, timeout).await?;
            Ok::<_, E2eError>(result)
        };

        let ((), result) = tokio::try_join!(signal, started)?;
        Ok(result)
    }
}

#[async_trait]
impl NavigablePage for ReadyPage {
    async fn goto(&self, url: &str) -> E2eResult<Option<Navigation>> {
        self.settle(NavigationKind::Goto, self.inner.goto(url)).await
    }

    async fn go_back(&self) -> E2eResult<Option<Navigation>> {
        self.settle(NavigationKind::Back, self.inner.go_back()).await
    }

    async fn reload(&self) -> E2eResult<Option<Navigation>> {
        self.settle(NavigationKind::Reload, self.inner.reload()).await
    }
}

#[async_trait]
impl Page for ReadyPage {
    fn javascript_enabled(&self) -> bool {
        self.inner.javascript_enabled()
    }

    fn viewport(&self) -> Viewport {
        self.inner.viewport()
    }

    async fn evaluate(&self, expression: &str) -> E2eResult<serde_json::Value> {
        self.inner.evaluate(expression).await
    }

    async fn add_init_script(&self, source: &str) -> E2eResult<()> {
        self.inner.add_init_script(source).await
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> E2eResult<()> {
        self.inner.wait_for_selector(selector, timeout).await
    }

    async fn wait_for_console(&self, fragment: &str, timeout: Duration) -> E2eResult<()> {
        self.inner.wait_for_console(fragment, timeout).await
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> E2eResult<()> {
        self.inner.wait_for_navigation(timeout).await
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.inner.click(selector).await
    }

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>> {
        self.inner.bounding_box(selector).await
    }

    async fn close(&self) -> E2eResult<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mode_has_no_dev_signal() {
        let policy = ReadinessPolicy::for_mode(ServerMode::Build);
        assert_eq!(policy.marker, "body.started");
        assert_eq!(policy.dev_signal_for(NavigationKind::Goto), None);
        assert_eq!(policy.dev_signal_for(NavigationKind::Reload), None);
        assert_eq!(policy.timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_dev_mode_skips_signal_on_back() {
        let policy = ReadinessPolicy::for_mode(ServerMode::Dev);
        assert_eq!(policy.dev_signal_for(NavigationKind::Goto), Some("[vite] connected."));
        assert_eq!(policy.dev_signal_for(NavigationKind::Reload), Some("[vite] connected."));
        assert_eq!(policy.dev_signal_for(NavigationKind::Back), None);
    }
}
