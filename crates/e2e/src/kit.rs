//! The fixtures tests request by name
//!
//! | name                 | depends on                   | value          |
//! |----------------------|------------------------------|----------------|
//! | `javascript_enabled` |                              | `bool`         |
//! | `page`               | (browser)                    | [`SharedPage`] |
//! | `page` (layered)     | `page`, `javascript_enabled` | [`SharedPage`] wrapped in [`ReadyPage`] |
//! | `app`                | `page`                       | [`AppBridge`]  |
//! | `clicknav`           | `page`, `javascript_enabled` | [`ClickNav`]   |
//! | `in_view`            | `page`                       | [`InView`]     |
//! | `read_errors`        |                              | `Arc<ErrorTable>` |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bridge::AppBridge;
use crate::cdp::{CdpBrowser, PageOptions};
use crate::config::HarnessConfig;
use crate::error::E2eResult;
use crate::error_table::ErrorTable;
use crate::fixtures::FixtureRegistry;
use crate::page::SharedPage;
use crate::readiness::{ReadinessPolicy, ReadyPage, START_MARKER_SCRIPT};

pub const PAGE: &str = "page";
pub const JAVASCRIPT_ENABLED: &str = "javascript_enabled";
pub const APP: &str = "app";
pub const CLICKNAV: &str = "clicknav";
pub const IN_VIEW: &str = "in_view";
pub const READ_ERRORS: &str = "read_errors";

/// Default bound on the navigation a `clicknav` click triggers
pub const CLICKNAV_TIMEOUT: Duration = Duration::from_secs(30);

/// Click a link or button and wait for the navigation it causes
#[derive(Clone)]
pub struct ClickNav {
    page: SharedPage,
    javascript_enabled: bool,
}

impl ClickNav {
    pub fn new(page: SharedPage, javascript_enabled: bool) -> Self {
        Self { page, javascript_enabled }
    }

    pub async fn click(&self, selector: &str) -> E2eResult<()> {
        self.click_with_timeout(selector, CLICKNAV_TIMEOUT).await
    }

    /// Without scripts the click is a plain document navigation and there
    /// is no client-side router event to wait for.
    pub async fn click_with_timeout(&self, selector: &str, timeout: Duration) -> E2eResult<()> {
        debug!("clicknav {}", selector);
        if self.javascript_enabled {
            tokio::try_join!(self.page.wait_for_navigation(timeout), self.page.click(selector))?;
            Ok(())
        } else {
            self.page.click(selector).await
        }
    }
}

/// Whether an element is at least partly inside the viewport
#[derive(Clone)]
pub struct InView {
    page: SharedPage,
}

impl InView {
    pub fn new(page: SharedPage) -> Self {
        Self { page }
    }

    pub async fn check(&self, selector: &str) -> E2eResult<bool> {
        let bounds = self.page.bounding_box(selector).await?;
        let viewport = self.page.viewport();
        Ok(bounds.map(|b| b.intersects(viewport)).unwrap_or(false))
    }
}

/// `javascript_enabled` and a raw `page` opened by `open_page`
///
/// The page is closed when the test's scope ends.
pub fn base_fixtures<F, Fut>(javascript_enabled: bool, open_page: F) -> FixtureRegistry
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = E2eResult<SharedPage>> + Send + 'static,
{
    let open_page = Arc::new(open_page);
    FixtureRegistry::new()
        .define_value(JAVASCRIPT_ENABLED, &[], move |_| async move { Ok(javascript_enabled) })
        .define(PAGE, &[], move |_, use_| {
            let open_page = open_page.clone();
            async move {
                let page = (open_page.as_ref())().await?;
                use_.provide(page.clone()).await;
                page.close().await
            }
        })
}

/// Base fixtures backed by a DevTools browser
pub fn browser_fixtures(browser: Arc<CdpBrowser>, options: PageOptions) -> FixtureRegistry {
    let javascript_enabled = options.javascript_enabled;
    base_fixtures(javascript_enabled, move || {
        let browser = browser.clone();
        let options = options.clone();
        async move {
            let page: SharedPage = Arc::new(browser.new_page(options).await?);
            Ok(page)
        }
    })
}

/// The harness layer: instrumented `page` plus the helpers built on it
pub fn kit_layer(policy: ReadinessPolicy, errors: Arc<ErrorTable>) -> FixtureRegistry {
    FixtureRegistry::new()
        .define(PAGE, &[PAGE, JAVASCRIPT_ENABLED], move |deps, use_| {
            let policy = policy.clone();
            async move {
                let inner: SharedPage = deps.get(PAGE)?;
                if deps.get::<bool>(JAVASCRIPT_ENABLED)? {
                    inner.add_init_script(START_MARKER_SCRIPT).await?;
                }
                let page: SharedPage = Arc::new(ReadyPage::new(inner, policy));
                use_.provide(page).await;
                Ok(())
            }
        })
        .define_value(APP, &[PAGE], |deps| async move {
            Ok(AppBridge::new(deps.get(PAGE)?))
        })
        .define_value(CLICKNAV, &[PAGE, JAVASCRIPT_ENABLED], |deps| async move {
            Ok(ClickNav::new(deps.get(PAGE)?, deps.get(JAVASCRIPT_ENABLED)?))
        })
        .define_value(IN_VIEW, &[PAGE], |deps| async move {
            Ok(InView::new(deps.get(PAGE)?))
        })
        .define_value(READ_ERRORS, &[], move |_| {
            let errors = errors.clone();
            async move { Ok(errors) }
        })
}

/// Kit layer for `config`, reading the error table up front
pub fn kit_fixtures(config: &HarnessConfig) -> E2eResult<FixtureRegistry> {
    let errors = Arc::new(ErrorTable::load(&config.error_table)?);
    Ok(kit_layer(config.readiness.clone(), errors))
}
