//! Client-router control from test code
//!
//! The application under test publishes a fixed set of globals (see
//! [`AppContract`]). Every [`AppBridge`] call serialises its arguments to
//! JSON, evaluates a call to the matching global in the page, and resolves
//! when that call's promise settles. Calls do not check the contract first:
//! a missing global fails inside the page and that failure is returned
//! as is. Use [`AppBridge::verify_contract`] to check up front.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::page::SharedPage;

/// Globals the application must install before tests drive it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Goto,
    Invalidate,
    BeforeNavigate,
    AfterNavigate,
    Prefetch,
    PrefetchRoutes,
}

impl EntryPoint {
    pub fn global(&self) -> &'static str {
        match self {
            EntryPoint::Goto => "goto",
            EntryPoint::Invalidate => "invalidate",
            EntryPoint::BeforeNavigate => "beforeNavigate",
            EntryPoint::AfterNavigate => "afterNavigate",
            EntryPoint::Prefetch => "prefetch",
            EntryPoint::PrefetchRoutes => "prefetchRoutes",
        }
    }
}

/// The full set of entry points
pub struct AppContract;

impl AppContract {
    pub const ENTRY_POINTS: [EntryPoint; 6] = [
        EntryPoint::Goto,
        EntryPoint::Invalidate,
        EntryPoint::BeforeNavigate,
        EntryPoint::AfterNavigate,
        EntryPoint::Prefetch,
        EntryPoint::PrefetchRoutes,
    ];

    /// Expression listing the globals that are not functions
    pub fn missing_entry_points_expression() -> String {
        let names: Vec<&str> = Self::ENTRY_POINTS.iter().map(EntryPoint::global).collect();
        format!(
            "{}.filter((name) => typeof window[name] !== 'function')",
            Value::from(names)
        )
    }
}

/// Options for a client-side `goto`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GotoOptions {
    #[serde(rename = "replaceState", skip_serializing_if = "std::ops::Not::not")]
    pub replace_state: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub noscroll: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub keepfocus: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// Router control bound to one page
#[derive(Clone)]
pub struct AppBridge {
    page: SharedPage,
}

impl AppBridge {
    pub fn new(page: SharedPage) -> Self {
        Self { page }
    }

    /// Fail with every entry point the page does not provide
    pub async fn verify_contract(&self) -> E2eResult<()> {
        let missing = self.page.evaluate(&AppContract::missing_entry_points_expression()).await?;
        let missing: Vec<String> = serde_json::from_value(missing)?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(E2eError::MissingEntryPoints(missing))
        }
    }

    pub async fn goto(&self, url: &str, options: &GotoOptions) -> E2eResult<()> {
        self.call(EntryPoint::Goto, &[Value::from(url), serde_json::to_value(options)?])
            .await
    }

    pub async fn invalidate(&self, url: &str) -> E2eResult<()> {
        self.call(EntryPoint::Invalidate, &[Value::from(url)]).await
    }

    /// Register `predicate`, JavaScript function source, as a navigation guard
    pub async fn before_navigate(&self, predicate: &str) -> E2eResult<()> {
        let expression = format!(
            "(async () => {{ await {}({}); }})()",
            EntryPoint::BeforeNavigate.global(),
            predicate
        );
        self.run(EntryPoint::BeforeNavigate, &expression).await
    }

    /// Register a no-op after-navigation callback
    pub async fn after_navigate(&self) -> E2eResult<()> {
        let expression = format!(
            "(async () => {{ await {}(() => {{}}); }})()",
            EntryPoint::AfterNavigate.global()
        );
        self.run(EntryPoint::AfterNavigate, &expression).await
    }

    pub async fn prefetch(&self, url: &str) -> E2eResult<()> {
        self.call(EntryPoint::Prefetch, &[Value::from(url)]).await
    }

    pub async fn prefetch_routes(&self, urls: &[&str]) -> E2eResult<()> {
        self.call(EntryPoint::PrefetchRoutes, &[Value::from(urls.to_vec())])
            .await
    }

    async fn call(&self, entry: EntryPoint, args: &[Value]) -> E2eResult<()> {
        self.run(entry, &call_expression(entry, args)).await
    }

    async fn run(&self, entry: EntryPoint, expression: &str) -> E2eResult<()> {
        debug!("app.{}", entry.global());
        self.page.evaluate(expression).await.map(|_| ())
    }
}

/// `(async () => { await name(arg0, arg1); })()` with JSON-encoded args
pub fn call_expression(entry: EntryPoint, args: &[Value]) -> String {
    let args: Vec<String> = args.iter().map(Value::to_string).collect();
    format!(
        "(async () => {{ await {}({}); }})()",
        entry.global(),
        args.join(", ")
    )
}
