//! Kit E2E Test Harness
//!
//! This crate provides the harness that end-to-end tests of a web
//! application framework run on:
//! - Resolves run configuration (browser, dev/build mode, CI policy) from the environment
//! - Hands out free local ports and runs throwaway HTTP servers on them
//! - Wraps browser pages so every navigation waits until the app has started
//! - Exposes the app's client-router entry points and the fixtures tests request by name
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    E2E Harness (Rust)                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HarnessConfig::from_env() -> projects()                    │
//! │  WebServer::spawn(config) -> base_url                       │
//! │  CdpBrowser::launch() -> new_page() -> CdpPage              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FixtureRegistry (layered, per test)                        │
//! │    ├── javascript_enabled                                   │
//! │    ├── page      (raw page)                                 │
//! │    ├── page      (ReadyPage over the raw page)              │
//! │    ├── app       (AppBridge: goto, invalidate, prefetch...) │
//! │    ├── clicknav / in_view                                   │
//! │    └── read_errors (ErrorTable)                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TestRunner                                                 │
//! │    ├── run_project(project, registry, suite)                │
//! │    ├── timeout + retries + trace retention                  │
//! │    └── write_results() -> test-results.json                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  EphemeralServer::start(handler) / port::reserve(start)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bridge;
pub mod cdp;
pub mod config;
pub mod error;
pub mod error_table;
pub mod fixtures;
pub mod kit;
pub mod page;
pub mod port;
pub mod readiness;
pub mod runner;
pub mod server;
pub mod webserver;

pub use bridge::{AppBridge, AppContract, EntryPoint, GotoOptions};
pub use config::{BrowserName, DeviceProfile, HarnessConfig, Project, TracePolicy};
pub use error::{E2eError, E2eResult};
pub use error_table::ErrorTable;
pub use fixtures::{FixtureRegistry, FixtureScope, FixtureSet, Use};
pub use page::{NavigablePage, Page, SharedPage};
pub use port::{reserve, PortReservation};
pub use readiness::{ReadinessPolicy, ReadyPage, ServerMode};
pub use runner::{TestCase, TestRunner, TestSuite};
pub use server::EphemeralServer;
pub use webserver::{WebServer, WebServerConfig};
