//! Error types for the E2E harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("invalid test browser specified: KIT_E2E_BROWSER={value}. Allowed values: {}", allowed.join(", "))]
    InvalidBrowser { value: String, allowed: Vec<&'static str> },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read error table {path}: {reason}")]
    ErrorTable { path: String, reason: String },

    #[error("No free port found in {start}..={end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Server health check failed after {0} attempts")]
    ServerHealthCheck(usize),

    #[error("Server on port {0} is not running")]
    ServerNotRunning(u16),

    #[error("Server on port {port} failed: {reason}")]
    ServerClosed { port: u16, reason: String },

    #[error("Browser failed to launch: {0}")]
    BrowserLaunch(String),

    #[error("DevTools protocol error in {method}: {message}")]
    Protocol { method: String, message: String },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Application is missing entry points: {}", .0.join(", "))]
    MissingEntryPoints(Vec<String>),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Unknown fixture '{name}' requested by '{requested_by}'")]
    UnknownFixture { name: String, requested_by: String },

    #[error("Fixture dependency cycle: {}", .0.join(" -> "))]
    FixtureCycle(Vec<String>),

    #[error("Fixture '{0}' finished without providing a value")]
    FixtureNotProvided(String),

    #[error("Fixture '{0}' has a different type than requested")]
    FixtureType(String),

    #[error("Fixture '{name}' failed: {reason}")]
    FixtureFailed { name: String, reason: String },

    #[error("Test '{0}' is marked only, which is forbidden in CI")]
    ForbiddenOnly(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl E2eError {
    /// Errors that abort the run before any test executes.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            E2eError::InvalidBrowser { .. }
                | E2eError::Config(_)
                | E2eError::ErrorTable { .. }
                | E2eError::UnknownFixture { .. }
                | E2eError::FixtureCycle(_)
                | E2eError::ForbiddenOnly(_)
        )
    }
}

pub type E2eResult<T> = Result<T, E2eError>;
