//! Harness configuration resolved from the process environment

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::page::Viewport;
use crate::readiness::{ReadinessPolicy, ServerMode};
use crate::webserver::WebServerConfig;

/// Browser selected through `KIT_E2E_BROWSER`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserName {
    #[default]
    Chromium,
    Firefox,
    Safari,
}

impl BrowserName {
    pub const ALL: [BrowserName; 3] = [BrowserName::Chromium, BrowserName::Firefox, BrowserName::Safari];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserName::Chromium => "chromium",
            BrowserName::Firefox => "firefox",
            BrowserName::Safari => "safari",
        }
    }

    pub fn allowed() -> Vec<&'static str> {
        Self::ALL.iter().map(BrowserName::as_str).collect()
    }

    /// Parse a browser name, failing with the allowed set on unknown input
    pub fn parse(value: &str) -> E2eResult<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.as_str() == value)
            .ok_or_else(|| E2eError::InvalidBrowser {
                value: value.to_string(),
                allowed: Self::allowed(),
            })
    }

    pub fn device(&self) -> DeviceProfile {
        match self {
            BrowserName::Chromium => DeviceProfile {
                name: "Desktop Chrome".to_string(),
                engine: BrowserEngine::Chromium,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                             (KHTML, like Gecko) Chrome/120.0.6099.28 Safari/537.36"
                    .to_string(),
                viewport: Viewport { width: 1280, height: 720 },
                device_scale_factor: 1.0,
                is_mobile: false,
                has_touch: false,
            },
            BrowserName::Firefox => DeviceProfile {
                name: "Desktop Firefox".to_string(),
                engine: BrowserEngine::Firefox,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) \
                             Gecko/20100101 Firefox/120.0"
                    .to_string(),
                viewport: Viewport { width: 1280, height: 720 },
                device_scale_factor: 1.0,
                is_mobile: false,
                has_touch: false,
            },
            BrowserName::Safari => DeviceProfile {
                name: "Desktop Safari".to_string(),
                engine: BrowserEngine::Webkit,
                user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                             (KHTML, like Gecko) Version/17.0 Safari/605.1.15"
                    .to_string(),
                viewport: Viewport { width: 1280, height: 720 },
                device_scale_factor: 2.0,
                is_mobile: false,
                has_touch: false,
            },
        }
    }
}

impl std::fmt::Display for BrowserName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserEngine {
    Chromium,
    Firefox,
    Webkit,
}

/// Emulated device a page is opened with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub engine: BrowserEngine,
    pub user_agent: String,
    pub viewport: Viewport,
    pub device_scale_factor: f64,
    pub is_mobile: bool,
    pub has_touch: bool,
}

/// When per-attempt traces are kept on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TracePolicy {
    /// Keep traces of every failed attempt
    RetainOnFailure,
    /// Keep the trace of the first retry only
    OnFirstRetry,
}

impl TracePolicy {
    /// `attempt` is zero-based; attempt 1 is the first retry.
    pub fn should_retain(&self, attempt: u32, failed: bool) -> bool {
        match self {
            TracePolicy::RetainOnFailure => failed,
            TracePolicy::OnFirstRetry => attempt == 1,
        }
    }
}

/// One browser configuration the suite is run under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub javascript_enabled: bool,
}

/// Complete harness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Running under CI
    pub ci: bool,

    pub browser: BrowserName,

    pub device: DeviceProfile,

    pub mode: ServerMode,

    pub trace: TracePolicy,

    /// Retries per failed test
    pub retries: u32,

    /// Parallel workers (None = runner default)
    pub workers: Option<usize>,

    /// Refuse tests marked `only`
    pub forbid_only: bool,

    /// Per-test execution timeout in milliseconds
    pub test_timeout_ms: u64,

    pub web_server: WebServerConfig,

    pub readiness: ReadinessPolicy,

    /// Expected error payloads keyed by test path
    pub error_table: PathBuf,

    /// Output directory for results and traces
    pub output_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let mode = ServerMode::Build;
        Self {
            ci: false,
            browser: BrowserName::Chromium,
            device: BrowserName::Chromium.device(),
            mode,
            trace: TracePolicy::OnFirstRetry,
            retries: 0,
            workers: None,
            forbid_only: false,
            test_timeout_ms: 15_000,
            web_server: WebServerConfig::for_mode(mode),
            readiness: ReadinessPolicy::for_mode(mode),
            error_table: PathBuf::from("test/errors.json"),
            output_dir: PathBuf::from("test-results"),
        }
    }
}

impl HarnessConfig {
    /// Resolve configuration from the process environment
    pub fn from_env() -> E2eResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> E2eResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|v| !v.is_empty()).unwrap_or(false);

        let ci = flag("CI");
        let browser = match lookup("KIT_E2E_BROWSER") {
            Some(value) => BrowserName::parse(&value)?,
            None => BrowserName::Chromium,
        };
        let mode = if flag("DEV") { ServerMode::Dev } else { ServerMode::Build };
        let trace = if flag("KIT_E2E_TRACE") {
            TracePolicy::RetainOnFailure
        } else {
            TracePolicy::OnFirstRetry
        };

        Ok(Self {
            ci,
            browser,
            device: browser.device(),
            mode,
            trace,
            retries: if ci { 2 } else { 0 },
            workers: if ci { Some(2) } else { None },
            forbid_only: ci,
            test_timeout_ms: if ci { 45_000 } else { 15_000 },
            web_server: WebServerConfig::for_mode(mode),
            readiness: ReadinessPolicy::for_mode(mode),
            ..Default::default()
        })
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    /// The script-enabled and script-disabled projects
    pub fn projects(&self) -> Vec<Project> {
        let mode = match self.mode {
            ServerMode::Dev => "dev",
            ServerMode::Build => "build",
        };
        [true, false]
            .into_iter()
            .map(|javascript_enabled| Project {
                name: format!(
                    "{}-{}{}js",
                    self.browser,
                    mode,
                    if javascript_enabled { "+" } else { "-" }
                ),
                javascript_enabled,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test_case("chromium", BrowserEngine::Chromium, "Desktop Chrome")]
    #[test_case("firefox", BrowserEngine::Firefox, "Desktop Firefox")]
    #[test_case("safari", BrowserEngine::Webkit, "Desktop Safari")]
    fn test_known_browsers_map_to_devices(name: &str, engine: BrowserEngine, device: &str) {
        let browser = BrowserName::parse(name).unwrap();
        let profile = browser.device();
        assert_eq!(profile.engine, engine);
        assert_eq!(profile.name, device);
    }

    #[test_case("chrome")]
    #[test_case("")]
    #[test_case("Chromium")]
    fn test_unknown_browser_is_rejected(name: &str) {
        let err = BrowserName::parse(name).unwrap_err();
        match &err {
            E2eError::InvalidBrowser { value, allowed } => {
                assert_eq!(value, name);
                assert_eq!(allowed, &vec!["chromium", "firefox", "safari"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_configuration());
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = HarnessConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.ci);
        assert_eq!(config.browser, BrowserName::Chromium);
        assert_eq!(config.mode, ServerMode::Build);
        assert_eq!(config.trace, TracePolicy::OnFirstRetry);
        assert_eq!(config.retries, 0);
        assert_eq!(config.workers, None);
        assert_eq!(config.test_timeout(), Duration::from_secs(15));
        assert_eq!(config.web_server.command, "npm run build && npm run preview");
    }

    #[test]
    fn test_ci_dev_and_trace() {
        let config = HarnessConfig::from_lookup(lookup(&[
            ("CI", "true"),
            ("DEV", "1"),
            ("KIT_E2E_TRACE", "1"),
            ("KIT_E2E_BROWSER", "firefox"),
        ]))
        .unwrap();
        assert!(config.forbid_only);
        assert_eq!(config.retries, 2);
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.test_timeout(), Duration::from_secs(45));
        assert_eq!(config.mode, ServerMode::Dev);
        assert_eq!(config.web_server.command, "npm run dev");
        assert!(config.readiness.dev_signal.is_some());
        assert_eq!(config.trace, TracePolicy::RetainOnFailure);
        assert_eq!(config.device.engine, BrowserEngine::Firefox);
    }

    #[test]
    fn test_empty_flag_is_unset() {
        let config = HarnessConfig::from_lookup(lookup(&[("CI", ""), ("DEV", "")])).unwrap();
        assert!(!config.ci);
        assert_eq!(config.mode, ServerMode::Build);
    }

    #[test]
    fn test_invalid_browser_fails_config() {
        let err = HarnessConfig::from_lookup(lookup(&[("KIT_E2E_BROWSER", "edge")])).unwrap_err();
        assert!(err.to_string().contains("Allowed values: chromium, firefox, safari"));
    }

    #[test]
    fn test_projects_cover_both_script_modes() {
        let config = HarnessConfig::from_lookup(lookup(&[("DEV", "1")])).unwrap();
        let projects = config.projects();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].name, "chromium-dev+js");
        assert!(projects[0].javascript_enabled);
        assert_eq!(projects[1].name, "chromium-dev-js");
        assert!(!projects[1].javascript_enabled);
    }

    #[test]
    fn test_trace_policy() {
        assert!(TracePolicy::RetainOnFailure.should_retain(0, true));
        assert!(!TracePolicy::RetainOnFailure.should_retain(0, false));
        assert!(TracePolicy::OnFirstRetry.should_retain(1, false));
        assert!(!TracePolicy::OnFirstRetry.should_retain(0, true));
        assert!(!TracePolicy::OnFirstRetry.should_retain(2, true));
    }
}
