//! Test runner that drives test cases through per-test fixture scopes

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{HarnessConfig, Project, TracePolicy};
use crate::error::{E2eError, E2eResult};
use crate::fixtures::{FixtureEvent, FixtureRegistry, FixtureScope, FixtureSet};

type TestBody = Arc<dyn Fn(FixtureSet) -> BoxFuture<'static, E2eResult<()>> + Send + Sync>;

/// A single test: the fixtures it needs and its body
#[derive(Clone)]
pub struct TestCase {
    pub name: String,
    pub fixtures: Vec<String>,
    pub only: bool,
    pub skip: bool,
    body: TestBody,
}

impl TestCase {
    pub fn new<F, Fut>(name: &str, fixtures: &[&str], body: F) -> Self
    where
        F: Fn(FixtureSet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = E2eResult<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            fixtures: fixtures.iter().map(|f| f.to_string()).collect(),
            only: false,
            skip: false,
            body: Arc::new(move |set: FixtureSet| body(set).boxed()),
        }
    }

    /// Run this case (and other `only` cases) exclusively
    pub fn only(mut self) -> Self {
        self.only = true;
        self
    }

    pub fn skip(mut self) -> Self {
        self.skip = true;
        self
    }

    fn fixture_names(&self) -> Vec<&str> {
        self.fixtures.iter().map(String::as_str).collect()
    }
}

/// Ordered collection of test cases
#[derive(Clone, Default)]
pub struct TestSuite {
    cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }
}

/// Result of running a single test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub project: String,
    pub success: bool,
    pub skipped: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub traces: Vec<PathBuf>,
}

/// Result of running a suite under one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuiteResult {
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Passed only after a retry
    pub flaky: usize,
    pub duration_ms: u64,
    pub results: Vec<TestResult>,
}

/// Trace of one attempt, written when the trace policy retains it
#[derive(Debug, Clone, Serialize)]
struct AttemptTrace<'a> {
    test: &'a str,
    project: &'a str,
    attempt: u32,
    finished_at: DateTime<Utc>,
    duration_ms: u64,
    error: Option<&'a str>,
    fixtures: &'a [FixtureEvent],
}

struct AttemptOutcome {
    error: Option<E2eError>,
    trace: Vec<FixtureEvent>,
    duration: Duration,
}

/// Configuration for the test runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub retries: u32,
    pub workers: usize,
    pub test_timeout: Duration,
    pub forbid_only: bool,
    pub trace: TracePolicy,
    pub output_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retries: 0,
            workers: 1,
            test_timeout: Duration::from_secs(15),
            forbid_only: false,
            trace: TracePolicy::OnFirstRetry,
            output_dir: PathBuf::from("test-results"),
        }
    }
}

impl From<&HarnessConfig> for RunnerConfig {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            retries: config.retries,
            workers: config.workers.unwrap_or(1).max(1),
            test_timeout: config.test_timeout(),
            forbid_only: config.forbid_only,
            trace: config.trace,
            output_dir: config.output_dir.clone(),
        }
    }
}

/// Main E2E test runner
pub struct TestRunner {
    config: RunnerConfig,
}

impl TestRunner {
    pub fn new() -> Self {
        Self::with_config(RunnerConfig::default())
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Reject suites that cannot run at all
    ///
    /// Unknown fixtures, dependency cycles and (under CI) `only` cases are
    /// reported before any test executes.
    pub fn validate(&self, registry: &FixtureRegistry, suite: &TestSuite) -> E2eResult<()> {
        for case in suite.cases() {
            if case.only && self.config.forbid_only {
                return Err(E2eError::ForbiddenOnly(case.name.clone()));
            }
            registry.plan(&case.fixture_names())?;
        }
        Ok(())
    }

    /// Run every case of `suite` under `project`
    pub async fn run_project(
        &self,
        project: &Project,
        registry: &FixtureRegistry,
        suite: &TestSuite,
    ) -> E2eResult<TestSuiteResult> {
        self.validate(registry, suite)?;

        let started_at = Utc::now();
        let start = Instant::now();
        let focused = suite.cases().iter().any(|c| c.only);

        info!("Running {} test(s) in project {}...", suite.cases().len(), project.name);

        let results: Vec<TestResult> = futures::stream::iter(suite.cases())
            .map(|case| async move {
                if case.skip || (focused && !case.only) {
                    return TestResult {
                        name: case.name.clone(),
                        project: project.name.clone(),
                        success: true,
                        skipped: true,
                        attempts: 0,
                        duration_ms: 0,
                        error: None,
                        traces: Vec::new(),
                    };
                }
                self.run_case(project, registry, case).await
            })
            .buffered(self.config.workers.max(1))
            .collect()
            .await;

        let skipped = results.iter().filter(|r| r.skipped).count();
        let passed = results.iter().filter(|r| r.success && !r.skipped).count();
        let failed = results.iter().filter(|r| !r.success).count();
        let flaky = results.iter().filter(|r| r.success && r.attempts > 1).count();
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Test Results ({}): {} passed, {} failed, {} skipped, {} flaky ({} ms)",
            project.name, passed, failed, skipped, flaky, duration_ms
        );

        Ok(TestSuiteResult {
            project: project.name.clone(),
            started_at,
            total: results.len(),
            passed,
            failed,
            skipped,
            flaky,
            duration_ms,
            results,
        })
    }

    /// Run one case with retries
    pub async fn run_case(&self, project: &Project, registry: &FixtureRegistry, case: &TestCase) -> TestResult {
        let start = Instant::now();
        let mut traces = Vec::new();
        let mut attempt = 0;

        loop {
            let outcome = self.run_attempt(registry, case).await;
            let failed = outcome.error.is_some();

            if self.config.trace.should_retain(attempt, failed) {
                match self.write_trace(project, case, attempt, &outcome) {
                    Ok(path) => traces.push(path),
                    Err(e) => warn!("Failed to write trace for '{}': {}", case.name, e),
                }
            }

            match outcome.error {
                None => {
                    info!("✓ {} [{}] ({} ms)", case.name, project.name, outcome.duration.as_millis());
                    return TestResult {
                        name: case.name.clone(),
                        project: project.name.clone(),
                        success: true,
                        skipped: false,
                        attempts: attempt + 1,
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: None,
                        traces,
                    };
                }
                Some(e) if attempt >= self.config.retries => {
                    error!("✗ {} [{}] - {}", case.name, project.name, e);
                    return TestResult {
                        name: case.name.clone(),
                        project: project.name.clone(),
                        success: false,
                        skipped: false,
                        attempts: attempt + 1,
                        duration_ms: start.elapsed().as_millis() as u64,
                        error: Some(e.to_string()),
                        traces,
                    };
                }
                Some(e) => {
                    warn!("Retrying '{}' after attempt {}: {}", case.name, attempt + 1, e);
                    attempt += 1;
                }
            }
        }
    }

    /// Set up and run under one per-test deadline, always tear down
    async fn run_attempt(&self, registry: &FixtureRegistry, case: &TestCase) -> AttemptOutcome {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.test_timeout;
        let mut scope = FixtureScope::default();

        let setup = tokio::time::timeout_at(deadline, registry.setup_into(&case.fixture_names(), &mut scope)).await;
        let result = match setup {
            Ok(Ok(())) => {
                debug!("Running test body: {}", case.name);
                let body = (case.body)(scope.values());
                match tokio::time::timeout_at(deadline, body).await {
                    Ok(result) => result,
                    Err(_) => Err(self.timed_out(case)),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.timed_out(case)),
        };

        let teardown = scope.teardown().await;

        AttemptOutcome {
            error: result.err().or(teardown.err()),
            trace: scope.trace().to_vec(),
            duration: start.elapsed(),
        }
    }

    fn timed_out(&self, case: &TestCase) -> E2eError {
        E2eError::Timeout(format!(
            "test '{}' exceeded {} ms",
            case.name,
            self.config.test_timeout.as_millis()
        ))
    }

    fn write_trace(
        &self,
        project: &Project,
        case: &TestCase,
        attempt: u32,
        outcome: &AttemptOutcome,
    ) -> E2eResult<PathBuf> {
        let dir = self.config.output_dir.join("traces");
        std::fs::create_dir_all(&dir)?;

        let error = outcome.error.as_ref().map(|e| e.to_string());
        let trace = AttemptTrace {
            test: &case.name,
            project: &project.name,
            attempt,
            finished_at: Utc::now(),
            duration_ms: outcome.duration.as_millis() as u64,
            error: error.as_deref(),
            fixtures: &outcome.trace,
        };

        let path = dir.join(format!(
            "{}-{}-{}.json",
            project.name,
            sanitize(&case.name),
            attempt
        ));
        std::fs::write(&path, serde_json::to_string_pretty(&trace)?)?;
        debug!("Trace written to {}", path.display());
        Ok(path)
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &[TestSuiteResult]) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let path = self.config.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn project() -> Project {
        Project { name: "chromium-build+js".into(), javascript_enabled: true }
    }

    fn runner(tmp: &TempDir, retries: u32) -> TestRunner {
        TestRunner::with_config(RunnerConfig {
            retries,
            test_timeout: Duration::from_millis(200),
            output_dir: tmp.path().to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("goto /a b"), "goto__a_b");
    }

    #[tokio::test]
    async fn test_passing_and_failing_cases() {
        let tmp = TempDir::new().unwrap();
        let registry = FixtureRegistry::new().define_value("n", &[], |_| async { Ok(1u32) });
        let suite = TestSuite::new()
            .case(TestCase::new("passes", &["n"], |f| async move {
                assert_eq!(f.get::<u32>("n")?, 1);
                Ok(())
            }))
            .case(TestCase::new("fails", &[], |_| async {
                Err(E2eError::Evaluation("boom".into()))
            }));

        let result = runner(&tmp, 0).run_project(&project(), &registry, &suite).await.unwrap();
        assert_eq!(result.total, 2);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.results[1].error.as_deref(), Some("Evaluation failed: boom"));
    }

    #[tokio::test]
    async fn test_retry_marks_flaky() {
        let tmp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let suite = TestSuite::new().case(TestCase::new("flaky", &[], move |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(E2eError::Timeout("first try".into()))
                } else {
                    Ok(())
                }
            }
        }));

        let result = runner(&tmp, 2)
            .run_project(&project(), &FixtureRegistry::new(), &suite)
            .await
            .unwrap();
        assert_eq!(result.passed, 1);
        assert_eq!(result.flaky, 1);
        assert_eq!(result.results[0].attempts, 2);
        // OnFirstRetry keeps exactly the second attempt
        assert_eq!(result.results[0].traces.len(), 1);
        assert!(result.results[0].traces[0].exists());
    }

    #[tokio::test]
    async fn test_timeout_fails_and_still_tears_down() {
        let tmp = TempDir::new().unwrap();
        let torn_down = Arc::new(AtomicU32::new(0));
        let flag = torn_down.clone();
        let registry = FixtureRegistry::new().define("res", &[], move |_, use_| {
            let flag = flag.clone();
            async move {
                use_.provide(()).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let suite = TestSuite::new().case(TestCase::new("hangs", &["res"], |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }));

        let result = runner(&tmp, 0).run_project(&project(), &registry, &suite).await.unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.results[0].error.as_deref().unwrap().contains("exceeded 200 ms"));
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fixture_setup_counts_against_timeout() {
        let tmp = TempDir::new().unwrap();
        let torn_down = Arc::new(AtomicU32::new(0));
        let flag = torn_down.clone();
        let registry = FixtureRegistry::new()
            .define("fast", &[], move |_, use_| {
                let flag = flag.clone();
                async move {
                    use_.provide(()).await;
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .define_value("slow", &["fast"], |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            });
        let suite = TestSuite::new().case(TestCase::new("waits on setup", &["slow"], |_| async { Ok(()) }));

        let start = tokio::time::Instant::now();
        let result = runner(&tmp, 0).run_project(&project(), &registry, &suite).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert_eq!(result.failed, 1);
        assert!(result.results[0].error.as_deref().unwrap().contains("exceeded 200 ms"));
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_focuses_and_forbid_only_rejects() {
        let tmp = TempDir::new().unwrap();
        let suite = TestSuite::new()
            .case(TestCase::new("a", &[], |_| async { Ok(()) }))
            .case(TestCase::new("b", &[], |_| async { Ok(()) }).only());

        let result = runner(&tmp, 0)
            .run_project(&project(), &FixtureRegistry::new(), &suite)
            .await
            .unwrap();
        assert_eq!(result.passed, 1);
        assert_eq!(result.skipped, 1);

        let strict = TestRunner::with_config(RunnerConfig { forbid_only: true, ..Default::default() });
        let err = strict
            .run_project(&project(), &FixtureRegistry::new(), &suite)
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::ForbiddenOnly(ref name) if name == "b"));
    }

    #[tokio::test]
    async fn test_unknown_fixture_aborts_before_running() {
        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        let suite = TestSuite::new()
            .case(TestCase::new("first", &[], move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .case(TestCase::new("second", &["nope"], |_| async { Ok(()) }));

        let err = TestRunner::new()
            .run_project(&project(), &FixtureRegistry::new(), &suite)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_write_results() {
        let tmp = TempDir::new().unwrap();
        let runner = runner(&tmp, 0);
        let suite = TestSuite::new().case(TestCase::new("ok", &[], |_| async { Ok(()) }));
        let result = runner
            .run_project(&project(), &FixtureRegistry::new(), &suite)
            .await
            .unwrap();

        let path = runner.write_results(&[result]).unwrap();
        let written: Vec<TestSuiteResult> =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written[0].passed, 1);
    }
}
