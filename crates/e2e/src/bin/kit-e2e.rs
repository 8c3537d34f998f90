//! Kit E2E - command line entry point
//!
//! Prints the resolved configuration or runs a smoke pass: start the web
//! server, launch the browser and load each path through the instrumented
//! page under every project.

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use kit_e2e::cdp::{CdpBrowser, LaunchOptions, PageOptions};
use kit_e2e::kit::{self, PAGE};
use kit_e2e::runner::RunnerConfig;
use kit_e2e::{HarnessConfig, NavigablePage, SharedPage, TestCase, TestRunner, TestSuite, WebServer};

/// Kit E2E - end-to-end harness for the app under test
#[derive(Parser)]
#[command(name = "kit-e2e")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "KIT_E2E_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration resolved from the environment
    Config,

    /// Load each path in every project and report the results
    Smoke {
        /// Paths to visit, relative to the server's base URL
        #[arg(default_value = "/")]
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    let config = HarnessConfig::from_env()?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Smoke { paths } => {
            let failed = smoke(&config, &paths).await?;
            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn smoke(config: &HarnessConfig, paths: &[String]) -> anyhow::Result<usize> {
    let mut server = WebServer::spawn(config.web_server.clone()).await?;
    let browser = Arc::new(CdpBrowser::launch(LaunchOptions::detect()?, &config.device).await?);
    let runner = TestRunner::with_config(RunnerConfig::from(config));

    let suite = paths.iter().fold(TestSuite::new(), |suite, path| {
        let path = path.clone();
        suite.case(TestCase::new(&format!("visit {}", path), &[PAGE], move |fixtures| {
            let path = path.clone();
            async move {
                let page: SharedPage = fixtures.get(PAGE)?;
                page.goto(&path).await?;
                Ok(())
            }
        }))
    });

    let mut results = Vec::new();
    for project in config.projects() {
        let options = PageOptions {
            device: config.device.clone(),
            javascript_enabled: project.javascript_enabled,
            base_url: Some(server.base_url().to_string()),
        };
        let registry = kit::browser_fixtures(browser.clone(), options).extend(kit::kit_fixtures(config)?);
        results.push(runner.run_project(&project, &registry, &suite).await?);
    }

    runner.write_results(&results)?;
    server.stop()?;

    let failed = results.iter().map(|r| r.failed).sum();
    info!("Smoke run finished with {} failure(s)", failed);
    Ok(failed)
}
