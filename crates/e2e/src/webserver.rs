//! Web server process management - spawning the application under test

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};
use crate::readiness::ServerMode;

/// Handle to a running application server process
pub struct WebServer {
    child: Child,
    pub base_url: String,
    pub port: u16,
}

impl WebServer {
    /// Spawn the server command and wait until its port serves HTTP
    pub async fn spawn(config: WebServerConfig) -> E2eResult<Self> {
        let port = config.port;
        let base_url = format!("http://localhost:{}", port);

        info!("Starting web server: {} (port {})", config.command, port);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&config.command)
            .current_dir(&config.cwd)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // Own process group so `npm run build && npm run preview` dies as a whole
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| {
            E2eError::ServerStartup(format!("Failed to spawn `{}`: {}", config.command, e))
        })?;

        let mut server = WebServer {
            child,
            base_url: base_url.clone(),
            port,
        };

        server.wait_for_listening(config.startup_timeout()).await?;

        info!("Web server is up at {}", base_url);
        Ok(server)
    }

    /// Poll until the port answers HTTP or the process exits
    async fn wait_for_listening(&mut self, timeout_duration: Duration) -> E2eResult<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = Instant::now();
        let mut attempts = 0;

        while start.elapsed() < timeout_duration {
            attempts += 1;

            if let Some(status) = self.child.try_wait()? {
                return Err(E2eError::ServerStartup(format!(
                    "web server exited before binding port {}: {}",
                    self.port, status
                )));
            }

            match client.get(&self.base_url).send().await {
                // Any response means the port is bound and serving
                Ok(_) => return Ok(()),
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for web server to bind port {}...", self.port);
                    }
                    if !e.is_connect() {
                        warn!("Web server health check error: {}", e);
                    }
                }
            }

            sleep(Duration::from_millis(250)).await;
        }

        Err(E2eError::ServerHealthCheck(attempts))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop the server and its children
    pub fn stop(&mut self) -> E2eResult<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }

        info!("Stopping web server (pid: {})", self.child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(self.child.id() as i32);
            if killpg(pgid, Signal::SIGTERM).is_ok() {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if self.child.try_wait()?.is_some() {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }

        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop web server: {}", e);
        }
    }
}

/// How to launch the application under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebServerConfig {
    /// Shell command that serves the application
    pub command: String,

    /// Port the command binds
    pub port: u16,

    /// Working directory for the command
    pub cwd: PathBuf,

    /// Timeout for the port to come up
    pub startup_timeout_ms: u64,
}

impl WebServerConfig {
    pub fn for_mode(mode: ServerMode) -> Self {
        let command = match mode {
            ServerMode::Dev => "npm run dev",
            ServerMode::Build => "npm run build && npm run preview",
        };
        Self {
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl Default for WebServerConfig {
    fn default() -> Self {
        Self {
            command: "npm run build && npm run preview".to_string(),
            port: 3000,
            cwd: PathBuf::from("."),
            startup_timeout_ms: 120_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port;

    #[test]
    fn test_mode_commands() {
        assert_eq!(WebServerConfig::for_mode(ServerMode::Dev).command, "npm run dev");
        let build = WebServerConfig::for_mode(ServerMode::Build);
        assert_eq!(build.command, "npm run build && npm run preview");
        assert_eq!(build.port, 3000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_command_fails_fast() {
        let config = WebServerConfig {
            command: "exit 3".to_string(),
            port: port::reserve(24_000).unwrap().release(),
            startup_timeout_ms: 10_000,
            ..Default::default()
        };

        let started = Instant::now();
        let err = WebServer::spawn(config).await.err().unwrap();
        assert!(matches!(err, E2eError::ServerStartup(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_command_times_out() {
        let config = WebServerConfig {
            command: "sleep 30".to_string(),
            port: port::reserve(24_100).unwrap().release(),
            startup_timeout_ms: 600,
            ..Default::default()
        };

        let err = WebServer::spawn(config).await.err().unwrap();
        assert!(matches!(err, E2eError::ServerHealthCheck(_)), "{err}");
    }
}
