//! Ephemeral HTTP servers for tests that need an isolated backend

use axum::handler::Handler;
use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{E2eError, E2eResult};
use crate::port;

/// Default first port tried by [`EphemeralServer::start`]
pub const DEFAULT_START_PORT: u16 = 4000;

/// A server bound to `127.0.0.1` on a freshly allocated port
///
/// Must be closed by the test that started it. Dropping an open server
/// aborts it without waiting, which is only meant for panicking tests.
pub struct EphemeralServer {
    port: u16,
    running: Option<Running>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl EphemeralServer {
    /// Serve every request with `handler`
    pub async fn start<H, T>(handler: H, start_port: u16) -> E2eResult<Self>
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        Self::start_router(Router::new().fallback(handler), start_port).await
    }

    /// Serve a full router
    pub async fn start_router(router: Router, start_port: u16) -> E2eResult<Self> {
        let reservation = port::reserve(start_port)?;
        let port = reservation.port();

        // The reservation is already bound and listening; hand it over as is
        let std_listener = reservation.into_listener();
        std_listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(std_listener)?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        info!("Ephemeral server listening on 127.0.0.1:{}", port);

        Ok(Self {
            port,
            running: Some(Running { shutdown, task }),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().map(|r| !r.task.is_finished()).unwrap_or(false)
    }

    /// Shut down gracefully and wait for the socket to be released
    ///
    /// Fails with the server's own error if it already died, and with
    /// [`E2eError::ServerNotRunning`] when called a second time.
    pub async fn close(&mut self) -> E2eResult<()> {
        let Running { shutdown, task } = self
            .running
            .take()
            .ok_or(E2eError::ServerNotRunning(self.port))?;

        debug!("Closing ephemeral server on port {}", self.port);

        // A dead server has dropped the receiver; the task result carries why
        let _ = shutdown.send(());

        match task.await {
            Ok(Ok(())) => {
                info!("Ephemeral server on port {} closed", self.port);
                Ok(())
            }
            Ok(Err(e)) => Err(E2eError::ServerClosed {
                port: self.port,
                reason: e.to_string(),
            }),
            Err(e) => Err(E2eError::ServerClosed {
                port: self.port,
                reason: e.to_string(),
            }),
        }
    }
}

impl Drop for EphemeralServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}
