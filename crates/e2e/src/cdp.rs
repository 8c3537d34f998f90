//! Chrome DevTools Protocol page driver
//!
//! Launches a Chromium-family browser with remote debugging enabled and
//! drives one WebSocket connection per page target. Command responses are
//! correlated by id; protocol events are fanned out on a broadcast channel
//! so waits can subscribe before the action that triggers them.

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::{BrowserEngine, DeviceProfile};
use crate::error::{E2eError, E2eResult};
use crate::page::{BoundingBox, NavigablePage, Navigation, Page, Viewport};

/// Bound on a single protocol command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on a document load after navigate/reload/back
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `click` waits for its target to exist
const CLICK_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const EXECUTABLE_CANDIDATES: [&str; 4] =
    ["chromium", "chromium-browser", "google-chrome", "google-chrome-stable"];

/// How to start the browser process
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub executable: PathBuf,
    pub headless: bool,
    pub extra_args: Vec<String>,
    pub startup_timeout: Duration,
}

impl LaunchOptions {
    /// Use the first Chromium-family executable found on `PATH`
    pub fn detect() -> E2eResult<Self> {
        let path = std::env::var_os("PATH").unwrap_or_default();
        let executable = std::env::split_paths(&path)
            .flat_map(|dir| EXECUTABLE_CANDIDATES.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                E2eError::BrowserLaunch(format!(
                    "no browser executable found on PATH (tried {})",
                    EXECUTABLE_CANDIDATES.join(", ")
                ))
            })?;

        Ok(Self {
            executable,
            ..Default::default()
        })
    }
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("chromium"),
            headless: true,
            extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(15),
        }
    }
}

/// Per-page settings
#[derive(Debug, Clone)]
pub struct PageOptions {
    pub device: DeviceProfile,
    pub javascript_enabled: bool,
    /// Base for relative `goto` URLs
    pub base_url: Option<String>,
}

/// A protocol event
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// One WebSocket session with a page target
pub struct CdpConnection {
    sink: tokio::sync::Mutex<WsSink>,
    pending: Pending,
    events: broadcast::Sender<CdpEvent>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> E2eResult<Self> {
        let (stream, _) = connect_async(ws_url).await?;
        let (sink, mut source) = stream.split();

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(1024);

        let reader = {
            let pending = pending.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(msg) = source.next().await {
                    match msg {
                        Ok(WsMessage::Text(text)) => {
                            trace!("CDP <- {}", text.chars().take(200).collect::<String>());
                            let Ok(json) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            if let Some(id) = json.get("id").and_then(Value::as_u64) {
                                let sender = pending.lock().remove(&id);
                                if let Some(sender) = sender {
                                    let _ = sender.send(json);
                                }
                            } else if let Some(method) = json.get("method").and_then(Value::as_str) {
                                let _ = events.send(CdpEvent {
                                    method: method.to_string(),
                                    params: json.get("params").cloned().unwrap_or(Value::Null),
                                });
                            }
                        }
                        Ok(WsMessage::Close(_)) => {
                            debug!("CDP connection closed");
                            break;
                        }
                        Err(e) => {
                            debug!("CDP connection error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                // Fail every in-flight command instead of letting it time out
                pending.lock().clear();
            })
        };

        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            pending,
            events,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    /// Subscribe to events; only events after this call are seen
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Send a command and return its `result`
    pub async fn send(&self, method: &str, params: Value) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let command = json!({ "id": id, "method": method, "params": params });
        trace!("CDP -> {}", command);

        if let Err(e) = self.sink.lock().await.send(WsMessage::Text(command.to_string())).await {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }

        let response = match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(E2eError::Protocol {
                    method: method.to_string(),
                    message: "connection closed".to_string(),
                })
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(E2eError::Timeout(format!("response to {}", method)));
            }
        };

        if let Some(error) = response.get("error") {
            return Err(E2eError::Protocol {
                method: method.to_string(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn close(&self) -> E2eResult<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<CdpEvent>,
    timeout: Duration,
    what: &str,
    predicate: F,
) -> E2eResult<CdpEvent>
where
    F: Fn(&CdpEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) if predicate(&event) => return Ok(event),
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                warn!("Dropped {} protocol events while waiting for {}", skipped, what);
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(E2eError::Protocol {
                    method: what.to_string(),
                    message: "connection closed".to_string(),
                })
            }
            Err(_) => return Err(E2eError::Timeout(what.to_string())),
        }
    }
}

/// Text of a `Runtime.consoleAPICalled` event, arguments joined by spaces
pub fn console_text(params: &Value) -> String {
    params
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .map(|arg| match arg.get("value") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => arg
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Viewport-relative box from a `DOM.getBoxModel` border quad
pub fn quad_to_box(quad: &[f64]) -> Option<BoundingBox> {
    if quad.len() != 8 {
        return None;
    }
    let xs = [quad[0], quad[2], quad[4], quad[6]];
    let ys = [quad[1], quad[3], quad[5], quad[7]];
    let min = |v: &[f64; 4]| v.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = |v: &[f64; 4]| v.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    Some(BoundingBox {
        x: min(&xs),
        y: min(&ys),
        width: max(&xs) - min(&xs),
        height: max(&ys) - min(&ys),
    })
}

/// Debugging port the browser wrote to `<profile>/DevToolsActivePort`
///
/// The first line is the port, the second the browser target path. A
/// missing or half-written file reads as `None`.
pub fn devtools_active_port(profile_dir: &Path) -> Option<u16> {
    let contents = std::fs::read_to_string(profile_dir.join("DevToolsActivePort")).ok()?;
    let mut lines = contents.lines();
    let port = lines.next()?.trim().parse().ok()?;
    // Written in one go; without the second line the write is still in flight
    lines.next()?;
    Some(port)
}

/// Whether `event` ends a navigation started by navigate, reload or back
///
/// A page restored from the back-forward cache fires neither a load event
/// nor a same-document navigation, only a restore-typed `frameNavigated`.
pub fn is_navigation_settled(event: &CdpEvent) -> bool {
    match event.method.as_str() {
        "Page.loadEventFired" | "Page.navigatedWithinDocument" => true,
        "Page.frameNavigated" => {
            event.params.get("type").and_then(Value::as_str) == Some("BackForwardCacheRestore")
        }
        _ => false,
    }
}

/// A running browser process with remote debugging enabled
pub struct CdpBrowser {
    child: Child,
    endpoint: String,
    http: reqwest::Client,
    // Removed when the browser is dropped
    profile_dir: tempfile::TempDir,
}

impl CdpBrowser {
    /// Launch a browser able to host pages for `device`
    pub async fn launch(options: LaunchOptions, device: &DeviceProfile) -> E2eResult<Self> {
        if device.engine != BrowserEngine::Chromium {
            return Err(E2eError::Config(format!(
                "device '{}' needs a {:?} browser; the DevTools driver only drives Chromium",
                device.name, device.engine
            )));
        }

        let profile_dir = tempfile::tempdir()?;

        // Port 0: the browser binds its own port and reports it in the profile dir
        let mut cmd = Command::new(&options.executable);
        cmd.arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", profile_dir.path().display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-back-forward-cache")
            .arg("--disable-sync");
        if options.headless {
            cmd.arg("--headless=new").arg("--disable-gpu");
        }
        cmd.args(&options.extra_args)
            .arg("about:blank")
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            E2eError::BrowserLaunch(format!("{}: {}", options.executable.display(), e))
        })?;

        let mut browser = Self {
            child,
            endpoint: String::new(),
            http: reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?,
            profile_dir,
        };

        browser.wait_for_endpoint(options.startup_timeout).await?;
        info!("Browser ready on {}", browser.endpoint);
        Ok(browser)
    }

    async fn wait_for_endpoint(&mut self, timeout: Duration) -> E2eResult<()> {
        let start = Instant::now();
        let mut last_error = String::from("DevToolsActivePort not written");

        while start.elapsed() < timeout {
            if let Some(status) = self.child.try_wait()? {
                return Err(E2eError::BrowserLaunch(format!("browser exited: {}", status)));
            }

            if let Some(port) = devtools_active_port(self.profile_dir.path()) {
                let endpoint = format!("http://127.0.0.1:{}", port);
                match self.http.get(format!("{}/json/version", endpoint)).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        self.endpoint = endpoint;
                        return Ok(());
                    }
                    Ok(resp) => last_error = format!("HTTP {}", resp.status()),
                    Err(e) => last_error = e.to_string(),
                }
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Err(E2eError::BrowserLaunch(format!(
            "DevTools endpoint not ready after {:?}: {}",
            timeout, last_error
        )))
    }

    /// Open a new tab configured by `options`
    pub async fn new_page(&self, options: PageOptions) -> E2eResult<CdpPage> {
        let target: Value = self
            .http
            .put(format!("{}/json/new?about:blank", self.endpoint))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let target_id = target
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| E2eError::BrowserLaunch("target without id".to_string()))?
            .to_string();
        let ws_url = target
            .get("webSocketDebuggerUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| E2eError::BrowserLaunch("target without webSocketDebuggerUrl".to_string()))?;

        debug!("Connecting to page target {}", target_id);
        let conn = CdpConnection::connect(ws_url).await?;

        conn.send("Page.enable", json!({})).await?;
        conn.send("Runtime.enable", json!({})).await?;
        conn.send("DOM.enable", json!({})).await?;

        let device = &options.device;
        conn.send(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": device.viewport.width,
                "height": device.viewport.height,
                "deviceScaleFactor": device.device_scale_factor,
                "mobile": device.is_mobile,
            }),
        )
        .await?;
        conn.send("Emulation.setUserAgentOverride", json!({ "userAgent": device.user_agent }))
            .await?;
        if device.has_touch {
            conn.send("Emulation.setTouchEmulationEnabled", json!({ "enabled": true }))
                .await?;
        }
        if !options.javascript_enabled {
            conn.send("Emulation.setScriptExecutionDisabled", json!({ "value": true }))
                .await?;
        }

        let base_url = options.base_url.as_deref().map(Url::parse).transpose()?;

        Ok(CdpPage {
            conn,
            target_id,
            endpoint: self.endpoint.clone(),
            http: self.http.clone(),
            base_url,
            viewport: device.viewport,
            javascript_enabled: options.javascript_enabled,
        })
    }

    pub fn close(&mut self) -> E2eResult<()> {
        if self.child.try_wait()?.is_none() {
            info!("Closing browser (pid: {})", self.child.id());
            self.child.kill()?;
            self.child.wait()?;
        }
        Ok(())
    }
}

impl Drop for CdpBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close browser: {}", e);
        }
    }
}

/// One browser tab driven over the DevTools protocol
pub struct CdpPage {
    conn: CdpConnection,
    target_id: String,
    endpoint: String,
    http: reqwest::Client,
    base_url: Option<Url>,
    viewport: Viewport,
    javascript_enabled: bool,
}

impl CdpPage {
    pub fn connection(&self) -> &CdpConnection {
        &self.conn
    }

    fn resolve(&self, url: &str) -> E2eResult<String> {
        match &self.base_url {
            Some(base) => Ok(base.join(url)?.to_string()),
            None => Ok(Url::parse(url)?.to_string()),
        }
    }

    async fn history(&self) -> E2eResult<(usize, Vec<Value>)> {
        let history = self.conn.send("Page.getNavigationHistory", json!({})).await?;
        let index = history.get("currentIndex").and_then(Value::as_u64).unwrap_or(0) as usize;
        let entries = history
            .get("entries")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok((index, entries))
    }

    async fn current_url(&self) -> E2eResult<String> {
        let (index, entries) = self.history().await?;
        Ok(entries
            .get(index)
            .and_then(|e| e.get("url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Node id of the first match, through the DOM domain so it works with
    /// script execution disabled
    async fn query(&self, selector: &str) -> E2eResult<Option<i64>> {
        let document = self.conn.send("DOM.getDocument", json!({ "depth": 0 })).await?;
        let root = document
            .get("root")
            .and_then(|r| r.get("nodeId"))
            .and_then(Value::as_i64)
            .ok_or_else(|| E2eError::Protocol {
                method: "DOM.getDocument".to_string(),
                message: "missing root node".to_string(),
            })?;
        let found = self
            .conn
            .send("DOM.querySelector", json!({ "nodeId": root, "selector": selector }))
            .await?;
        Ok(found
            .get("nodeId")
            .and_then(Value::as_i64)
            .filter(|id| *id != 0))
    }

    async fn box_of(&self, node_id: i64) -> Option<BoundingBox> {
        let model = self
            .conn
            .send("DOM.getBoxModel", json!({ "nodeId": node_id }))
            .await
            .ok()?;
        let quad: Vec<f64> = model
            .get("model")
            .and_then(|m| m.get("border"))
            .and_then(Value::as_array)?
            .iter()
            .filter_map(Value::as_f64)
            .collect();
        quad_to_box(&quad)
    }

    async fn wait_for_load(&self, mut rx: broadcast::Receiver<CdpEvent>, what: &str) -> E2eResult<()> {
        wait_for_event(&mut rx, NAVIGATION_TIMEOUT, what, is_navigation_settled)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl NavigablePage for CdpPage {
    async fn goto(&self, url: &str) -> E2eResult<Option<Navigation>> {
        let url = self.resolve(url)?;
        let rx = self.conn.subscribe();

        let result = self.conn.send("Page.navigate", json!({ "url": url })).await?;
        if let Some(reason) = result.get("errorText").and_then(Value::as_str) {
            if !reason.is_empty() {
                return Err(E2eError::Navigation { url, reason: reason.to_string() });
            }
        }

        // No loader means a same-document navigation; there is no load event
        if result.get("loaderId").is_some() {
            self.wait_for_load(rx, &format!("load of {}", url)).await?;
        }

        debug!("Navigated to {}", url);
        Ok(Some(Navigation { url }))
    }

    async fn go_back(&self) -> E2eResult<Option<Navigation>> {
        let (index, entries) = self.history().await?;
        if index == 0 {
            return Ok(None);
        }
        let Some(entry) = entries.get(index - 1) else {
            return Ok(None);
        };
        let entry_id = entry.get("id").cloned().unwrap_or(Value::Null);
        let url = entry.get("url").and_then(Value::as_str).unwrap_or_default().to_string();

        let rx = self.conn.subscribe();
        self.conn
            .send("Page.navigateToHistoryEntry", json!({ "entryId": entry_id }))
            .await?;
        self.wait_for_load(rx, "history back").await?;

        debug!("Went back to {}", url);
        Ok(Some(Navigation { url }))
    }

    async fn reload(&self) -> E2eResult<Option<Navigation>> {
        let rx = self.conn.subscribe();
        self.conn.send("Page.reload", json!({})).await?;
        self.wait_for_load(rx, "reload").await?;

        let url = self.current_url().await?;
        debug!("Reloaded {}", url);
        Ok(Some(Navigation { url }))
    }
}

#[async_trait]
impl Page for CdpPage {
    fn javascript_enabled(&self) -> bool {
        self.javascript_enabled
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    async fn evaluate(&self, expression: &str) -> E2eResult<Value> {
        let result = self
            .conn
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let message = details
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| details.get("text").and_then(Value::as_str))
                .unwrap_or("uncaught exception");
            return Err(E2eError::Evaluation(message.to_string()));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn add_init_script(&self, source: &str) -> E2eResult<()> {
        self.conn
            .send("Page.addScriptToEvaluateOnNewDocument", json!({ "source": source }))
            .await?;
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> E2eResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            // Lookups fail while a document is being replaced; keep polling
            match self.query(selector).await {
                Ok(Some(_)) => return Ok(()),
                Ok(None) => {}
                Err(e) => trace!("Selector query failed: {}", e),
            }
            if Instant::now() >= deadline {
                return Err(E2eError::Timeout(format!("selector '{}'", selector)));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_console(&self, fragment: &str, timeout: Duration) -> E2eResult<()> {
        let mut rx = self.conn.subscribe();
        wait_for_event(&mut rx, timeout, &format!("console '{}'", fragment), |event| {
            event.method == "Runtime.consoleAPICalled" && console_text(&event.params).contains(fragment)
        })
        .await
        .map(|_| ())
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> E2eResult<()> {
        let mut rx = self.conn.subscribe();
        wait_for_event(&mut rx, timeout, "navigation", |event| match event.method.as_str() {
            "Page.navigatedWithinDocument" => true,
            "Page.frameNavigated" => event
                .params
                .get("frame")
                .map(|frame| frame.get("parentId").is_none())
                .unwrap_or(false),
            _ => false,
        })
        .await
        .map(|_| ())
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.wait_for_selector(selector, CLICK_TIMEOUT)
            .await
            .map_err(|_| E2eError::ElementNotFound(selector.to_string()))?;
        let node_id = self
            .query(selector)
            .await?
            .ok_or_else(|| E2eError::ElementNotFound(selector.to_string()))?;

        self.conn
            .send("DOM.scrollIntoViewIfNeeded", json!({ "nodeId": node_id }))
            .await?;
        let bounds = self
            .box_of(node_id)
            .await
            .ok_or_else(|| E2eError::ElementNotFound(format!("{} (not visible)", selector)))?;

        let x = bounds.x + bounds.width / 2.0;
        let y = bounds.y + bounds.height / 2.0;
        for kind in ["mouseMoved", "mousePressed", "mouseReleased"] {
            self.conn
                .send(
                    "Input.dispatchMouseEvent",
                    json!({ "type": kind, "x": x, "y": y, "button": "left", "clickCount": 1 }),
                )
                .await?;
        }

        debug!("Clicked {}", selector);
        Ok(())
    }

    async fn bounding_box(&self, selector: &str) -> E2eResult<Option<BoundingBox>> {
        match self.query(selector).await? {
            Some(node_id) => Ok(self.box_of(node_id).await),
            None => Ok(None),
        }
    }

    async fn close(&self) -> E2eResult<()> {
        let socket = self.conn.close().await;
        let target = async {
            self.http
                .get(format!("{}/json/close/{}", self.endpoint, self.target_id))
                .send()
                .await?
                .error_for_status()?;
            Ok::<(), E2eError>(())
        }
        .await;
        debug!("Closed page {}", self.target_id);
        settle_close(&self.target_id, socket, target)
    }
}
/// Closing a page does both steps; the socket error wins if both fail
fn settle_close(target_id: &str, socket: E2eResult<()>, target: E2eResult<()>) -> E2eResult<()> {
    if let Err(e) = &socket {
        warn!("Closing DevTools socket of page {} failed: {}", target_id, e);
    }
    socket.and(target)
}
