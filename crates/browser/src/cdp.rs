//! Chrome DevTools Protocol driver.
//!
//! One WebSocket per page target.  A reader task routes command replies to
//! their waiting callers by id and fans protocol events out on a broadcast
//! channel; a writer task drains the outgoing queue.  When the socket closes
//! (browser crashed, was killed, or closed) the disconnect signal flips and
//! every in-flight call fails with [`BrowserError::Disconnected`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use pvtrack_config::BrowserConfig;

use crate::{
    BrowserError, BrowserLauncher, POLL_INTERVAL, Page, ResponseInfo, ResponseMatcher, Result,
    poll_until,
};

/// Broadcast capacity for protocol events.  Slow listeners lose the oldest.
const EVENT_CAP: usize = 256;

/// Upper bound on any single protocol round trip, so a wedged renderer
/// surfaces as a timeout instead of a hang.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

#[derive(Debug, Clone)]
struct CdpEvent {
    method: String,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct TargetInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    ws_url: Option<String>,
}

// ── Launcher ─────────────────────────────────────────────────────────────────

/// Spawns a local Chromium with remote debugging enabled and attaches to its
/// first page target.
pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg(format!("--remote-debugging-port={}", self.config.debugging_port))
            .arg(format!("--user-data-dir={}", self.config.user_data_dir))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-gpu");
        if self.config.headless {
            cmd.arg("--headless=new");
        }
        cmd.arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Page>> {
        std::fs::create_dir_all(&self.config.user_data_dir)?;
        info!(
            executable = %self.config.executable,
            headless = self.config.headless,
            port = self.config.debugging_port,
            "launching browser"
        );
        let child = self
            .command()
            .spawn()
            .map_err(|err| BrowserError::Launch(format!("{}: {err}", self.config.executable)))?;

        let timeout = Duration::from_secs(self.config.launch_timeout_secs);
        let ws_url = discover_page_target(self.config.debugging_port, timeout).await?;
        debug!(%ws_url, "attaching to page target");

        let slow_mo = Duration::from_millis(self.config.slow_mo_ms);
        let page = CdpPage::connect(&ws_url, Some(child), slow_mo).await?;
        info!("browser page ready");
        Ok(Arc::new(page))
    }
}

/// Poll the DevTools HTTP endpoint until a page target shows up.
async fn discover_page_target(port: u16, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let url = format!("http://127.0.0.1:{port}/json/list");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match client.get(&url).send().await {
            Ok(resp) => {
                let targets: Vec<TargetInfo> = resp.json().await?;
                if let Some(ws) = targets
                    .into_iter()
                    .find(|t| t.kind == "page")
                    .and_then(|t| t.ws_url)
                {
                    return Ok(ws);
                }
            }
            Err(err) => debug!(%err, "devtools endpoint not ready yet"),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(BrowserError::Launch(format!(
                "no page target on port {port} after {timeout:?}"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL * 2).await;
    }
}

// ── Page ─────────────────────────────────────────────────────────────────────

pub struct CdpPage {
    next_id: AtomicU64,
    pending: Pending,
    outgoing: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<CdpEvent>,
    closed: watch::Receiver<bool>,
    child: tokio::sync::Mutex<Option<Child>>,
    slow_mo: Duration,
}

impl CdpPage {
    /// Attach to a page target.  `child` is the browser process this page
    /// owns, if any; it is terminated by [`Page::close`] or on drop.
    pub async fn connect(ws_url: &str, child: Option<Child>, slow_mo: Duration) -> Result<Self> {
        let (stream, _) = connect_async(ws_url).await?;
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, _) = broadcast::channel::<CdpEvent>(EVENT_CAP);
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = write.send(msg).await {
                    warn!(%err, "devtools write failed");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_pending = pending.clone();
        let reader_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch_frame(&text, &reader_pending, &reader_events),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "devtools read failed");
                        break;
                    }
                }
            }
            closed_tx.send_replace(true);
            if let Ok(mut waiting) = reader_pending.lock() {
                for (_, tx) in waiting.drain() {
                    let _ = tx.send(Err(BrowserError::Disconnected));
                }
            }
        });

        let page = Self {
            next_id: AtomicU64::new(1),
            pending,
            outgoing: out_tx,
            events: event_tx,
            closed: closed_rx,
            child: tokio::sync::Mutex::new(child),
            slow_mo,
        };
        page.call("Page.enable", json!({})).await?;
        page.call("Network.enable", json!({})).await?;
        Ok(page)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        if *self.closed.borrow() {
            return Err(BrowserError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        let frame = json!({ "id": id, "method": method, "params": params });
        self.outgoing
            .send(Message::Text(frame.to_string()))
            .map_err(|_| BrowserError::Disconnected)?;
        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(reply) => reply.map_err(|_| BrowserError::Disconnected)?,
            Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                Err(BrowserError::timeout(format!("devtools reply to {method}"), CALL_TIMEOUT))
            }
        }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("uncaught exception");
            return Err(BrowserError::Script(text.to_string()));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    /// Run a script that returns `false` when `selector` matched nothing.
    async fn act_on(&self, selector: &str, body: &str) -> Result<()> {
        self.pace().await;
        let expr = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; {body} return true; }})()",
            js_str(selector)
        );
        match self.evaluate(&expr).await?.as_bool() {
            Some(true) => Ok(()),
            _ => Err(BrowserError::ElementNotFound(selector.to_string())),
        }
    }

    async fn pace(&self) {
        if !self.slow_mo.is_zero() {
            tokio::time::sleep(self.slow_mo).await;
        }
    }
}

#[async_trait]
impl Page for CdpPage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        self.pace().await;
        let what = format!("navigation to {url}");
        let deadline = tokio::time::Instant::now() + timeout;
        let result = tokio::time::timeout(timeout, self.call("Page.navigate", json!({ "url": url })))
            .await
            .map_err(|_| BrowserError::timeout(what.as_str(), timeout))??;
        if let Some(reason) = result.get("errorText").and_then(Value::as_str) {
            if !reason.is_empty() {
                return Err(BrowserError::Navigation {
                    url: url.to_string(),
                    reason: reason.to_string(),
                });
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        poll_until(&what, remaining, || async move {
            let state = self.evaluate("document.readyState").await?;
            Ok(matches!(state.as_str(), Some("interactive" | "complete")).then_some(()))
        })
        .await
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let expr = format!("document.querySelector({}) !== null", js_str(selector));
        let expr = expr.as_str();
        poll_until(&format!("selector {selector}"), timeout, || async move {
            Ok((self.evaluate(expr).await?.as_bool() == Some(true)).then_some(()))
        })
        .await
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        let body = format!(
            "el.focus(); el.value = {}; \
             el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
             el.dispatchEvent(new Event('change', {{ bubbles: true }}));",
            js_str(text)
        );
        self.act_on(selector, &body).await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.act_on(selector, "el.click();").await
    }

    async fn wait_for_response(
        &self,
        matcher: &ResponseMatcher,
        timeout: Duration,
    ) -> Result<ResponseInfo> {
        // Subscribe before the first await so the triggering action, joined
        // after this future, cannot outrun the listener.
        let mut events = self.events.subscribe();
        let closed = self.closed.clone();
        let wait = async {
            loop {
                let event = tokio::select! {
                    received = events.recv() => received,
                    _ = wait_closed(closed.clone()) => return Err(BrowserError::Disconnected),
                };
                match event {
                    Ok(event) if event.method == "Network.responseReceived" => {
                        let response = response_info(&event.params);
                        if matcher.matches(&response) {
                            return Ok::<ResponseInfo, BrowserError>(response);
                        }
                        debug!(url = %response.url, status = response.status, "ignoring response");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(n, "response listener lagged; {n} events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BrowserError::Disconnected);
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            BrowserError::timeout(format!("response containing {:?}", matcher.url_contains), timeout)
        })?
    }

    async fn text_content(&self, selector: &str) -> Result<Option<String>> {
        let expr = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.textContent : null; }})()",
            js_str(selector)
        );
        Ok(self.evaluate(&expr).await?.as_str().map(str::to_string))
    }

    async fn row_texts(
        &self,
        row_selector: &str,
        cell_selectors: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>> {
        let expr = format!(
            "Array.from(document.querySelectorAll({})).map(row => {}.map(sel => {{ \
               const el = row.querySelector(sel); return el ? el.textContent : null; }}))",
            js_str(row_selector),
            json!(cell_selectors)
        );
        let value = self.evaluate(&expr).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn current_url(&self) -> Result<String> {
        let value = self.evaluate("location.href").await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Protocol("location.href was not a string".to_string()))
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    async fn close(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        match child.take() {
            Some(mut process) => {
                info!("closing browser");
                process.start_kill()?;
                let _ = tokio::time::timeout(Duration::from_secs(5), process.wait()).await;
            }
            None => {
                let _ = self.call("Page.close", json!({})).await;
            }
        }
        Ok(())
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await.map(|_| ());
}

fn response_info(params: &Value) -> ResponseInfo {
    ResponseInfo {
        url: params
            .pointer("/response/url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        status: params
            .pointer("/response/status")
            .and_then(Value::as_f64)
            .map(|s| s as u16)
            .unwrap_or(0),
    }
}

/// Route one incoming frame: replies go to their caller, events to listeners.
fn dispatch_frame(text: &str, pending: &Pending, events: &broadcast::Sender<CdpEvent>) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            warn!(%err, "unparsable devtools frame");
            return;
        }
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
        if let Some(tx) = waiter {
            let outcome = match frame.get("error") {
                Some(err) => Err(BrowserError::Protocol(
                    err.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                )),
                None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
        return;
    }

    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        let _ = events.send(CdpEvent {
            method: method.to_string(),
            params: frame.get("params").cloned().unwrap_or(Value::Null),
        });
    }
}

/// Quote `s` as a JavaScript string literal.
fn js_str(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}
