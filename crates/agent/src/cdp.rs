//! Chrome DevTools Protocol backend.
//!
//! Tabs are discovered through the browser's `/json/list` endpoint and driven
//! over one WebSocket per target. Integer tab ids are derived from the
//! target id so they stay stable across agent restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tabrelay_core::{Error, Result, TabId};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::browser::{Browser, DebugSession, TabInfo};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A CDP WebSocket client for one target.
pub struct CdpClient {
    ws_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: AtomicU64,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let (ws_stream, _) = connect_async(ws_url).await.map_err(|e| {
            Error::Browser(format!("failed to connect to CDP endpoint {}: {}", ws_url, e))
        })?;
        let (mut ws_sink, mut ws_read) = ws_stream.split();
        let (ws_tx, mut ws_rx) = mpsc::channel::<String>(256);

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_clone = pending.clone();

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(msg)).await {
                    error!("CDP WebSocket write error: {}", e);
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        // Events are not consumed; only command responses are routed.
        let reader_handle = tokio::spawn(async move {
            while let Some(msg_result) = ws_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        let Ok(val) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        if let Some(id) = val.get("id").and_then(|v| v.as_u64()) {
                            if let Some(tx) = pending_clone.lock().await.remove(&id) {
                                let _ = tx.send(val);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("CDP WebSocket closed by browser");
                        break;
                    }
                    Err(e) => {
                        warn!("CDP WebSocket read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // Fail whatever is still waiting.
            pending_clone.lock().await.clear();
        });

        Ok(Self {
            ws_tx,
            pending,
            next_id: AtomicU64::new(1),
            reader_handle,
            writer_handle,
        })
    }

    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = json!({ "id": id, "method": method, "params": params });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.ws_tx.send(msg.to_string()).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Browser(format!("CDP channel closed before '{}'", method)));
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(response)) => match response.get("error") {
                Some(error) => Err(Error::Browser(format!("CDP error: {}", error))),
                None => Ok(response.get("result").cloned().unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(Error::Browser("CDP response channel closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Browser(format!(
                    "CDP command '{}' timed out after {}s",
                    method,
                    COMMAND_TIMEOUT.as_secs()
                )))
            }
        }
    }

    pub async fn enable_domain(&self, domain: &str) -> Result<()> {
        self.send_command(&format!("{}.enable", domain), json!({}))
            .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let result = self
            .send_command("Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(reason) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::Browser(format!("navigation failed: {}", reason)));
        }
        Ok(())
    }

    /// Evaluate in the page's main world and unwrap the returned value.
    pub async fn evaluate_js(&self, expression: &str) -> Result<Value> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        remote_value(result)
    }

    pub async fn insert_text(&self, text: &str) -> Result<()> {
        self.send_command("Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }

    pub fn close(&self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Unwrap a `Runtime.evaluate` result, surfacing page exceptions as errors.
fn remote_value(result: Value) -> Result<Value> {
    if let Some(details) = result.get("exceptionDetails") {
        let message = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or("script threw");
        return Err(Error::Browser(message.to_string()));
    }
    Ok(result
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}

/// Stable integer id for a CDP target id. Chrome target ids are 32 hex
/// chars; the first 12 give a positive 48-bit integer. Anything else is
/// hashed.
pub fn tab_id_for_target(target_id: &str) -> TabId {
    if let Some(prefix) = target_id.get(..12) {
        if let Ok(value) = i64::from_str_radix(prefix, 16) {
            return value;
        }
    }
    let digest = Sha256::digest(target_id.as_bytes());
    digest[..6]
        .iter()
        .fold(0i64, |acc, byte| (acc << 8) | i64::from(*byte))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CdpTarget {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    web_socket_debugger_url: Option<String>,
}

impl CdpTarget {
    fn tab_id(&self) -> TabId {
        tab_id_for_target(&self.id)
    }

    fn info(&self) -> TabInfo {
        TabInfo {
            id: self.tab_id(),
            url: self.url.clone(),
            title: self.title.clone(),
        }
    }
}

/// A Chrome instance reachable on its remote debugging port.
pub struct CdpBrowser {
    port: u16,
    http: reqwest::Client,
}

impl CdpBrowser {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn targets(&self) -> Result<Vec<CdpTarget>> {
        let url = format!("http://127.0.0.1:{}/json/list", self.port);
        let resp = self.http.get(&url).send().await.map_err(|e| {
            Error::Browser(format!("browser not reachable on port {}: {}", self.port, e))
        })?;
        let targets: Vec<CdpTarget> = resp
            .json()
            .await
            .map_err(|e| Error::Browser(format!("bad /json/list response: {}", e)))?;
        Ok(targets.into_iter().filter(|t| t.kind == "page").collect())
    }

    async fn target(&self, tab_id: TabId) -> Result<CdpTarget> {
        self.targets()
            .await?
            .into_iter()
            .find(|t| t.tab_id() == tab_id)
            .ok_or(Error::TabMissing(tab_id))
    }

    async fn client(&self, tab_id: TabId) -> Result<CdpClient> {
        let target = self.target(tab_id).await?;
        // Chrome withholds the socket URL while another client is attached.
        let ws_url = target
            .web_socket_debugger_url
            .ok_or(Error::ControlConflict(tab_id))?;
        CdpClient::connect(&ws_url).await
    }
}

#[async_trait]
impl Browser for CdpBrowser {
    async fn get_tab(&self, tab_id: TabId) -> Result<TabInfo> {
        Ok(self.target(tab_id).await?.info())
    }

    async fn list_pages(&self) -> Result<Vec<TabInfo>> {
        Ok(self.targets().await?.iter().map(CdpTarget::info).collect())
    }

    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<()> {
        self.client(tab_id).await?.navigate(url).await
    }

    async fn evaluate(&self, tab_id: TabId, script: &str) -> Result<Value> {
        self.client(tab_id).await?.evaluate_js(script).await
    }

    async fn attach_debugger(&self, tab_id: TabId) -> Result<Box<dyn DebugSession>> {
        let client = self.client(tab_id).await?;
        client.enable_domain("Page").await?;
        client.enable_domain("Runtime").await?;
        Ok(Box::new(CdpDebugSession { client }))
    }
}

pub struct CdpDebugSession {
    client: CdpClient,
}

#[async_trait]
impl DebugSession for CdpDebugSession {
    async fn evaluate(&self, expression: &str) -> Result<Value> {
        self.client.evaluate_js(expression).await
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.client.navigate(url).await
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        self.client.insert_text(text).await
    }

    async fn detach(&self) -> Result<()> {
        self.client.close();
        Ok(())
    }
}
