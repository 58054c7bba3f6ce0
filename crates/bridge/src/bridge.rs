//! Bridge core: turns the agent link into a request/response API usable by
//! many concurrent callers.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tabrelay_core::protocol::{self, AgentFrame};
use tabrelay_core::{
    BridgeConfig, Command, Error, PostOutcome, Reply, RequestFrame, Result, SessionState,
    TabEntry, TabId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::{LinkHandle, TransportLink};
use crate::pending::{CorrelationTable, PendingGuard};

pub struct Bridge {
    config: BridgeConfig,
    link: TransportLink,
    pending: CorrelationTable,
    /// The agent's session as last announced.
    mirror: Mutex<SessionState>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            link: TransportLink::new(),
            pending: CorrelationTable::new(),
            mirror: Mutex::new(SessionState::default()),
        }
    }

    fn mirror(&self) -> MutexGuard<'_, SessionState> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Budget for a command when the caller does not pick one.
    pub fn timeout_for(&self, command: &Command) -> Duration {
        match command {
            Command::Post { .. } => self.config.post_timeout(),
            Command::Evaluate { .. } => self.config.eval_timeout(),
            _ => self.config.default_timeout(),
        }
    }

    pub async fn call(&self, command: Command) -> Result<Reply> {
        let timeout = self.timeout_for(&command);
        self.call_with_timeout(command, timeout).await
    }

    /// Send one command and wait for its correlated reply.
    ///
    /// Fails fast with `NotConnected` when there is no usable link. The
    /// pending entry is gone when this returns, whatever the outcome.
    pub async fn call_with_timeout(&self, command: Command, timeout: Duration) -> Result<Reply> {
        let Some(link) = self.link.current() else {
            return Err(Error::NotConnected);
        };
        self.call_on(&link, command, timeout).await
    }

    async fn call_on(&self, link: &LinkHandle, command: Command, timeout: Duration) -> Result<Reply> {
        let name = command.name();
        let (request_id, rx) = loop {
            let id = protocol::new_request_id();
            if let Some(rx) = self.pending.register(&id, link.id, name) {
                break (id, rx);
            }
        };
        let _guard = PendingGuard {
            table: &self.pending,
            id: request_id.clone(),
        };

        // The link may have closed between lookup and registration, in which
        // case its teardown already swept the table without this entry.
        if !self.link.is_current(link.id) {
            return Err(Error::LinkLost);
        }

        let frame = RequestFrame {
            request_id: request_id.clone(),
            command,
        };
        match link.send_frame(&frame).await {
            Ok(()) => {}
            Err(Error::NotConnected) => return Err(Error::LinkLost),
            Err(e) => return Err(e),
        }
        debug!(request_id = %request_id, command = name, link_id = link.id, "Request sent to agent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(settlement)) => settlement,
            // Sender dropped without settling: the table went away with the link.
            Ok(Err(_)) => Err(Error::LinkLost),
            Err(_) => {
                warn!(request_id = %request_id, command = name, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(Error::Timeout(format!("{} timeout", name)))
            }
        }
    }

    pub async fn list_tabs(&self) -> Result<Vec<TabEntry>> {
        match self.call(Command::ListTabs).await? {
            Reply::ListTabsResult { tabs } => Ok(tabs),
            other => Err(unexpected("listTabs", &other)),
        }
    }

    pub async fn set_active_tab(&self, tab_id: TabId) -> Result<()> {
        match self.call(Command::SetActiveTab { tab_id }).await? {
            Reply::Ok => {
                let mut mirror = self.mirror();
                mirror.attach(tab_id);
                mirror.set_active(tab_id);
                Ok(())
            }
            other => Err(unexpected("setActiveTab", &other)),
        }
    }

    pub async fn navigate(&self, tab_id: Option<TabId>, url: &str) -> Result<()> {
        let command = Command::Navigate {
            tab_id,
            url: url.to_string(),
        };
        match self.call(command).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected("navigate", &other)),
        }
    }

    pub async fn evaluate(&self, tab_id: Option<TabId>, script: &str) -> Result<Value> {
        let command = Command::Evaluate {
            tab_id,
            script: script.to_string(),
        };
        match self.call(command).await? {
            Reply::EvalResult { result } => Ok(result),
            other => Err(unexpected("eval", &other)),
        }
    }

    pub async fn post(&self, tab_id: Option<TabId>, text: &str) -> Result<PostOutcome> {
        let command = Command::Post {
            tab_id,
            text: text.to_string(),
        };
        match self.call(command).await? {
            Reply::PostResult { posted, detail } => Ok(PostOutcome { posted, detail }),
            other => Err(unexpected("post", &other)),
        }
    }

    /// A new agent socket is up. Returns the link id and its outbound frames.
    /// Requests still waiting on a replaced link fail with `LinkLost`.
    pub fn attach_link(&self) -> (u64, mpsc::Receiver<String>) {
        let (id, rx, replaced) = self.link.attach();
        if let Some(old) = replaced {
            let failed = self.pending.fail_link(old, || Error::LinkLost);
            info!(link_id = old, failed_requests = failed, "Agent link replaced");
        }
        let mut mirror = self.mirror();
        mirror.connected = true;
        mirror.last_error = None;
        mirror.last_seen_at = Some(Utc::now());
        info!(link_id = id, "Agent connected");
        (id, rx)
    }

    /// The agent socket `id` closed. Its pending callers fail with
    /// `LinkLost`; the session only goes disconnected if it was current.
    pub fn detach_link(&self, id: u64) {
        let current = self.link.detach(id);
        let failed = self.pending.fail_link(id, || Error::LinkLost);
        if !current {
            debug!(link_id = id, failed_requests = failed, "Stale link closed");
            return;
        }
        self.mirror().connected = false;
        info!(link_id = id, failed_requests = failed, "Agent disconnected");
    }

    /// Route one inbound frame. Unmatched frames are dropped; a malformed
    /// reply to a pending request rejects that request.
    pub fn handle_frame(&self, text: &str) {
        match AgentFrame::decode(text) {
            Ok(AgentFrame::Response(frame)) => {
                self.pending.resolve(&frame.request_id, frame.reply);
            }
            Ok(AgentFrame::Event(event)) => {
                debug!(event = ?event, "Session event");
                self.mirror().apply_event(&event);
            }
            Err(e) => {
                let request_id = serde_json::from_str::<Value>(text).ok().and_then(|v| {
                    v.get("requestId")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                match request_id {
                    Some(id) if self.pending.contains(&id) => {
                        warn!(request_id = %id, error = %e, "Malformed reply from agent");
                        self.pending
                            .reject(&id, Error::Protocol(format!("malformed reply: {}", e)));
                    }
                    _ => debug!(error = %e, "Dropping unparseable agent frame"),
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.mirror().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_usable()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn unexpected(command: &str, reply: &Reply) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", command, reply))
}
