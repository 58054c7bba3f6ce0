//! Relay wire protocol.
//!
//! Every frame is a single JSON object on one WebSocket text message.
//! Frames carrying `requestId` are correlated request/response pairs; frames
//! without it are unsolicited session events from the agent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Browser tab identifier as seen by the agent.
pub type TabId = i64;

/// Source tag announced in `hello` events.
pub const AGENT_SOURCE: &str = "tabrelay-agent";

/// Commands the control plane can issue. `tab_id: None` targets the active tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    ListTabs,
    SetActiveTab {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    Navigate {
        #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
        url: String,
    },
    #[serde(rename = "eval")]
    Evaluate {
        #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
        script: String,
    },
    #[serde(alias = "xPost")]
    Post {
        #[serde(rename = "tabId", default, skip_serializing_if = "Option::is_none")]
        tab_id: Option<TabId>,
        text: String,
    },
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ListTabs => "listTabs",
            Command::SetActiveTab { .. } => "setActiveTab",
            Command::Navigate { .. } => "navigate",
            Command::Evaluate { .. } => "eval",
            Command::Post { .. } => "post",
        }
    }
}

/// One attached tab in a `listTabsResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabEntry {
    pub id: TabId,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub active: bool,
}

/// Outcome of a completed post sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostOutcome {
    pub posted: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

impl PostOutcome {
    pub fn posted(detail: impl Into<String>) -> Self {
        Self {
            posted: true,
            detail: Some(detail.into()),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            posted: false,
            detail: Some(detail.into()),
        }
    }
}

/// Agent replies. `Error` carries the agent-side failure message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    Ok,
    ListTabsResult {
        #[serde(default)]
        tabs: Vec<TabEntry>,
    },
    EvalResult {
        #[serde(default)]
        result: Value,
    },
    #[serde(alias = "xPostResult")]
    PostResult {
        posted: bool,
        #[serde(default)]
        detail: Option<String>,
    },
    Error {
        #[serde(default = "default_error_message")]
        error: String,
    },
}

fn default_error_message() -> String {
    "unknown error".to_string()
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            error: message.into(),
        }
    }

    pub fn from_outcome(outcome: PostOutcome) -> Self {
        Reply::PostResult {
            posted: outcome.posted,
            detail: outcome.detail,
        }
    }
}

/// Unsolicited agent events. They update mirrored state and never settle a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(rename = "attachedTabIds", default)]
        attached_tab_ids: Vec<TabId>,
        #[serde(rename = "activeTabId", default)]
        active_tab_id: Option<TabId>,
    },
    TabAttached {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    TabDetached {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    ActiveTabChanged {
        #[serde(rename = "tabId", default)]
        tab_id: Option<TabId>,
    },
}

/// Bridge → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub command: Command,
}

/// Agent → bridge, correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(flatten)]
    pub reply: Reply,
}

/// Anything the agent may send to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    Response(ResponseFrame),
    Event(SessionEvent),
}

impl AgentFrame {
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(Error::Protocol("frame is not a JSON object".to_string()));
        }
        if value.get("requestId").map_or(false, |v| !v.is_null()) {
            Ok(AgentFrame::Response(serde_json::from_value(value)?))
        } else {
            Ok(AgentFrame::Event(serde_json::from_value(value)?))
        }
    }
}

impl RequestFrame {
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Serialize a frame. serde_json never emits raw newlines, so one frame is one line.
pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// `req_<unix-millis>_<8 hex>`.
pub fn new_request_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "req_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}
