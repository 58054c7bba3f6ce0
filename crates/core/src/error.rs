use thiserror::Error;

use crate::protocol::TabId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Browser error: {0}")]
    Browser(String),

    /// No usable transport link to the agent.
    #[error("extension not connected")]
    NotConnected,

    /// No reply from the agent within the request budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The page never reached the target site in a ready state.
    #[error("page load timeout")]
    PageLoadTimeout,

    /// The transport link closed while the request was pending.
    #[error("extension disconnected")]
    LinkLost,

    /// The agent answered with an error frame.
    #[error("{0}")]
    RemoteError(String),

    #[error("tab missing")]
    TabMissing(TabId),

    #[error("tab not attached")]
    TabNotAttached(TabId),

    #[error("no active tab")]
    NoActiveTab,

    #[error("{reason}")]
    SelectorNotFound { step: &'static str, reason: String },

    /// Another controller already holds the tab's debugging channel.
    #[error("debugger already attached to tab {0}")]
    ControlConflict(TabId),
}

pub type Result<T> = std::result::Result<T, Error>;
