//! Seams between the agent and the browser it drives.

use async_trait::async_trait;
use serde_json::Value;
use tabrelay_core::{Result, TabId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub url: String,
    pub title: String,
}

/// Tab-level operations that need no exclusive control.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Look up a live tab. Fails with `Error::TabMissing` once it is gone.
    async fn get_tab(&self, tab_id: TabId) -> Result<TabInfo>;

    /// All open page tabs, attached or not.
    async fn list_pages(&self) -> Result<Vec<TabInfo>>;

    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<()>;

    /// Run a script in the tab's main world and return its value.
    async fn evaluate(&self, tab_id: TabId, script: &str) -> Result<Value>;

    /// Open a debugging channel to the tab. Callers go through
    /// `ControlRegistry` rather than calling this directly.
    async fn attach_debugger(&self, tab_id: TabId) -> Result<Box<dyn DebugSession>>;
}

/// An open debugging channel to one tab.
#[async_trait]
pub trait DebugSession: Send + Sync {
    async fn evaluate(&self, expression: &str) -> Result<Value>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// Trusted text insertion at the current focus.
    async fn insert_text(&self, text: &str) -> Result<()>;

    async fn detach(&self) -> Result<()>;

    async fn location(&self) -> Result<String> {
        let value = self.evaluate("location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn ready_state(&self) -> Result<String> {
        let value = self.evaluate("document.readyState").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}
