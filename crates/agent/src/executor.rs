//! Executes bridge commands against the browser.

use std::sync::Arc;

use tabrelay_core::{
    AutomationConfig, Command, Error, PostOutcome, Reply, RequestFrame, ResponseFrame, Result,
    TabEntry, TabId,
};
use tracing::{debug, info, warn};

use crate::automation::PostSequencer;
use crate::browser::{Browser, TabInfo};
use crate::control::ControlRegistry;
use crate::session::AgentSession;

pub struct CommandExecutor {
    session: Arc<AgentSession>,
    browser: Arc<dyn Browser>,
    sequencer: PostSequencer,
    post_retries: u32,
}

impl CommandExecutor {
    pub fn new(
        session: Arc<AgentSession>,
        browser: Arc<dyn Browser>,
        automation: AutomationConfig,
    ) -> Self {
        let post_retries = automation.post_retries;
        Self {
            session,
            browser,
            sequencer: PostSequencer::new(automation, ControlRegistry::new()),
            post_retries,
        }
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    /// Execute one request and build its correlated response. Failures
    /// become error replies; nothing escapes.
    pub async fn handle(&self, frame: RequestFrame) -> ResponseFrame {
        let name = frame.command.name();
        debug!(request_id = %frame.request_id, command = name, "Executing command");
        let reply = match self.execute(frame.command).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(request_id = %frame.request_id, command = name, error = %e, "Command failed");
                Reply::error(e.to_string())
            }
        };
        ResponseFrame {
            request_id: frame.request_id,
            reply,
        }
    }

    pub async fn execute(&self, command: Command) -> Result<Reply> {
        match command {
            Command::ListTabs => self.list_tabs().await,
            Command::SetActiveTab { tab_id } => self.set_active_tab(tab_id).await,
            Command::Navigate { tab_id, url } => {
                let tab_id = self.ensure_live(self.resolve_tab(tab_id).await?).await?.id;
                self.browser.navigate(tab_id, &url).await?;
                info!(tab_id, url = %url, "Navigated");
                Ok(Reply::Ok)
            }
            Command::Evaluate { tab_id, script } => {
                let tab_id = self.ensure_live(self.resolve_tab(tab_id).await?).await?.id;
                let result = self.browser.evaluate(tab_id, &script).await?;
                Ok(Reply::EvalResult { result })
            }
            Command::Post { tab_id, text } => {
                let tab_id = self.ensure_live(self.resolve_tab(tab_id).await?).await?.id;
                self.post(tab_id, &text).await.map(Reply::from_outcome)
            }
        }
    }

    /// Attached tabs in attach order. Tabs that have gone away are detached
    /// on the way.
    async fn list_tabs(&self) -> Result<Reply> {
        let state = self.session.snapshot().await;
        let mut tabs = Vec::with_capacity(state.attached_tab_ids.len());
        for tab_id in state.attached_tab_ids {
            match self.ensure_live(tab_id).await {
                Ok(info) => tabs.push(info),
                Err(Error::TabMissing(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        let active = self.session.snapshot().await.active_tab_id;
        Ok(Reply::ListTabsResult {
            tabs: tabs
                .into_iter()
                .map(|t| TabEntry {
                    active: Some(t.id) == active,
                    id: t.id,
                    url: t.url,
                    title: t.title,
                })
                .collect(),
        })
    }

    async fn set_active_tab(&self, tab_id: TabId) -> Result<Reply> {
        if !self.session.snapshot().await.is_attached(tab_id) {
            return Err(Error::TabNotAttached(tab_id));
        }
        self.ensure_live(tab_id).await?;
        self.session.set_active_tab(tab_id).await?;
        Ok(Reply::Ok)
    }

    /// Explicit id, else the active tab.
    async fn resolve_tab(&self, explicit: Option<TabId>) -> Result<TabId> {
        match explicit {
            Some(tab_id) => Ok(tab_id),
            None => self
                .session
                .snapshot()
                .await
                .active_tab_id
                .ok_or(Error::NoActiveTab),
        }
    }

    /// Check the tab still exists. A vanished tab is detached before the
    /// error is reported.
    async fn ensure_live(&self, tab_id: TabId) -> Result<TabInfo> {
        match self.browser.get_tab(tab_id).await {
            Err(Error::TabMissing(_)) => {
                warn!(tab_id, "Tab is gone, detaching");
                self.session.detach_tab(tab_id).await?;
                Err(Error::TabMissing(tab_id))
            }
            other => other,
        }
    }

    /// Missing elements become an un-posted outcome carrying the reason.
    /// Other failures (control conflict, load timeout, browser errors) are
    /// hard errors and never retried.
    async fn post(&self, tab_id: TabId, text: &str) -> Result<PostOutcome> {
        let attempts = self.post_retries + 1;
        let mut attempt = 1;
        loop {
            let outcome = match self.sequencer.run(self.browser.as_ref(), tab_id, text).await {
                Ok(outcome) => outcome,
                Err(Error::SelectorNotFound { step, reason }) => {
                    debug!(tab_id, step, reason = %reason, "Post step found nothing");
                    PostOutcome::rejected(reason)
                }
                Err(e) => return Err(e),
            };
            if outcome.posted || attempt >= attempts {
                return Ok(outcome);
            }
            info!(tab_id, attempt, attempts, detail = ?outcome.detail, "Post not published, retrying");
            attempt += 1;
        }
    }
}
