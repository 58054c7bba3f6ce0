//! Drives the site's composer to publish a post.
//!
//! The sequence holds exclusive debugging control of the tab for its whole
//! duration and gives it back on every exit path:
//!
//! 1. acquire control
//! 2. make sure the tab is on the site (navigate and wait for load otherwise)
//! 3. open the composer
//! 4. focus the input box
//! 5. insert the text as trusted input
//! 6. press submit, unless it is disabled
//! 7. release control
//!
//! Every selector list is tried in order, one evaluation per candidate, and
//! the first hit wins.

use std::time::Duration;

use serde_json::Value;
use tabrelay_core::{AutomationConfig, Error, PostOutcome, Result, TabId};
use tracing::{debug, info, warn};

use crate::browser::{Browser, DebugSession};
use crate::control::ControlRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStep {
    AcquireControl,
    EnsureContext,
    OpenComposer,
    FocusInput,
    InsertText,
    Submit,
    ReleaseControl,
}

impl PostStep {
    pub fn name(self) -> &'static str {
        match self {
            PostStep::AcquireControl => "acquireControl",
            PostStep::EnsureContext => "ensureContext",
            PostStep::OpenComposer => "openComposer",
            PostStep::FocusInput => "focusInput",
            PostStep::InsertText => "insertText",
            PostStep::Submit => "submit",
            PostStep::ReleaseControl => "releaseControl",
        }
    }
}

fn js_string(selector: &str) -> String {
    Value::String(selector.to_string()).to_string()
}

fn click_script(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return null; el.click(); return 'clicked'; }})()",
        js_string(selector)
    )
}

/// Focus and park the caret at the end so inserted text appends.
fn focus_script(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({}); if (!el) return null; el.focus(); \
         const sel = window.getSelection(); \
         if (sel) {{ const range = document.createRange(); range.selectNodeContents(el); range.collapse(false); sel.removeAllRanges(); sel.addRange(range); }} \
         return 'focused'; }})()",
        js_string(selector)
    )
}

fn submit_script(selector: &str) -> String {
    format!(
        "(() => {{ const b = document.querySelector({}); if (!b) return null; \
         if (b.disabled || b.getAttribute('aria-disabled') === 'true') return 'disabled'; \
         b.click(); return 'clicked'; }})()",
        js_string(selector)
    )
}

pub struct PostSequencer {
    config: AutomationConfig,
    controls: ControlRegistry,
}

impl PostSequencer {
    pub fn new(config: AutomationConfig, controls: ControlRegistry) -> Self {
        Self { config, controls }
    }

    pub fn controls(&self) -> &ControlRegistry {
        &self.controls
    }

    /// Run one full attempt.
    ///
    /// `Ok` carries whether the submit control was pressed. Missing elements
    /// come back as `Error::SelectorNotFound`; anything else is a hard failure.
    pub async fn run(&self, browser: &dyn Browser, tab_id: TabId, text: &str) -> Result<PostOutcome> {
        info!(tab_id, chars = text.chars().count(), "Post sequence starting");
        let guard = self.controls.acquire(browser, tab_id).await?;

        let outcome = self.drive(guard.session(), text).await;

        if let Err(e) = guard.release().await {
            warn!(tab_id, error = %e, step = PostStep::ReleaseControl.name(), "Failed to detach cleanly");
        }
        match &outcome {
            Ok(o) => info!(tab_id, posted = o.posted, detail = ?o.detail, "Post sequence finished"),
            Err(e) => warn!(tab_id, error = %e, "Post sequence failed"),
        }
        outcome
    }

    async fn drive(&self, session: &dyn DebugSession, text: &str) -> Result<PostOutcome> {
        self.ensure_context(session).await?;
        self.open_composer(session).await?;
        self.focus_input(session).await?;

        session.insert_text(text).await?;
        debug!(step = PostStep::InsertText.name(), "Text inserted");
        tokio::time::sleep(Duration::from_millis(self.config.insert_settle_ms)).await;

        self.submit(session).await
    }

    async fn ensure_context(&self, session: &dyn DebugSession) -> Result<()> {
        let href = session.location().await?;
        if href.starts_with(&self.config.site_prefix) {
            return Ok(());
        }
        info!(from = %href, to = %self.config.site_url, "Tab is off-site, navigating");
        session.navigate(&self.config.site_url).await?;

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let wait = async {
            loop {
                let on_site = session.location().await?.starts_with(&self.config.site_prefix);
                if on_site && session.ready_state().await? == "complete" {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(Duration::from_millis(self.config.load_timeout_ms), wait)
            .await
            .map_err(|_| Error::PageLoadTimeout)?
    }

    async fn open_composer(&self, session: &dyn DebugSession) -> Result<()> {
        let step = PostStep::OpenComposer;
        // Not fatal: the composer may already be open.
        if self
            .probe(session, step, &self.config.composer_selectors, click_script)
            .await?
            .is_none()
        {
            debug!(step = step.name(), "No composer affordance found, continuing");
        }
        tokio::time::sleep(Duration::from_millis(self.config.composer_settle_ms)).await;
        Ok(())
    }

    async fn focus_input(&self, session: &dyn DebugSession) -> Result<()> {
        let step = PostStep::FocusInput;
        self.probe(session, step, &self.config.input_selectors, focus_script)
            .await?
            .map(|_| ())
            .ok_or_else(|| Error::SelectorNotFound {
                step: step.name(),
                reason: "box not found".to_string(),
            })
    }

    async fn submit(&self, session: &dyn DebugSession) -> Result<PostOutcome> {
        let step = PostStep::Submit;
        let status = self
            .probe(session, step, &self.config.submit_selectors, submit_script)
            .await?
            .ok_or_else(|| Error::SelectorNotFound {
                step: step.name(),
                reason: "button-not-found".to_string(),
            })?;
        Ok(match status.as_str() {
            "disabled" => PostOutcome::rejected("button-disabled"),
            _ => PostOutcome::posted("clicked"),
        })
    }

    /// Evaluate `script` for each selector until one reports a status.
    async fn probe(
        &self,
        session: &dyn DebugSession,
        step: PostStep,
        selectors: &[String],
        script: fn(&str) -> String,
    ) -> Result<Option<String>> {
        for selector in selectors {
            let value = session.evaluate(&script(selector)).await?;
            if let Some(status) = value.as_str() {
                debug!(step = step.name(), selector = %selector, status, "Selector matched");
                return Ok(Some(status.to_string()));
            }
        }
        Ok(None)
    }
}
