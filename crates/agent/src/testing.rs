//! In-memory browser used by the unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tabrelay_core::{AutomationConfig, Error, Result, TabId};

use crate::browser::{Browser, DebugSession, TabInfo};

#[derive(Debug, Clone)]
pub struct FakePage {
    pub id: TabId,
    pub url: String,
    pub ready_state: String,
    /// readyState reported after a navigation.
    pub ready_after_navigate: String,
    pub present: HashSet<String>,
    pub disabled: HashSet<String>,
    pub eval_result: Value,
    pub conflicting: bool,
}

impl FakePage {
    pub fn new(id: TabId, url: &str) -> Self {
        Self {
            id,
            url: url.to_string(),
            ready_state: "complete".to_string(),
            ready_after_navigate: "complete".to_string(),
            present: HashSet::new(),
            disabled: HashSet::new(),
            eval_result: Value::Null,
            conflicting: false,
        }
    }

    /// A tab already on the site with the first selector of each list present.
    pub fn site(id: TabId) -> Self {
        let config = AutomationConfig::default();
        Self::new(id, &config.site_url)
            .with(&config.composer_selectors[0])
            .with(&config.input_selectors[0])
            .with(&config.submit_selectors[0])
    }

    pub fn with(mut self, selector: &str) -> Self {
        self.present.insert(selector.to_string());
        self
    }

    pub fn without(mut self, selector: &str) -> Self {
        self.present.remove(selector);
        self
    }

    pub fn disabled(mut self, selector: &str) -> Self {
        self.present.insert(selector.to_string());
        self.disabled.insert(selector.to_string());
        self
    }
}

#[derive(Clone, Default)]
pub struct FakeBrowser {
    pages: Arc<Mutex<BTreeMap<TabId, FakePage>>>,
    calls: Arc<Mutex<Vec<(TabId, String)>>>,
}

impl FakeBrowser {
    pub fn with_page(page: FakePage) -> Self {
        let browser = Self::default();
        browser.add_page(page);
        browser
    }

    pub fn add_page(&self, page: FakePage) {
        self.pages.lock().unwrap().insert(page.id, page);
    }

    pub fn close_tab(&self, tab_id: TabId) {
        self.pages.lock().unwrap().remove(&tab_id);
    }

    pub fn page(&self, tab_id: TabId) -> Option<FakePage> {
        self.pages.lock().unwrap().get(&tab_id).cloned()
    }

    pub fn calls_for(&self, tab_id: TabId) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == tab_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn record(&self, tab_id: TabId, call: String) {
        self.calls.lock().unwrap().push((tab_id, call));
    }

    fn with_page_mut<R>(&self, tab_id: TabId, f: impl FnOnce(&mut FakePage) -> R) -> Result<R> {
        let mut pages = self.pages.lock().unwrap();
        let page = pages.get_mut(&tab_id).ok_or(Error::TabMissing(tab_id))?;
        Ok(f(page))
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn get_tab(&self, tab_id: TabId) -> Result<TabInfo> {
        self.with_page_mut(tab_id, |p| TabInfo {
            id: p.id,
            url: p.url.clone(),
            title: format!("tab {}", p.id),
        })
    }

    async fn list_pages(&self) -> Result<Vec<TabInfo>> {
        let pages = self.pages.lock().unwrap();
        Ok(pages
            .values()
            .map(|p| TabInfo {
                id: p.id,
                url: p.url.clone(),
                title: format!("tab {}", p.id),
            })
            .collect())
    }

    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<()> {
        self.with_page_mut(tab_id, |p| p.url = url.to_string())?;
        self.record(tab_id, format!("navigate:{}", url));
        Ok(())
    }

    async fn evaluate(&self, tab_id: TabId, script: &str) -> Result<Value> {
        let value = self.with_page_mut(tab_id, |p| p.eval_result.clone())?;
        self.record(tab_id, format!("eval:{}", script));
        Ok(value)
    }

    async fn attach_debugger(&self, tab_id: TabId) -> Result<Box<dyn DebugSession>> {
        let conflicting = self.with_page_mut(tab_id, |p| p.conflicting)?;
        if conflicting {
            return Err(Error::ControlConflict(tab_id));
        }
        self.record(tab_id, "attach".to_string());
        Ok(Box::new(FakeSession {
            tab_id,
            browser: self.clone(),
        }))
    }
}

struct FakeSession {
    tab_id: TabId,
    browser: FakeBrowser,
}

#[async_trait]
impl DebugSession for FakeSession {
    async fn evaluate(&self, expression: &str) -> Result<Value> {
        let page = self
            .browser
            .page(self.tab_id)
            .ok_or(Error::TabMissing(self.tab_id))?;
        if expression == "location.href" {
            return Ok(Value::String(page.url));
        }
        if expression == "document.readyState" {
            return Ok(Value::String(page.ready_state));
        }
        let hit = page.present.iter().find(|selector| {
            serde_json::to_string(selector)
                .map(|quoted| expression.contains(&quoted))
                .unwrap_or(false)
        });
        let Some(selector) = hit else {
            return Ok(Value::Null);
        };
        if expression.contains("aria-disabled") && page.disabled.contains(selector) {
            return Ok(Value::String("disabled".to_string()));
        }
        let action = if expression.contains(".focus()") {
            "focus"
        } else {
            "click"
        };
        self.browser
            .record(self.tab_id, format!("{}:{}", action, selector));
        Ok(Value::String(format!("{}ed", action)))
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.browser.with_page_mut(self.tab_id, |p| {
            p.url = url.to_string();
            p.ready_state = p.ready_after_navigate.clone();
        })?;
        self.browser
            .record(self.tab_id, format!("navigate:{}", url));
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        self.browser.record(self.tab_id, format!("insert:{}", text));
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        self.browser.record(self.tab_id, "detach".to_string());
        Ok(())
    }
}
