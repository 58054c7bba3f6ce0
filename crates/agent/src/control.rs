//! Exclusive debugging control per tab.
//!
//! A tab's claim lives as long as its [`ControlGuard`]. Dropping the guard
//! (including on task cancellation) frees the claim and closes the channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tabrelay_core::{Error, Result, TabId};
use tracing::debug;

use crate::browser::{Browser, DebugSession};

#[derive(Clone, Default)]
pub struct ControlRegistry {
    held: Arc<Mutex<HashSet<TabId>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, tab_id: TabId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&tab_id)
    }

    fn claim(&self, tab_id: TabId) -> Option<Claim> {
        let fresh = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tab_id);
        fresh.then(|| Claim {
            registry: self.clone(),
            tab_id,
        })
    }

    /// Claim the tab and open its debugging channel. A failed attach leaves
    /// nothing held.
    pub async fn acquire(&self, browser: &dyn Browser, tab_id: TabId) -> Result<ControlGuard> {
        let claim = self.claim(tab_id).ok_or(Error::ControlConflict(tab_id))?;
        let session = browser.attach_debugger(tab_id).await?;
        debug!(tab_id, "Debug control acquired");
        Ok(ControlGuard {
            session,
            claim,
        })
    }
}

struct Claim {
    registry: ControlRegistry,
    tab_id: TabId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.tab_id);
    }
}

pub struct ControlGuard {
    session: Box<dyn DebugSession>,
    claim: Claim,
}

impl ControlGuard {
    pub fn tab_id(&self) -> TabId {
        self.claim.tab_id
    }

    pub fn session(&self) -> &dyn DebugSession {
        self.session.as_ref()
    }

    /// Detach the channel and free the claim. The claim is freed even if
    /// the detach itself fails.
    pub async fn release(self) -> Result<()> {
        let tab_id = self.tab_id();
        let result = self.session.detach().await;
        drop(self);
        debug!(tab_id, ok = result.is_ok(), "Debug control released");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBrowser, FakePage};

    #[tokio::test]
    async fn test_second_acquire_conflicts() {
        let browser = FakeBrowser::with_page(FakePage::new(5, "https://x.com/home"));
        let controls = ControlRegistry::new();

        let guard = controls.acquire(&browser, 5).await.unwrap();
        assert!(controls.is_held(5));
        let err = controls.acquire(&browser, 5).await.err().unwrap();
        assert!(matches!(err, Error::ControlConflict(5)));

        guard.release().await.unwrap();
        assert!(!controls.is_held(5));
        assert_eq!(browser.calls_for(5), vec!["attach", "detach"]);
        controls.acquire(&browser, 5).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_attach_holds_nothing() {
        let browser = FakeBrowser::default();
        let controls = ControlRegistry::new();
        let err = controls.acquire(&browser, 8).await.err().unwrap();
        assert!(matches!(err, Error::TabMissing(8)));
        assert!(!controls.is_held(8));
    }

    #[tokio::test]
    async fn test_drop_frees_claim() {
        let browser = FakeBrowser::with_page(FakePage::new(2, "https://x.com/home"));
        let controls = ControlRegistry::new();
        {
            let _guard = controls.acquire(&browser, 2).await.unwrap();
            assert!(controls.is_held(2));
        }
        assert!(!controls.is_held(2));
    }
}
