//! Periodic sweep that notices attached tabs the browser has closed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::browser::Browser;
use crate::session::AgentSession;

pub struct TabWatcher {
    session: Arc<AgentSession>,
    browser: Arc<dyn Browser>,
    period: Duration,
}

impl TabWatcher {
    pub fn new(session: Arc<AgentSession>, browser: Arc<dyn Browser>, period: Duration) -> Self {
        Self {
            session,
            browser,
            period,
        }
    }

    /// One pass. Returns how many tabs were dropped.
    pub async fn sweep(&self) -> usize {
        let pages = match self.browser.list_pages().await {
            Ok(pages) => pages,
            Err(e) => {
                debug!(error = %e, "Tab sweep skipped, browser unavailable");
                return 0;
            }
        };
        let open: HashSet<_> = pages.iter().map(|p| p.id).collect();
        let attached = self.session.snapshot().await.attached_tab_ids;

        let mut removed = 0;
        for tab_id in attached.into_iter().filter(|id| !open.contains(id)) {
            match self.session.tab_removed(tab_id).await {
                Ok(()) => {
                    info!(tab_id, "Attached tab was closed");
                    removed += 1;
                }
                Err(e) => warn!(tab_id, error = %e, "Failed to drop closed tab"),
            }
        }
        removed
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    debug!("Tab watcher shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use crate::testing::{FakeBrowser, FakePage};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweep_detaches_closed_tabs() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(
            AgentSession::open(StateStore::new(dir.path().join("agent-state.json")))
                .await
                .unwrap(),
        );
        let browser = FakeBrowser::with_page(FakePage::new(1, "https://a.test/"));
        browser.add_page(FakePage::new(2, "https://b.test/"));
        session.attach_tab(1).await.unwrap();
        session.attach_tab(2).await.unwrap();

        let watcher = TabWatcher::new(session.clone(), Arc::new(browser.clone()), Duration::from_secs(5));
        assert_eq!(watcher.sweep().await, 0);

        browser.close_tab(1);
        assert_eq!(watcher.sweep().await, 1);
        let state = session.snapshot().await;
        assert_eq!(state.attached_tab_ids, vec![2]);
        assert_eq!(state.active_tab_id, Some(2));
    }
}
