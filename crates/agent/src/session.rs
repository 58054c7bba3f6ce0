//! The agent's session object: attachment state, its persisted copy, and the
//! outbound side of the current bridge link.
//!
//! Every mutation goes through [`AgentSession::apply`], which persists the new
//! state before releasing the lock, so the file never lags behind memory.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tabrelay_core::{protocol, Error, Result, SessionEvent, SessionState, TabId};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::store::StateStore;

/// Best-effort sender for the current link. Frames sent while no link is up are dropped.
#[derive(Clone, Default)]
pub struct Outbox {
    tx: Arc<StdMutex<Option<mpsc::Sender<String>>>>,
}

impl Outbox {
    pub fn install(&self, tx: mpsc::Sender<String>) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    pub fn clear(&self) {
        *self.tx.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_open(&self) -> bool {
        self.sender().is_some()
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }

    /// Returns false if the frame could not be queued.
    pub async fn send<T: Serialize>(&self, frame: &T) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        match protocol::encode(frame) {
            Ok(text) => tx.send(text).await.is_ok(),
            Err(e) => {
                debug!(error = %e, "Failed to encode outbound frame");
                false
            }
        }
    }
}

pub struct AgentSession {
    state: Mutex<SessionState>,
    store: StateStore,
    outbox: Outbox,
}

impl AgentSession {
    /// Load persisted state (or start empty).
    pub async fn open(store: StateStore) -> Result<Self> {
        let state = store.load().await?;
        info!(
            attached = state.attached_tab_ids.len(),
            active = ?state.active_tab_id,
            "Agent session loaded"
        );
        Ok(Self {
            state: Mutex::new(state),
            store,
            outbox: Outbox::default(),
        })
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Run a mutation on a copy, persist the copy, then publish it. If the
    /// mutation or the write fails, memory and disk both keep the old state.
    pub async fn apply<R>(
        &self,
        mutate: impl FnOnce(&mut SessionState) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = mutate(&mut next)?;
        debug_assert!(next.invariants_hold(), "session invariant broken: {:?}", next);
        self.store.save(&next).await?;
        *state = next;
        Ok(out)
    }

    pub async fn attach_tab(&self, tab_id: TabId) -> Result<bool> {
        let added = self.apply(|s| Ok(s.attach(tab_id))).await?;
        if added {
            info!(tab_id, "Tab attached");
        }
        self.outbox.send(&SessionEvent::TabAttached { tab_id }).await;
        Ok(added)
    }

    pub async fn detach_tab(&self, tab_id: TabId) -> Result<bool> {
        let removed = self.apply(|s| Ok(s.detach(tab_id))).await?;
        if removed {
            info!(tab_id, "Tab detached");
            self.outbox.send(&SessionEvent::TabDetached { tab_id }).await;
        }
        Ok(removed)
    }

    /// Make an attached tab active. Never attaches implicitly.
    pub async fn set_active_tab(&self, tab_id: TabId) -> Result<()> {
        self.apply(|s| {
            if s.set_active(tab_id) {
                Ok(())
            } else {
                Err(Error::TabNotAttached(tab_id))
            }
        })
        .await?;
        self.outbox
            .send(&SessionEvent::ActiveTabChanged {
                tab_id: Some(tab_id),
            })
            .await;
        Ok(())
    }

    /// Attach if needed, then make active.
    pub async fn activate_tab(&self, tab_id: TabId) -> Result<()> {
        let added = self
            .apply(|s| {
                let added = s.attach(tab_id);
                s.set_active(tab_id);
                Ok(added)
            })
            .await?;
        if added {
            self.outbox.send(&SessionEvent::TabAttached { tab_id }).await;
        }
        self.outbox
            .send(&SessionEvent::ActiveTabChanged {
                tab_id: Some(tab_id),
            })
            .await;
        Ok(())
    }

    /// The browser reported the tab closed.
    pub async fn tab_removed(&self, tab_id: TabId) -> Result<()> {
        if self.state.lock().await.is_attached(tab_id) {
            self.detach_tab(tab_id).await?;
        }
        Ok(())
    }

    pub async fn mark_connected(&self) -> Result<()> {
        self.apply(|s| {
            s.connected = true;
            s.last_error = None;
            s.last_seen_at = Some(Utc::now());
            Ok(())
        })
        .await
    }

    pub async fn mark_disconnected(&self, error: Option<String>) -> Result<()> {
        self.apply(|s| {
            s.connected = false;
            if error.is_some() {
                s.last_error = error;
            }
            Ok(())
        })
        .await
    }

    /// Announce the current attachment state over the link.
    pub async fn announce(&self) -> bool {
        let hello = self.state.lock().await.hello();
        self.outbox.send(&hello).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabrelay_core::protocol::AgentFrame;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> AgentSession {
        AgentSession::open(StateStore::new(dir.path().join("agent-state.json")))
            .await
            .unwrap()
    }

    fn drain_events(rx: &mut mpsc::Receiver<String>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(text) = rx.try_recv() {
            match AgentFrame::decode(&text).unwrap() {
                AgentFrame::Event(e) => events.push(e),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        events
    }

    #[tokio::test]
    async fn test_mutations_persist_across_restart() {
        let dir = TempDir::new().unwrap();
        {
            let session = open(&dir).await;
            session.attach_tab(7).await.unwrap();
            session.attach_tab(9).await.unwrap();
            session.attach_tab(12).await.unwrap();
            session.set_active_tab(9).await.unwrap();
            session.detach_tab(9).await.unwrap();
        }
        let session = open(&dir).await;
        let state = session.snapshot().await;
        assert_eq!(state.attached_tab_ids, vec![7, 12]);
        assert_eq!(state.active_tab_id, Some(7));
    }

    #[tokio::test]
    async fn test_set_active_on_unattached_tab_is_rejected() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir).await;
        session.attach_tab(1).await.unwrap();
        let err = session.set_active_tab(5).await.unwrap_err();
        assert!(matches!(err, Error::TabNotAttached(5)));
        assert_eq!(session.snapshot().await.active_tab_id, Some(1));
    }

    #[tokio::test]
    async fn test_events_go_out_on_the_link() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir).await;
        let (tx, mut rx) = mpsc::channel(16);
        session.outbox().install(tx);

        session.activate_tab(3).await.unwrap();
        session.attach_tab(4).await.unwrap();
        session.tab_removed(3).await.unwrap();
        session.tab_removed(99).await.unwrap();
        assert!(session.announce().await);

        let events = drain_events(&mut rx);
        assert_eq!(
            events,
            vec![
                SessionEvent::TabAttached { tab_id: 3 },
                SessionEvent::ActiveTabChanged { tab_id: Some(3) },
                SessionEvent::TabAttached { tab_id: 4 },
                SessionEvent::TabDetached { tab_id: 3 },
                SessionEvent::Hello {
                    source: Some(protocol::AGENT_SOURCE.to_string()),
                    attached_tab_ids: vec![4],
                    active_tab_id: Some(4),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_sending_without_link_is_dropped() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir).await;
        assert!(!session.outbox().is_open());
        assert!(!session.announce().await);
        session.attach_tab(2).await.unwrap();
        assert_eq!(session.snapshot().await.attached_tab_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir).await;
        let (tx, mut rx) = mpsc::channel(16);
        session.outbox().install(tx);
        session.attach_tab(1).await.unwrap();
        drain_events(&mut rx);

        // A directory where the temp file goes makes every write fail.
        std::fs::create_dir(dir.path().join("agent-state.json.tmp")).unwrap();
        assert!(session.attach_tab(5).await.is_err());
        assert!(session.activate_tab(6).await.is_err());

        let state = session.snapshot().await;
        assert_eq!(state.attached_tab_ids, vec![1]);
        assert_eq!(state.active_tab_id, Some(1));
        assert!(drain_events(&mut rx).is_empty());

        std::fs::remove_dir(dir.path().join("agent-state.json.tmp")).unwrap();
        let reopened = open(&dir).await;
        assert_eq!(reopened.snapshot().await.attached_tab_ids, vec![1]);
    }

    #[tokio::test]
    async fn test_announce_does_not_touch_state() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir).await;
        session.attach_tab(3).await.unwrap();
        let (tx, _rx) = mpsc::channel(16);
        session.outbox().install(tx);

        let before = session.snapshot().await;
        assert!(session.announce().await);
        assert_eq!(session.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_connection_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let session = open(&dir).await;
        session
            .mark_disconnected(Some("bridge connection error".into()))
            .await
            .unwrap();
        let state = session.snapshot().await;
        assert!(!state.connected);
        assert_eq!(state.last_error.as_deref(), Some("bridge connection error"));

        session.mark_connected().await.unwrap();
        let state = session.snapshot().await;
        assert!(state.connected);
        assert!(state.last_error.is_none());
        assert!(state.last_seen_at.is_some());

        session.mark_disconnected(None).await.unwrap();
        assert!(!session.snapshot().await.connected);
    }
}
