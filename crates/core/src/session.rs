use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{SessionEvent, TabId};

/// Tab attachment bookkeeping plus link liveness.
///
/// Invariants held after every mutation:
/// - `attached_tab_ids` has no duplicates
/// - `active_tab_id` is `None` or a member of `attached_tab_ids`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub attached_tab_ids: Vec<TabId>,
    #[serde(default)]
    pub active_tab_id: Option<TabId>,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn is_attached(&self, tab_id: TabId) -> bool {
        self.attached_tab_ids.contains(&tab_id)
    }

    /// Returns false when the tab was already attached.
    /// The first attached tab becomes active.
    pub fn attach(&mut self, tab_id: TabId) -> bool {
        let added = if self.is_attached(tab_id) {
            false
        } else {
            self.attached_tab_ids.push(tab_id);
            true
        };
        if self.active_tab_id.is_none() {
            self.active_tab_id = Some(tab_id);
        }
        added
    }

    /// Returns false when the tab was not attached. Detaching the active tab
    /// hands activity to the new first attached tab, or clears it.
    pub fn detach(&mut self, tab_id: TabId) -> bool {
        let before = self.attached_tab_ids.len();
        self.attached_tab_ids.retain(|id| *id != tab_id);
        if self.active_tab_id == Some(tab_id) {
            self.active_tab_id = self.attached_tab_ids.first().copied();
        }
        self.attached_tab_ids.len() != before
    }

    /// Only attached tabs can become active.
    pub fn set_active(&mut self, tab_id: TabId) -> bool {
        if !self.is_attached(tab_id) {
            return false;
        }
        self.active_tab_id = Some(tab_id);
        true
    }

    /// Replace the attachment set wholesale (a `hello` announcement).
    pub fn replace(&mut self, attached: Vec<TabId>, active: Option<TabId>) {
        self.attached_tab_ids = attached;
        self.active_tab_id = active;
        self.normalize();
    }

    /// Repair state loaded from an untrusted source.
    pub fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.attached_tab_ids.retain(|id| seen.insert(*id));
        if let Some(active) = self.active_tab_id {
            if !self.is_attached(active) {
                self.active_tab_id = self.attached_tab_ids.first().copied();
            }
        }
    }

    pub fn invariants_hold(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        let unique = self.attached_tab_ids.iter().all(|id| seen.insert(*id));
        let active_ok = match self.active_tab_id {
            Some(id) => self.is_attached(id),
            None => true,
        };
        unique && active_ok
    }

    /// Mirror an agent event. Used by the bridge to track the agent's view.
    pub fn apply_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Hello {
                attached_tab_ids,
                active_tab_id,
                ..
            } => {
                self.replace(attached_tab_ids.clone(), *active_tab_id);
                self.last_seen_at = Some(Utc::now());
            }
            SessionEvent::TabAttached { tab_id } => {
                self.attach(*tab_id);
            }
            SessionEvent::TabDetached { tab_id } => {
                self.detach(*tab_id);
            }
            SessionEvent::ActiveTabChanged { tab_id } => match tab_id {
                Some(id) => {
                    // The agent attaches before activating; tolerate a lost tabAttached.
                    self.attach(*id);
                    self.set_active(*id);
                }
                None => self.active_tab_id = None,
            },
        }
    }

    pub fn hello(&self) -> SessionEvent {
        SessionEvent::Hello {
            source: Some(crate::protocol::AGENT_SOURCE.to_string()),
            attached_tab_ids: self.attached_tab_ids.clone(),
            active_tab_id: self.active_tab_id,
        }
    }
}
