//! Correlation table: request id → waiting caller.
//!
//! An entry is removed exactly once. Whoever removes it (response, timeout,
//! link loss) owns the settlement; every later attempt finds nothing and is a
//! no-op. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tabrelay_core::{Error, Reply, Result};
use tokio::sync::oneshot;
use tracing::debug;

pub type Settlement = Result<Reply>;

/// A caller waiting for its reply.
pub struct PendingRequest {
    pub id: String,
    /// The link the request went out on.
    pub link_id: u64,
    pub command: &'static str,
    pub created_at: Instant,
    tx: oneshot::Sender<Settlement>,
}

#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for a request sent on `link_id`. Returns `None` if
    /// `id` is already pending.
    pub fn register(
        &self,
        id: &str,
        link_id: u64,
        command: &'static str,
    ) -> Option<oneshot::Receiver<Settlement>> {
        let mut entries = self.entries();
        if entries.contains_key(id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            id.to_string(),
            PendingRequest {
                id: id.to_string(),
                link_id,
                command,
                created_at: Instant::now(),
                tx,
            },
        );
        Some(rx)
    }

    /// Settle with an agent reply. Error frames reject the caller.
    pub fn resolve(&self, id: &str, reply: Reply) -> bool {
        let settlement = match reply {
            Reply::Error { error } => Err(Error::RemoteError(error)),
            other => Ok(other),
        };
        self.settle(id, settlement)
    }

    pub fn reject(&self, id: &str, error: Error) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &str, settlement: Settlement) -> bool {
        let Some(entry) = self.entries().remove(id) else {
            debug!(request_id = %id, "No pending request for settlement, discarding");
            return false;
        };
        // The caller may already have gone away; its loss.
        let _ = entry.tx.send(settlement);
        true
    }

    /// Drop an entry without settling it (the caller stopped waiting).
    pub fn remove(&self, id: &str) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Reject every caller waiting on `link_id`. Returns how many were failed.
    pub fn fail_link(&self, link_id: u64, make_error: impl Fn() -> Error) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut entries = self.entries();
            let ids: Vec<String> = entries
                .values()
                .filter(|p| p.link_id == link_id)
                .map(|p| p.id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            debug!(
                request_id = %entry.id,
                command = entry.command,
                link_id,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                "Failing pending request"
            );
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Removes its entry when dropped, so a caller that stops waiting
/// (timeout or cancellation) never leaves a stale entry behind.
pub(crate) struct PendingGuard<'a> {
    pub(crate) table: &'a CorrelationTable,
    pub(crate) id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}
