//! The single logical connection to the agent.
//!
//! The socket task owns the WebSocket; the link only holds the sending side
//! of its outbound queue. Each attach gets a fresh id so a stale socket
//! closing late cannot tear down its replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tabrelay_core::{protocol, Error, Result};
use tokio::sync::mpsc;

const OUTBOUND_QUEUE: usize = 256;

#[derive(Clone)]
pub struct LinkHandle {
    pub id: u64,
    tx: mpsc::Sender<String>,
}

impl LinkHandle {
    /// The socket writer is still draining this queue.
    pub fn is_usable(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn send_frame<T: Serialize>(&self, frame: &T) -> Result<()> {
        let text = protocol::encode(frame)?;
        self.tx.send(text).await.map_err(|_| Error::NotConnected)
    }
}

#[derive(Default)]
pub struct TransportLink {
    current: Mutex<Option<LinkHandle>>,
    next_id: AtomicU64,
}

impl TransportLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<LinkHandle>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a new link, replacing any previous one. The receiver yields
    /// encoded frames for the socket writer. Also returns the id of the link
    /// that was replaced, if any.
    pub fn attach(&self) -> (u64, mpsc::Receiver<String>, Option<u64>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let replaced = self.slot().replace(LinkHandle { id, tx }).map(|h| h.id);
        (id, rx, replaced)
    }

    /// Whether `id` is still the installed link.
    pub fn is_current(&self, id: u64) -> bool {
        self.slot().as_ref().map_or(false, |h| h.id == id)
    }

    /// Clear the link if `id` is still current. Returns whether it was.
    pub fn detach(&self, id: u64) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(handle) if handle.id == id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// The current link, if one exists and its writer is alive.
    pub fn current(&self) -> Option<LinkHandle> {
        self.slot().as_ref().filter(|h| h.is_usable()).cloned()
    }

    pub fn is_usable(&self) -> bool {
        self.current().is_some()
    }
}
