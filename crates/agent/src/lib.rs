//! Agent side of the relay: holds the attached tabs, keeps the link to the
//! bridge up, and executes commands against a DevTools-enabled browser.

pub mod automation;
pub mod browser;
pub mod cdp;
pub mod control;
pub mod executor;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use automation::{PostSequencer, PostStep};
pub use browser::{Browser, DebugSession, TabInfo};
pub use cdp::{tab_id_for_target, CdpBrowser};
pub use control::{ControlGuard, ControlRegistry};
pub use executor::CommandExecutor;
pub use session::{AgentSession, Outbox};
pub use store::StateStore;
pub use supervisor::{Backoff, LinkState, Supervisor};
pub use watcher::TabWatcher;
