//! Control-plane side of the relay: correlates requests sent over the agent
//! link with their replies and serves the HTTP control API.

pub mod bridge;
pub mod link;
pub mod pending;
pub mod server;

pub use bridge::Bridge;
pub use link::{LinkHandle, TransportLink};
pub use pending::CorrelationTable;
