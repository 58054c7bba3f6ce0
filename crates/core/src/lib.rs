pub mod config;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod session;

pub use config::{AgentConfig, AutomationConfig, BridgeConfig, Config};
pub use error::{Error, Result};
pub use paths::Paths;
pub use protocol::{
    AgentFrame, Command, PostOutcome, Reply, RequestFrame, ResponseFrame, SessionEvent, TabEntry,
    TabId,
};
pub use session::SessionState;
