use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".tabrelay"))
            .unwrap_or_else(|| PathBuf::from(".tabrelay"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    /// Persisted agent session record.
    pub fn agent_state_file(&self) -> PathBuf {
        self.base.join("agent-state.json")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
