//! Persisted agent session record.
//!
//! The file holds a single JSON object keyed by the schema tag, so a future
//! layout can live next to (and migrate from) this one.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tabrelay_core::{Result, SessionState};
use tracing::{debug, warn};

pub const STATE_KEY: &str = "tabRelayStateV1";

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, or a default one if the file or key is absent.
    ///
    /// `connected` always starts false: no link exists yet at load time.
    pub async fn load(&self) -> Result<SessionState> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "No persisted agent state, starting empty");
            return Ok(SessionState::default());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        let root: Map<String, Value> = serde_json::from_str(&content)?;
        let mut state = match root.get(STATE_KEY) {
            Some(record) => serde_json::from_value::<SessionState>(record.clone())?,
            None => {
                warn!(path = %self.path.display(), key = STATE_KEY, "State file has no current record, starting empty");
                SessionState::default()
            }
        };
        state.normalize();
        state.connected = false;
        Ok(state)
    }

    /// Rewrite the record. Writes a sibling temp file then renames over the
    /// original so a crash never leaves a truncated record.
    pub async fn save(&self, state: &SessionState) -> Result<()> {
        let mut root = Map::new();
        root.insert(STATE_KEY.to_string(), serde_json::to_value(state)?);
        let content = serde_json::to_string_pretty(&Value::Object(root))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
