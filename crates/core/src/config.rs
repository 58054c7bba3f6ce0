use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_host")]
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    /// WebSocket path the agent connects to.
    #[serde(default = "default_relay_path")]
    pub path: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_eval_timeout_ms")]
    pub eval_timeout_ms: u64,
    /// Post drives a real UI, so it gets a much larger budget.
    #[serde(default = "default_post_timeout_ms")]
    pub post_timeout_ms: u64,
}

fn default_bridge_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bridge_port() -> u16 {
    18793
}

fn default_relay_path() -> String {
    "/relay".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_eval_timeout_ms() -> u64 {
    10000
}

fn default_post_timeout_ms() -> u64 {
    20000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_bridge_host(),
            port: default_bridge_port(),
            path: default_relay_path(),
            default_timeout_ms: default_timeout_ms(),
            eval_timeout_ms: default_eval_timeout_ms(),
            post_timeout_ms: default_post_timeout_ms(),
        }
    }
}

impl BridgeConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }

    pub fn post_timeout(&self) -> Duration {
        Duration::from_millis(self.post_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
    /// Period of the liveness tick that re-announces or forces a reconnect.
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    /// Chrome remote-debugging port.
    #[serde(default = "default_cdp_port")]
    pub cdp_port: u16,
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:18793/relay".to_string()
}

fn default_backoff_floor_ms() -> u64 {
    1500
}

fn default_backoff_ceiling_ms() -> u64 {
    30000
}

fn default_liveness_interval_secs() -> u64 {
    30
}

fn default_cdp_port() -> u16 {
    9222
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            liveness_interval_secs: default_liveness_interval_secs(),
            cdp_port: default_cdp_port(),
        }
    }
}

/// Post automation tuning. Selector lists are tried in order, first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    /// Where the composer lives.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    /// A tab whose location starts with this is already on the site.
    #[serde(default = "default_site_prefix")]
    pub site_prefix: String,
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_composer_settle_ms")]
    pub composer_settle_ms: u64,
    #[serde(default = "default_insert_settle_ms")]
    pub insert_settle_ms: u64,
    #[serde(default = "default_composer_selectors")]
    pub composer_selectors: Vec<String>,
    #[serde(default = "default_input_selectors")]
    pub input_selectors: Vec<String>,
    #[serde(default = "default_submit_selectors")]
    pub submit_selectors: Vec<String>,
    /// Extra whole-sequence attempts after an un-posted outcome. 0 disables retries.
    #[serde(default)]
    pub post_retries: u32,
}

fn default_site_url() -> String {
    "https://x.com/home".to_string()
}

fn default_site_prefix() -> String {
    "https://x.com".to_string()
}

fn default_load_timeout_ms() -> u64 {
    12000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_composer_settle_ms() -> u64 {
    700
}

fn default_insert_settle_ms() -> u64 {
    400
}

fn default_composer_selectors() -> Vec<String> {
    vec![
        "a[data-testid='SideNav_NewTweet_Button']".to_string(),
        "a[href='/compose/post']".to_string(),
    ]
}

fn default_input_selectors() -> Vec<String> {
    vec![
        "div[role='dialog'] div[role='textbox'][contenteditable='true']".to_string(),
        "div[data-testid='tweetTextarea_0']".to_string(),
        "div[role='textbox'][contenteditable='true']".to_string(),
    ]
}

fn default_submit_selectors() -> Vec<String> {
    vec![
        "div[role='dialog'] button[data-testid='tweetButton']".to_string(),
        "button[data-testid='tweetButton']".to_string(),
        "button[data-testid='tweetButtonInline']".to_string(),
    ]
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            site_url: default_site_url(),
            site_prefix: default_site_prefix(),
            load_timeout_ms: default_load_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            composer_settle_ms: default_composer_settle_ms(),
            insert_settle_ms: default_insert_settle_ms(),
            composer_selectors: default_composer_selectors(),
            input_selectors: default_input_selectors(),
            submit_selectors: default_submit_selectors(),
            post_retries: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The bind address for the bridge server.
    pub fn bridge_addr(&self) -> String {
        format!("{}:{}", self.bridge.host, self.bridge.port)
    }
}
