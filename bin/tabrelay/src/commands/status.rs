use std::time::Duration;

use serde_json::Value;
use tabrelay_agent::StateStore;
use tabrelay_core::{Config, Paths};

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("tabrelay status");
    println!("===============");
    println!();

    let config_path = paths.config_file();
    println!(
        "Config:  {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗ (defaults)" }
    );
    let config = Config::load_or_default(&paths)?;

    let state = StateStore::new(paths.agent_state_file()).load().await?;
    println!("State:   {}", paths.agent_state_file().display());
    println!("  attached   : {:?}", state.attached_tab_ids);
    println!("  active     : {:?}", state.active_tab_id);
    println!(
        "  last error : {}",
        state.last_error.as_deref().unwrap_or("-")
    );
    println!(
        "  last seen  : {}",
        state
            .last_seen_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!();

    let health_url = format!("http://{}/health", config.bridge_addr());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    match client.get(&health_url).send().await {
        Ok(resp) => {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let connected = body
                .get("extensionConnected")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            println!("Bridge:  {} ✓", health_url);
            println!(
                "  agent      : {}",
                if connected { "connected" } else { "not connected" }
            );
            println!(
                "  pending    : {}",
                body.get("pending").and_then(|v| v.as_u64()).unwrap_or(0)
            );
        }
        Err(_) => {
            println!("Bridge:  {} ✗ (not running)", health_url);
        }
    }

    Ok(())
}
