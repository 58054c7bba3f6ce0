use std::sync::Arc;

use tabrelay_bridge::{server, Bridge};
use tabrelay_core::{Config, Paths};
use tokio::sync::broadcast;
use tracing::info;

pub async fn run(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    if let Some(host) = host {
        config.bridge.host = host;
    }
    if let Some(port) = port {
        config.bridge.port = port;
    }

    let bridge = Arc::new(Bridge::new(config.bridge.clone()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    println!("tabrelay bridge");
    println!("  control API : http://{}/api", config.bridge_addr());
    println!("  agent relay : ws://{}{}", config.bridge_addr(), config.bridge.path);

    let server = server::serve(bridge, shutdown_tx.subscribe());
    tokio::pin!(server);

    tokio::select! {
        // Bind failures and the like end the server before any signal.
        result = &mut server => return result.map_err(Into::into),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    }

    server.await?;
    Ok(())
}
