use std::sync::Arc;
use std::time::Duration;

use tabrelay_agent::{
    AgentSession, Browser, CdpBrowser, CommandExecutor, StateStore, Supervisor, TabWatcher,
};
use tabrelay_core::{Config, Paths, TabId};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub async fn run(
    bridge_url: Option<String>,
    cdp_port: Option<u16>,
    attach: Vec<TabId>,
    attach_all: bool,
) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::load_or_default(&paths)?;
    if let Some(url) = bridge_url {
        config.agent.bridge_url = url;
    }
    if let Some(port) = cdp_port {
        config.agent.cdp_port = port;
    }

    let browser: Arc<dyn Browser> = Arc::new(CdpBrowser::new(config.agent.cdp_port));
    let session = Arc::new(AgentSession::open(StateStore::new(paths.agent_state_file())).await?);

    let mut to_attach = attach;
    if attach_all {
        match browser.list_pages().await {
            Ok(pages) => to_attach.extend(pages.into_iter().map(|p| p.id)),
            Err(e) => warn!(error = %e, "Could not list pages for --attach-all"),
        }
    }
    for tab_id in to_attach {
        match browser.get_tab(tab_id).await {
            Ok(tab) => {
                session.attach_tab(tab_id).await?;
                info!(tab_id, url = %tab.url, "Attached at start-up");
            }
            Err(e) => warn!(tab_id, error = %e, "Skipping tab"),
        }
    }

    let executor = Arc::new(CommandExecutor::new(
        session.clone(),
        browser.clone(),
        config.automation.clone(),
    ));
    let supervisor = Arc::new(Supervisor::new(&config.agent, executor));
    let watcher = TabWatcher::new(
        session.clone(),
        browser,
        Duration::from_secs(config.agent.liveness_interval_secs.max(1)),
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let supervisor_handle = tokio::spawn(supervisor.clone().run(shutdown_tx.subscribe()));
    let watcher_handle = tokio::spawn(watcher.run(shutdown_tx.subscribe()));
    let hangup_handle = tokio::spawn(reconnect_on_hangup(supervisor.clone()));

    let state = session.snapshot().await;
    println!("tabrelay agent");
    println!("  bridge   : {}", config.agent.bridge_url);
    println!("  cdp port : {}", config.agent.cdp_port);
    println!("  attached : {:?} (active {:?})", state.attached_tab_ids, state.active_tab_id);
    #[cfg(unix)]
    println!("  send SIGHUP to reconnect immediately");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    hangup_handle.abort();

    for (name, handle) in [("supervisor", supervisor_handle), ("watcher", watcher_handle)] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    Ok(())
}

/// SIGHUP skips the reconnect backoff.
#[cfg(unix)]
async fn reconnect_on_hangup(supervisor: Arc<Supervisor>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        info!(link = ?supervisor.link_state(), "SIGHUP received, reconnecting now");
        supervisor.reconnect_now();
    }
}

#[cfg(not(unix))]
async fn reconnect_on_hangup(_supervisor: Arc<Supervisor>) {}
