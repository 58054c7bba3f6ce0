//! Keeps the agent's link to the bridge alive.
//!
//! One loop owns the whole `Disconnected -> Connecting -> Connected` cycle,
//! so at most one connection attempt is ever in flight. Incoming commands
//! run on their own tasks, so a long post never stalls `listTabs`.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tabrelay_core::{AgentConfig, RequestFrame};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::executor::CommandExecutor;
use crate::session::AgentSession;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE: usize = 256;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

type BridgeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Exponential reconnect delay between a floor and a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay before the next attempt. Doubles on every call up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

enum LinkEnd {
    Closed(Option<String>),
    Shutdown,
}

pub struct Supervisor {
    bridge_url: String,
    floor: Duration,
    ceiling: Duration,
    liveness: Duration,
    session: Arc<AgentSession>,
    executor: Arc<CommandExecutor>,
    state: watch::Sender<LinkState>,
    reconnect: Notify,
}

impl Supervisor {
    pub fn new(config: &AgentConfig, executor: Arc<CommandExecutor>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            bridge_url: config.bridge_url.clone(),
            floor: Duration::from_millis(config.backoff_floor_ms),
            ceiling: Duration::from_millis(config.backoff_ceiling_ms),
            liveness: Duration::from_secs(config.liveness_interval_secs.max(1)),
            session: executor.session().clone(),
            executor,
            state,
            reconnect: Notify::new(),
        }
    }

    pub fn session(&self) -> &Arc<AgentSession> {
        &self.session
    }

    pub fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Skip the pending backoff wait and try now. A no-op while connected.
    pub fn reconnect_now(&self) {
        self.reconnect.notify_one();
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Link state changed");
        }
    }

    async fn record_disconnect(&self, error: Option<String>) {
        if let Err(e) = self.session.mark_disconnected(error).await {
            warn!(error = %e, "Failed to persist disconnect");
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(self.floor, self.ceiling);
        let mut liveness = tokio::time::interval_at(Instant::now() + self.liveness, self.liveness);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(url = %self.bridge_url, "Reconnection supervisor starting");

        loop {
            self.set_state(LinkState::Connecting);
            let attempt = tokio::select! {
                result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.bridge_url.as_str())) => result,
                _ = shutdown.recv() => {
                    self.set_state(LinkState::Disconnected);
                    info!("Reconnection supervisor shutting down");
                    return;
                }
            };

            let failure = match attempt {
                Ok(Ok((socket, _))) => {
                    info!(url = %self.bridge_url, "Connected to bridge");
                    backoff.reset();
                    self.set_state(LinkState::Connected);
                    let end = self.run_link(socket, &mut liveness, &mut shutdown).await;
                    self.set_state(LinkState::Disconnected);
                    match end {
                        LinkEnd::Shutdown => {
                            self.record_disconnect(None).await;
                            info!("Reconnection supervisor shutting down");
                            return;
                        }
                        LinkEnd::Closed(error) => {
                            warn!(error = ?error, "Bridge link closed");
                            error
                        }
                    }
                }
                Ok(Err(e)) => Some(format!("bridge connection error: {}", e)),
                Err(_) => Some("bridge connection timed out".to_string()),
            };
            self.set_state(LinkState::Disconnected);
            self.record_disconnect(failure).await;

            let delay = backoff.next_delay();
            info!(backoff_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            if !self.wait_before_retry(delay, &mut liveness, &mut shutdown).await {
                info!("Reconnection supervisor shutting down");
                return;
            }
        }
    }

    /// Sit out the backoff. A reconnect request or a liveness tick cuts it
    /// short. Returns false on shutdown.
    async fn wait_before_retry(
        &self,
        delay: Duration,
        liveness: &mut Interval,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.reconnect.notified() => {
                info!("Reconnect requested, skipping backoff");
                true
            }
            _ = liveness.tick() => {
                debug!("Liveness tick while disconnected, forcing reconnect");
                true
            }
            _ = shutdown.recv() => false,
        }
    }

    async fn run_link(
        &self,
        socket: BridgeSocket,
        liveness: &mut Interval,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> LinkEnd {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!(error = %e, "Bridge socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.session.outbox().install(tx);
        if let Err(e) = self.session.mark_connected().await {
            warn!(error = %e, "Failed to persist connect");
        }
        self.session.announce().await;
        liveness.reset();

        let end = loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(_))) | None => break LinkEnd::Closed(None),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break LinkEnd::Closed(Some(format!("bridge connection error: {}", e))),
                },
                _ = liveness.tick() => {
                    if !self.session.announce().await {
                        break LinkEnd::Closed(Some("bridge link stalled".to_string()));
                    }
                    debug!("Liveness hello sent");
                }
                _ = self.reconnect.notified() => {
                    debug!("Reconnect requested while connected, ignoring");
                }
                _ = shutdown.recv() => break LinkEnd::Shutdown,
            }
        };

        self.session.outbox().clear();
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
        end
    }

    fn dispatch(&self, text: &str) {
        let frame = match RequestFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognised bridge frame");
                return;
            }
        };
        let executor = self.executor.clone();
        let outbox = self.session.outbox().clone();
        tokio::spawn(async move {
            let response = executor.handle(frame).await;
            if !outbox.send(&response).await {
                debug!(request_id = %response.request_id, "Link gone, response dropped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use crate::testing::{FakeBrowser, FakePage};
    use std::net::SocketAddr;
    use tabrelay_bridge::{server, Bridge};
    use tabrelay_core::{AutomationConfig, BridgeConfig, Error, PostOutcome, SessionEvent};
    use tempfile::TempDir;

    #[test]
    fn test_backoff_doubles_to_ceiling_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(1500), Duration::from_millis(30000));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![1500, 3000, 6000, 12000, 24000, 30000, 30000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1500));
    }

    #[test]
    fn test_backoff_ceiling_below_floor() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    async fn start_bridge(listener: tokio::net::TcpListener) -> (Arc<Bridge>, tokio::sync::oneshot::Sender<()>) {
        let bridge = Arc::new(Bridge::new(BridgeConfig::default()));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(server::serve_on(listener, bridge.clone(), async move {
            let _ = stop_rx.await;
        }));
        (bridge, stop_tx)
    }

    fn test_config(addr: SocketAddr) -> AgentConfig {
        AgentConfig {
            bridge_url: format!("ws://{}/relay", addr),
            backoff_floor_ms: 50,
            backoff_ceiling_ms: 200,
            ..AgentConfig::default()
        }
    }

    async fn agent_with(dir: &TempDir, browser: &FakeBrowser, config: AgentConfig) -> Arc<Supervisor> {
        let session = AgentSession::open(StateStore::new(dir.path().join("agent-state.json")))
            .await
            .unwrap();
        let automation = AutomationConfig {
            composer_settle_ms: 10,
            insert_settle_ms: 10,
            ..AutomationConfig::default()
        };
        let executor = Arc::new(CommandExecutor::new(
            Arc::new(session),
            Arc::new(browser.clone()),
            automation,
        ));
        Arc::new(Supervisor::new(&config, executor))
    }

    async fn agent(dir: &TempDir, browser: &FakeBrowser, addr: SocketAddr) -> Arc<Supervisor> {
        agent_with(dir, browser, test_config(addr)).await
    }

    fn free_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    async fn wait_for_failure(session: &AgentSession) {
        for _ in 0..250 {
            if session.snapshot().await.last_error.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("connection failure was not recorded");
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_end_to_end_over_loopback() {
        let dir = TempDir::new().unwrap();
        let browser = FakeBrowser::with_page(FakePage::site(7));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (bridge, stop_bridge) = start_bridge(listener).await;

        let supervisor = agent(&dir, &browser, addr).await;
        supervisor.session().attach_tab(7).await.unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(supervisor.clone().run(shutdown_rx));

        wait_for(|| bridge.is_connected() && bridge.state().attached_tab_ids == vec![7]).await;
        assert_eq!(supervisor.link_state(), LinkState::Connected);
        assert_eq!(bridge.state().active_tab_id, Some(7));

        let tabs = bridge.list_tabs().await.unwrap();
        assert_eq!(tabs.len(), 1);
        assert!(tabs[0].active);

        let err = bridge.set_active_tab(42).await.unwrap_err();
        assert!(matches!(err, Error::RemoteError(ref m) if m == "tab not attached"));

        let (outcome, listing) = tokio::join!(bridge.post(None, "hello"), bridge.list_tabs());
        assert_eq!(outcome.unwrap(), PostOutcome::posted("clicked"));
        assert_eq!(listing.unwrap().len(), 1);
        assert!(browser.calls_for(7).contains(&"insert:hello".to_string()));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        wait_for(|| !bridge.is_connected()).await;
        assert!(!supervisor.session().snapshot().await.connected);
        let _ = stop_bridge.send(());
    }

    #[tokio::test]
    async fn test_reconnect_now_skips_long_backoff() {
        let dir = TempDir::new().unwrap();
        let browser = FakeBrowser::default();
        let addr = free_addr();
        let config = AgentConfig {
            backoff_floor_ms: 60_000,
            backoff_ceiling_ms: 60_000,
            liveness_interval_secs: 600,
            ..test_config(addr)
        };

        let supervisor = agent_with(&dir, &browser, config).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(supervisor.clone().run(shutdown_rx));

        let session = supervisor.session().clone();
        wait_for_failure(&session).await;
        assert_ne!(supervisor.link_state(), LinkState::Connected);

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let (bridge, stop_bridge) = start_bridge(listener).await;
        // Without the request the next attempt is a minute away.
        supervisor.reconnect_now();

        wait_for(|| bridge.is_connected()).await;
        wait_for(|| supervisor.link_state() == LinkState::Connected).await;
        let state = session.snapshot().await;
        assert!(state.connected);
        assert!(state.last_error.is_none());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        let _ = stop_bridge.send(());
    }

    #[tokio::test]
    async fn test_liveness_tick_forces_attempt_while_disconnected() {
        let dir = TempDir::new().unwrap();
        let browser = FakeBrowser::default();
        let addr = free_addr();
        let config = AgentConfig {
            backoff_floor_ms: 60_000,
            backoff_ceiling_ms: 60_000,
            liveness_interval_secs: 1,
            ..test_config(addr)
        };

        let supervisor = agent_with(&dir, &browser, config).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(supervisor.clone().run(shutdown_rx));
        wait_for_failure(supervisor.session()).await;

        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let (bridge, stop_bridge) = start_bridge(listener).await;
        wait_for(|| bridge.is_connected()).await;
        wait_for(|| supervisor.link_state() == LinkState::Connected).await;

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        let _ = stop_bridge.send(());
    }

    #[tokio::test]
    async fn test_liveness_tick_repeats_hello_while_connected() {
        let dir = TempDir::new().unwrap();
        let browser = FakeBrowser::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = AgentConfig {
            liveness_interval_secs: 1,
            ..test_config(addr)
        };

        let supervisor = agent_with(&dir, &browser, config).await;
        supervisor.session().attach_tab(5).await.unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(supervisor.clone().run(shutdown_rx));

        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut hellos = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while hellos < 2 {
            let msg = tokio::time::timeout_at(deadline, socket.next())
                .await
                .expect("second hello not sent in time")
                .expect("socket closed")
                .unwrap();
            if let Message::Text(text) = msg {
                match tabrelay_core::protocol::AgentFrame::decode(&text).unwrap() {
                    tabrelay_core::protocol::AgentFrame::Event(SessionEvent::Hello {
                        attached_tab_ids,
                        ..
                    }) => {
                        assert_eq!(attached_tab_ids, vec![5]);
                        hellos += 1;
                    }
                    other => panic!("unexpected frame {:?}", other),
                }
            }
        }

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_wait_is_cut_short() {
        let dir = TempDir::new().unwrap();
        let supervisor = agent(&dir, &FakeBrowser::default(), free_addr()).await;
        let (shutdown_tx, mut shutdown) = broadcast::channel(1);
        let delay = Duration::from_secs(60);
        let mut liveness = tokio::time::interval_at(
            Instant::now() + Duration::from_secs(600),
            Duration::from_secs(600),
        );

        let started = Instant::now();
        assert!(supervisor.wait_before_retry(delay, &mut liveness, &mut shutdown).await);
        assert!(started.elapsed() >= delay);

        let started = Instant::now();
        supervisor.reconnect_now();
        assert!(supervisor.wait_before_retry(delay, &mut liveness, &mut shutdown).await);
        assert!(started.elapsed() < Duration::from_secs(1));

        let mut liveness = tokio::time::interval_at(
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let started = Instant::now();
        assert!(supervisor.wait_before_retry(delay, &mut liveness, &mut shutdown).await);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < delay);

        shutdown_tx.send(()).unwrap();
        assert!(!supervisor.wait_before_retry(delay, &mut liveness, &mut shutdown).await);
    }
}
