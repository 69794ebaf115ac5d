pub mod registry;

pub use registry::NodeRegistry;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheAdapter, CacheOptions},
    common::{
        Result,
        types::{GuildId, SessionId},
    },
    events::{EventEmitter, LunalinkEvent},
    player::Player,
    protocol::{IncomingMessage, NodeEvent, NodeStats},
    rest::RestClient,
};

/// Connection lifecycle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Construction-time options for one node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Unique name within a registry; a UUID is assigned when omitted.
    pub identifier: Option<String>,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub secure: bool,
    /// Region tags used by `best_node` region filtering.
    pub regions: Vec<String>,
    /// Reconnect attempts before the node settles into `Disconnected`.
    pub retry_amount: u32,
    /// Fixed delay between reconnect attempts.
    pub retry_delay: Duration,
    /// When set, session resuming is enabled on the node after `ready`.
    pub resume_timeout_secs: Option<u64>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            identifier: None,
            host: "localhost".to_string(),
            port: 2333,
            password: "youshallnotpass".to_string(),
            secure: false,
            regions: Vec::new(),
            retry_amount: 5,
            retry_delay: Duration::from_secs(5),
            resume_timeout_secs: None,
        }
    }
}

enum ConnectOutcome {
    Shutdown,
    Reconnect,
}

/// A persistent control connection to one processing node.
///
/// Owns the WebSocket session, its reconnect loop and the dispatch of
/// inbound frames into player state transitions. All mutations issued back
/// to the node go through the embedded [`RestClient`].
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    identifier: String,
    options: NodeOptions,
    state: RwLock<NodeState>,
    /// Cumulative over the node lifetime; a successful reconnect does not
    /// reset it, so the total retry budget can silently run out.
    reconnect_attempts: AtomicU32,
    rest: RestClient,
    stats: RwLock<Option<NodeStats>>,
    info: RwLock<Option<Value>>,
    emitter: EventEmitter,
    players: Arc<DashMap<GuildId, Player>>,
    user_id: RwLock<Option<String>>,
    client_name: String,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(
        identifier: String,
        options: NodeOptions,
        emitter: EventEmitter,
        players: Arc<DashMap<GuildId, Player>>,
        cache: Arc<dyn CacheAdapter>,
        cache_options: CacheOptions,
        client_name: String,
    ) -> Result<Self> {
        let rest = RestClient::new(
            &identifier,
            &options.host,
            options.port,
            options.secure,
            &options.password,
            cache,
            cache_options,
        )?;
        Ok(Self {
            inner: Arc::new(NodeInner {
                identifier,
                options,
                state: RwLock::new(NodeState::Disconnected),
                reconnect_attempts: AtomicU32::new(0),
                rest,
                stats: RwLock::new(None),
                info: RwLock::new(None),
                emitter,
                players,
                user_id: RwLock::new(None),
                client_name,
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Connected
    }

    pub fn regions(&self) -> &[String] {
        &self.inner.options.regions
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.inner.stats.read().clone()
    }

    /// Capability info fetched from `/v4/info` after the ready handshake.
    pub fn info(&self) -> Option<Value> {
        self.inner.info.read().clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.rest.session_id()
    }

    pub fn rest(&self) -> &RestClient {
        &self.inner.rest
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: NodeState) {
        *self.inner.state.write() = state;
    }

    fn emit(&self, event: LunalinkEvent) {
        self.inner.emitter.emit(event);
    }

    /// Opens the WebSocket session and spawns the connection loop.
    pub fn connect(&self, user_id: &str) {
        {
            let mut stored = self.inner.user_id.write();
            *stored = Some(user_id.to_string());
        }
        // Claim the state under the write guard so a racing connect()
        // cannot spawn a second loop for the same node.
        {
            let mut state = self.inner.state.write();
            if matches!(*state, NodeState::Connecting | NodeState::Connected) {
                return;
            }
            *state = NodeState::Connecting;
        }
        let node = self.clone();
        tokio::spawn(async move { node.run().await });
    }

    async fn run(self) {
        loop {
            if self.inner.cancel.is_cancelled() {
                return;
            }
            self.set_state(NodeState::Connecting);

            match self.connect_once().await {
                ConnectOutcome::Shutdown => {
                    debug!("[{}] connection loop shutting down", self.identifier());
                    return;
                }
                ConnectOutcome::Reconnect => {
                    let attempt = self.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt > self.inner.options.retry_amount {
                        warn!(
                            "[{}] retry budget exhausted after {} attempts, settling disconnected",
                            self.identifier(),
                            attempt - 1
                        );
                        self.set_state(NodeState::Disconnected);
                        return;
                    }
                    self.set_state(NodeState::Disconnected);
                    self.emit(LunalinkEvent::NodeReconnect {
                        identifier: self.identifier().to_string(),
                        attempt,
                    });
                    debug!(
                        "[{}] reconnecting in {:?} (attempt {}/{})",
                        self.identifier(),
                        self.inner.options.retry_delay,
                        attempt,
                        self.inner.options.retry_amount
                    );
                    tokio::select! {
                        _ = self.inner.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.inner.options.retry_delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> ConnectOutcome {
        let scheme = if self.inner.options.secure { "wss" } else { "ws" };
        let url = format!(
            "{}://{}:{}/v4/websocket",
            scheme, self.inner.options.host, self.inner.options.port
        );
        debug!("[{}] connecting to {}", self.identifier(), url);

        let request = match self.client_request(&url) {
            Ok(request) => request,
            Err(message) => {
                self.emit(LunalinkEvent::NodeError {
                    identifier: self.identifier().to_string(),
                    message,
                });
                return ConnectOutcome::Reconnect;
            }
        };

        let (ws_stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(pair) => pair,
            Err(e) => {
                self.emit(LunalinkEvent::NodeError {
                    identifier: self.identifier().to_string(),
                    message: format!("connect failed: {}", e),
                });
                return ConnectOutcome::Reconnect;
            }
        };

        self.set_state(NodeState::Connected);
        info!("[{}] connected", self.identifier());
        self.emit(LunalinkEvent::NodeConnected {
            identifier: self.identifier().to_string(),
        });

        let (_, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    return ConnectOutcome::Shutdown;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(text.as_str()).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|cf| (cf.code.into(), cf.reason.to_string()))
                                .unwrap_or((1000u16, "no reason".to_string()));
                            info!(
                                "[{}] socket closed: code={} reason='{}'",
                                self.identifier(), code, reason
                            );
                            self.emit(LunalinkEvent::NodeDisconnect {
                                identifier: self.identifier().to_string(),
                                code,
                                reason,
                            });
                            return ConnectOutcome::Reconnect;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("[{}] socket read error: {}", self.identifier(), e);
                            self.emit(LunalinkEvent::NodeError {
                                identifier: self.identifier().to_string(),
                                message: format!("socket error: {}", e),
                            });
                            self.emit(LunalinkEvent::NodeDisconnect {
                                identifier: self.identifier().to_string(),
                                code: 1006,
                                reason: format!("io error: {}", e),
                            });
                            return ConnectOutcome::Reconnect;
                        }
                        None => {
                            debug!("[{}] socket stream ended", self.identifier());
                            self.emit(LunalinkEvent::NodeDisconnect {
                                identifier: self.identifier().to_string(),
                                code: 1000,
                                reason: "stream ended".to_string(),
                            });
                            return ConnectOutcome::Reconnect;
                        }
                    }
                }
            }
        }
    }

    fn client_request(
        &self,
        url: &str,
    ) -> std::result::Result<tokio_tungstenite::tungstenite::handshake::client::Request, String>
    {
        let mut request = url
            .into_client_request()
            .map_err(|e| format!("bad node url: {}", e))?;
        let headers = request.headers_mut();
        let user_id = self
            .inner
            .user_id
            .read()
            .clone()
            .ok_or_else(|| "connect called before init".to_string())?;

        let insert = |headers: &mut tokio_tungstenite::tungstenite::http::HeaderMap,
                      name: &'static str,
                      value: &str|
         -> std::result::Result<(), String> {
            let value = value
                .parse()
                .map_err(|_| format!("invalid header value for {}", name))?;
            headers.insert(name, value);
            Ok(())
        };
        insert(headers, "Authorization", &self.inner.options.password)?;
        insert(headers, "User-Id", &user_id)?;
        insert(headers, "Client-Name", &self.inner.client_name)?;
        if let Some(session_id) = self.session_id() {
            insert(headers, "Session-Id", &session_id)?;
        }
        Ok(request)
    }

    /// Parses and dispatches one inbound frame. Malformed frames surface as
    /// a `nodeError` notification; the connection stays up.
    async fn handle_frame(&self, text: &str) {
        let message: IncomingMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] malformed frame: {} - {}", self.identifier(), e, text);
                self.emit(LunalinkEvent::NodeError {
                    identifier: self.identifier().to_string(),
                    message: format!("malformed frame: {}", e),
                });
                return;
            }
        };

        match message {
            IncomingMessage::Ready {
                resumed,
                session_id,
            } => self.handle_ready(resumed, session_id),
            IncomingMessage::Stats(stats) => {
                *self.inner.stats.write() = Some(stats);
            }
            IncomingMessage::PlayerUpdate { guild_id, state } => {
                if let Some(player) = self.lookup_player(&guild_id) {
                    player.sync_update(&state);
                }
            }
            IncomingMessage::Event(event) => self.handle_event(event).await,
        }
    }

    fn handle_ready(&self, resumed: bool, session_id: SessionId) {
        info!(
            "[{}] ready, session={} resumed={}",
            self.identifier(),
            session_id,
            resumed
        );
        self.inner.rest.set_session_id(session_id.clone());
        self.emit(LunalinkEvent::NodeReady {
            identifier: self.identifier().to_string(),
            session_id: session_id.to_string(),
            resumed,
        });

        // Capability info and resume configuration happen off the read loop.
        let node = self.clone();
        tokio::spawn(async move {
            match node.inner.rest.get_info().await {
                Ok(info) => *node.inner.info.write() = Some(info),
                Err(e) => {
                    node.emit(LunalinkEvent::NodeError {
                        identifier: node.identifier().to_string(),
                        message: format!("info fetch failed: {}", e),
                    });
                }
            }
            if let Some(timeout) = node.inner.options.resume_timeout_secs {
                if let Err(e) = node.inner.rest.update_session(true, timeout).await {
                    warn!("[{}] resume configuration failed: {}", node.identifier(), e);
                }
            }
        });
    }

    async fn handle_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::TrackStart { guild_id, track } => {
                if let Some(player) = self.lookup_player(&guild_id) {
                    player.handle_track_start(track);
                }
            }
            NodeEvent::TrackEnd {
                guild_id,
                track,
                reason,
            } => {
                if let Some(player) = self.lookup_player(&guild_id) {
                    player.handle_track_end(track, reason).await;
                }
            }
            NodeEvent::TrackStuck {
                guild_id,
                track,
                threshold_ms,
            } => {
                self.emit(LunalinkEvent::TrackStuck {
                    guild_id,
                    track,
                    threshold_ms,
                });
            }
            NodeEvent::TrackException {
                guild_id,
                track,
                exception,
            } => {
                self.emit(LunalinkEvent::TrackException {
                    guild_id,
                    track,
                    exception,
                });
            }
            NodeEvent::WebSocketClosed {
                guild_id,
                code,
                reason,
                by_remote,
            } => {
                self.emit(LunalinkEvent::SocketClosed {
                    guild_id,
                    code,
                    reason,
                    by_remote,
                });
            }
        }
    }

    fn lookup_player(&self, guild_id: &GuildId) -> Option<Player> {
        let player = self.inner.players.get(guild_id).map(|p| p.clone());
        if player.is_none() {
            debug!("[{}] frame for unknown guild {}", self.identifier(), guild_id);
        }
        player
    }

    /// Closes the transport and suppresses any further reconnection.
    pub fn destroy(&self) {
        self.set_state(NodeState::Disconnecting);
        self.inner.cancel.cancel();
        self.set_state(NodeState::Disconnected);
        self.emit(LunalinkEvent::NodeDestroy {
            identifier: self.identifier().to_string(),
        });
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identifier", &self.inner.identifier)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn node(retry_amount: u32) -> (Node, UnboundedReceiver<LunalinkEvent>) {
        let (emitter, rx) = EventEmitter::channel();
        let cache = Arc::new(MemoryCache::new(CacheOptions::default(), emitter.clone()));
        let node = Node::new(
            "test".to_string(),
            NodeOptions {
                identifier: Some("test".to_string()),
                host: "127.0.0.1".to_string(),
                // Nothing listens here; every connect attempt is refused.
                port: 1,
                retry_amount,
                retry_delay: Duration::from_millis(10),
                ..Default::default()
            },
            emitter,
            Arc::new(DashMap::new()),
            cache,
            CacheOptions::default(),
            "lunalink/test".to_string(),
        )
        .unwrap();
        (node, rx)
    }

    async fn wait_disconnected(node: &Node) {
        for _ in 0..200 {
            // run() flips through Connecting; wait for the loop to exit.
            if node.state() == NodeState::Disconnected && node.reconnect_attempts() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never settled into Disconnected");
    }

    fn drain(rx: &mut UnboundedReceiver<LunalinkEvent>) -> Vec<LunalinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn retry_exhaustion_settles_disconnected() {
        let (node, mut rx) = node(2);
        node.connect("10001");
        wait_disconnected(&node).await;
        // Give any stray timer a chance to fire before draining.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain(&mut rx);
        let reconnects = events
            .iter()
            .filter(|e| matches!(e, LunalinkEvent::NodeReconnect { .. }))
            .count();
        assert_eq!(reconnects, 2, "one per attempt within the budget");
        assert_eq!(node.state(), NodeState::Disconnected);
        assert_eq!(node.reconnect_attempts(), 3, "counter is never reset");
    }

    #[tokio::test]
    async fn zero_retry_budget_emits_no_reconnect_events() {
        let (node, mut rx) = node(0);
        node.connect("10001");
        wait_disconnected(&node).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .all(|e| !matches!(e, LunalinkEvent::NodeReconnect { .. })),
            "no reconnect is announced once the budget is gone"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, LunalinkEvent::NodeError { .. })));
    }

    #[tokio::test]
    async fn connect_claims_the_state_before_spawning() {
        let (node, _rx) = node(0);
        node.connect("10001");
        // The claim happens synchronously, before the loop task first runs.
        assert_eq!(node.state(), NodeState::Connecting);

        // A second call while a loop is already claimed is a no-op.
        node.connect("10001");
        wait_disconnected(&node).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            node.reconnect_attempts(),
            1,
            "exactly one connection loop ran"
        );
    }

    #[tokio::test]
    async fn malformed_frame_surfaces_as_node_error() {
        let (node, mut rx) = node(0);
        node.handle_frame("{not json").await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, LunalinkEvent::NodeError { .. })));
    }

    #[tokio::test]
    async fn ready_frame_captures_the_session() {
        let (node, mut rx) = node(0);
        node.handle_frame(r#"{"op":"ready","resumed":false,"sessionId":"abc123"}"#)
            .await;

        assert_eq!(node.session_id().map(|s| s.to_string()), Some("abc123".to_string()));
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            LunalinkEvent::NodeReady { session_id, resumed: false, .. } if session_id == "abc123"
        )));
    }

    #[tokio::test]
    async fn stats_frame_replaces_node_statistics() {
        let (node, _rx) = node(0);
        assert!(node.stats().is_none());
        node.handle_frame(
            r#"{"op":"stats","players":3,"playingPlayers":2,"uptime":1000,
                "memory":{"free":1,"used":2,"allocated":3,"reservable":4},
                "cpu":{"cores":8,"systemLoad":0.25,"lavalinkLoad":0.1}}"#,
        )
        .await;

        let stats = node.stats().unwrap();
        assert_eq!(stats.playing_players, 2);
    }

    #[tokio::test]
    async fn destroy_suppresses_reconnection() {
        let (node, mut rx) = node(100);
        node.connect("10001");
        tokio::time::sleep(Duration::from_millis(30)).await;
        node.destroy();
        let attempts = node.reconnect_attempts();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(node.state(), NodeState::Disconnected);
        assert!(
            node.reconnect_attempts() <= attempts + 1,
            "at most one in-flight attempt after destroy"
        );
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, LunalinkEvent::NodeDestroy { .. })));
    }
}
