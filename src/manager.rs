use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::{
    cache::{CacheAdapter, MemoryCache},
    common::{LunalinkError, Result, types::GuildId},
    config::ManagerOptions,
    events::{EventEmitter, LunalinkEvent},
    node::{Node, NodeOptions, NodeRegistry},
    player::{AutoplayRegistry, Player, PlayerOptions, PlayerRegistry},
    protocol::LoadResult,
    rest::RestClient,
    voice::PayloadSink,
};

/// Entry point tying nodes, players, cache and event flow together.
///
/// One manager per bot process. The host wires in a [`PayloadSink`] for
/// outbound voice payloads, forwards raw gateway packets through
/// [`packet_update`](Manager::packet_update), and consumes notifications
/// from the receiver handed out by [`events`](Manager::events).
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    options: ManagerOptions,
    emitter: EventEmitter,
    events: Mutex<Option<UnboundedReceiver<LunalinkEvent>>>,
    nodes: NodeRegistry,
    players: PlayerRegistry,
    autoplay: Arc<AutoplayRegistry>,
    cache: Arc<dyn CacheAdapter>,
    user_id: RwLock<Option<String>>,
    initialized: AtomicBool,
}

impl Manager {
    /// Builds a manager over the in-memory cache backend.
    pub fn new(options: ManagerOptions, sink: Arc<dyn PayloadSink>) -> Self {
        let (emitter, rx) = EventEmitter::channel();
        let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new(
            options.cache.clone(),
            emitter.clone(),
        ));
        Self::assemble(options, sink, cache, emitter, rx)
    }

    /// Like [`new`](Manager::new), but with a host-provided cache backend.
    pub fn with_cache(
        options: ManagerOptions,
        sink: Arc<dyn PayloadSink>,
        cache: Arc<dyn CacheAdapter>,
    ) -> Self {
        let (emitter, rx) = EventEmitter::channel();
        Self::assemble(options, sink, cache, emitter, rx)
    }

    fn assemble(
        options: ManagerOptions,
        sink: Arc<dyn PayloadSink>,
        cache: Arc<dyn CacheAdapter>,
        emitter: EventEmitter,
        rx: UnboundedReceiver<LunalinkEvent>,
    ) -> Self {
        let player_map: Arc<DashMap<GuildId, Player>> = Arc::new(DashMap::new());
        let autoplay = Arc::new(AutoplayRegistry::new());
        let nodes = NodeRegistry::new(
            emitter.clone(),
            player_map.clone(),
            cache.clone(),
            options.cache.clone(),
            options.client_name.clone(),
        );
        let players = PlayerRegistry::new(
            player_map,
            emitter.clone(),
            cache.clone(),
            autoplay.clone(),
            sink,
        );
        Self {
            inner: Arc::new(ManagerInner {
                options,
                emitter,
                events: Mutex::new(Some(rx)),
                nodes,
                players,
                autoplay,
                cache,
                user_id: RwLock::new(None),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Hands out the notification receiver. Single-consumer: subsequent
    /// calls return `None`.
    pub fn events(&self) -> Option<UnboundedReceiver<LunalinkEvent>> {
        self.inner.events.lock().take()
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.inner.nodes
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.inner.players
    }

    pub fn autoplay(&self) -> &AutoplayRegistry {
        &self.inner.autoplay
    }

    pub fn cache(&self) -> &Arc<dyn CacheAdapter> {
        &self.inner.cache
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.read().clone()
    }

    /// Registers the configured nodes and opens their connections.
    /// Idempotent; later calls are ignored.
    pub async fn init(&self, user_id: &str) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            debug!("init called twice, ignoring");
            return Ok(());
        }
        *self.inner.user_id.write() = Some(user_id.to_string());
        self.inner.cache.init().await;

        for options in self.inner.options.nodes.clone() {
            let node = self.inner.nodes.add(options)?;
            node.connect(user_id);
        }
        info!(
            "initialized with {} node(s) as user {}",
            self.inner.nodes.size(),
            user_id
        );
        Ok(())
    }

    /// Registers an extra node at runtime; connected immediately when the
    /// manager is already initialized.
    pub fn add_node(&self, options: NodeOptions) -> Result<Node> {
        let node = self.inner.nodes.add(options)?;
        if let Some(user_id) = self.user_id() {
            node.connect(&user_id);
        }
        Ok(node)
    }

    /// Creates (or returns) the player for a guild, bound to its preferred
    /// node when one is named, otherwise to the least-loaded connected node.
    pub fn create_player(&self, options: PlayerOptions) -> Result<Player> {
        if let Some(existing) = self.inner.players.get(&options.guild_id) {
            return Ok(existing);
        }
        let node = match &options.preferred_node {
            Some(identifier) => self
                .inner
                .nodes
                .get(identifier)
                .filter(|n| n.is_connected())
                .ok_or_else(|| LunalinkError::NodeNotFound(identifier.clone()))?,
            None => self.inner.nodes.best_node(None)?,
        };
        self.inner.players.create(options, node)
    }

    pub fn get_player(&self, guild_id: &GuildId) -> Option<Player> {
        self.inner.players.get(guild_id)
    }

    pub async fn destroy_player(&self, guild_id: &GuildId) -> Result<()> {
        self.inner.players.destroy(guild_id).await
    }

    /// Resolves a query on the least-loaded node and stamps the requester
    /// onto every returned track.
    pub async fn search(
        &self,
        query: &str,
        source: Option<&str>,
        requester: Option<Value>,
    ) -> Result<LoadResult> {
        let node = self.inner.nodes.best_node(None)?;
        let source = source.unwrap_or(self.inner.options.default_search_source.as_str());
        let mut result = node.rest().load_tracks(source, query).await?;
        if let Some(requester) = requester {
            attach_requester(&mut result, requester);
        }
        Ok(result)
    }

    /// Feed of raw gateway packets. Only `VOICE_SERVER_UPDATE` and the bot
    /// user's own `VOICE_STATE_UPDATE` are acted on; everything else is
    /// ignored.
    pub async fn packet_update(&self, packet: &Value) {
        let Some(t) = packet.get("t").and_then(Value::as_str) else {
            return;
        };
        let Some(d) = packet.get("d") else {
            return;
        };
        let Some(guild_id) = d.get("guild_id").and_then(Value::as_str) else {
            return;
        };
        let Some(player) = self.get_player(&GuildId::from(guild_id)) else {
            return;
        };

        match t {
            "VOICE_SERVER_UPDATE" => {
                let token = d.get("token").and_then(Value::as_str).unwrap_or_default();
                let endpoint = d.get("endpoint").and_then(Value::as_str).unwrap_or_default();
                if token.is_empty() || endpoint.is_empty() {
                    debug!("[{}] incomplete voice server update, skipping", guild_id);
                    return;
                }
                player.voice_server_update(token, endpoint).await;
            }
            "VOICE_STATE_UPDATE" => {
                let user_id = d.get("user_id").and_then(Value::as_str);
                if user_id != self.user_id().as_deref() {
                    return;
                }
                let Some(session_id) = d.get("session_id").and_then(Value::as_str) else {
                    return;
                };
                let channel_id = d.get("channel_id").and_then(Value::as_str);
                player.voice_state_update(session_id, channel_id).await;
            }
            _ => {}
        }
    }

    /// Convenience passthrough for a search-tagged identifier, mirroring
    /// [`RestClient::search_identifier`].
    pub fn search_identifier(&self, query: &str) -> String {
        RestClient::search_identifier(&self.inner.options.default_search_source, query)
    }

    /// Tears down every player and node connection.
    pub async fn destroy(&self) {
        self.inner.players.destroy_all().await;
        self.inner.nodes.destroy_all();
        self.inner.cache.clear().await;
    }
}

fn attach_requester(result: &mut LoadResult, requester: Value) {
    match result {
        LoadResult::Track(track) => track.set_requester(requester),
        LoadResult::Playlist(playlist) => {
            for track in &mut playlist.tracks {
                track.set_requester(requester.clone());
            }
        }
        LoadResult::Search(tracks) => {
            for track in tracks {
                track.set_requester(requester.clone());
            }
        }
        LoadResult::Empty {} | LoadResult::Error(_) => {}
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("nodes", &self.inner.nodes.size())
            .field("players", &self.inner.players.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::AnyResult,
        protocol::{Track, TrackInfo},
    };
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl PayloadSink for NullSink {
        async fn send(&self, _guild_id: &GuildId, _payload: Value) -> AnyResult<()> {
            Ok(())
        }
    }

    fn manager() -> Manager {
        Manager::new(ManagerOptions::default(), Arc::new(NullSink))
    }

    fn track(tag: &str) -> Track {
        Track {
            encoded: format!("blob:{}", tag),
            info: TrackInfo {
                identifier: tag.to_string(),
                ..Default::default()
            },
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn events_receiver_is_single_consumer() {
        let manager = manager();
        assert!(manager.events().is_some());
        assert!(manager.events().is_none());
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let manager = manager();
        manager.init("10001").await.unwrap();
        manager.init("10001").await.unwrap();
        assert_eq!(manager.user_id().as_deref(), Some("10001"));
    }

    #[tokio::test]
    async fn create_player_fails_without_connected_nodes() {
        let manager = manager();
        manager.init("10001").await.unwrap();
        let err = manager
            .create_player(PlayerOptions {
                guild_id: "guild".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LunalinkError::NoNodeAvailable));
    }

    #[tokio::test]
    async fn create_player_rejects_unknown_preferred_node() {
        let manager = manager();
        manager.init("10001").await.unwrap();
        let err = manager
            .create_player(PlayerOptions {
                guild_id: "guild".into(),
                preferred_node: Some("ghost".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, LunalinkError::NodeNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn packet_update_ignores_foreign_voice_states() {
        let manager = manager();
        manager.init("10001").await.unwrap();
        // No player registered for the guild, so any packet is a no-op.
        manager
            .packet_update(&serde_json::json!({
                "t": "VOICE_STATE_UPDATE",
                "d": { "guild_id": "guild", "user_id": "99999", "session_id": "s" }
            }))
            .await;
        manager
            .packet_update(&serde_json::json!({ "t": "MESSAGE_CREATE", "d": {} }))
            .await;
        assert!(manager.get_player(&GuildId::from("guild")).is_none());
    }

    #[test]
    fn requester_is_attached_to_every_track() {
        let mut result = LoadResult::Search(vec![track("a"), track("b")]);
        attach_requester(&mut result, serde_json::json!({ "id": "42" }));
        let tracks = result.into_tracks();
        assert!(tracks.iter().all(|t| t.requester().is_some()));

        let mut result = LoadResult::Empty {};
        attach_requester(&mut result, serde_json::json!("nobody"));
        assert!(result.into_tracks().is_empty());
    }

    #[test]
    fn search_identifier_uses_the_default_source() {
        let manager = manager();
        assert_eq!(manager.search_identifier("hello"), "ytsearch:hello");
        assert_eq!(
            manager.search_identifier("https://example.com/t"),
            "https://example.com/t"
        );
    }
}
