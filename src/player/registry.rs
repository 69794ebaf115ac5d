use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    cache::CacheAdapter,
    common::{Result, types::GuildId},
    events::{EventEmitter, LunalinkEvent},
    node::Node,
    voice::PayloadSink,
};

use super::{AutoplayRegistry, Player, PlayerOptions};

/// Guild-keyed player store shared with every node for event dispatch.
pub struct PlayerRegistry {
    players: Arc<DashMap<GuildId, Player>>,
    emitter: EventEmitter,
    cache: Arc<dyn CacheAdapter>,
    autoplay: Arc<AutoplayRegistry>,
    sink: Arc<dyn PayloadSink>,
}

impl PlayerRegistry {
    pub fn new(
        players: Arc<DashMap<GuildId, Player>>,
        emitter: EventEmitter,
        cache: Arc<dyn CacheAdapter>,
        autoplay: Arc<AutoplayRegistry>,
        sink: Arc<dyn PayloadSink>,
    ) -> Self {
        Self {
            players,
            emitter,
            cache,
            autoplay,
            sink,
        }
    }

    /// Idempotent get-or-create: a second call for the same guild returns
    /// the existing player untouched, ignoring the new options.
    pub fn create(&self, options: PlayerOptions, node: Node) -> Result<Player> {
        if let Some(existing) = self.players.get(&options.guild_id) {
            return Ok(existing.clone());
        }

        let guild_id = options.guild_id.clone();
        let player = Player::new(
            options,
            node,
            self.emitter.clone(),
            self.players.clone(),
            self.cache.clone(),
            self.autoplay.clone(),
            self.sink.clone(),
        );

        // Racing creates for the same guild collapse onto whichever entry
        // landed first.
        let player = self
            .players
            .entry(guild_id.clone())
            .or_insert_with(|| player.clone())
            .clone();
        self.emitter.emit(LunalinkEvent::PlayerCreate { guild_id });
        Ok(player)
    }

    pub fn get(&self, guild_id: &GuildId) -> Option<Player> {
        self.players.get(guild_id).map(|p| p.clone())
    }

    pub fn size(&self) -> usize {
        self.players.len()
    }

    pub fn all(&self) -> Vec<Player> {
        self.players.iter().map(|p| p.clone()).collect()
    }

    pub async fn destroy(&self, guild_id: &GuildId) -> Result<()> {
        let Some(player) = self.get(guild_id) else {
            return Ok(());
        };
        // Removal from the map happens inside destroy().
        player.destroy().await
    }

    pub async fn destroy_all(&self) {
        for player in self.all() {
            let _ = player.destroy().await;
        }
        self.players.clear();
    }
}
