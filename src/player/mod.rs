pub mod autoplay;
pub mod registry;

pub use autoplay::{AutoplayRegistry, AutoplaySource};
pub use registry::PlayerRegistry;

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cache::CacheAdapter,
    common::{LunalinkError, Result, types::GuildId},
    events::{EventEmitter, LunalinkEvent},
    node::Node,
    protocol::{PlayerUpdateState, Track, TrackEndReason},
    queue::Queue,
    rest::{UpdatePlayerPayload, VoiceServerPayload},
    voice::{PayloadSink, VoiceState, voice_update_payload},
};

/// Inclusive volume range. The minimum is 0: a fully silenced player is
/// still a valid player.
pub const MAX_VOLUME: u16 = 1000;

/// Rapid successive filter changes are coalesced behind this window;
/// last write wins.
pub const FILTER_DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    Off,
    Track,
    Queue,
}

/// Construction-time options for a player.
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub guild_id: GuildId,
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub auto_play: bool,
    /// Destroy the player when its queue ends.
    pub auto_leave: bool,
    /// Keep every previous track instead of only the most recent one.
    pub accumulate_history: bool,
    /// Base used for external queue position addressing.
    pub queue_start_index: usize,
    /// Pin the player to a specific node instead of the best one.
    pub preferred_node: Option<String>,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            guild_id: GuildId(String::new()),
            voice_channel_id: None,
            text_channel_id: None,
            volume: 100,
            loop_mode: LoopMode::Off,
            auto_play: false,
            auto_leave: false,
            accumulate_history: false,
            queue_start_index: 0,
            preferred_node: None,
        }
    }
}

#[derive(Debug)]
struct PlayState {
    connected: bool,
    playing: bool,
    paused: bool,
    volume: u16,
    loop_mode: LoopMode,
    auto_play: bool,
    auto_leave: bool,
    current: Option<Track>,
    previous: Vec<Track>,
    position: u64,
    last_update: u64,
    ping: i64,
    voice_channel_id: Option<String>,
    text_channel_id: Option<String>,
}

/// Snapshot persisted through the cache adapter for crash/restart recovery.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: GuildId,
    pub voice_channel_id: Option<String>,
    pub text_channel_id: Option<String>,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub auto_play: bool,
    pub auto_leave: bool,
    pub paused: bool,
    pub current: Option<Track>,
    pub queue: Vec<Track>,
    pub filters: Value,
}

/// Per-guild playback session bound to one node.
///
/// Mutators validate synchronously before any side effect, then update local
/// state, emit their notification and issue the REST call. Concurrent calls
/// on the same player are not serialized against each other.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

struct PlayerInner {
    guild_id: GuildId,
    node: RwLock<Node>,
    state: Mutex<PlayState>,
    queue: Mutex<Queue>,
    voice: Mutex<VoiceState>,
    filters: Mutex<Value>,
    filter_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    accumulate_history: bool,
    sink: Arc<dyn PayloadSink>,
    autoplay: Arc<AutoplayRegistry>,
    cache: Arc<dyn CacheAdapter>,
    emitter: EventEmitter,
    players: Arc<DashMap<GuildId, Player>>,
    cancel: CancellationToken,
}

impl Player {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        options: PlayerOptions,
        node: Node,
        emitter: EventEmitter,
        players: Arc<DashMap<GuildId, Player>>,
        cache: Arc<dyn CacheAdapter>,
        autoplay: Arc<AutoplayRegistry>,
        sink: Arc<dyn PayloadSink>,
    ) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                guild_id: options.guild_id.clone(),
                node: RwLock::new(node),
                state: Mutex::new(PlayState {
                    connected: false,
                    playing: false,
                    paused: false,
                    volume: options.volume.min(MAX_VOLUME),
                    loop_mode: options.loop_mode,
                    auto_play: options.auto_play,
                    auto_leave: options.auto_leave,
                    current: None,
                    previous: Vec::new(),
                    position: 0,
                    last_update: 0,
                    ping: -1,
                    voice_channel_id: options.voice_channel_id,
                    text_channel_id: options.text_channel_id,
                }),
                queue: Mutex::new(Queue::new(options.queue_start_index)),
                voice: Mutex::new(VoiceState::default()),
                filters: Mutex::new(serde_json::json!({})),
                filter_task: Mutex::new(None),
                accumulate_history: options.accumulate_history,
                sink,
                autoplay,
                cache,
                emitter,
                players,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn guild_id(&self) -> &GuildId {
        &self.inner.guild_id
    }

    pub fn node(&self) -> Node {
        self.inner.node.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().playing
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn volume(&self) -> u16 {
        self.inner.state.lock().volume
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.inner.state.lock().loop_mode
    }

    pub fn auto_play(&self) -> bool {
        self.inner.state.lock().auto_play
    }

    pub fn auto_leave(&self) -> bool {
        self.inner.state.lock().auto_leave
    }

    pub fn current_track(&self) -> Option<Track> {
        self.inner.state.lock().current.clone()
    }

    /// Most recently archived track.
    pub fn previous_track(&self) -> Option<Track> {
        self.inner.state.lock().previous.last().cloned()
    }

    pub fn position(&self) -> u64 {
        self.inner.state.lock().position
    }

    pub fn ping(&self) -> i64 {
        self.inner.state.lock().ping
    }

    pub fn voice_channel_id(&self) -> Option<String> {
        self.inner.state.lock().voice_channel_id.clone()
    }

    /// Direct access to the queue. Guards must not be held across awaits.
    pub fn queue(&self) -> MutexGuard<'_, Queue> {
        self.inner.queue.lock()
    }

    pub fn filters(&self) -> Value {
        self.inner.filters.lock().clone()
    }

    fn emit(&self, event: LunalinkEvent) {
        self.inner.emitter.emit(event);
    }

    fn snapshot_key(&self) -> String {
        format!("player:{}", self.inner.guild_id)
    }

    /// Writes the restart-recovery snapshot through the cache adapter.
    async fn persist(&self) {
        let snapshot = {
            let state = self.inner.state.lock();
            let queue = self.inner.queue.lock();
            PlayerSnapshot {
                guild_id: self.inner.guild_id.clone(),
                voice_channel_id: state.voice_channel_id.clone(),
                text_channel_id: state.text_channel_id.clone(),
                volume: state.volume,
                loop_mode: state.loop_mode,
                auto_play: state.auto_play,
                auto_leave: state.auto_leave,
                paused: state.paused,
                current: state.current.clone(),
                queue: queue.tracks().cloned().collect(),
                filters: self.inner.filters.lock().clone(),
            }
        };
        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                self.inner
                    .cache
                    .set(&self.snapshot_key(), value, None)
                    .await
            }
            Err(e) => warn!("[{}] snapshot serialization failed: {}", self.inner.guild_id, e),
        }
    }

    // -- Voice ------------------------------------------------------------

    /// Joins a voice channel by forwarding an `op:4` payload through the
    /// injected sink.
    pub async fn connect(&self, channel_id: &str, self_mute: bool, self_deaf: bool) -> Result<()> {
        if channel_id.is_empty() {
            return Err(LunalinkError::InvalidParameter(
                "channel id must not be empty".to_string(),
            ));
        }
        let payload =
            voice_update_payload(&self.inner.guild_id, Some(channel_id), self_mute, self_deaf);
        self.inner
            .sink
            .send(&self.inner.guild_id, payload)
            .await
            .map_err(|e| LunalinkError::PayloadSink(e.to_string()))?;
        self.inner.state.lock().voice_channel_id = Some(channel_id.to_string());
        self.inner.voice.lock().channel_id = Some(channel_id.to_string());
        self.emit(LunalinkEvent::PlayerConnected {
            guild_id: self.inner.guild_id.clone(),
            channel_id: channel_id.to_string(),
        });
        self.persist().await;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let payload = voice_update_payload(&self.inner.guild_id, None, false, false);
        self.inner
            .sink
            .send(&self.inner.guild_id, payload)
            .await
            .map_err(|e| LunalinkError::PayloadSink(e.to_string()))?;
        {
            let mut state = self.inner.state.lock();
            state.connected = false;
            state.voice_channel_id = None;
        }
        self.inner.voice.lock().channel_id = None;
        self.emit(LunalinkEvent::PlayerDisconnected {
            guild_id: self.inner.guild_id.clone(),
        });
        self.persist().await;
        Ok(())
    }

    /// Applies a `VOICE_SERVER_UPDATE` and syncs to the node when the
    /// handshake is complete.
    pub async fn voice_server_update(&self, token: &str, endpoint: &str) {
        {
            let mut voice = self.inner.voice.lock();
            voice.token = Some(token.to_string());
            voice.endpoint = Some(endpoint.to_string());
        }
        self.try_sync_voice().await;
    }

    /// Applies a `VOICE_STATE_UPDATE` for the bot user.
    pub async fn voice_state_update(&self, session_id: &str, channel_id: Option<&str>) {
        let old_channel = self.inner.state.lock().voice_channel_id.clone();
        match channel_id {
            Some(channel) => {
                {
                    let mut voice = self.inner.voice.lock();
                    voice.session_id = Some(session_id.to_string());
                    voice.channel_id = Some(channel.to_string());
                }
                self.inner.state.lock().voice_channel_id = Some(channel.to_string());
                if old_channel.as_deref() != Some(channel) && old_channel.is_some() {
                    self.emit(LunalinkEvent::PlayerMoved {
                        guild_id: self.inner.guild_id.clone(),
                        old_channel,
                        new_channel: channel.to_string(),
                    });
                }
                self.try_sync_voice().await;
            }
            None => {
                {
                    let mut voice = self.inner.voice.lock();
                    voice.session_id = Some(session_id.to_string());
                    voice.channel_id = None;
                }
                {
                    let mut state = self.inner.state.lock();
                    state.connected = false;
                    state.voice_channel_id = None;
                }
                self.emit(LunalinkEvent::PlayerDisconnected {
                    guild_id: self.inner.guild_id.clone(),
                });
            }
        }
    }

    /// Forwards voice credentials to the node once token, session id and
    /// endpoint are all known. Gateway-driven, so failures are reported as
    /// events rather than returned.
    async fn try_sync_voice(&self) {
        let voice = self.inner.voice.lock().clone();
        if !voice.is_complete() {
            return;
        }
        let payload = UpdatePlayerPayload {
            voice: Some(VoiceServerPayload {
                token: voice.token.unwrap_or_default(),
                endpoint: voice.endpoint.unwrap_or_default(),
                session_id: voice.session_id.unwrap_or_default(),
            }),
            ..Default::default()
        };
        let node = self.node();
        if let Err(e) = node
            .rest()
            .update_player(&self.inner.guild_id, &payload, false)
            .await
        {
            warn!("[{}] voice sync failed: {}", self.inner.guild_id, e);
            self.emit(LunalinkEvent::NodeError {
                identifier: node.identifier().to_string(),
                message: format!("voice sync failed: {}", e),
            });
        }
    }

    // -- Playback ---------------------------------------------------------

    /// Starts the next queued track. Returns false when the queue is empty.
    pub async fn play(&self) -> Result<bool> {
        self.start_next().await
    }

    /// Dequeues the head, marks it playing, emits `playerTriggeredPlay` and
    /// submits it to the node. Local state is updated before the network
    /// call; a REST failure is returned but does not roll anything back.
    async fn start_next(&self) -> Result<bool> {
        let Some(track) = self.inner.queue.lock().shift() else {
            return Ok(false);
        };
        let volume = {
            let mut state = self.inner.state.lock();
            state.current = Some(track.clone());
            state.playing = true;
            state.paused = false;
            state.position = 0;
            state.volume
        };
        self.emit(LunalinkEvent::PlayerTriggeredPlay {
            guild_id: self.inner.guild_id.clone(),
            track: track.clone(),
        });
        self.persist().await;
        self.node()
            .rest()
            .update_player(
                &self.inner.guild_id,
                &UpdatePlayerPayload::play(&track.encoded, volume),
                false,
            )
            .await?;
        Ok(true)
    }

    /// Like [`start_next`], but for internally driven advancement where
    /// there is no caller to hand the error to.
    async fn advance(&self) -> bool {
        match self.start_next().await {
            Ok(started) => started,
            Err(e) => {
                warn!("[{}] advancing playback failed: {}", self.inner.guild_id, e);
                // The local transition already happened; the node will
                // re-emit a track event once it recovers.
                true
            }
        }
    }

    pub async fn pause(&self) -> Result<bool> {
        if self.inner.state.lock().paused {
            return Ok(true);
        }
        self.node()
            .rest()
            .update_player(
                &self.inner.guild_id,
                &UpdatePlayerPayload {
                    paused: Some(true),
                    ..Default::default()
                },
                false,
            )
            .await?;
        self.inner.state.lock().paused = true;
        self.emit(LunalinkEvent::PlayerTriggeredPause {
            guild_id: self.inner.guild_id.clone(),
        });
        self.persist().await;
        Ok(true)
    }

    pub async fn resume(&self) -> Result<bool> {
        if !self.inner.state.lock().paused {
            return Ok(true);
        }
        self.node()
            .rest()
            .update_player(
                &self.inner.guild_id,
                &UpdatePlayerPayload {
                    paused: Some(false),
                    ..Default::default()
                },
                false,
            )
            .await?;
        self.inner.state.lock().paused = false;
        self.emit(LunalinkEvent::PlayerTriggeredResume {
            guild_id: self.inner.guild_id.clone(),
        });
        self.persist().await;
        Ok(true)
    }

    /// Clears the remote track. With `destroy` set the whole player is torn
    /// down; otherwise only the local queue is dropped.
    pub async fn stop(&self, destroy: bool) -> Result<bool> {
        self.node()
            .rest()
            .update_player(
                &self.inner.guild_id,
                &UpdatePlayerPayload::clear_track(),
                false,
            )
            .await?;
        self.emit(LunalinkEvent::PlayerTriggeredStop {
            guild_id: self.inner.guild_id.clone(),
        });
        if destroy {
            self.destroy().await?;
        } else {
            self.inner.queue.lock().clear();
            let mut state = self.inner.state.lock();
            state.playing = false;
            state.current = None;
            drop(state);
            self.persist().await;
        }
        Ok(true)
    }

    /// Advances to the next track. With an explicit position, that queue
    /// entry is spliced to the front first. With an empty queue and autoplay
    /// enabled, the remote track is cleared so the end-event recovery path
    /// picks a recommendation.
    pub async fn skip(&self, position: Option<usize>) -> Result<bool> {
        if let Some(pos) = position {
            self.inner.queue.lock().move_to_front(pos)?;
            self.emit(LunalinkEvent::PlayerTriggeredSkip {
                guild_id: self.inner.guild_id.clone(),
                position: Some(pos),
            });
            return self.start_next().await;
        }

        let queue_empty = self.inner.queue.lock().is_empty();
        if !queue_empty {
            self.emit(LunalinkEvent::PlayerTriggeredSkip {
                guild_id: self.inner.guild_id.clone(),
                position: None,
            });
            return self.start_next().await;
        }
        if self.inner.state.lock().auto_play {
            self.emit(LunalinkEvent::PlayerTriggeredSkip {
                guild_id: self.inner.guild_id.clone(),
                position: None,
            });
            self.node()
                .rest()
                .update_player(
                    &self.inner.guild_id,
                    &UpdatePlayerPayload::clear_track(),
                    false,
                )
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Seeks within the current track; bounds-checked to its duration.
    pub async fn seek(&self, position: u64) -> Result<()> {
        let current = self.inner.state.lock().current.clone();
        let Some(track) = current else {
            return Err(LunalinkError::InvalidParameter(
                "nothing is playing".to_string(),
            ));
        };
        if !track.info.is_seekable {
            return Err(LunalinkError::InvalidParameter(
                "current track is not seekable".to_string(),
            ));
        }
        if position > track.info.length {
            return Err(LunalinkError::InvalidParameter(format!(
                "seek position {} outside [0, {}]",
                position, track.info.length
            )));
        }
        self.node()
            .rest()
            .update_player(
                &self.inner.guild_id,
                &UpdatePlayerPayload {
                    position: Some(position),
                    ..Default::default()
                },
                false,
            )
            .await?;
        self.inner.state.lock().position = position;
        self.emit(LunalinkEvent::PlayerTriggeredSeek {
            guild_id: self.inner.guild_id.clone(),
            position,
        });
        Ok(())
    }

    /// Shuffles the queue in place; requires at least two queued tracks.
    pub async fn shuffle(&self) -> Result<()> {
        self.inner.queue.lock().shuffle()?;
        self.emit(LunalinkEvent::PlayerTriggeredShuffle {
            guild_id: self.inner.guild_id.clone(),
        });
        self.persist().await;
        Ok(())
    }

    /// Sets the playback volume, rejected outside `0..=MAX_VOLUME` before
    /// any side effect.
    pub async fn set_volume(&self, volume: u16) -> Result<()> {
        if volume > MAX_VOLUME {
            return Err(LunalinkError::InvalidParameter(format!(
                "volume {} outside [0, {}]",
                volume, MAX_VOLUME
            )));
        }
        self.node()
            .rest()
            .update_player(
                &self.inner.guild_id,
                &UpdatePlayerPayload {
                    volume: Some(volume),
                    ..Default::default()
                },
                false,
            )
            .await?;
        self.inner.state.lock().volume = volume;
        self.emit(LunalinkEvent::PlayerChangedVolume {
            guild_id: self.inner.guild_id.clone(),
            volume,
        });
        self.persist().await;
        Ok(())
    }

    pub async fn set_loop(&self, mode: LoopMode) {
        self.inner.state.lock().loop_mode = mode;
        self.emit(LunalinkEvent::PlayerChangedLoop {
            guild_id: self.inner.guild_id.clone(),
            mode,
        });
        self.persist().await;
    }

    pub async fn set_auto_play(&self, enabled: bool) {
        self.inner.state.lock().auto_play = enabled;
        self.emit(LunalinkEvent::PlayerAutoPlaySet {
            guild_id: self.inner.guild_id.clone(),
            enabled,
        });
        self.persist().await;
    }

    pub async fn set_auto_leave(&self, enabled: bool) {
        self.inner.state.lock().auto_leave = enabled;
        self.emit(LunalinkEvent::PlayerAutoLeaveSet {
            guild_id: self.inner.guild_id.clone(),
            enabled,
        });
        self.persist().await;
    }

    /// Updates filters locally right away; the remote sync is deferred
    /// behind a debounce window. A newer set cancels the pending one.
    pub async fn set_filters(&self, filters: Value) -> Result<()> {
        if !filters.is_object() {
            return Err(LunalinkError::InvalidParameter(
                "filters must be a JSON object".to_string(),
            ));
        }
        *self.inner.filters.lock() = filters.clone();
        self.persist().await;

        let player = self.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(FILTER_DEBOUNCE) => {
                    let payload = UpdatePlayerPayload {
                        filters: Some(player.inner.filters.lock().clone()),
                        ..Default::default()
                    };
                    if let Err(e) = player
                        .node()
                        .rest()
                        .update_player(&player.inner.guild_id, &payload, false)
                        .await
                    {
                        warn!("[{}] filter sync failed: {}", player.inner.guild_id, e);
                    }
                }
            }
        });
        if let Some(previous) = self.inner.filter_task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn clear_filters(&self) -> Result<()> {
        self.set_filters(serde_json::json!({})).await
    }

    /// Rebinds the player to another connected node, replaying the current
    /// track at its last known position.
    pub async fn transfer_node(&self, target: Node) -> Result<()> {
        if !target.is_connected() {
            return Err(LunalinkError::NoNodeAvailable);
        }
        let old = self.node();
        if old.identifier() == target.identifier() {
            return Ok(());
        }
        if let Err(e) = old.rest().destroy_player(&self.inner.guild_id).await {
            debug!(
                "[{}] destroy on old node {} failed: {}",
                self.inner.guild_id,
                old.identifier(),
                e
            );
        }
        *self.inner.node.write() = target.clone();

        let voice = self.inner.voice.lock().clone();
        if voice.is_complete() {
            let payload = UpdatePlayerPayload {
                voice: Some(VoiceServerPayload {
                    token: voice.token.unwrap_or_default(),
                    endpoint: voice.endpoint.unwrap_or_default(),
                    session_id: voice.session_id.unwrap_or_default(),
                }),
                ..Default::default()
            };
            target
                .rest()
                .update_player(&self.inner.guild_id, &payload, false)
                .await?;
        }

        let (current, position, volume) = {
            let state = self.inner.state.lock();
            (state.current.clone(), state.position, state.volume)
        };
        if let Some(track) = current {
            let mut payload = UpdatePlayerPayload::play(&track.encoded, volume);
            payload.position = Some(position);
            target
                .rest()
                .update_player(&self.inner.guild_id, &payload, false)
                .await?;
        }
        Ok(())
    }

    /// Tears the player down: pending timers, voice channel, remote state,
    /// registry entry and persisted snapshot.
    pub async fn destroy(&self) -> Result<()> {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.filter_task.lock().take() {
            task.abort();
        }

        let had_channel = self.inner.state.lock().voice_channel_id.is_some();
        if had_channel {
            if let Err(e) = self.disconnect().await {
                debug!("[{}] disconnect during destroy failed: {}", self.inner.guild_id, e);
            }
        }
        if let Err(e) = self
            .node()
            .rest()
            .destroy_player(&self.inner.guild_id)
            .await
        {
            debug!("[{}] remote destroy failed: {}", self.inner.guild_id, e);
        }
        self.inner.queue.lock().clear();
        self.inner.players.remove(&self.inner.guild_id);
        self.inner.cache.delete(&self.snapshot_key()).await;
        self.emit(LunalinkEvent::PlayerDestroy {
            guild_id: self.inner.guild_id.clone(),
        });
        Ok(())
    }

    // -- Node-driven transitions ------------------------------------------

    /// Applies a `playerUpdate` frame from the node.
    pub(crate) fn sync_update(&self, update: &PlayerUpdateState) {
        let mut state = self.inner.state.lock();
        state.connected = update.connected;
        state.position = update.position;
        state.last_update = update.time;
        state.ping = update.ping;
    }

    pub(crate) fn handle_track_start(&self, track: Track) {
        {
            let mut state = self.inner.state.lock();
            state.current = Some(track.clone());
            state.playing = true;
            state.paused = false;
        }
        self.emit(LunalinkEvent::TrackStart {
            guild_id: self.inner.guild_id.clone(),
            track,
        });
    }

    /// Track-end recovery. The ordering of these steps is observable
    /// through the emitted notifications and must not change.
    pub(crate) async fn handle_track_end(&self, ended: Track, reason: TrackEndReason) {
        let (loop_mode, auto_play, auto_leave, current) = {
            let mut state = self.inner.state.lock();
            state.playing = false;
            state.paused = false;
            if self.inner.accumulate_history {
                state.previous.push(ended.clone());
            } else {
                state.previous = vec![ended.clone()];
            }
            (
                state.loop_mode,
                state.auto_play,
                state.auto_leave,
                state.current.clone(),
            )
        };

        self.emit(LunalinkEvent::TrackEnd {
            guild_id: self.inner.guild_id.clone(),
            track: ended.clone(),
            reason,
        });

        if reason.is_failure() {
            if !self.inner.queue.lock().is_empty() {
                self.advance().await;
            } else {
                self.inner.queue.lock().clear();
                self.inner.state.lock().current = None;
            }
            return;
        }

        if reason == TrackEndReason::Replaced {
            // The explicit replacement is already in flight.
            return;
        }

        if loop_mode == LoopMode::Track {
            let volume = self.inner.state.lock().volume;
            {
                let mut state = self.inner.state.lock();
                state.playing = true;
                state.position = 0;
            }
            if let Err(e) = self
                .node()
                .rest()
                .update_player(
                    &self.inner.guild_id,
                    &UpdatePlayerPayload::play(&ended.encoded, volume),
                    false,
                )
                .await
            {
                warn!("[{}] track loop resubmit failed: {}", self.inner.guild_id, e);
            }
            return;
        }

        if loop_mode == LoopMode::Queue {
            if let Some(mut track) = current {
                track.info.position = 0;
                self.inner.queue.lock().add(track);
                self.advance().await;
                return;
            }
        }

        if !self.inner.queue.lock().is_empty() {
            self.advance().await;
            return;
        }

        if auto_play {
            match self.run_autoplay(&ended).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    // The reference implementation destroys the whole node
                    // connection here; we scope the failure to this player.
                    warn!("[{}] autoplay failed: {}", self.inner.guild_id, e);
                }
            }
        }

        self.inner.state.lock().current = None;
        self.emit(LunalinkEvent::QueueEnd {
            guild_id: self.inner.guild_id.clone(),
        });
        if auto_leave {
            if let Err(e) = self.destroy().await {
                warn!("[{}] auto-leave destroy failed: {}", self.inner.guild_id, e);
            }
        }
    }

    /// Asks the source-specific collaborator for related tracks, drops any
    /// matching the seed's identity and enqueues a uniformly random pick.
    async fn run_autoplay(&self, seed: &Track) -> Result<bool> {
        let Some(source) = self.inner.autoplay.get(&seed.info.source_name) else {
            debug!(
                "[{}] no autoplay source registered for '{}'",
                self.inner.guild_id, seed.info.source_name
            );
            return Ok(false);
        };
        let mut recommendations = source
            .recommend(seed)
            .await
            .map_err(|e| LunalinkError::Autoplay(seed.info.source_name.clone(), e.to_string()))?;
        recommendations.retain(|t| {
            !t.same_identity(seed) && t.info.identifier != seed.info.identifier
        });
        if recommendations.is_empty() {
            return Ok(false);
        }
        let pick = {
            let index = rand::thread_rng().gen_range(0..recommendations.len());
            recommendations.swap_remove(index)
        };
        self.inner.queue.lock().add(pick);
        self.advance().await;
        Ok(true)
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.inner.guild_id)
            .field("playing", &self.is_playing())
            .finish()
    }
}
