use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

use crate::{
    common::types::GuildId,
    player::LoopMode,
    protocol::{Track, TrackEndReason, TrackException},
};

/// Everything the library notifies the host about.
///
/// A closed set: hosts receive these over the channel handed out by
/// [`crate::Manager::events`] and match exhaustively. Variant names mirror
/// the notification names of the protocol's client surface.
#[derive(Debug)]
pub enum LunalinkEvent {
    // -- Node lifecycle --------------------------------------------------
    NodeCreate {
        identifier: String,
    },
    NodeReady {
        identifier: String,
        session_id: String,
        resumed: bool,
    },
    NodeConnected {
        identifier: String,
    },
    NodeError {
        identifier: String,
        message: String,
    },
    NodeReconnect {
        identifier: String,
        attempt: u32,
    },
    NodeDisconnect {
        identifier: String,
        code: u16,
        reason: String,
    },
    NodeDestroy {
        identifier: String,
    },

    // -- Player lifecycle and control ------------------------------------
    PlayerCreate {
        guild_id: GuildId,
    },
    PlayerDestroy {
        guild_id: GuildId,
    },
    PlayerConnected {
        guild_id: GuildId,
        channel_id: String,
    },
    PlayerDisconnected {
        guild_id: GuildId,
    },
    PlayerMoved {
        guild_id: GuildId,
        old_channel: Option<String>,
        new_channel: String,
    },
    PlayerTriggeredPlay {
        guild_id: GuildId,
        track: Track,
    },
    PlayerTriggeredPause {
        guild_id: GuildId,
    },
    PlayerTriggeredResume {
        guild_id: GuildId,
    },
    PlayerTriggeredStop {
        guild_id: GuildId,
    },
    PlayerTriggeredSkip {
        guild_id: GuildId,
        position: Option<usize>,
    },
    PlayerTriggeredSeek {
        guild_id: GuildId,
        position: u64,
    },
    PlayerTriggeredShuffle {
        guild_id: GuildId,
    },
    PlayerChangedVolume {
        guild_id: GuildId,
        volume: u16,
    },
    PlayerChangedLoop {
        guild_id: GuildId,
        mode: LoopMode,
    },
    PlayerAutoPlaySet {
        guild_id: GuildId,
        enabled: bool,
    },
    PlayerAutoLeaveSet {
        guild_id: GuildId,
        enabled: bool,
    },

    // -- Track events ----------------------------------------------------
    TrackStart {
        guild_id: GuildId,
        track: Track,
    },
    TrackEnd {
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },
    TrackStuck {
        guild_id: GuildId,
        track: Track,
        threshold_ms: u64,
    },
    TrackException {
        guild_id: GuildId,
        track: Track,
        exception: TrackException,
    },
    SocketClosed {
        guild_id: GuildId,
        code: u16,
        reason: String,
        by_remote: bool,
    },
    QueueEnd {
        guild_id: GuildId,
    },

    // -- Cache events ----------------------------------------------------
    CacheInitialized,
    CacheExpired {
        key: String,
    },
    CacheSet {
        key: String,
    },
    CacheDelete {
        key: String,
    },
    CacheClear,
}

/// Cheap clonable handle used by every component to publish events.
///
/// Delivery is best-effort: once the host drops its receiver, events are
/// silently discarded.
#[derive(Clone)]
pub struct EventEmitter {
    tx: UnboundedSender<LunalinkEvent>,
}

impl EventEmitter {
    pub fn channel() -> (Self, UnboundedReceiver<LunalinkEvent>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: LunalinkEvent) {
        trace!("emit {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventEmitter")
    }
}
