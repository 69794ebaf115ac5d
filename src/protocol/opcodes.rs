use serde::Deserialize;

use crate::common::types::{GuildId, SessionId};

use super::{events::NodeEvent, stats::NodeStats};

/// Messages received from a node over its WebSocket.
///
/// One `op` field selects the frame kind; `event` frames are sub-dispatched
/// by their `type` field (see [`NodeEvent`]).
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum IncomingMessage {
    Ready {
        resumed: bool,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    PlayerUpdate {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        state: PlayerUpdateState,
    },
    Stats(NodeStats),
    Event(NodeEvent),
}

/// Live playback state pushed by the node alongside `playerUpdate` frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    /// Unix timestamp in milliseconds.
    pub time: u64,
    /// Playback position in milliseconds.
    #[serde(default)]
    pub position: u64,
    pub connected: bool,
    /// Voice gateway ping in milliseconds, -1 when not connected.
    pub ping: i64,
}
