use serde::Deserialize;

use crate::common::types::GuildId;

use super::{Severity, tracks::Track};

/// `event` frames, sub-dispatched by their `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent")]
    TrackStart {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
    },

    #[serde(rename = "TrackEndEvent")]
    TrackEnd {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        reason: TrackEndReason,
    },

    #[serde(rename = "TrackExceptionEvent")]
    TrackException {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        exception: TrackException,
    },

    #[serde(rename = "TrackStuckEvent")]
    TrackStuck {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        track: Track,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },

    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        #[serde(rename = "guildId")]
        guild_id: GuildId,
        code: u16,
        reason: String,
        #[serde(rename = "byRemote")]
        by_remote: bool,
    },
}

/// Why a track stopped playing. Drives the track-end recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    /// Failure reasons are recovered from by starting the next track.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::LoadFailed | Self::Cleanup)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
    #[serde(default)]
    pub cause_stack_trace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_track_end_event() {
        let raw = r#"{
            "type":"TrackEndEvent",
            "guildId":"123",
            "track":{
                "encoded":"QAAAjQ==",
                "info":{
                    "identifier":"abc","isSeekable":true,"author":"a","length":1000,
                    "isStream":false,"position":0,"title":"t","uri":null,
                    "artworkUrl":null,"isrc":null,"sourceName":"youtube"
                }
            },
            "reason":"loadFailed"
        }"#;
        let event: NodeEvent = serde_json::from_str(raw).unwrap();
        match event {
            NodeEvent::TrackEnd { reason, track, .. } => {
                assert_eq!(reason, TrackEndReason::LoadFailed);
                assert!(reason.is_failure());
                assert_eq!(track.info.identifier, "abc");
            }
            other => panic!("expected TrackEnd, got {:?}", other),
        }
    }

    #[test]
    fn parses_websocket_closed_event() {
        let raw = r#"{
            "type":"WebSocketClosedEvent",
            "guildId":"123","code":4006,"reason":"Session invalid","byRemote":true
        }"#;
        let event: NodeEvent = serde_json::from_str(raw).unwrap();
        match event {
            NodeEvent::WebSocketClosed { code, by_remote, .. } => {
                assert_eq!(code, 4006);
                assert!(by_remote);
            }
            other => panic!("expected WebSocketClosed, got {:?}", other),
        }
    }

    #[test]
    fn end_reason_failure_classification() {
        assert!(TrackEndReason::LoadFailed.is_failure());
        assert!(TrackEndReason::Cleanup.is_failure());
        assert!(!TrackEndReason::Finished.is_failure());
        assert!(!TrackEndReason::Replaced.is_failure());
        assert!(!TrackEndReason::Stopped.is_failure());
    }
}
