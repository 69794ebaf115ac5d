use std::io::{Cursor, Read};

use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use super::Severity;

/// A playable unit: an opaque node-encoded blob plus display metadata.
///
/// The `encoded` payload is the authoritative identity. Queue and player
/// operations never mutate it, only its position and attached user data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Base64-encoded track data, replayed verbatim to the node.
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default = "default_json_object")]
    pub plugin_info: serde_json::Value,
    /// Free-form user data; the requester is stored here under `"requester"`.
    #[serde(default = "default_json_object")]
    pub user_data: serde_json::Value,
}

fn default_json_object() -> serde_json::Value {
    serde_json::json!({})
}

impl Track {
    /// Attach the requesting user (or any opaque marker) to this track.
    pub fn set_requester(&mut self, requester: serde_json::Value) {
        if !self.user_data.is_object() {
            self.user_data = serde_json::json!({});
        }
        self.user_data["requester"] = requester;
    }

    pub fn requester(&self) -> Option<&serde_json::Value> {
        self.user_data.get("requester")
    }

    /// Two tracks are the same playable unit when their encoded blobs match.
    pub fn same_identity(&self, other: &Track) -> bool {
        self.encoded == other.encoded
    }

    /// Decodes a lavaplayer track blob locally, without a node round trip.
    ///
    /// Understands format versions 1 through 3: a 4-byte big-endian header
    /// whose top two bits carry flags (bit 0 = versioned), an optional
    /// version byte, then length-prefixed UTF fields. Returns `None` for
    /// malformed input or unknown future versions.
    pub fn decode(encoded: &str) -> Option<Self> {
        let data = BASE64_STANDARD.decode(encoded).ok()?;
        if data.len() < 4 {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let header = cursor.read_u32::<BigEndian>().ok()?;
        let flags = (header >> 30) & 0x03;

        let version = if (flags & 1) != 0 {
            cursor.read_u8().ok()?
        } else {
            1
        };
        if version > 3 {
            return None;
        }

        let title = read_utf(&mut cursor)?;
        let author = read_utf(&mut cursor)?;
        let length = cursor.read_u64::<BigEndian>().ok()?;
        let identifier = read_utf(&mut cursor)?;
        let is_stream = cursor.read_u8().ok()? != 0;

        let uri = if version >= 2 {
            read_opt_utf(&mut cursor)
        } else {
            None
        };
        let (artwork_url, isrc) = if version >= 3 {
            (read_opt_utf(&mut cursor), read_opt_utf(&mut cursor))
        } else {
            (None, None)
        };

        let source_name = read_utf(&mut cursor)?;
        let position = cursor.read_u64::<BigEndian>().ok().unwrap_or(0);

        Some(Self {
            encoded: encoded.to_string(),
            info: TrackInfo {
                identifier,
                is_seekable: !is_stream,
                author,
                length,
                is_stream,
                position,
                title,
                uri,
                artwork_url,
                isrc,
                source_name,
            },
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({}),
        })
    }
}

fn read_utf<R: Read>(r: &mut R) -> Option<String> {
    let len = r.read_u16::<BigEndian>().ok()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).ok()?;
    String::from_utf8(buf).ok()
}

fn read_opt_utf<R: Read>(r: &mut R) -> Option<String> {
    let present = r.read_u8().ok()? != 0;
    if present { read_utf(r) } else { None }
}

/// Metadata for an audio track.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Duration in milliseconds. 0 for live streams.
    pub length: u64,
    pub is_stream: bool,
    /// Playback position in milliseconds.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub isrc: Option<String>,
    pub source_name: String,
}

/// Response of `GET /v4/loadtracks`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
pub enum LoadResult {
    Track(Track),
    Playlist(PlaylistData),
    Search(Vec<Track>),
    Empty {},
    Error(LoadError),
}

impl LoadResult {
    /// Flattens the result into the tracks it carries, in order.
    pub fn into_tracks(self) -> Vec<Track> {
        match self {
            Self::Track(track) => vec![track],
            Self::Playlist(playlist) => playlist.tracks,
            Self::Search(tracks) => tracks,
            Self::Empty {} | Self::Error(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    #[serde(default = "default_json_object")]
    pub plugin_info: serde_json::Value,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    /// Index of the selected track, or -1 if none.
    pub selected_track: i32,
}

/// Error payload of a failed load.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadError {
    pub message: Option<String>,
    pub severity: Severity,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause_stack_trace: Option<String>,
}
