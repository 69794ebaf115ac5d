use async_trait::async_trait;
use serde_json::Value;

use crate::common::{AnyResult, types::GuildId};

/// Transient voice handshake state, rebuilt from inbound gateway packets.
///
/// A player may only (re)sync its voice credentials to the node once all
/// three of token, session id and endpoint are known.
#[derive(Debug, Clone, Default)]
pub struct VoiceState {
    pub token: Option<String>,
    pub session_id: Option<String>,
    pub endpoint: Option<String>,
    pub channel_id: Option<String>,
}

impl VoiceState {
    pub fn is_complete(&self) -> bool {
        self.token.is_some() && self.session_id.is_some() && self.endpoint.is_some()
    }
}

/// Outbound voice-gateway payload sink, injected by the host.
///
/// The library never owns the Discord gateway connection; it only hands
/// ready-made `{op:4}` payloads to whatever transport the host uses.
#[async_trait]
pub trait PayloadSink: Send + Sync {
    async fn send(&self, guild_id: &GuildId, payload: Value) -> AnyResult<()>;
}

/// Builds the voice state update payload. A `None` channel requests a
/// disconnect.
pub fn voice_update_payload(
    guild_id: &GuildId,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> Value {
    serde_json::json!({
        "op": 4,
        "d": {
            "guild_id": guild_id.0,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }
    })
}
