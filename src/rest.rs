use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::{
    cache::{CacheAdapter, CacheOptions},
    common::{LunalinkError, Result, types::GuildId, types::SessionId},
    protocol::{LoadResult, Track},
};

const API_VERSION: &str = "v4";
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Per-node HTTP facade over the protocol's REST surface.
///
/// All node mutations flow through here. Idempotent GETs are cache-aside;
/// mutating calls invalidate the cached responses scoped to their guild.
pub struct RestClient {
    client: Client,
    node_id: String,
    /// `http(s)://host:port` without the version prefix.
    origin: String,
    password: String,
    session_id: RwLock<Option<SessionId>>,
    cache: Arc<dyn CacheAdapter>,
    cache_options: CacheOptions,
}

impl RestClient {
    pub fn new(
        node_id: &str,
        host: &str,
        port: u16,
        secure: bool,
        password: &str,
        cache: Arc<dyn CacheAdapter>,
        cache_options: CacheOptions,
    ) -> Result<Self> {
        let scheme = if secure { "https" } else { "http" };
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            node_id: node_id.to_string(),
            origin: format!("{}://{}:{}", scheme, host, port),
            password: password.to_string(),
            session_id: RwLock::new(None),
            cache,
            cache_options,
        })
    }

    pub fn set_session_id(&self, session_id: SessionId) {
        *self.session_id.write() = Some(session_id);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().clone()
    }

    fn versioned(&self, path: &str) -> String {
        format!("{}/{}{}", self.origin, API_VERSION, path)
    }

    fn players_path(&self, guild_id: Option<&GuildId>) -> Result<String> {
        let session = self
            .session_id
            .read()
            .clone()
            .ok_or_else(|| LunalinkError::NoSession(self.node_id.clone()))?;
        Ok(match guild_id {
            Some(guild) => format!("/sessions/{}/players/{}", session, guild),
            None => format!("/sessions/{}/players", session),
        })
    }

    fn cache_key(&self, path: &str) -> String {
        format!("node:{}:{}", self.node_id, path)
    }

    async fn get_json(&self, url: String) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Cache-aside GET for the idempotent endpoints. A cache hit
    /// short-circuits the origin call unless `revalidate_on_get` forces a
    /// refresh, in which case the fresh origin value is returned.
    async fn cached_get(&self, path: &str) -> Result<Value> {
        let url = self.versioned(path);
        if !self.cache_options.enabled {
            return self.get_json(url).await;
        }

        let key = self.cache_key(path);
        let client = self.client.clone();
        let password = self.password.clone();
        let producer = Box::pin(async move {
            let response = client
                .get(url)
                .header("Authorization", &password)
                .send()
                .await
                .map_err(LunalinkError::from)?
                .error_for_status()
                .map_err(LunalinkError::from)?;
            response.json().await.map_err(LunalinkError::from)
        });
        self.cache
            .revalidate(&key, self.cache_options.revalidate_on_get, producer)
            .await
    }

    /// Drops any cached GET response scoped to this guild.
    async fn invalidate_guild(&self, guild_id: &GuildId) {
        if !self.cache_options.enabled {
            return;
        }
        if let Ok(path) = self.players_path(Some(guild_id)) {
            self.cache.delete(&self.cache_key(&path)).await;
        }
        if let Ok(path) = self.players_path(None) {
            self.cache.delete(&self.cache_key(&path)).await;
        }
    }

    /// Builds the `loadtracks` identifier: URLs pass through verbatim,
    /// anything else is prefixed with the source's search tag.
    pub fn search_identifier(source: &str, query: &str) -> String {
        if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("{}:{}", source, query)
        }
    }

    pub async fn load_tracks(&self, source: &str, query: &str) -> Result<LoadResult> {
        let identifier = Self::search_identifier(source, query);
        let url = format!(
            "{}?identifier={}",
            self.versioned("/loadtracks"),
            urlencoding::encode(&identifier)
        );
        debug!("[{}] loadtracks identifier='{}'", self.node_id, identifier);
        let value = self.get_json(url).await?;
        serde_json::from_value(value).map_err(|e| LunalinkError::Protocol(e.to_string()))
    }

    pub async fn update_player(
        &self,
        guild_id: &GuildId,
        update: &UpdatePlayerPayload,
        no_replace: bool,
    ) -> Result<Value> {
        let path = self.players_path(Some(guild_id))?;
        let url = format!("{}?noReplace={}", self.versioned(&path), no_replace);
        let response = self
            .client
            .patch(url)
            .header("Authorization", &self.password)
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        self.invalidate_guild(guild_id).await;
        Ok(response.json().await?)
    }

    pub async fn destroy_player(&self, guild_id: &GuildId) -> Result<()> {
        let path = self.players_path(Some(guild_id))?;
        self.client
            .delete(self.versioned(&path))
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?;
        self.invalidate_guild(guild_id).await;
        Ok(())
    }

    pub async fn get_player(&self, guild_id: &GuildId) -> Result<Value> {
        let path = self.players_path(Some(guild_id))?;
        self.cached_get(&path).await
    }

    pub async fn get_players(&self) -> Result<Value> {
        let path = self.players_path(None)?;
        self.cached_get(&path).await
    }

    pub async fn update_session(&self, resuming: bool, timeout_secs: u64) -> Result<Value> {
        let session = self
            .session_id
            .read()
            .clone()
            .ok_or_else(|| LunalinkError::NoSession(self.node_id.clone()))?;
        let url = self.versioned(&format!("/sessions/{}", session));
        let response = self
            .client
            .patch(url)
            .header("Authorization", &self.password)
            .json(&serde_json::json!({ "resuming": resuming, "timeout": timeout_secs }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn get_info(&self) -> Result<Value> {
        self.cached_get("/info").await
    }

    pub async fn get_stats(&self) -> Result<Value> {
        // Stats change continuously; always read from the origin.
        self.get_json(self.versioned("/stats")).await
    }

    /// `GET /version` lives on the unversioned host path and returns plain
    /// text.
    pub async fn get_version(&self) -> Result<String> {
        let key = self.cache_key("/version");
        if self.cache_options.enabled && !self.cache_options.revalidate_on_get {
            if let Some(Value::String(version)) = self.cache.get(&key).await {
                return Ok(version);
            }
        }
        let response = self
            .client
            .get(format!("{}/version", self.origin))
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?;
        let version = response.text().await?;
        if self.cache_options.enabled {
            self.cache.set(&key, Value::String(version.clone()), None).await;
        }
        Ok(version)
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let path = format!("/decodetrack?encodedTrack={}", urlencoding::encode(encoded));
        let value = self.cached_get(&path).await?;
        serde_json::from_value(value).map_err(|e| LunalinkError::Protocol(e.to_string()))
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let response = self
            .client
            .post(self.versioned("/decodetracks"))
            .header("Authorization", &self.password)
            .json(&encoded)
            .send()
            .await?
            .error_for_status()?;
        let value: Value = response.json().await?;
        serde_json::from_value(value).map_err(|e| LunalinkError::Protocol(e.to_string()))
    }

    pub async fn route_planner_status(&self) -> Result<Value> {
        self.cached_get("/routeplanner/status").await
    }

    pub async fn free_route_planner_address(&self, address: &str) -> Result<()> {
        self.client
            .post(self.versioned("/routeplanner/free/address"))
            .header("Authorization", &self.password)
            .json(&serde_json::json!({ "address": address }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn free_all_route_planner_addresses(&self) -> Result<()> {
        self.client
            .post(self.versioned("/routeplanner/free/all"))
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Body of `PATCH /v4/sessions/{sessionId}/players/{guildId}`.
///
/// Absent fields leave the corresponding player state untouched on the node.
/// `track.encoded` uses a double Option: the outer level controls presence,
/// the inner `None` serializes to `null` and clears the remote track.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<UpdatePlayerTrack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceServerPayload>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlayerTrack {
    /// `Some(None)` clears the track on the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

impl UpdatePlayerPayload {
    pub fn play(encoded: &str, volume: u16) -> Self {
        Self {
            track: Some(UpdatePlayerTrack {
                encoded: Some(Some(encoded.to_string())),
                user_data: None,
            }),
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn clear_track() -> Self {
        Self {
            track: Some(UpdatePlayerTrack {
                encoded: Some(None),
                user_data: None,
            }),
            ..Default::default()
        }
    }
}

/// Voice credentials forwarded to the node once the handshake completes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceServerPayload {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_queries_pass_through_verbatim() {
        let url = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";
        assert_eq!(RestClient::search_identifier("ytsearch", url), url);
        assert_eq!(
            RestClient::search_identifier("ytsearch", "never gonna give you up"),
            "ytsearch:never gonna give you up"
        );
    }

    #[test]
    fn clear_track_serializes_null_encoded() {
        let payload = UpdatePlayerPayload::clear_track();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"track": {"encoded": null}}));
    }

    #[test]
    fn play_payload_carries_track_and_volume() {
        let payload = UpdatePlayerPayload::play("QAAAjQ==", 80);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["track"]["encoded"], "QAAAjQ==");
        assert_eq!(json["volume"], 80);
        assert!(json.get("paused").is_none(), "absent fields are omitted");
    }

    #[test]
    fn voice_payload_uses_camel_case() {
        let voice = VoiceServerPayload {
            token: "tok".into(),
            endpoint: "us-west.example".into(),
            session_id: "sess".into(),
        };
        let json = serde_json::to_value(&voice).unwrap();
        assert!(json.get("sessionId").is_some());
    }
}
