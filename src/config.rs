use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{cache::CacheOptions, common::AnyResult, node::NodeOptions};

/// Top-level manager configuration.
///
/// Usually built in code, but [`ManagerOptions::load`] reads the same shape
/// from a TOML file for hosts that prefer file-driven setup.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub nodes: Vec<NodeOptions>,
    /// Sent as the `Client-Name` header on node handshakes.
    pub client_name: String,
    /// Search tag prefixed onto non-URL queries, e.g. `ytsearch`.
    pub default_search_source: String,
    pub cache: CacheOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            client_name: format!("lunalink/{}", env!("CARGO_PKG_VERSION")),
            default_search_source: "ytsearch".to_string(),
            cache: CacheOptions::default(),
        }
    }
}

impl ManagerOptions {
    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: ManagerFile = toml::from_str(&text)?;
        Ok(file.into_options())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ManagerFile {
    #[serde(default)]
    nodes: Vec<NodeFile>,
    client_name: Option<String>,
    default_search_source: Option<String>,
    #[serde(default)]
    cache: CacheFile,
}

#[derive(Debug, Deserialize, Serialize)]
struct NodeFile {
    identifier: Option<String>,
    host: String,
    port: u16,
    password: String,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    regions: Vec<String>,
    retry_amount: Option<u32>,
    retry_delay_ms: Option<u64>,
    resume_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct CacheFile {
    enabled: Option<bool>,
    default_ttl_secs: Option<u64>,
    revalidate_on_get: Option<bool>,
}

impl ManagerFile {
    fn into_options(self) -> ManagerOptions {
        let defaults = ManagerOptions::default();
        let node_defaults = NodeOptions::default();
        let cache_defaults = CacheOptions::default();
        ManagerOptions {
            nodes: self
                .nodes
                .into_iter()
                .map(|n| NodeOptions {
                    identifier: n.identifier,
                    host: n.host,
                    port: n.port,
                    password: n.password,
                    secure: n.secure,
                    regions: n.regions,
                    retry_amount: n.retry_amount.unwrap_or(node_defaults.retry_amount),
                    retry_delay: n
                        .retry_delay_ms
                        .map(Duration::from_millis)
                        .unwrap_or(node_defaults.retry_delay),
                    resume_timeout_secs: n.resume_timeout_secs,
                })
                .collect(),
            client_name: self.client_name.unwrap_or(defaults.client_name),
            default_search_source: self
                .default_search_source
                .unwrap_or(defaults.default_search_source),
            cache: CacheOptions {
                enabled: self.cache.enabled.unwrap_or(cache_defaults.enabled),
                default_ttl: self
                    .cache
                    .default_ttl_secs
                    .map(Duration::from_secs)
                    .or(cache_defaults.default_ttl),
                revalidate_on_get: self
                    .cache
                    .revalidate_on_get
                    .unwrap_or(cache_defaults.revalidate_on_get),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip_with_defaults() {
        let file: ManagerFile = toml::from_str(
            r#"
            default_search_source = "scsearch"

            [[nodes]]
            identifier = "main"
            host = "lava.example"
            port = 2333
            password = "hunter2"
            secure = true
            regions = ["us-west"]
            retry_delay_ms = 1500

            [cache]
            default_ttl_secs = 60
            "#,
        )
        .unwrap();
        let options = file.into_options();

        assert_eq!(options.default_search_source, "scsearch");
        assert!(options.client_name.starts_with("lunalink/"));
        assert_eq!(options.nodes.len(), 1);
        let node = &options.nodes[0];
        assert_eq!(node.identifier.as_deref(), Some("main"));
        assert!(node.secure);
        assert_eq!(node.retry_delay, Duration::from_millis(1500));
        assert_eq!(node.retry_amount, NodeOptions::default().retry_amount);
        assert_eq!(options.cache.default_ttl, Some(Duration::from_secs(60)));
        assert!(options.cache.enabled);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file: ManagerFile = toml::from_str("").unwrap();
        let options = file.into_options();
        assert!(options.nodes.is_empty());
        assert_eq!(options.default_search_source, "ytsearch");
    }
}
