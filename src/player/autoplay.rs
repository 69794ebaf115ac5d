use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{common::Result, protocol::Track};

/// Source-specific recommendation collaborator used when the queue empties
/// with autoplay enabled.
///
/// Implementations are looked up by the ended track's `sourceName`, so a
/// host can register distinct strategies per source. The library filters
/// out the ended track's own identity and picks uniformly at random among
/// what remains.
#[async_trait]
pub trait AutoplaySource: Send + Sync {
    /// Tracks related to `seed`, in any order. May be empty.
    async fn recommend(&self, seed: &Track) -> Result<Vec<Track>>;
}

/// Per-source-name lookup of autoplay collaborators.
#[derive(Default)]
pub struct AutoplayRegistry {
    sources: DashMap<String, Arc<dyn AutoplaySource>>,
}

impl AutoplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source_name: &str, source: Arc<dyn AutoplaySource>) {
        self.sources.insert(source_name.to_string(), source);
    }

    pub fn get(&self, source_name: &str) -> Option<Arc<dyn AutoplaySource>> {
        self.sources.get(source_name).map(|s| s.clone())
    }

    pub fn unregister(&self, source_name: &str) -> bool {
        self.sources.remove(source_name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TrackInfo;

    struct Fixed(Vec<Track>);

    #[async_trait]
    impl AutoplaySource for Fixed {
        async fn recommend(&self, _seed: &Track) -> Result<Vec<Track>> {
            Ok(self.0.clone())
        }
    }

    fn track(tag: &str) -> Track {
        Track {
            encoded: format!("blob:{}", tag),
            info: TrackInfo {
                identifier: tag.to_string(),
                source_name: "youtube".to_string(),
                ..Default::default()
            },
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn lookup_is_keyed_by_source_name() {
        let registry = AutoplayRegistry::new();
        registry.register("youtube", Arc::new(Fixed(vec![track("a")])));

        assert!(registry.get("youtube").is_some());
        assert!(registry.get("soundcloud").is_none());

        let source = registry.get("youtube").unwrap();
        let recs = source.recommend(&track("seed")).await.unwrap();
        assert_eq!(recs.len(), 1);

        assert!(registry.unregister("youtube"));
        assert!(registry.get("youtube").is_none());
    }
}
