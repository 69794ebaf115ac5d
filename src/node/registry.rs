use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    cache::{CacheAdapter, CacheOptions},
    common::{LunalinkError, Result, types::GuildId},
    events::{EventEmitter, LunalinkEvent},
    player::Player,
};

use super::{Node, NodeOptions, NodeState};

/// Owns the node fleet: unique identifiers, lifecycle, load balancing.
pub struct NodeRegistry {
    nodes: DashMap<String, Node>,
    emitter: EventEmitter,
    players: Arc<DashMap<GuildId, Player>>,
    cache: Arc<dyn CacheAdapter>,
    cache_options: CacheOptions,
    client_name: String,
}

impl NodeRegistry {
    pub fn new(
        emitter: EventEmitter,
        players: Arc<DashMap<GuildId, Player>>,
        cache: Arc<dyn CacheAdapter>,
        cache_options: CacheOptions,
        client_name: String,
    ) -> Self {
        Self {
            nodes: DashMap::new(),
            emitter,
            players,
            cache,
            cache_options,
            client_name,
        }
    }

    /// Adds a node. Fails on a duplicate identifier without touching the
    /// registry.
    pub fn add(&self, options: NodeOptions) -> Result<Node> {
        let identifier = options
            .identifier
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if self.nodes.contains_key(&identifier) {
            return Err(LunalinkError::DuplicateNode(identifier));
        }

        let node = Node::new(
            identifier.clone(),
            options,
            self.emitter.clone(),
            self.players.clone(),
            self.cache.clone(),
            self.cache_options.clone(),
            self.client_name.clone(),
        )?;

        // contains_key + insert is not atomic, but registries are mutated
        // from the host's setup path; entry() keeps the duplicate-safe
        // invariant regardless.
        match self.nodes.entry(identifier.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(LunalinkError::DuplicateNode(identifier));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(node.clone());
            }
        }

        self.emitter.emit(LunalinkEvent::NodeCreate {
            identifier: identifier.clone(),
        });
        Ok(node)
    }

    /// Destroys and removes a node.
    pub fn remove(&self, identifier: &str) -> Result<()> {
        let (_, node) = self
            .nodes
            .remove(identifier)
            .ok_or_else(|| LunalinkError::NodeNotFound(identifier.to_string()))?;
        node.destroy();
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<Node> {
        self.nodes.get(identifier).map(|n| n.clone())
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn all(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.clone()).collect()
    }

    /// Selects the connected node with the lowest stats penalty, optionally
    /// restricted to nodes tagged with one of the given regions.
    pub fn best_node(&self, regions: Option<&[String]>) -> Result<Node> {
        let mut best: Option<(u64, Node)> = None;
        for entry in self.nodes.iter() {
            let node = entry.value();
            if node.state() != NodeState::Connected {
                continue;
            }
            if let Some(wanted) = regions {
                if !wanted.is_empty() && !wanted.iter().any(|r| node.regions().contains(r)) {
                    continue;
                }
            }
            let penalty = node.stats().map(|s| s.penalty()).unwrap_or(0);
            match &best {
                Some((lowest, _)) if *lowest <= penalty => {}
                _ => best = Some((penalty, node.clone())),
            }
        }
        best.map(|(_, node)| node)
            .ok_or(LunalinkError::NoNodeAvailable)
    }

    pub fn destroy_all(&self) {
        for entry in self.nodes.iter() {
            entry.value().destroy();
        }
        self.nodes.clear();
    }
}
