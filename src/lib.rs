//! Client library for Lavalink-compatible audio nodes.
//!
//! A [`Manager`] owns a fleet of [`node::Node`] connections and the per-guild
//! [`player::Player`] state machines driven by the frames those nodes push.
//! The host supplies a [`voice::PayloadSink`] for outbound voice payloads and
//! forwards its raw gateway packets through [`Manager::packet_update`];
//! everything the library does is reported back as [`events::LunalinkEvent`]
//! values on a single channel.

pub mod cache;
pub mod common;
pub mod config;
pub mod events;
pub mod manager;
pub mod node;
pub mod player;
pub mod protocol;
pub mod queue;
pub mod rest;
pub mod voice;

pub use cache::{CacheAdapter, CacheOptions, MemoryCache};
pub use common::{LunalinkError, Result};
pub use config::ManagerOptions;
pub use events::{EventEmitter, LunalinkEvent};
pub use manager::Manager;
pub use node::{Node, NodeOptions, NodeRegistry, NodeState};
pub use player::{
    AutoplayRegistry, AutoplaySource, LoopMode, Player, PlayerOptions, PlayerRegistry,
};
pub use protocol::{LoadResult, Track, TrackEndReason, TrackInfo};
pub use queue::Queue;
pub use rest::RestClient;
pub use voice::{PayloadSink, VoiceState};
