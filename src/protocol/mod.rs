pub mod events;
pub mod opcodes;
pub mod stats;
pub mod tracks;

pub use events::{NodeEvent, TrackEndReason, TrackException};
pub use opcodes::{IncomingMessage, PlayerUpdateState};
pub use stats::NodeStats;
pub use tracks::{LoadResult, PlaylistData, PlaylistInfo, Track, TrackInfo};

/// Exception severity levels, as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}
