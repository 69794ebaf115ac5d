use thiserror::Error;

/// Errors surfaced by the public API.
///
/// Validation failures are returned synchronously, before any state mutation
/// or network call takes place. Socket-level failures never appear here; they
/// are reported through `nodeError` events instead.
#[derive(Debug, Error)]
pub enum LunalinkError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("position {position} out of bounds [{start}, {end})")]
    OutOfBounds {
        position: usize,
        start: usize,
        end: usize,
    },

    #[error("queue needs at least {needed} tracks, has {actual}")]
    NotEnoughTracks { needed: usize, actual: usize },

    #[error("a node with identifier '{0}' already exists")]
    DuplicateNode(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("no connected node available")]
    NoNodeAvailable,

    #[error("node '{0}' has not completed its ready handshake")]
    NoSession(String),

    #[error("player for guild '{0}' not found")]
    PlayerNotFound(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("voice payload delivery failed: {0}")]
    PayloadSink(String),

    #[error("autoplay source '{0}' failed: {1}")]
    Autoplay(String, String),
}

pub type Result<T> = std::result::Result<T, LunalinkError>;
