pub mod errors;
pub mod logger;
pub mod types;

pub use errors::{LunalinkError, Result};
pub use types::{AnyError, AnyResult, GuildId, SessionId};
