//! Error types for the music catalogue layer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MusicError {
    /// Credentials for a third-party service are absent
    #[error("service not configured: {0}")]
    Unconfigured(String),

    /// Upstream rejected our credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Upstream quota or rate limit hit
    #[error("quota exhausted: {0}")]
    Quota(String),

    /// HTTP failure talking to an upstream API
    #[error("upstream HTTP error: {0}")]
    Http(String),

    /// Malformed upstream or device payload
    #[error("parse error: {0}")]
    Parse(String),

    /// Device-side failure via the player layer
    #[error(transparent)]
    Player(#[from] sonos_player::PlayerError),

    /// Local cache I/O failure
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local cache serialization failure
    #[error("cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The library index has not been built yet
    #[error("library index not ready")]
    LibraryNotReady,

    /// Named catalogue entry not found
    #[error("not found: {0}")]
    NotFound(String),

    /// The adapter recognises the operation but cannot perform it
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl MusicError {
    /// Whether the upstream should be left alone for a while.
    pub fn triggers_backoff(&self) -> bool {
        matches!(self, MusicError::Auth(_) | MusicError::Quota(_))
    }
}

pub type Result<T> = std::result::Result<T, MusicError>;
