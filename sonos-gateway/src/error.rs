//! User-facing error kinds and their HTTP mapping.
//!
//! Lower layers report their own error types; everything converges here so
//! the HTTP dispatcher (an external collaborator) can translate any failure
//! into a deterministic status code and a `{status, error}` body.

use thiserror::Error;

use sonos_music::MusicError;
use sonos_player::PlayerError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad argument (volume out of range, malformed parameter)
    #[error("{0}")]
    Validation(String),

    /// Unknown room name
    #[error("room '{0}' not found")]
    RoomNotFound(String),

    /// Missing catalogue entry (preset, favourite, playlist, station)
    #[error("{0} not found")]
    NotFound(String),

    /// Third-party service credentials absent or rejected
    #[error("service '{0}' is not configured")]
    ServiceUnconfigured(String),

    /// Route recognises the command but no adapter implements it
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Breaking a pure stereo pair is not allowed
    #[error("cannot break stereo pair '{0}'; bonded sets are fixed in the vendor app")]
    StereoPairProtected(String),

    /// Library queries before the index is built
    #[error("music library index is not ready yet")]
    LibraryNotReady,

    /// Device-side UPnP failure, with the vendor code when known
    #[error("player error: {message}")]
    Upnp { code: Option<u16>, message: String },

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Deterministic HTTP status for each error kind. Vendor UPnP codes
    /// map through [`upnp_code_status`].
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::StereoPairProtected(_) => 400,
            GatewayError::RoomNotFound(_) => 404,
            GatewayError::NotFound(_) => 404,
            GatewayError::ServiceUnconfigured(_) => 503,
            GatewayError::LibraryNotReady => 503,
            GatewayError::NotImplemented(_) => 501,
            GatewayError::Upnp { code, .. } => code.map(upnp_code_status).unwrap_or(500),
            GatewayError::Internal(_) => 500,
        }
    }

    /// The `{status: "error"}` response body.
    pub fn to_body(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "error",
            "error": self.to_string(),
        })
    }
}

/// Vendor UPnP error code → HTTP status.
///
/// State conflicts (another transition in flight, wrong group member
/// addressed) surface as 409; invalid-argument flavors as 400; the rest of
/// the tabulated codes are plain server errors.
pub fn upnp_code_status(code: u16) -> u16 {
    match code {
        402 => 400,
        701 | 1023 => 409,
        _ => 500,
    }
}

impl From<PlayerError> for GatewayError {
    fn from(err: PlayerError) -> Self {
        match err {
            PlayerError::InvalidArgument(message) => GatewayError::Validation(message),
            PlayerError::NotFound(what) => GatewayError::NotFound(what),
            PlayerError::UnknownRoom(room) => GatewayError::RoomNotFound(room),
            PlayerError::Soap(soap) => GatewayError::Upnp {
                code: soap.upnp_code(),
                message: soap.to_string(),
            },
            PlayerError::Response(message) => GatewayError::Internal(message),
        }
    }
}

impl From<MusicError> for GatewayError {
    fn from(err: MusicError) -> Self {
        match err {
            MusicError::Unconfigured(service) => GatewayError::ServiceUnconfigured(service),
            MusicError::Auth(message) | MusicError::Quota(message) => {
                GatewayError::ServiceUnconfigured(message)
            }
            MusicError::LibraryNotReady => GatewayError::LibraryNotReady,
            MusicError::NotFound(what) => GatewayError::NotFound(what),
            MusicError::Unsupported(what) => GatewayError::NotImplemented(what),
            MusicError::Player(player) => player.into(),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
