//! Error types for player control

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    /// Argument failed validation before any wire traffic
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// SOAP-level failure, including vendor faults
    #[error(transparent)]
    Soap(#[from] soap_client::SoapError),

    /// Response was well-formed XML but missing expected fields
    #[error("unexpected response shape: {0}")]
    Response(String),

    /// Named catalogue entry (favourite, playlist) not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Room referenced by a preset is unknown
    #[error("unknown room: {0}")]
    UnknownRoom(String),
}

impl PlayerError {
    /// Vendor UPnP error code, when the failure carries one.
    pub fn upnp_code(&self) -> Option<u16> {
        match self {
            PlayerError::Soap(err) => err.upnp_code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
