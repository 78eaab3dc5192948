//! Error types for device discovery

use thiserror::Error;

/// Errors that can occur during discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket or HTTP failure
    #[error("network error: {0}")]
    Network(String),

    /// Malformed device description or SSDP response
    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
