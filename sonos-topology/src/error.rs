//! Error types for topology parsing

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopologyError {
    /// Malformed topology event XML
    #[error("topology parse error: {0}")]
    Parse(String),

    /// Event carried no ZoneGroupState property
    #[error("event carried no zone group state")]
    MissingZoneGroupState,
}

pub type Result<T> = std::result::Result<T, TopologyError>;
