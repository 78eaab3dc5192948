//! Error types for the eventing layer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    /// Malformed event body
    #[error("event parse error: {0}")]
    Parse(String),

    /// Malformed topology event
    #[error(transparent)]
    Topology(#[from] sonos_topology::TopologyError),

    /// Subscription protocol failure
    #[error("subscription error: {0}")]
    Subscription(#[from] soap_client::SoapError),

    /// Callback listener failure
    #[error("callback listener error: {0}")]
    Listener(#[from] callback_server::CallbackError),

    /// Player is not registered with the event manager
    #[error("player not registered: {0}")]
    NotRegistered(String),
}

pub type Result<T> = std::result::Result<T, EventError>;
