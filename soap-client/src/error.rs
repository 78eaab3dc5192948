//! Error types for the SOAP client

use thiserror::Error;

/// Structured SOAP fault extracted from an `s:Fault` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    /// The `faultcode` element text (e.g. `s:Client`)
    pub faultcode: String,
    /// The `faultstring` element text (e.g. `UPnPError`)
    pub faultstring: String,
    /// Vendor error code from `detail/UPnPError/errorCode`, if present
    pub upnp_code: Option<u16>,
    /// Vendor error description from `detail/UPnPError/errorDescription`
    pub upnp_description: Option<String>,
}

impl std::fmt::Display for SoapFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.upnp_code {
            Some(code) => write!(f, "{} ({}): UPnP error {}", self.faultcode, self.faultstring, code),
            None => write!(f, "{} ({})", self.faultcode, self.faultstring),
        }
    }
}

/// Errors that can occur during SOAP communication
#[derive(Debug, Error)]
pub enum SoapError {
    /// Connection refused by the device
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// No response within the request deadline
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Other network or HTTP transport error
    #[error("network/HTTP error: {0}")]
    Network(String),

    /// Non-2xx HTTP status without a parsable SOAP fault
    #[error("HTTP status {0}")]
    Http(u16),

    /// HTTP 412 on a subscription request: the SID is no longer valid
    #[error("subscription precondition failed (HTTP 412)")]
    PreconditionFailed,

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    Parse(String),

    /// SOAP fault returned by the device
    #[error("SOAP fault: {0}")]
    Fault(SoapFault),
}

impl SoapError {
    /// Vendor error code carried by a fault, if any.
    pub fn upnp_code(&self) -> Option<u16> {
        match self {
            SoapError::Fault(fault) => fault.upnp_code,
            _ => None,
        }
    }

    /// Whether a retry may succeed.
    ///
    /// Connection-refused errors only count as transient inside the grace
    /// window right after discovery, when a rebooting device may not be
    /// listening yet.
    pub fn is_transient(&self, within_discovery_grace: bool) -> bool {
        match self {
            SoapError::ConnectionRefused(_) => within_discovery_grace,
            SoapError::Http(code) => *code >= 500,
            SoapError::Fault(fault) => matches!(fault.upnp_code, Some(402) | Some(701)),
            _ => false,
        }
    }
}
