//! Private SOAP client for UPnP device control and eventing
//!
//! This crate provides a minimal SOAP client for communicating with UPnP
//! audio players: action invocation with fault classification and bounded
//! retry, plus the raw SUBSCRIBE/UNSUBSCRIBE verbs used by the event
//! subscription layer.

mod error;
pub mod xml;

pub use error::{SoapError, SoapFault};

use std::thread;
use std::time::Duration;
use xmltree::Element;

/// Maximum attempts for a retryable call (initial try included).
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff applied between retries, doubled per attempt.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Per-call options controlling the retry policy.
#[derive(Debug, Clone, Copy)]
pub struct CallOptions {
    /// Whether the action may be replayed safely. Non-idempotent calls are
    /// never retried.
    pub idempotent: bool,
    /// Whether the target device was discovered recently enough that a
    /// connection refusal should be treated as transient.
    pub within_discovery_grace: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            idempotent: true,
            within_discovery_grace: false,
        }
    }
}

/// Response to a SUBSCRIBE or renewal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResponse {
    /// Subscription ID granted by the device
    pub sid: String,
    /// Timeout granted by the device, in seconds
    pub timeout_seconds: u32,
}

/// A minimal SOAP client for UPnP device communication
pub struct SoapClient {
    agent: ureq::Agent,
}

impl SoapClient {
    /// Create a new SOAP client with the standard control-plane deadlines
    /// (5 s connect, 10 s read; browse responses can be large).
    pub fn new() -> Self {
        Self::with_timeouts(Duration::from_secs(5), Duration::from_secs(10))
    }

    /// Create a SOAP client with explicit connect/read deadlines.
    pub fn with_timeouts(connect: Duration, read: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(connect)
                .timeout_read(read)
                .build(),
        }
    }

    /// Invoke a SOAP action and return the parsed `<ActionResponse>` element.
    ///
    /// Transient failures (refused connections inside the discovery grace
    /// window, 5xx responses, vendor codes 402 and 701) are retried with
    /// exponential backoff when `opts.idempotent` is set.
    pub fn call(
        &self,
        endpoint_url: &str,
        service_type: &str,
        action: &str,
        arguments: &[(&str, &str)],
        opts: CallOptions,
    ) -> Result<Element, SoapError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(endpoint_url, service_type, action, arguments) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempt += 1;
                    let retryable = opts.idempotent
                        && attempt < MAX_ATTEMPTS
                        && err.is_transient(opts.within_discovery_grace);
                    if !retryable {
                        return Err(err);
                    }
                    let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
                    tracing::debug!(
                        action,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient SOAP failure, retrying: {err}"
                    );
                    thread::sleep(backoff);
                }
            }
        }
    }

    /// Single-shot SOAP invocation without retry.
    pub fn call_once(
        &self,
        endpoint_url: &str,
        service_type: &str,
        action: &str,
        arguments: &[(&str, &str)],
    ) -> Result<Element, SoapError> {
        let mut payload = String::new();
        for (name, value) in arguments {
            payload.push_str(&format!("<{name}>{}</{name}>", xml::escape(value)));
        }

        let body = format!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{action} xmlns:u="{service_type}">{payload}</u:{action}></s:Body></s:Envelope>"#
        );
        let soap_action = format!("\"{service_type}#{action}\"");

        let result = self
            .agent
            .post(endpoint_url)
            .set("Content-Type", "text/xml; charset=\"utf-8\"")
            .set("SOAPACTION", &soap_action)
            .send_string(&body);

        let text = match result {
            Ok(response) => response
                .into_string()
                .map_err(|e| SoapError::Network(e.to_string()))?,
            Err(ureq::Error::Status(code, response)) => {
                // Devices report SOAP faults on 500; the body still carries
                // the structured error.
                let text = response.into_string().unwrap_or_default();
                if let Ok(xml) = Element::parse(text.as_bytes()) {
                    if let Some(fault) = extract_fault(&xml) {
                        return Err(SoapError::Fault(fault));
                    }
                }
                return Err(SoapError::Http(code));
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(classify_transport(&transport.to_string()));
            }
        };

        let xml =
            Element::parse(text.as_bytes()).map_err(|e| SoapError::Parse(e.to_string()))?;
        extract_response(&xml, action)
    }

    /// Issue an initial UPnP event subscription.
    pub fn subscribe(
        &self,
        event_url: &str,
        callback_url: &str,
        timeout_seconds: u32,
    ) -> Result<SubscribeResponse, SoapError> {
        let result = self
            .agent
            .request("SUBSCRIBE", event_url)
            .set("CALLBACK", &format!("<{callback_url}>"))
            .set("NT", "upnp:event")
            .set("TIMEOUT", &format!("Second-{timeout_seconds}"))
            .call();
        subscribe_response(result, timeout_seconds)
    }

    /// Renew an existing subscription identified by its SID.
    pub fn renew(
        &self,
        event_url: &str,
        sid: &str,
        timeout_seconds: u32,
    ) -> Result<SubscribeResponse, SoapError> {
        let result = self
            .agent
            .request("SUBSCRIBE", event_url)
            .set("SID", sid)
            .set("TIMEOUT", &format!("Second-{timeout_seconds}"))
            .call();
        subscribe_response(result, timeout_seconds)
    }

    /// Cancel a subscription.
    pub fn unsubscribe(&self, event_url: &str, sid: &str) -> Result<(), SoapError> {
        let result = self
            .agent
            .request("UNSUBSCRIBE", event_url)
            .set("SID", sid)
            .call();
        match result {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(412, _)) => Err(SoapError::PreconditionFailed),
            Err(ureq::Error::Status(code, _)) => Err(SoapError::Http(code)),
            Err(ureq::Error::Transport(transport)) => {
                Err(classify_transport(&transport.to_string()))
            }
        }
    }
}

impl Default for SoapClient {
    fn default() -> Self {
        Self::new()
    }
}

fn subscribe_response(
    result: Result<ureq::Response, ureq::Error>,
    requested_timeout: u32,
) -> Result<SubscribeResponse, SoapError> {
    match result {
        Ok(response) => {
            let sid = response
                .header("SID")
                .ok_or_else(|| SoapError::Parse("missing SID header".to_string()))?
                .to_string();
            let timeout_seconds = response
                .header("TIMEOUT")
                .and_then(parse_timeout_header)
                .unwrap_or(requested_timeout);
            Ok(SubscribeResponse {
                sid,
                timeout_seconds,
            })
        }
        Err(ureq::Error::Status(412, _)) => Err(SoapError::PreconditionFailed),
        Err(ureq::Error::Status(code, _)) => Err(SoapError::Http(code)),
        Err(ureq::Error::Transport(transport)) => Err(classify_transport(&transport.to_string())),
    }
}

/// Parse a `TIMEOUT: Second-300` header value.
fn parse_timeout_header(value: &str) -> Option<u32> {
    value
        .trim()
        .strip_prefix("Second-")
        .and_then(|s| s.parse().ok())
}

fn classify_transport(message: &str) -> SoapError {
    let lower = message.to_lowercase();
    if lower.contains("connection refused") {
        SoapError::ConnectionRefused(message.to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        SoapError::Timeout(message.to_string())
    } else {
        SoapError::Network(message.to_string())
    }
}

fn extract_response(xml: &Element, action: &str) -> Result<Element, SoapError> {
    let body = xml
        .get_child("Body")
        .ok_or_else(|| SoapError::Parse("missing SOAP Body".to_string()))?;

    if let Some(fault) = body.get_child("Fault").and_then(|f| parse_fault(f)) {
        return Err(SoapError::Fault(fault));
    }

    let response_name = format!("{action}Response");
    body.get_child(response_name.as_str())
        .cloned()
        .ok_or_else(|| SoapError::Parse(format!("missing {response_name} element")))
}

fn extract_fault(xml: &Element) -> Option<SoapFault> {
    xml.get_child("Body")
        .and_then(|body| body.get_child("Fault"))
        .and_then(parse_fault)
}

fn parse_fault(fault: &Element) -> Option<SoapFault> {
    let faultcode = xml::child_text(fault, "faultcode").unwrap_or_default();
    let faultstring = xml::child_text(fault, "faultstring").unwrap_or_default();

    let upnp = fault
        .get_child("detail")
        .and_then(|d| d.get_child("UPnPError").or_else(|| d.get_child("UpnPError")));
    let upnp_code = upnp
        .and_then(|e| xml::child_text(e, "errorCode"))
        .and_then(|t| t.parse::<u16>().ok());
    let upnp_description = upnp.and_then(|e| xml::child_text(e, "errorDescription"));

    Some(SoapFault {
        faultcode,
        faultstring,
        upnp_code,
        upnp_description,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAULT_XML: &str = r#"
        <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
            <s:Body>
                <s:Fault>
                    <faultcode>s:Client</faultcode>
                    <faultstring>UPnPError</faultstring>
                    <detail>
                        <UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
                            <errorCode>701</errorCode>
                            <errorDescription>Transition not available</errorDescription>
                        </UPnPError>
                    </detail>
                </s:Fault>
            </s:Body>
        </s:Envelope>
    "#;

    #[test]
    fn test_extract_response_with_valid_response() {
        let xml_str = r#"
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
                <s:Body>
                    <u:PlayResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
                    </u:PlayResponse>
                </s:Body>
            </s:Envelope>
        "#;

        let xml = Element::parse(xml_str.as_bytes()).unwrap();
        let response = extract_response(&xml, "Play").unwrap();
        assert_eq!(response.name, "PlayResponse");
    }

    #[test]
    fn test_extract_response_with_soap_fault() {
        let xml = Element::parse(FAULT_XML.as_bytes()).unwrap();
        let result = extract_response(&xml, "Play");

        match result.unwrap_err() {
            SoapError::Fault(fault) => {
                assert_eq!(fault.faultcode, "s:Client");
                assert_eq!(fault.faultstring, "UPnPError");
                assert_eq!(fault.upnp_code, Some(701));
                assert_eq!(
                    fault.upnp_description.as_deref(),
                    Some("Transition not available")
                );
            }
            other => panic!("expected SoapError::Fault, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_response_missing_body() {
        let xml_str = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"></s:Envelope>"#;
        let xml = Element::parse(xml_str.as_bytes()).unwrap();
        match extract_response(&xml, "Play").unwrap_err() {
            SoapError::Parse(msg) => assert!(msg.contains("missing SOAP Body")),
            other => panic!("expected SoapError::Parse, got {other:?}"),
        }
    }

    #[test]
    fn test_fault_without_vendor_detail() {
        let xml_str = r#"
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
                <s:Body>
                    <s:Fault>
                        <faultcode>s:Server</faultcode>
                        <faultstring>Internal Error</faultstring>
                    </s:Fault>
                </s:Body>
            </s:Envelope>
        "#;
        let xml = Element::parse(xml_str.as_bytes()).unwrap();
        match extract_response(&xml, "Play").unwrap_err() {
            SoapError::Fault(fault) => {
                assert_eq!(fault.faultcode, "s:Server");
                assert_eq!(fault.upnp_code, None);
            }
            other => panic!("expected SoapError::Fault, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_timeout_header() {
        assert_eq!(parse_timeout_header("Second-300"), Some(300));
        assert_eq!(parse_timeout_header(" Second-1800"), Some(1800));
        assert_eq!(parse_timeout_header("infinite"), None);
    }

    #[test]
    fn test_classify_transport() {
        assert!(matches!(
            classify_transport("Connection Failed: Connection refused (os error 111)"),
            SoapError::ConnectionRefused(_)
        ));
        assert!(matches!(
            classify_transport("Network Error: timed out reading response"),
            SoapError::Timeout(_)
        ));
        assert!(matches!(
            classify_transport("Dns Failed: resolve"),
            SoapError::Network(_)
        ));
    }

    #[test]
    fn test_call_against_mock_server() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/MediaRenderer/AVTransport/Control")
            .match_header("soapaction", "\"urn:schemas-upnp-org:service:AVTransport:1#GetTransportInfo\"")
            .with_status(200)
            .with_body(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
                    <s:Body>
                        <u:GetTransportInfoResponse xmlns:u="urn:schemas-upnp-org:service:AVTransport:1">
                            <CurrentTransportState>PLAYING</CurrentTransportState>
                            <CurrentTransportStatus>OK</CurrentTransportStatus>
                        </u:GetTransportInfoResponse>
                    </s:Body>
                </s:Envelope>"#,
            )
            .create();

        let client = SoapClient::new();
        let url = format!("{}/MediaRenderer/AVTransport/Control", server.url());
        let response = client
            .call(
                &url,
                "urn:schemas-upnp-org:service:AVTransport:1",
                "GetTransportInfo",
                &[("InstanceID", "0")],
                CallOptions::default(),
            )
            .unwrap();

        assert_eq!(
            xml::child_text(&response, "CurrentTransportState").as_deref(),
            Some("PLAYING")
        );
        mock.assert();
    }

    #[test]
    fn test_non_idempotent_call_is_not_retried() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/Control")
            .with_status(503)
            .with_body("unavailable")
            .expect(1)
            .create();

        let client = SoapClient::new();
        let url = format!("{}/Control", server.url());
        let result = client.call(
            &url,
            "urn:schemas-upnp-org:service:AVTransport:1",
            "Play",
            &[("InstanceID", "0"), ("Speed", "1")],
            CallOptions {
                idempotent: false,
                within_discovery_grace: false,
            },
        );

        assert!(matches!(result, Err(SoapError::Http(503))));
        mock.assert();
    }

    #[test]
    fn test_transient_error_is_retried() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/Control")
            .with_status(503)
            .with_body("unavailable")
            .expect(3)
            .create();

        let client = SoapClient::new();
        let url = format!("{}/Control", server.url());
        let result = client.call(
            &url,
            "urn:schemas-upnp-org:service:AVTransport:1",
            "GetVolume",
            &[("InstanceID", "0"), ("Channel", "Master")],
            CallOptions::default(),
        );

        assert!(matches!(result, Err(SoapError::Http(503))));
        mock.assert();
    }
}
