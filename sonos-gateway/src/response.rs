//! Response body shapes for the HTTP dispatcher.
//!
//! Successful actions answer `{"status": "success"}` (plus any payload
//! fields); queries answer their result value directly. Errors carry
//! `{"status": "error", "error": "<message>"}` with a 4xx/5xx status.

use serde::Serialize;
use serde_json::{json, Value};

use crate::error::GatewayError;

/// Bare success acknowledgement.
pub fn success() -> Value {
    json!({ "status": "success" })
}

/// Success with extra payload fields merged in.
pub fn success_with(payload: Value) -> Value {
    let mut body = success();
    if let (Some(body_map), Some(payload_map)) = (body.as_object_mut(), payload.as_object()) {
        for (key, value) in payload_map {
            body_map.insert(key.clone(), value.clone());
        }
    }
    body
}

/// Serialize a query result directly.
pub fn data<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|_| json!(null))
}

/// (status code, body) pair handed to the HTTP dispatcher.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }
}

impl From<GatewayError> for Reply {
    fn from(err: GatewayError) -> Self {
        Self {
            status: err.http_status(),
            body: err.to_body(),
        }
    }
}

/// Collapse a router result into a reply.
pub fn reply(result: crate::error::Result<Value>) -> Reply {
    match result {
        Ok(body) => Reply::ok(body),
        Err(err) => err.into(),
    }
}
