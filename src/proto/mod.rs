//! Framed JSON wire protocol shared by the worker and master daemons.
//!
//! A message is a JSON array `[type, payload?]` where `type` is one of
//! request (0), response (1), ping (2), pong (3). Frames on a stream are
//! separated by a single EOT byte (0x04). Requests and responses are
//! correlated by a per-connection sequence number `no`.

pub mod codec;
pub mod connection;
pub mod server;

pub use codec::{Frame, FrameCodec, SEPARATOR};
pub use connection::{AuthPolicy, Connection, RequestHandler};
pub use server::Server;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FabricError, Result};

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_PING: u64 = 2;
const TYPE_PONG: u64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub no: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(no: u64, data: Value) -> Self {
        Self {
            no,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(no: u64, error: impl Into<String>) -> Self {
        Self {
            no,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Unpack the payload, turning a peer-reported error into `Err`.
    pub fn into_data(self) -> Result<Option<Value>> {
        match self.error {
            Some(e) => Err(FabricError::Remote(e)),
            None => Ok(self.data),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Ping,
    Pong,
}

impl Message {
    /// Encode as a JSON array, without the frame separator.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let value = match self {
            Message::Request(r) => serde_json::json!([TYPE_REQUEST, r]),
            Message::Response(r) => serde_json::json!([TYPE_RESPONSE, r]),
            Message::Ping => serde_json::json!([TYPE_PING]),
            Message::Pong => serde_json::json!([TYPE_PONG]),
        };
        serde_json::to_vec(&value)
    }

    /// Parse one frame body. The error string is sent back to the peer in an
    /// error response with `no = 0`, since the sender's `no` is unrecoverable.
    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Message, String> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| format!("malformed JSON: {e}"))?;
        let items = value.as_array().ok_or("message is not an array")?;
        let kind = items
            .first()
            .and_then(Value::as_u64)
            .ok_or("missing message type discriminant")?;
        if items.len() > 2 {
            return Err(format!("bad message arity: {}", items.len()));
        }
        match kind {
            TYPE_REQUEST => {
                let payload = items.get(1).cloned().ok_or("request without payload")?;
                let request: Request = serde_json::from_value(payload)
                    .map_err(|e| format!("bad request payload: {e}"))?;
                Ok(Message::Request(request))
            }
            TYPE_RESPONSE => {
                let payload = items.get(1).cloned().ok_or("response without payload")?;
                let response: Response = serde_json::from_value(payload)
                    .map_err(|e| format!("bad response payload: {e}"))?;
                Ok(Message::Response(response))
            }
            TYPE_PING if items.len() == 1 => Ok(Message::Ping),
            TYPE_PONG if items.len() == 1 => Ok(Message::Pong),
            TYPE_PING | TYPE_PONG => Err("ping/pong carries no payload".to_string()),
            other => Err(format!("unknown message type {other}")),
        }
    }
}
