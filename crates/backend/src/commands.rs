//! The command envelope shared with the host, and the handler seam the
//! dispatcher routes into.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded command request.
///
/// The host's serializer historically capitalizes the field names; both
/// casings are accepted.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(alias = "Command")]
    pub command: String,
    #[serde(default, alias = "Parameters")]
    pub parameters: Value,
}

/// The single-frame response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            error: None,
            result: Some(result),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            result: None,
        }
    }
}

/// What a handler hands back to the dispatcher.
pub enum Reply {
    /// One encrypted JSON frame.
    Single(Response),
    /// A metadata frame followed by a raw binary payload frame, for
    /// payloads too large to embed in JSON.
    Stream { meta: Response, payload: Vec<u8> },
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Reply::Single(response)
    }
}

/// The business-logic seam behind the dispatcher.
///
/// Implementations never touch the transport: they receive decoded
/// parameters and report failures in-band through the reply envelope.
pub trait CommandHandler {
    fn convert_to_ttl(&mut self, parameters: &Value) -> Reply;
    fn open_ttl(&mut self, parameters: &Value) -> Reply;
    fn batch_convert(&mut self, parameters: &Value) -> Reply;
    fn get_config(&mut self, parameters: &Value) -> Reply;
    fn set_config(&mut self, parameters: &Value) -> Reply;
}
