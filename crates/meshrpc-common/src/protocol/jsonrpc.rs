//! JSON-RPC 2.0 envelope spoken by the HTTP endpoint invoker.
//!
//! Only the client side of the exchange lives here: building a request from
//! an [`Invocation`] and classifying the response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{MeshrpcError, Result};
use super::requests::Invocation;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Server-defined: the endpoint is shutting down or overloaded.
pub const SERVER_UNAVAILABLE: i32 = -32050;

impl From<&Invocation> for JsonRpcRequest {
    fn from(invocation: &Invocation) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: invocation.method.clone(),
            params: Value::Array(invocation.args.clone()),
            id: invocation.id.into(),
        }
    }
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Turns the envelope into the call outcome.
    ///
    /// An error object is a business rejection unless the server flagged
    /// itself unavailable. A response with neither field carries `null`.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) if error.code == SERVER_UNAVAILABLE => {
                Err(MeshrpcError::EndpointUnavailable(error.message))
            }
            Some(error) => Err(MeshrpcError::Rejected {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
