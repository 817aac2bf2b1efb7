use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::constants::{JSONRPC_VERSION, Method};

/// Error object carried in a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// A JSON-RPC request.
///
/// `params` is kept as raw JSON until the worker knows which payload the
/// method expects. On the wire it is always a one-element array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Box<RawValue>,
    pub id: u64,
}

impl RpcRequest {
    /// Creates a request wrapping `params` as `[params]`.
    pub fn new<P: Serialize>(id: u64, method: Method, params: &P) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(&[params])?;
        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.as_str().to_string(),
            params: RawValue::from_string(json)?,
            id,
        })
    }

    /// Deserializes the single params element.
    pub fn parse_params<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        let (params,): (P,) = serde_json::from_str(self.params.get())?;
        Ok(params)
    }
}

/// A JSON-RPC response.
///
/// `result` and `error` are both serialized, one of them as `null`. `id` is
/// `null` only when the request could not be parsed far enough to read it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Box<RawValue>>,
    pub error: Option<RpcError>,
    pub id: Option<u64>,
}

impl RpcResponse {
    /// Creates a successful response.
    pub fn success<T: Serialize>(id: u64, result: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(result)?;
        Ok(Self {
            result: Some(RawValue::from_string(json)?),
            error: None,
            id: Some(id),
        })
    }

    /// Creates an error response.
    pub fn failure(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }

    /// Deserializes the result. Returns `None` if the response carries no result.
    pub fn parse_result<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.result {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}
