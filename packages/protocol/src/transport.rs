use std::fmt::Display;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: u32,
    pub message: String,
}

impl Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Code: {}, Message: {}", self.code, self.message)
    }
}

impl RpcError {
    pub fn new<C: Into<u32>>(code: C, message: &str) -> Self {
        Self {
            code: code.into(),
            message: message.to_string(),
        }
    }

    pub fn new2<C: Into<u32> + Display>(code: C) -> Self {
        Self {
            message: code.to_string(),
            code: code.into(),
        }
    }
}

pub type RpcResult<Type> = Result<Type, RpcError>;

/// A control-plane request as routed over the channel. Methods are dynamic
/// strings so that a handler can pass requests it does not understand down
/// to a shared base handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ChannelRequest {
    pub fn new(id: u64, method: &str, data: serde_json::Value) -> Self {
        Self {
            id,
            method: method.to_string(),
            data,
        }
    }
}
