//! Invocation protocol between the host and a plugin entry point.
//!
//! The host starts the entry point with the capability name as its only
//! argument, writes one JSON [`InvocationRequest`] to stdin and closes it,
//! then reads one JSON [`InvocationResponse`] from stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::CapabilityType;

/// Current protocol revision written into every request.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request envelope sent to a plugin entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub protocol: u32,
    /// Id of the plugin being invoked.
    pub plugin_id: String,
    /// Name of the capability being invoked.
    pub capability: String,
    /// Kind of the capability being invoked.
    pub kind: CapabilityType,
    /// Caller-supplied payload.
    #[serde(default)]
    pub input: Value,
}

impl InvocationRequest {
    pub fn new(
        plugin_id: impl Into<String>,
        capability: impl Into<String>,
        kind: CapabilityType,
        input: Value,
    ) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            plugin_id: plugin_id.into(),
            capability: capability.into(),
            kind,
            input,
        }
    }
}

/// Response envelope read back from a plugin entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InvocationResponse {
    Ok {
        #[serde(default)]
        output: Value,
    },
    Error {
        message: String,
    },
}

impl InvocationResponse {
    /// Convert into a `Result`, keeping the plugin's error message.
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            InvocationResponse::Ok { output } => Ok(output),
            InvocationResponse::Error { message } => Err(message),
        }
    }
}
