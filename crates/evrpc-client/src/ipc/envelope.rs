use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use uuid::Uuid;

/// Version carried by every envelope and checked during the hello exchange.
pub const PROTOCOL_VERSION: u16 = 1;

/// RPC message envelope
///
/// Every frame on the wire carries exactly one envelope. Responses and errors
/// reuse the `uuid` of the request they answer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcEnvelope {
    /// Protocol version, currently 1
    pub proto: u16,
    /// Message unique identifier
    pub uuid: String,
    /// Basic communication type
    pub kind: RpcKind,
    /// Specific message content
    pub msg: serde_json::Value,
    /// Message timestamp
    pub timestamp: DateTime<Utc>,
}

impl RpcEnvelope {
    pub fn new(kind: RpcKind, msg: serde_json::Value) -> Self {
        Self::new_with_uuid(kind, msg, Uuid::new_v4().to_string())
    }

    /// Create an envelope answering (or correlated with) `uuid`
    pub fn new_with_uuid(kind: RpcKind, msg: serde_json::Value, uuid: String) -> Self {
        Self {
            proto: PROTOCOL_VERSION,
            uuid,
            kind,
            msg,
            timestamp: Utc::now(),
        }
    }

    pub fn request(method: &str, params: serde_json::Value) -> Self {
        Self::new(RpcKind::Request(method.to_owned()), params)
    }
}

/// RPC basic communication types
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Display)]
pub enum RpcKind {
    /// Hello message, exchanged once when a connection opens
    Hello,
    /// Remote method invocation, the payload holds the parameters
    Request(String),
    /// Successful result of a request
    Response,
    /// Failed result of a request
    Err,
}
