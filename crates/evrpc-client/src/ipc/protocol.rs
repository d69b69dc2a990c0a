use serde::{Deserialize, Serialize};
use std::fmt;

use super::envelope::PROTOCOL_VERSION;

/// Name of a publish/subscribe channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Remote method names understood by both ends
pub mod methods {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const PUBLISH: &str = "publish";
    pub const NOTIFY: &str = "notify";
    pub const PING: &str = "ping";
}

/// 握手消息
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HelloMessage {
    /// version number
    pub version: u16,

    /// C2S
    pub client_info: Option<String>,

    /// S2C
    pub server_name: Option<String>,

    /// Supported features
    pub supported_features: Vec<String>,
}

impl HelloMessage {
    pub fn client(name: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client_info: Some(name.to_owned()),
            server_name: None,
            supported_features: vec!["pubsub".to_owned(), "compression".to_owned()],
        }
    }

    pub fn server(name: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client_info: None,
            server_name: Some(name.to_owned()),
            supported_features: vec![
                "pubsub".to_owned(),
                "publish".to_owned(),
                "compression".to_owned(),
            ],
        }
    }
}

/// 订阅消息
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubscribeMessage {
    pub topics: Vec<Topic>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    pub subscribed: usize,
}

/// Publish request sent to the broker
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub topic: Topic,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub delivered: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub topic: Topic,
}

/// Event notification pushed by the broker to a subscriber
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotifyMessage {
    pub subscription: SubscriptionRef,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NotifyMessage {
    pub fn new(topic: Topic, data: serde_json::Value) -> Self {
        Self {
            subscription: SubscriptionRef { topic },
            data,
        }
    }
}

/// Error message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Error code
    pub code: u32,
    /// Error description
    pub message: String,
    /// Detailed error information
    pub details: Option<String>,
}

impl ErrorMessage {
    pub const METHOD_NOT_FOUND: u32 = 404;
    pub const INVALID_PARAMS: u32 = 400;
    pub const HANDLER_FAILED: u32 = 500;

    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }
}
