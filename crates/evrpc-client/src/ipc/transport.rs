use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::channel::RpcChannel;
use super::endpoint::Endpoint;
use super::error::TransportError;
use super::protocol::ErrorMessage;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Methods a peer may invoke on this side of the connection
pub trait RpcMethods: Send + Sync + 'static {
    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BoxFuture<'static, Result<serde_json::Value, ErrorMessage>>;
}

/// Options recognised by the socket transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Limit on establishing the stream and completing the hello exchange
    pub connect_timeout: Duration,
    /// Limit on waiting for the response to one remote call
    pub request_timeout: Duration,
    /// Sent to the server in the hello message
    pub client_name: String,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_name: "evrpc-client".to_owned(),
        }
    }
}

/// Acquires connections to a broker
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        endpoint: &Endpoint,
        methods: Arc<dyn RpcMethods>,
        options: &TransportOptions,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// A live connection; dropping it releases the underlying resources
pub trait Connection: Send + Sync + 'static {
    /// Invoke a method on the remote side and wait for its result
    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, TransportError>> + Send;

    /// Wait until the connection stops reading
    ///
    /// Returns `Ok` only when the connection was closed locally.
    fn wait_on_reader(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Length-prefixed frames over unix sockets or TCP
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketTransport;

impl Transport for SocketTransport {
    type Connection = RpcChannel;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        methods: Arc<dyn RpcMethods>,
        options: &TransportOptions,
    ) -> Result<RpcChannel, TransportError> {
        RpcChannel::connect(endpoint, methods, options).await
    }
}

impl Connection for RpcChannel {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        Self::call(self, method, params).await
    }

    async fn wait_on_reader(&self) -> Result<(), TransportError> {
        Self::wait_on_reader(self).await
    }
}
