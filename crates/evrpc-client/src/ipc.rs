/// RPC wire layer
///
/// provides the message envelope, frame codec, endpoint addressing and the
/// socket transport that carries remote calls in both directions.
pub mod channel;
pub mod codec;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod transport;

pub use channel::RpcChannel;
pub use codec::*;
pub use endpoint::{Endpoint, EndpointError};
pub use envelope::{RpcEnvelope, RpcKind};
pub use error::TransportError;
pub use protocol::*;
pub use transport::{
    BoxFuture, Connection, RpcMethods, SocketTransport, Transport, TransportOptions,
};
