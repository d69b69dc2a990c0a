/// Reconnecting publish/subscribe client
///
/// topic and connect-hook registration, the retry wrapper, and the connection
/// lifecycle that replays subscriptions after every reconnect.
pub mod client;
pub mod hooks;
pub mod methods;
pub mod registry;
pub mod retry;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClientHandle, EventRpcClient};
pub use hooks::{ConnectHook, ConnectHookError, HookRegistry, connect_hook};
pub use methods::EventClientMethods;
pub use registry::{SubscriptionRegistry, TopicCallback, topic_callback};
pub use retry::{RetryConfig, RetryPolicy, WaitStrategy, with_retry};
pub use state::ConnectionState;
