/// Topic broker
///
/// the serving side of the wire protocol: answers hello, records
/// subscriptions and pushes `notify` calls to subscribed clients.
pub mod server;

pub use server::Broker;
