//! 事件订阅客户端
//!
//! A publish/subscribe client that keeps its topic subscriptions alive across
//! reconnects, plus the broker it talks to.
//!
//! ```no_run
//! use evrpc_client::{ClientConfig, EventRpcClient};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = ClientConfig::from_env()?;
//! let client = EventRpcClient::new()
//!     .with_retry(config.retry_config())
//!     .with_options(config.transport_options());
//! client.subscribe("guns", |data| async move {
//!     log::info!("guns: {data}");
//!     Ok(())
//! });
//! client.run(&config.endpoint()?, true).await
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod ipc;
pub mod pubsub;

pub use broker::Broker;
pub use config::ClientConfig;
pub use pubsub::{ClientHandle, EventRpcClient};

use std::io::Write as _;

/// Initialise logging for binaries and examples
///
/// An explicit `level` wins over `RUST_LOG`. Calling this twice is harmless.
pub fn setup(level: Option<log::LevelFilter>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level);
    }

    let result = builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_err() {
        log::debug!("Logger already initialized, using existing logger");
    }
}
