use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use evrpc_client::config::{ClientConfig, ENDPOINT_ENV};
use evrpc_client::ipc::{PublishMessage, PublishResult, RpcChannel, methods};
use evrpc_client::pubsub::{EventClientMethods, SubscriptionRegistry};
use evrpc_client::EventRpcClient;

#[derive(Debug, Parser)]
#[command(name = "evrpc", version, about = "Subscribe to or publish topic events")]
pub struct Cli {
    /// Set verbose output level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Subscribe to topics and print every event as a JSON line
    Listen(ListenArgs),
    /// Publish one event through the broker
    Publish(PublishArgs),
}

#[derive(Debug, Args)]
struct ListenArgs {
    /// Broker address, unix:///path or tcp://host:port
    #[arg(short, long, env = ENDPOINT_ENV)]
    endpoint: Option<String>,

    /// Configuration file, defaults to `evrpc.toml` when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Give up on the first connection fault
    #[arg(long)]
    no_retry: bool,

    /// Topics to subscribe to, added to the configured ones
    topics: Vec<String>,
}

#[derive(Debug, Args)]
struct PublishArgs {
    /// Broker address, unix:///path or tcp://host:port
    #[arg(short, long, env = ENDPOINT_ENV)]
    endpoint: Option<String>,

    topic: String,

    /// Event payload, parsed as JSON and sent as a plain string otherwise
    data: String,
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Listen(args) => listen(args).await,
            Command::Publish(args) => publish(args).await,
        }
    }
}

async fn listen(args: ListenArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::from_env()?,
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = Some(endpoint);
    }
    if args.no_retry {
        config.retry.enabled = false;
    }

    let endpoint = config.endpoint()?;
    let topics: Vec<String> = config.topics.iter().chain(&args.topics).cloned().collect();
    if topics.is_empty() {
        bail!("No topics given on the command line or in the configuration");
    }

    let client = EventRpcClient::new()
        .with_retry(config.retry_config())
        .with_options(config.transport_options());

    for topic in topics {
        let name = topic.clone();
        client.subscribe(topic, move |data| {
            let line = json!({ "topic": name, "data": data });
            async move {
                println!("{line}");
                Ok(())
            }
        });
    }
    client.on_connect(|| async {
        log::info!("Listening for events");
        Ok(())
    });

    tokio::select! {
        result = client.run(&endpoint, true) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted, stopping");
            Ok(())
        }
    }
}

async fn publish(args: PublishArgs) -> Result<()> {
    let mut config = ClientConfig::from_env()?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = Some(endpoint);
    }
    let endpoint = config.endpoint()?;

    let data = serde_json::from_str(&args.data)
        .unwrap_or_else(|_| serde_json::Value::String(args.data.clone()));
    let request = PublishMessage {
        topic: args.topic.as_str().into(),
        data,
    };

    // a publisher serves nothing, the registry stays empty
    let channel = RpcChannel::connect(
        &endpoint,
        Arc::new(EventClientMethods::new(SubscriptionRegistry::new())),
        &config.transport_options(),
    )
    .await?;
    let reply = channel
        .call(methods::PUBLISH, serde_json::to_value(request)?)
        .await
        .with_context(|| format!("Failed to publish on `{}`", args.topic))?;
    channel.close();

    let result: PublishResult = serde_json::from_value(reply)?;
    log::info!("Event on `{}` delivered to {} subscriber(s)", args.topic, result.delivered);
    println!("{}", result.delivered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory as _;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_listen() {
        let cli = Cli::try_parse_from([
            "evrpc",
            "-vv",
            "listen",
            "--endpoint",
            "tcp://127.0.0.1:7000",
            "--no-retry",
            "guns",
            "germs",
        ])
        .expect("valid arguments");
        assert_eq!(cli.log_level(), log::LevelFilter::Trace);

        let Command::Listen(args) = cli.command else {
            panic!("expected listen");
        };
        assert_eq!(args.endpoint.as_deref(), Some("tcp://127.0.0.1:7000"));
        assert!(args.no_retry);
        assert_eq!(args.topics, vec!["guns", "germs"]);
    }

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from(["evrpc", "publish", "steel", r#"{"tons": 3}"#])
            .expect("valid arguments");
        assert_eq!(cli.log_level(), log::LevelFilter::Info);

        let Command::Publish(args) = cli.command else {
            panic!("expected publish");
        };
        assert_eq!(args.topic, "steel");
        assert_eq!(args.data, r#"{"tons": 3}"#);
    }
}
