use anyhow::{Context as _, Result};
use clap::{Arg, Command};
use evrpc_client::{Broker, config::ENDPOINT_ENV, ipc::Endpoint};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("evrpc-broker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Publish/subscribe broker for evrpc clients")
        .arg(
            Arg::new("endpoint")
                .long("endpoint")
                .short('e')
                .env(ENDPOINT_ENV)
                .default_value(Endpoint::DEFAULT)
                .help("Address to listen on, unix:///path or tcp://host:port"),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .default_value(Broker::DEFAULT_NAME)
                .help("Server name announced to clients"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(clap::ArgAction::Count)
                .help("Set verbose output level"),
        )
        .get_matches();

    let log_level = match matches.get_count("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    evrpc_client::setup(Some(log_level));

    let endpoint: Endpoint = matches
        .get_one::<String>("endpoint")
        .map(String::as_str)
        .unwrap_or(Endpoint::DEFAULT)
        .parse()
        .context("Invalid --endpoint")?;
    let name = matches
        .get_one::<String>("name")
        .map(String::as_str)
        .unwrap_or(Broker::DEFAULT_NAME);

    let mut broker = Broker::bind(&endpoint).await?.with_name(name);
    let accept_loop = broker.start()?;

    tokio::select! {
        result = wait_for_shutdown() => result?,
        _ = accept_loop => log::error!("Accept loop stopped unexpectedly"),
    }

    broker.disconnect_all();
    log::info!("Broker stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal;

        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            _ = signal::ctrl_c() => log::info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        log::info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}
