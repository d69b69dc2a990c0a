use clap::Parser as _;
use evrpc::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    evrpc_client::setup(Some(cli.log_level()));
    cli.run().await
}
