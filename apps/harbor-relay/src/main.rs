use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harbor_relay::{
    cli::{self, Cli, Commands},
    config::Config,
    EnvelopeRouter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Some(Commands::Probe { url, seconds }) = cli.command {
        return cli::run_probe(url, seconds).await;
    }

    let config = Config::from_env().with_overrides(cli.host, cli.port);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!("Harbor relay listening on {}", addr);

    harbor_relay::serve(listener, EnvelopeRouter::new())
        .await
        .context("relay server stopped")?;
    Ok(())
}
