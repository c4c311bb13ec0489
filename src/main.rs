use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ragserve::{http, Config, RagService};

#[derive(Parser, Debug)]
#[command(name = "ragserve")]
#[command(about = "Serve graph + vector retrieval-augmented generation over HTTP")]
#[command(version)]
struct Args {
    /// Config file (defaults to RAGSERVE_CONFIG or ./ragserve.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    log::info!("Starting RAGServe v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let server = config.server.clone();
    let service = Arc::new(RagService::new(config));

    // Health reports "initializing" and operations answer 503 until this finishes
    let init = Arc::clone(&service);
    tokio::spawn(async move {
        if let Err(e) = init.initialize().await {
            log::error!("RAG system unavailable until restart: {}", e);
        }
    });

    http::serve(service, &server).await?;
    Ok(())
}
