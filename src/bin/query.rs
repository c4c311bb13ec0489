use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use ragserve::pipeline::QueryOptions;
use ragserve::{Config, RagService};

#[derive(Parser, Debug)]
#[command(name = "query")]
#[command(about = "Ask a one-off question against the RAGServe stores")]
struct Args {
    /// Question to answer
    query: String,

    /// Retrieval mode: naive, local, global or hybrid
    #[arg(short, long, default_value = "hybrid")]
    mode: String,

    /// Results per retrieval step
    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// Print the retrieved context instead of an answer
    #[arg(long)]
    context_only: bool,

    /// Config file (defaults to RAGSERVE_CONFIG or ./ragserve.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "warn")
    ).init();

    let args = Args::parse();
    if args.query.trim().is_empty() {
        anyhow::bail!("Query cannot be empty");
    }

    let config = Config::load_from(args.config.as_deref())?;
    let service = RagService::new(config);
    service.initialize().await.context("Failed to initialize RAG system")?;

    let start = Instant::now();
    let options = QueryOptions {
        top_k: args.top_k,
        only_need_context: args.context_only,
    };
    let answer = service.query(&args.query, &args.mode, options).await?;

    println!("{}", answer.answer);
    eprintln!("\n({} mode, {:.2}s)", answer.mode, start.elapsed().as_secs_f64());
    Ok(())
}
