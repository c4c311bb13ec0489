use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use ragserve::{Config, RagService};
use walkdir::WalkDir;

const INGESTIBLE: &[&str] = &["txt", "md", "markdown", "json", "yaml", "yml", "png", "jpg", "jpeg", "gif", "webp"];

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Ingest files or directories into the RAGServe stores")]
struct Args {
    /// Files or directories (walked recursively)
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Config file (defaults to RAGSERVE_CONFIG or ./ragserve.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep going after a file fails
    #[arg(short, long)]
    keep_going: bool,
}

fn is_ingestible(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| INGESTIBLE.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand directories into the supported files beneath them, skipping hidden entries
fn discover(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && is_ingestible(entry.path()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    let config = Config::load_from(args.config.as_deref())?;
    let service = RagService::new(config);
    service.initialize().await.context("Failed to initialize RAG system")?;

    let files = discover(&args.paths);
    if files.is_empty() {
        log::warn!("No ingestible files found");
        return Ok(());
    }
    log::info!("Found {} files to ingest", files.len());

    let start = Instant::now();
    let (mut ingested, mut skipped, mut failed) = (0usize, 0usize, 0usize);
    for file in &files {
        match service.ingest_file(file).await {
            Ok(receipt) if receipt.report.skipped => skipped += 1,
            Ok(receipt) => {
                ingested += 1;
                log::info!(
                    "{}: {} chunks, {} entities, {} relations",
                    file.display(),
                    receipt.report.chunks,
                    receipt.report.entities,
                    receipt.report.relations
                );
            }
            Err(e) => {
                failed += 1;
                log::error!("Failed to ingest {}: {}", file.display(), e);
                if !args.keep_going {
                    anyhow::bail!("Stopped after failure on {} ({} ingested so far)", file.display(), ingested);
                }
            }
        }
    }

    log::info!(
        "Done in {:.1}s: {} ingested, {} unchanged, {} failed",
        start.elapsed().as_secs_f64(),
        ingested,
        skipped,
        failed
    );
    Ok(())
}
