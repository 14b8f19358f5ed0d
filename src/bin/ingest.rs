use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use portfolio_rag::config::{ChunkingArgs, EmbedderArgs, PacingArgs, StoreArgs};
use portfolio_rag::telemetry::init_tracing;
use portfolio_rag::{DocumentLoader, IngestConfig, IngestPipeline, MarkdownChunker};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "portfolio-ingest",
    about = "Chunk, enrich and embed portfolio markdown into a fresh vector collection"
)]
struct IngestCli {
    /// Directory containing the markdown sources.
    #[arg(long, env = "PORTFOLIO_SOURCE_DIR", default_value = "content")]
    source_dir: PathBuf,

    /// Only chunk the sources and report counts (no embedding, no writes).
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    #[command(flatten)]
    chunking: ChunkingArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,

    #[command(flatten)]
    pacing: PacingArgs,

    #[command(flatten)]
    store: StoreArgs,
}

fn main() -> Result<()> {
    init_tracing("info");
    let cli = IngestCli::parse();
    let chunking = cli.chunking.build().context("invalid chunking options")?;

    if cli.dry_run {
        let documents = DocumentLoader::default()
            .load_dir(&cli.source_dir)
            .with_context(|| format!("failed to load {}", cli.source_dir.display()))?;
        let chunker = MarkdownChunker::new(chunking)?;
        let mut total = 0;
        for document in &documents {
            let chunked = chunker.chunk(document);
            info!(
                document = %document.id,
                chunks = chunked.chunks.len(),
                fallback = chunked.fallback.is_some(),
                "chunked"
            );
            total += chunked.chunks.len();
        }
        println!("{} documents, {} chunks (dry run)", documents.len(), total);
        return Ok(());
    }

    let embedder = Arc::new(cli.embedder.build().context("failed to build embedder")?);
    let store = cli.store.open().context("failed to open vector store")?;
    let config = IngestConfig {
        chunking,
        embedding_batch_size: cli.pacing.embedding_batch_size.max(1),
        embedding_model: cli.embedder.embedding_model.clone(),
        write_batch_size: cli.store.write_batch_size.max(1),
        pacing: cli.pacing.build(),
    };
    let pipeline = IngestPipeline::new(config, embedder, store)?;
    let report = pipeline
        .run(&cli.source_dir, &cli.store.collection)
        .with_context(|| {
            format!(
                "ingestion of {} into `{}` failed",
                cli.source_dir.display(),
                cli.store.collection
            )
        })?;
    if report.parse_fallbacks > 0 {
        info!(
            documents = report.parse_fallbacks,
            "some documents were chunked as plain text"
        );
    }
    println!(
        "wrote {} chunks from {} documents into `{}`",
        report.chunks_written, report.documents, cli.store.collection
    );
    Ok(())
}
