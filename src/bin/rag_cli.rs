use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use portfolio_rag::composer::render_context;
use portfolio_rag::config::{ChatArgs, EmbedderArgs, PolicyArgs, StoreArgs};
use portfolio_rag::telemetry::init_tracing;
use portfolio_rag::{AnswerComposer, Retriever};

#[derive(Parser, Debug)]
#[command(
    name = "portfolio-ask",
    about = "Ask one question against the portfolio collection from the terminal"
)]
struct AskCli {
    /// Question to answer.
    #[arg(long)]
    query: String,

    /// Response language (defaults to --language).
    #[arg(long)]
    answer_language: Option<String>,

    /// Override the intent's similarity threshold.
    #[arg(long)]
    min_similarity: Option<f32>,

    /// Only print the classification and retrieved context (skip the chat call).
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    #[command(flatten)]
    embedder: EmbedderArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    policy: PolicyArgs,

    #[command(flatten)]
    chat: ChatArgs,
}

fn main() -> Result<()> {
    init_tracing("warn");
    let cli = AskCli::parse();
    let embedder = Arc::new(cli.embedder.build().context("failed to build embedder")?);
    let store = cli.store.open().context("failed to open vector store")?;
    let policy = cli.policy.load().context("failed to load retrieval policy")?;
    let retriever = Retriever::new(embedder, store, cli.store.collection.clone(), policy);

    let mut query = retriever.prepare(&cli.query);
    if let Some(min_similarity) = cli.min_similarity {
        query = query.with_min_similarity(min_similarity.clamp(0.0, 1.0));
    }
    let result = retriever
        .retrieve_query(query, None)
        .with_context(|| format!("retrieval against `{}` failed", retriever.collection()))?;

    println!(
        "--- Intent: {} (top_k {}, min_similarity {:.2}, {} of {} candidates kept) ---",
        result.query.intent,
        result.query.top_k,
        result.query.min_similarity,
        result.hits.len(),
        result.candidates
    );
    if result.is_empty() {
        println!("(no chunks cleared the threshold)\n");
    } else {
        println!("{}", render_context(&result.hits));
    }
    if cli.dry_run {
        return Ok(());
    }

    let chatter = cli
        .chat
        .build(cli.embedder.openai_api_key.as_deref())
        .context("failed to build chat client")?;
    let composer = AnswerComposer::new(chatter, cli.chat.composer_config());
    let answer = composer
        .compose(&cli.query, &result, &[], cli.answer_language.as_deref())
        .context("failed to get response")?;
    println!("--- Answer ---\n{answer}");
    Ok(())
}
