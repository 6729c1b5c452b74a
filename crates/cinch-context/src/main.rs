//! Inspect a stored conversation: print its token estimate or the provider
//! payload it would produce.
//!
//! # Examples
//!
//! ```sh
//! # Token estimate for the next call
//! cinch-ctx session/history.jsonl --estimate
//!
//! # Provider payload for a specific model, with offloaded attachments
//! cinch-ctx session/history.jsonl --blob-dir session/blobs \
//!   --model anthropic/claude-sonnet-4 --system "You are a code reviewer."
//!
//! # Custom budget and compaction chain
//! cinch-ctx session/history.jsonl --config context.json
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use cinch_context::blob::fs::FsBlobStore;
use cinch_context::formatter::OpenAiFormatter;
use cinch_context::history::jsonl::JsonlHistory;
use cinch_context::manager::{ContextConfig, ContextManager, LlmContext, LoggingHandler};
use cinch_context::ContextError;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Print the token estimate or provider payload for a JSON-lines history.
#[derive(Parser)]
#[command(name = "cinch-ctx")]
struct Cli {
    /// JSON-lines history file, one message per line
    history: PathBuf,

    /// JSON file with a context configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of offloaded attachments
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Provider name passed to the formatter
    #[arg(long, default_value = "openrouter")]
    provider: String,

    /// Model whose budget and media types apply
    #[arg(long, default_value = "anthropic/claude-sonnet-4")]
    model: String,

    /// System prompt sent ahead of the history
    #[arg(long)]
    system: Option<String>,

    /// Print the token estimate instead of the payload
    #[arg(long)]
    estimate: bool,

    /// Compact and persist a summary when the history is over budget
    #[arg(long)]
    write: bool,
}

async fn run(cli: &Cli) -> Result<String, ContextError> {
    let config = match &cli.config {
        Some(path) => ContextConfig::from_json_file(path)?,
        None => ContextConfig::default(),
    };

    let history = Arc::new(JsonlHistory::open(&cli.history)?);
    let mut manager = ContextManager::new(
        LlmContext::new(&cli.provider, &cli.model),
        history,
        Arc::new(OpenAiFormatter),
    )
    .with_config(config)
    .with_events(Arc::new(LoggingHandler));

    if let Some(dir) = &cli.blob_dir {
        manager = manager.with_blob_store(Arc::new(FsBlobStore::new(dir)?));
    }
    if let Some(system) = &cli.system {
        manager.set_system_prompt(system);
    }

    if cli.estimate {
        let estimate = manager.estimate_tokens().await?;
        return Ok(format!(
            "{}\n{}\n",
            estimate.to_log_string(manager.max_input_tokens()),
            serde_json::to_string_pretty(&estimate.breakdown)?
        ));
    }

    let formatted = manager.format_messages().await?;
    if cli.write {
        manager.flush().await?;
    }
    Ok(format!("{}\n", serde_json::to_string_pretty(&formatted.messages)?))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(&cli).await {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
