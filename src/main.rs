//! # threadline CLI
//!
//! Search an archive of past AI tool conversations by meaning, not just
//! keywords.
//!
//! ## Usage
//!
//! ```bash
//! threadline --config ./config/threadline.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `threadline init` | Create the SQLite database and schema |
//! | `threadline import <path>` | Import JSONL conversation records |
//! | `threadline index build` | Embed new exchanges (or `--rebuild` everything) |
//! | `threadline index status` | Show how the active index was built |
//! | `threadline search "<query>"` | Hybrid lexical + semantic search |
//! | `threadline first-mention "<query>"` | Earliest exchange that discusses a topic |
//!
//! Logs go to stderr (`--verbose` or `RUST_LOG=debug` for more); stdout
//! carries only command output.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use threadline::progress::ProgressMode;
use threadline::search::{FilterArgs, OutputMode, ParamOverrides};
use threadline::{config, index_cmd, ingest, migrate, search};

#[derive(Parser)]
#[command(
    name = "threadline",
    about = "Hybrid lexical and semantic search over past AI tool conversations",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/threadline.toml")]
    config: PathBuf,

    /// Log progress at info level (RUST_LOG overrides).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and schema. Safe to run repeatedly.
    Init,

    /// Import normalized conversation records.
    ///
    /// Reads one JSON conversation per line from a `.jsonl` file, or from
    /// every `.jsonl` file under a directory. Unchanged conversations are
    /// skipped; changed ones replace their previous version.
    Import {
        /// File or directory to import.
        path: PathBuf,
    },

    /// Manage the vector index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search conversations.
    Search {
        /// Natural-language query.
        query: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Conversations requested from lexical recall.
        #[arg(long)]
        recall_n: Option<usize>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Relevance weight for the diversity rerank, in [0, 1].
        #[arg(long)]
        lambda: Option<f32>,

        /// Return pure similarity order without the diversity rerank.
        #[arg(long)]
        no_diversity: bool,

        /// Skip lexical recall and score every indexed conversation.
        #[arg(long)]
        embeddings_only: bool,

        /// Minimum similarity a chunk needs to be considered.
        #[arg(long)]
        threshold: Option<f32>,

        /// Embedding backend (defaults to the one the index was built with).
        #[arg(long)]
        backend: Option<String>,

        /// Print the score breakdown of every result.
        #[arg(long)]
        explain: bool,

        /// Group results by conversation.
        #[arg(long)]
        by_conversation: bool,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Find the earliest exchange that discusses a topic.
    FirstMention {
        /// Natural-language query.
        query: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Minimum relevance a mention needs.
        #[arg(long)]
        threshold: Option<f32>,

        /// Embedding backend (defaults to the one the index was built with).
        #[arg(long)]
        backend: Option<String>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Embed exchanges that are not indexed yet.
    Build {
        /// Re-embed everything into a fresh generation, then swap it in.
        #[arg(long)]
        rebuild: bool,

        /// Embedding backend to use (`local` or `ollama`).
        #[arg(long)]
        backend: Option<String>,

        /// Progress on stderr (default: human when stderr is a TTY).
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Print the build report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the active index metadata and corpus counts.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { path } => {
            ingest::run_import(&cfg, &path).await?;
        }
        Commands::Index { action } => match action {
            IndexAction::Build {
                rebuild,
                backend,
                progress,
                json,
            } => {
                let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
                index_cmd::run_build(&cfg, rebuild, backend.as_deref(), progress, json).await?;
            }
            IndexAction::Status { json } => {
                index_cmd::run_status(&cfg, json).await?;
            }
        },
        Commands::Search {
            query,
            filters,
            recall_n,
            limit,
            lambda,
            no_diversity,
            embeddings_only,
            threshold,
            backend,
            explain,
            by_conversation,
            json,
        } => {
            let overrides = ParamOverrides {
                recall_n,
                limit,
                lambda,
                no_diversity,
                threshold,
            };
            let output = OutputMode {
                explain,
                by_conversation,
                json,
            };
            search::run_search(
                &cfg,
                &query,
                &filters,
                &overrides,
                embeddings_only,
                backend.as_deref(),
                output,
            )
            .await?;
        }
        Commands::FirstMention {
            query,
            filters,
            threshold,
            backend,
            json,
        } => {
            search::run_first_mention(&cfg, &query, &filters, threshold, backend.as_deref(), json)
                .await?;
        }
    }

    Ok(())
}
