//! # lex-sentinel CLI (`lex`)
//!
//! The `lex` binary drives the legal-act change tracking pipeline: it
//! ingests act versions and internal documents, builds their summary
//! hierarchies, diffs act versions, and scores the impact of each change
//! on the document corpus.
//!
//! ## Usage
//!
//! ```bash
//! lex --config ./config/lex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lex init` | Create the SQLite database and schema |
//! | `lex ingest act` | Ingest a new version of an act from a text file |
//! | `lex ingest doc` | Ingest an internal document from a text file |
//! | `lex embed pending` | Backfill missing fragment embeddings |
//! | `lex embed rebuild` | Delete and regenerate all embeddings |
//! | `lex summarize act <slug>` | Build the summary hierarchy for an act version |
//! | `lex summarize doc <id>` | Build the summary hierarchy for a document |
//! | `lex diff <slug>` | Detect changes between two act versions |
//! | `lex assess <slug>` | Score the impact of detected changes on documents |
//! | `lex show act <slug>` | Print an act's versions and summary tree |
//! | `lex show doc <id>` | Print a document's summary tree |
//! | `lex report <slug>` | Print changeset entries with their assessments |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lex_sentinel::config;

/// lex-sentinel — legal-act change tracking with recursive summarization
/// and document impact assessment.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lex.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lex",
    about = "lex-sentinel — legal-act change tracking and document impact assessment",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest an act version or an internal document.
    Ingest {
        #[command(subcommand)]
        target: IngestTarget,
    },

    /// Manage fragment embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Build the summary hierarchy for an act version or a document.
    Summarize {
        #[command(subcommand)]
        target: SummarizeTarget,
    },

    /// Detect changes between two versions of an act.
    Diff {
        /// Act slug.
        slug: String,
        /// Older version number.
        #[arg(long)]
        from: i64,
        /// Newer version number.
        #[arg(long)]
        to: i64,
    },

    /// Score the impact of detected changes on the document corpus.
    Assess {
        /// Act slug.
        slug: String,
        /// Older version number.
        #[arg(long)]
        from: i64,
        /// Newer version number.
        #[arg(long)]
        to: i64,
        /// Override the number of candidate documents per change.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Print stored summaries.
    Show {
        #[command(subcommand)]
        target: ShowTarget,
    },

    /// Print changeset entries with their impact assessments.
    Report {
        /// Act slug.
        slug: String,
        /// Older version number.
        #[arg(long)]
        from: i64,
        /// Newer version number.
        #[arg(long)]
        to: i64,
    },
}

#[derive(Subcommand)]
enum IngestTarget {
    /// Ingest the next version of an act from a plain-text file.
    Act {
        /// Stable act handle (e.g. `vat`).
        #[arg(long)]
        slug: String,
        /// Act title.
        #[arg(long)]
        title: String,
        /// Path to the act's plain text.
        #[arg(long)]
        file: PathBuf,
        /// Publication date (YYYY-MM-DD).
        #[arg(long)]
        published: Option<String>,
    },
    /// Ingest an internal document from a plain-text file.
    Doc {
        /// Document title.
        #[arg(long)]
        title: String,
        /// Path to the document's plain text.
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed fragments missing from the cache.
    Pending {
        /// Maximum number of texts to embed.
        #[arg(long)]
        limit: Option<usize>,
        /// Show counts without embedding.
        #[arg(long)]
        dry_run: bool,
    },
    /// Clear the cache and re-embed everything.
    Rebuild,
}

#[derive(Subcommand)]
enum SummarizeTarget {
    /// Summarize an act version (defaults to the latest).
    Act {
        slug: String,
        /// Version number to summarize.
        #[arg(long)]
        version: Option<i64>,
    },
    /// Summarize a document.
    Doc { id: String },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Print an act's versions and latest summary tree.
    Act { slug: String },
    /// Print a document's summary tree.
    Doc { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    // Catch contract drift before any command runs.
    lex_sentinel::prompts::PromptRegistry::load()?;

    match cli.command {
        Commands::Init => {
            lex_sentinel::migrate::run_migrations(&config).await?;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Ingest { target } => match target {
            IngestTarget::Act {
                slug,
                title,
                file,
                published,
            } => {
                lex_sentinel::ingest::run_ingest_act(&config, &slug, &title, &file, published)
                    .await?;
            }
            IngestTarget::Doc { title, file } => {
                lex_sentinel::ingest::run_ingest_doc(&config, &title, &file).await?;
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Pending { limit, dry_run } => {
                lex_sentinel::embed_cmd::run_embed_pending(&config, limit, dry_run).await?;
            }
            EmbedAction::Rebuild => {
                lex_sentinel::embed_cmd::run_embed_rebuild(&config).await?;
            }
        },
        Commands::Summarize { target } => match target {
            SummarizeTarget::Act { slug, version } => {
                lex_sentinel::summarize::run_summarize_act(&config, &slug, version).await?;
            }
            SummarizeTarget::Doc { id } => {
                lex_sentinel::summarize::run_summarize_doc(&config, &id).await?;
            }
        },
        Commands::Diff { slug, from, to } => {
            lex_sentinel::diff::run_diff(&config, &slug, from, to).await?;
        }
        Commands::Assess {
            slug,
            from,
            to,
            top_k,
        } => {
            lex_sentinel::assess::run_assess(&config, &slug, from, to, top_k).await?;
        }
        Commands::Show { target } => match target {
            ShowTarget::Act { slug } => {
                lex_sentinel::show::run_show_act(&config, &slug).await?;
            }
            ShowTarget::Doc { id } => {
                lex_sentinel::show::run_show_doc(&config, &id).await?;
            }
        },
        Commands::Report { slug, from, to } => {
            lex_sentinel::show::run_report(&config, &slug, from, to).await?;
        }
    }

    Ok(())
}
