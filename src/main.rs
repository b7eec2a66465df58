//! # Private RAG CLI (`prag`)
//!
//! Ingest documents, query them, and serve the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! prag --config ./config/prag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `prag init` | Create the SQLite database and run schema migrations |
//! | `prag ingest <path>` | Ingest a file or every matching file under a folder |
//! | `prag ingest-text <name> <text>` | Ingest a raw text |
//! | `prag list` | List ingested documents and their status |
//! | `prag delete <doc-id>` | Delete a document and its nodes |
//! | `prag wipe` | Delete every document |
//! | `prag retrieve "<query>"` | Print the most relevant chunks |
//! | `prag chat "<question>"` | Answer a question from the ingested documents |
//! | `prag serve` | Start the HTTP server |
//!
//! Log verbosity follows `RUST_LOG` (default `info`); logs go to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use private_rag::{commands, config, migrate, server};

/// Private RAG: retrieval-augmented answers over your own documents.
#[derive(Parser)]
#[command(
    name = "prag",
    about = "Private RAG: retrieval-augmented answers over your own documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/prag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Ingest a file or folder.
    ///
    /// Re-ingesting a file replaces the nodes from its previous ingestion.
    Ingest {
        /// File or directory to ingest.
        path: PathBuf,
    },

    /// Ingest a raw text under a generated document id.
    IngestText {
        /// Name stored as the document's `file_name`.
        file_name: String,
        /// The text itself.
        text: String,
    },

    /// List ingested documents.
    List,

    /// Delete one document by id.
    Delete {
        document_id: String,
    },

    /// Delete every document.
    Wipe,

    /// Print the chunks most relevant to a query.
    Retrieve {
        query: String,

        /// Number of chunks to return (defaults to `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Restrict to these document ids. Repeatable.
        #[arg(long = "doc")]
        docs: Vec<String>,
    },

    /// Ask a question.
    Chat {
        question: String,

        /// Answer without retrieving context.
        #[arg(long)]
        no_context: bool,

        /// Print tokens as they are generated.
        #[arg(long)]
        stream: bool,

        /// Restrict retrieval to these document ids. Repeatable.
        #[arg(long = "doc")]
        docs: Vec<String>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path } => {
            commands::run_ingest(&cfg, &path).await?;
        }
        Commands::IngestText { file_name, text } => {
            commands::run_ingest_text(&cfg, &file_name, &text).await?;
        }
        Commands::List => {
            commands::run_list(&cfg).await?;
        }
        Commands::Delete { document_id } => {
            commands::run_delete(&cfg, &document_id).await?;
        }
        Commands::Wipe => {
            commands::run_wipe(&cfg).await?;
        }
        Commands::Retrieve { query, top_k, docs } => {
            commands::run_retrieve(&cfg, &query, top_k, docs).await?;
        }
        Commands::Chat {
            question,
            no_context,
            stream,
            docs,
        } => {
            commands::run_chat(&cfg, &question, !no_context, stream, docs).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
