//! CLI command implementations.
//!
//! Each `run_*` function builds the [`Components`] it needs, performs one
//! operation, prints a human-readable report to stdout, and closes the
//! database pool.

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use std::io::Write;
use std::path::Path;
use tracing::warn;

use private_rag_core::cancel::CancellationToken;
use private_rag_core::chat::ChatRequest;
use private_rag_core::ingest::FILE_NAME_KEY;
use private_rag_core::models::{AnswerEvent, IngestedDocumentRecord, SearchFilter};

use crate::components::Components;
use crate::config::Config;
use crate::loader;

/// Ingest a file or folder.
pub async fn run_ingest(config: &Config, path: &Path) -> Result<()> {
    let report = loader::load_path(path, &config.ingestion)?;
    let components = Components::build(config).await?;

    println!("ingest {}", path.display());
    println!("  files loaded: {}", report.documents.len());

    let names: Vec<String> = report
        .documents
        .iter()
        .map(|d| d.metadata.get(FILE_NAME_KEY).cloned().unwrap_or_else(|| d.id.clone()))
        .collect();
    let results = components.ingestion.ingest_many(report.documents).await;

    let mut nodes = 0;
    let mut failed = 0;
    for (name, result) in names.iter().zip(results) {
        match result {
            Ok(record) => {
                nodes += record.node_ids.len();
                println!("  ok     {} ({} nodes)", name, record.node_ids.len());
            }
            Err(e) => {
                failed += 1;
                println!("  failed {}: {}", name, e);
            }
        }
    }
    for (rel, reason) in &report.skipped {
        println!("  skipped {}: {}", rel, reason);
    }

    println!("  nodes written: {}", nodes);
    println!("  failed: {}", failed);
    println!("  skipped: {}", report.skipped.len());
    components.close().await;

    if failed > 0 {
        bail!("{} document(s) failed to ingest", failed);
    }
    println!("ok");
    Ok(())
}

/// Ingest a raw text under a generated document id.
pub async fn run_ingest_text(config: &Config, file_name: &str, text: &str) -> Result<()> {
    let components = Components::build(config).await?;
    let result = components.ingestion.ingest_text(file_name, text).await;
    components.close().await;

    let record = result.context("Ingestion failed")?;
    println!("ingested {}", record.document_id);
    println!("  nodes: {}", record.node_ids.len());
    Ok(())
}

pub async fn run_list(config: &Config) -> Result<()> {
    let components = Components::build(config).await?;
    let records = components.ingestion.list();
    components.close().await;

    if records.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &IngestedDocumentRecord) {
    let name = record
        .metadata
        .get(FILE_NAME_KEY)
        .map(String::as_str)
        .unwrap_or("-");
    println!("{}  {:?}  {} nodes  {}", record.document_id, record.status, record.node_ids.len(), name);
    if let Some(ref err) = record.error {
        println!("    error: {}", err);
    }
}

pub async fn run_delete(config: &Config, document_id: &str) -> Result<()> {
    let components = Components::build(config).await?;
    let result = components.ingestion.delete(document_id).await;
    components.close().await;

    let removed = result.context("Delete failed")?;
    println!("deleted {} ({} nodes)", document_id, removed);
    Ok(())
}

pub async fn run_wipe(config: &Config) -> Result<()> {
    let components = Components::build(config).await?;
    let result = components.ingestion.wipe().await;
    components.close().await;

    let removed = result.context("Wipe failed")?;
    println!("wiped {} documents", removed);
    Ok(())
}

/// Print the most relevant chunks for a query.
pub async fn run_retrieve(
    config: &Config,
    query: &str,
    top_k: Option<usize>,
    docs: Vec<String>,
) -> Result<()> {
    let components = Components::build(config).await?;
    let filter = if docs.is_empty() {
        SearchFilter::default()
    } else {
        SearchFilter::documents(docs)
    };
    let limit = top_k.unwrap_or(config.retrieval.top_k);
    let result = components
        .chat
        .chunks(query, limit, &filter, config.retrieval.prev_next_chunks)
        .await;
    components.close().await;

    let chunks = result.context("Retrieval failed")?;
    if chunks.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, chunk) in chunks.iter().enumerate() {
        let name = chunk
            .node
            .metadata
            .get(FILE_NAME_KEY)
            .map(String::as_str)
            .unwrap_or("-");
        println!("{}. [{:.2}] {} #{}", i + 1, chunk.score, name, chunk.node.position);
        println!("    excerpt: \"{}\"", chunk.node.text.replace('\n', " ").trim());
        println!("    document: {}", chunk.node.document_id);
        println!("    node: {}", chunk.node.id);
        println!();
    }
    Ok(())
}

/// Answer one question, optionally streaming tokens as they arrive.
///
/// Ctrl-C during generation cancels the request.
pub async fn run_chat(
    config: &Config,
    question: &str,
    use_context: bool,
    stream: bool,
    docs: Vec<String>,
) -> Result<()> {
    let components = Components::build(config).await?;
    let filter = if docs.is_empty() {
        SearchFilter::default()
    } else {
        SearchFilter::documents(docs)
    };

    let (cancel, handle) = CancellationToken::new();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    let result = if stream {
        let mut request = ChatRequest::query(question).with_filter(filter);
        request.use_context = use_context;
        stream_answer(&components, request, cancel).await
    } else {
        components
            .chat
            .complete(question, use_context, filter, &cancel)
            .await
            .map(|answer| {
                println!("{}", answer.text);
                answer.citations
            })
            .map_err(anyhow::Error::from)
    };
    watcher.abort();
    components.close().await;

    let citations = result?;
    if !citations.is_empty() {
        println!();
        println!("sources:");
        for id in citations {
            println!("  {}", id);
        }
    }
    Ok(())
}

async fn stream_answer(
    components: &Components,
    request: ChatRequest,
    cancel: CancellationToken,
) -> Result<Vec<String>> {
    let mut events = components.chat.chat_stream(request, cancel).await?;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            AnswerEvent::Delta { text } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            AnswerEvent::Done { citations } => {
                writeln!(stdout)?;
                return Ok(citations);
            }
            AnswerEvent::Failed { error, .. } => {
                writeln!(stdout)?;
                bail!("Generation failed: {}", error);
            }
            AnswerEvent::Cancelled { .. } => {
                writeln!(stdout)?;
                warn!("generation cancelled");
                bail!("Generation cancelled");
            }
        }
    }
    bail!("Answer stream ended without a terminal event")
}
