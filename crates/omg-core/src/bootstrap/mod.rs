//! Bootstrap pipeline: chunk and batch workspace sources, fan them out to
//! the Observer oracle, apply accepted operations, and report on graph
//! quality (spec §4.7).

pub mod batch;
pub mod chunk;
pub mod fanout;
pub mod quality;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::error::StoreError;
use crate::llm::{Gateway, Generator};
use crate::observer::{apply_observations, parse_observations};
use crate::store::GraphStore;

pub use batch::{batch_chunks, Batch};
pub use chunk::{char_budget_from_tokens, chunk_sources, Chunk, SourceEntry, DEFAULT_TOKEN_BUDGET};
pub use fanout::{run_fanout, FailureLogEntry, FanoutConfig};
pub use quality::{build_quality_report, QualityReport};

const FAILURE_LOG_FILE: &str = ".bootstrap-failures.jsonl";

#[derive(Debug, Clone, Default)]
pub struct BootstrapOutcome {
    pub batches_processed: usize,
    pub nodes_written: u32,
    pub nodes_updated: u32,
    pub failures_logged: u32,
    pub quality: Option<QualityReport>,
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub token_budget_per_chunk: u64,
    pub batch_char_budget: usize,
    pub fanout: FanoutConfig,
    pub system_prompt: String,
    /// Clears the failure log before the run when set.
    pub force: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        BootstrapConfig {
            token_budget_per_chunk: DEFAULT_TOKEN_BUDGET,
            batch_char_budget: char_budget_from_tokens(DEFAULT_TOKEN_BUDGET) * 4,
            fanout: FanoutConfig::default(),
            system_prompt: String::new(),
            force: true,
        }
    }
}

async fn append_failure_log(root: &Path, entry: &FailureLogEntry) -> Result<(), StoreError> {
    let line = json!({
        "batchIndex": entry.batch_index,
        "labels": entry.labels,
        "errorType": entry.error_type,
        "error": entry.error,
        "timestamp": Utc::now().to_rfc3339(),
        "diagnostics": entry.diagnostics,
        "chunkCount": entry.chunk_count,
    });
    append_jsonl_line(&root.join(FAILURE_LOG_FILE), &line.to_string()).await
}

async fn append_jsonl_line(path: &PathBuf, line: &str) -> Result<(), StoreError> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
    file.write_all(format!("{line}\n").as_bytes())
        .await
        .map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })
}

/// Runs the full bootstrap pipeline: chunk, batch, fan out to the oracle,
/// apply accepted operations, then compute a quality report over the
/// final registry.
pub async fn run_bootstrap<G: Generator>(
    store: &GraphStore,
    generator: G,
    sources: &[SourceEntry],
    config: BootstrapConfig,
) -> Result<BootstrapOutcome, StoreError> {
    let failure_log_path = store.root().join(FAILURE_LOG_FILE);
    if config.force && failure_log_path.exists() {
        tokio::fs::remove_file(&failure_log_path)
            .await
            .map_err(|source| StoreError::Io {
                path: failure_log_path.display().to_string(),
                source,
            })?;
    }

    let chunks = chunk_sources(sources, char_budget_from_tokens(config.token_budget_per_chunk) as usize);
    let batches = batch_chunks(chunks, config.batch_char_budget);
    let batches_processed = batches.len();

    let gateway = Arc::new(Gateway::new(generator));
    let results = run_fanout(gateway, batches, config.system_prompt.clone(), config.fanout).await;

    let mut outcome = BootstrapOutcome {
        batches_processed,
        ..Default::default()
    };

    for result in results {
        if let Some(failure) = &result.failure {
            append_failure_log(store.root(), failure).await?;
            outcome.failures_logged += 1;
            continue;
        }

        let Some(raw) = result.raw_response else { continue };
        let parsed = parse_observations(&raw);
        let total_candidates = parsed.operations.len() as u32 + parsed.dropped_count;

        if total_candidates == 0 {
            append_failure_log(
                store.root(),
                &FailureLogEntry {
                    batch_index: result.batch_index,
                    labels: result.labels.clone(),
                    error_type: "parse-empty".to_string(),
                    error: "oracle response had no operations".to_string(),
                    diagnostics: json!({}),
                    chunk_count: result.chunk_count,
                },
            )
            .await?;
            outcome.failures_logged += 1;
            continue;
        }

        if parsed.operations.is_empty() {
            append_failure_log(
                store.root(),
                &FailureLogEntry {
                    batch_index: result.batch_index,
                    labels: result.labels.clone(),
                    error_type: "zero-operations".to_string(),
                    error: "all candidate operations were rejected".to_string(),
                    diagnostics: json!({
                        "totalCandidates": total_candidates,
                        "accepted": 0,
                        "rejectedReasons": parsed.dropped_reasons,
                    }),
                    chunk_count: result.chunk_count,
                },
            )
            .await?;
            outcome.failures_logged += 1;
            continue;
        }

        let applied = apply_observations(store, &parsed).await?;
        outcome.nodes_written += applied.nodes_created;
        outcome.nodes_updated += applied.nodes_updated;
    }

    let entries = store.get_entries().await;
    outcome.quality = Some(build_quality_report(&entries));

    tracing::info!(
        "bootstrap run: {} batches, {} nodes written, {} nodes updated, {} failures logged",
        outcome.batches_processed,
        outcome.nodes_written,
        outcome.nodes_updated,
        outcome.failures_logged,
    );

    Ok(outcome)
}
