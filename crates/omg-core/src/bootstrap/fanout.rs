//! Rate-limited fan-out over bootstrap batches (spec §4.7 stage 4). Calls
//! the Observer oracle for each batch with bounded concurrency, retrying
//! rate-limited and unreachable failures before giving up on a batch.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::json;

use crate::error::GatewayError;
use crate::llm::{Gateway, Generator};
use crate::token::compute_backoff_ms;

use super::batch::Batch;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub concurrency: usize,
    pub max_rate_limit_retries: u32,
    pub max_unreachable_retries: u32,
    pub max_tokens: u32,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        FanoutConfig {
            concurrency: 4,
            max_rate_limit_retries: 5,
            max_unreachable_retries: 3,
            max_tokens: 4_096,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureLogEntry {
    pub batch_index: usize,
    pub labels: Vec<String>,
    pub error_type: String,
    pub error: String,
    pub diagnostics: serde_json::Value,
    pub chunk_count: usize,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_index: usize,
    pub labels: Vec<String>,
    pub chunk_count: usize,
    pub raw_response: Option<String>,
    pub failure: Option<FailureLogEntry>,
}

fn batch_labels(batch: &Batch) -> Vec<String> {
    let mut labels: Vec<String> = batch.chunks.iter().map(|c| c.source.clone()).collect();
    labels.sort();
    labels.dedup();
    labels
}

fn render_batch_user_content(batch: &Batch) -> String {
    batch
        .chunks
        .iter()
        .map(|c| format!("--- source: {} (chunk {}) ---\n{}", c.source, c.chunk_index, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn process_batch<G: Generator>(
    gateway: &Gateway<G>,
    batch: &Batch,
    system_prompt: &str,
    config: &FanoutConfig,
) -> BatchResult {
    let labels = batch_labels(batch);
    let chunk_count = batch.chunks.len();
    let user_content = render_batch_user_content(batch);

    let mut rate_limit_failures = 0u32;
    let mut unreachable_attempts = 0u32;

    loop {
        match gateway
            .generate(system_prompt, &user_content, config.max_tokens)
            .await
        {
            Ok(response) => {
                return BatchResult {
                    batch_index: batch.index,
                    labels,
                    chunk_count,
                    raw_response: Some(response.content),
                    failure: None,
                };
            }
            Err(GatewayError::RateLimit { cause, .. }) => {
                rate_limit_failures += 1;
                if rate_limit_failures > config.max_rate_limit_retries {
                    return failed_result(batch.index, labels, chunk_count, "rate-limit", &cause, json!({}));
                }
                tracing::warn!(
                    "batch {} rate limited (attempt {}), backing off",
                    batch.index,
                    rate_limit_failures
                );
                tokio::time::sleep(Duration::from_millis(compute_backoff_ms(rate_limit_failures))).await;
            }
            Err(GatewayError::Unreachable { cause, .. }) => {
                unreachable_attempts += 1;
                if unreachable_attempts > config.max_unreachable_retries {
                    return failed_result(batch.index, labels, chunk_count, "unreachable", &cause, json!({}));
                }
                tracing::warn!(
                    "batch {} gateway unreachable (attempt {}), retrying",
                    batch.index,
                    unreachable_attempts
                );
                tokio::time::sleep(Duration::from_millis(compute_backoff_ms(unreachable_attempts))).await;
            }
            Err(GatewayError::Aborted { cause, .. }) => {
                return failed_result(batch.index, labels, chunk_count, "aborted", &cause, json!({}));
            }
            Err(other) => {
                let cause = other.to_string();
                return failed_result(batch.index, labels, chunk_count, "other", &cause, json!({}));
            }
        }
    }
}

fn failed_result(
    batch_index: usize,
    labels: Vec<String>,
    chunk_count: usize,
    error_type: &str,
    error: &str,
    diagnostics: serde_json::Value,
) -> BatchResult {
    BatchResult {
        batch_index,
        labels: labels.clone(),
        chunk_count,
        raw_response: None,
        failure: Some(FailureLogEntry {
            batch_index,
            labels,
            error_type: error_type.to_string(),
            error: error.to_string(),
            diagnostics,
            chunk_count,
        }),
    }
}

/// Runs every batch through the oracle with up to `config.concurrency`
/// batches in flight at once. Results are returned sorted by batch index
/// so downstream stages can apply them in stable input order.
pub async fn run_fanout<G: Generator>(
    gateway: Arc<Gateway<G>>,
    batches: Vec<Batch>,
    system_prompt: String,
    config: FanoutConfig,
) -> Vec<BatchResult> {
    let concurrency = config.concurrency.max(1);
    let system_prompt = Arc::new(system_prompt);
    let config = Arc::new(config);

    let mut results: Vec<BatchResult> = stream::iter(batches)
        .map(|batch| {
            let gateway = Arc::clone(&gateway);
            let system_prompt = Arc::clone(&system_prompt);
            let config = Arc::clone(&config);
            async move { process_batch(&gateway, &batch, &system_prompt, &config).await }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    results.sort_by_key(|r| r.batch_index);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::chunk::Chunk;
    use crate::llm::{GenerateParams, GenerateResponse, Usage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn batch(index: usize, source: &str, text: &str) -> Batch {
        Batch {
            index,
            chunks: vec![Chunk {
                source: source.to_string(),
                chunk_index: 0,
                text: text.to_string(),
            }],
        }
    }

    struct ScriptedGenerator {
        model: String,
        scripts: Mutex<Vec<Result<GenerateResponse, String>>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        fn model_name(&self) -> &str {
            &self.model
        }

        async fn generate(&self, _params: GenerateParams) -> Result<GenerateResponse, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                return Ok(GenerateResponse {
                    content: "<observations></observations>".into(),
                    usage: Usage::default(),
                });
            }
            scripts.remove(0)
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try_records_response() {
        let generator = ScriptedGenerator {
            model: "test".into(),
            scripts: Mutex::new(vec![Ok(GenerateResponse {
                content: "<observations></observations>".into(),
                usage: Usage::default(),
            })]),
            calls: AtomicU32::new(0),
        };
        let gateway = Arc::new(Gateway::new(generator));
        let results = run_fanout(
            gateway,
            vec![batch(0, "a", "hello")],
            "sys".into(),
            FanoutConfig::default(),
        )
        .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].failure.is_none());
        assert!(results[0].raw_response.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limit_then_succeeds() {
        let generator = ScriptedGenerator {
            model: "test".into(),
            scripts: Mutex::new(vec![
                Err("HTTP 429 too many requests".into()),
                Err("HTTP 429 too many requests".into()),
                Ok(GenerateResponse {
                    content: "<observations></observations>".into(),
                    usage: Usage::default(),
                }),
            ]),
            calls: AtomicU32::new(0),
        };
        let gateway = Arc::new(Gateway::new(generator));
        let results = run_fanout(
            gateway,
            vec![batch(0, "a", "hello")],
            "sys".into(),
            FanoutConfig {
                max_rate_limit_retries: 5,
                ..Default::default()
            },
        )
        .await;

        assert_eq!(results.len(), 1);
        assert!(results[0].failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_exceeding_rate_limit_retries() {
        let generator = ScriptedGenerator {
            model: "test".into(),
            scripts: Mutex::new(vec![Err("429".into()), Err("429".into())]),
            calls: AtomicU32::new(0),
        };
        let gateway = Arc::new(Gateway::new(generator));
        let results = run_fanout(
            gateway,
            vec![batch(0, "a", "hello")],
            "sys".into(),
            FanoutConfig {
                max_rate_limit_retries: 1,
                ..Default::default()
            },
        )
        .await;

        let failure = results[0].failure.as_ref().unwrap();
        assert_eq!(failure.error_type, "rate-limit");
    }

    #[tokio::test]
    async fn other_errors_recorded_without_retry() {
        let generator = ScriptedGenerator {
            model: "test".into(),
            scripts: Mutex::new(vec![Err("something broke".into())]),
            calls: AtomicU32::new(0),
        };
        let gateway = Arc::new(Gateway::new(generator));
        let results = run_fanout(
            gateway,
            vec![batch(0, "a", "hello")],
            "sys".into(),
            FanoutConfig::default(),
        )
        .await;

        let failure = results[0].failure.as_ref().unwrap();
        assert_eq!(failure.error_type, "other");
    }

    #[tokio::test]
    async fn results_sorted_by_batch_index_despite_concurrency() {
        let generator = ScriptedGenerator {
            model: "test".into(),
            scripts: Mutex::new(vec![]),
            calls: AtomicU32::new(0),
        };
        let gateway = Arc::new(Gateway::new(generator));
        let batches = vec![batch(0, "a", "x"), batch(1, "b", "y"), batch(2, "c", "z")];
        let results = run_fanout(gateway, batches, "sys".into(), FanoutConfig::default()).await;

        let indices: Vec<usize> = results.iter().map(|r| r.batch_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
