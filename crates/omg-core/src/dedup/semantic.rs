//! Semantic dedup: a lower-threshold prefilter into domain+time blocks,
//! an oracle call per block proposing merge suggestions with a similarity
//! score, and merge execution for suggestions clearing the configured
//! threshold (spec §4.9 "Semantic dedup"). Disabled by default — this
//! pass is materially more expensive than the literal pass since it calls
//! the oracle once per block rather than once per run.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::StoreError;
use crate::llm::{Gateway, Generator};
use crate::model::{Registry, RegistryEntry};
use crate::similarity::{combined_similarity, resolve_domain_for_entry};
use crate::store::GraphStore;

use super::merge::{execute_merge_plan, strip_json_fence, MergePatch, MergePlan};

#[derive(Debug, Clone)]
pub struct SemanticDedupConfig {
    pub enabled: bool,
    /// Threshold for our own 0..1 `combinedSimilarity` heuristic, used only
    /// to decide whether a block is worth an oracle call at all.
    pub prefilter_threshold: f64,
    /// Threshold for the oracle's own `similarityScore`, which spec §4.9
    /// defines on a 0..100 scale (not the 0..1 scale `combinedSimilarity`
    /// uses internally).
    pub semantic_merge_threshold: f64,
    pub time_window_days: i64,
    pub max_block_size: usize,
    pub max_blocks_per_run: usize,
    pub max_body_chars_per_node: usize,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for SemanticDedupConfig {
    fn default() -> Self {
        SemanticDedupConfig {
            enabled: false,
            prefilter_threshold: 0.55,
            semantic_merge_threshold: 75.0,
            time_window_days: 30,
            max_block_size: 12,
            max_blocks_per_run: 10,
            max_body_chars_per_node: 500,
            max_tokens: 4_096,
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SemanticDedupOutcome {
    pub enabled: bool,
    pub blocks_considered: usize,
    pub suggestions_received: usize,
    pub suggestions_accepted: usize,
    pub merges_executed: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SemanticSuggestion {
    pub keep_node_id: String,
    pub merge_node_ids: Vec<String>,
    pub similarity_score: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Deserialize)]
struct SuggestionEnvelope {
    suggestions: Vec<SemanticSuggestion>,
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

/// Groups non-archived entries into per-domain blocks, splitting a domain's
/// entries further whenever the gap since the previous entry (by `updated`,
/// sorted ascending) exceeds `timeWindowDays`. Blocks are capped at
/// `maxBlockSize` entries and a run at `maxBlocksPerRun` blocks, largest
/// first, mirroring the literal pass's cluster caps.
pub fn group_into_blocks(registry: &Registry, config: &SemanticDedupConfig) -> Vec<Vec<String>> {
    let mut by_domain: std::collections::HashMap<String, Vec<&RegistryEntry>> = std::collections::HashMap::new();
    for entry in registry.values().filter(|e| !e.archived) {
        by_domain
            .entry(resolve_domain_for_entry(entry))
            .or_default()
            .push(entry);
    }

    let mut blocks: Vec<Vec<String>> = Vec::new();
    for entries in by_domain.into_values() {
        let mut sorted = entries;
        sorted.sort_by(|a, b| a.updated.cmp(&b.updated));

        let mut current: Vec<&RegistryEntry> = Vec::new();
        let mut last_time: Option<DateTime<Utc>> = None;
        for entry in sorted {
            let this_time = parse_time(&entry.updated);
            let gap_exceeded = match (last_time, this_time) {
                (Some(last), Some(this)) => (this - last).num_days() > config.time_window_days,
                _ => false,
            };
            if gap_exceeded && !current.is_empty() {
                blocks.push(current.drain(..).map(|e| e.id.clone()).collect());
            }
            current.push(entry);
            last_time = this_time.or(last_time);
        }
        if current.len() >= 2 {
            blocks.push(current.into_iter().map(|e| e.id.clone()).collect());
        }
    }

    for block in &mut blocks {
        block.truncate(config.max_block_size);
    }
    blocks.retain(|b| b.len() >= 2);
    blocks.sort_by(|a, b| b.len().cmp(&a.len()));
    blocks.truncate(config.max_blocks_per_run);
    blocks
}

/// Cheap prefilter over a block: does any pair in it clear
/// `prefilterThreshold`? Blocks with no plausible pair skip the oracle call
/// entirely.
fn block_has_plausible_pair(registry: &Registry, block: &[String], threshold: f64) -> bool {
    for (i, a_id) in block.iter().enumerate() {
        let Some(a) = registry.get(a_id) else { continue };
        for b_id in &block[i + 1..] {
            let Some(b) = registry.get(b_id) else { continue };
            let key_a = a.canonical_key.as_deref().unwrap_or("");
            let key_b = b.canonical_key.as_deref().unwrap_or("");
            if combined_similarity(&a.description, &b.description, key_a, key_b) >= threshold {
                return true;
            }
        }
    }
    false
}

/// Renders metadata plus a body truncated to `maxBodyCharsPerNode` for each
/// member of the block (spec §4.9). Reads each node's file directly since
/// the registry only carries metadata, not body text.
async fn render_block_user_content(store: &GraphStore, registry: &Registry, block: &[String], max_body_chars: usize) -> String {
    let mut out = String::new();
    for id in block {
        let Some(entry) = registry.get(id) else { continue };
        out.push_str(&format!(
            "- {} | key={} | {}\n",
            entry.id,
            entry.canonical_key.as_deref().unwrap_or(""),
            entry.description
        ));

        let Some(node) = store.read_node(&store.root().join(&entry.file_path)).await else {
            continue;
        };
        let mut body = node.body.trim();
        if body.len() > max_body_chars {
            let end = (0..=max_body_chars).rev().find(|&i| body.is_char_boundary(i)).unwrap_or(0);
            body = &body[..end];
        }
        if !body.is_empty() {
            out.push_str("  body: ");
            out.push_str(body);
            out.push('\n');
        }
    }
    out
}

fn parse_suggestions(raw: &str) -> Result<Vec<SemanticSuggestion>, String> {
    let stripped = strip_json_fence(raw);
    let envelope: SuggestionEnvelope = serde_json::from_str(stripped).map_err(|e| e.to_string())?;
    Ok(envelope.suggestions)
}

/// Accepts suggestions at or above `semanticMergeThreshold`, highest score
/// first, rejecting any suggestion that would claim a node (as keeper or
/// merge target) already claimed by a higher-scored suggestion this run.
fn select_non_conflicting(mut suggestions: Vec<SemanticSuggestion>, threshold: f64) -> Vec<SemanticSuggestion> {
    suggestions.retain(|s| s.similarity_score >= threshold && !s.merge_node_ids.is_empty());
    suggestions.sort_by(|a, b| b.similarity_score.partial_cmp(&a.similarity_score).unwrap_or(std::cmp::Ordering::Equal));

    let mut claimed: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut accepted = Vec::new();
    for suggestion in suggestions {
        let mut ids = suggestion.merge_node_ids.clone();
        ids.push(suggestion.keep_node_id.clone());
        if ids.iter().any(|id| claimed.contains(id)) {
            continue;
        }
        claimed.extend(ids);
        accepted.push(suggestion);
    }
    accepted
}

/// Runs the semantic dedup pass. A no-op when `config.enabled` is false.
pub async fn run_semantic_dedup<G: Generator>(
    store: &GraphStore,
    generator: &Gateway<G>,
    config: &SemanticDedupConfig,
) -> Result<SemanticDedupOutcome, StoreError> {
    let mut outcome = SemanticDedupOutcome {
        enabled: config.enabled,
        ..Default::default()
    };

    if !config.enabled {
        tracing::debug!("semantic dedup disabled, skipping");
        return Ok(outcome);
    }

    let registry = store.get_entries().await;
    let blocks: Vec<Vec<String>> = group_into_blocks(&registry, config)
        .into_iter()
        .filter(|b| block_has_plausible_pair(&registry, b, config.prefilter_threshold))
        .collect();
    outcome.blocks_considered = blocks.len();

    for block in &blocks {
        let user_content =
            render_block_user_content(store, &registry, block, config.max_body_chars_per_node).await;
        let response = match generator
            .generate(&config.system_prompt, &user_content, config.max_tokens)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                outcome.errors.push(format!("block oracle call failed: {e}"));
                continue;
            }
        };

        let suggestions = match parse_suggestions(&response.content) {
            Ok(s) => s,
            Err(e) => {
                outcome.errors.push(format!("suggestion response invalid: {e}"));
                continue;
            }
        };
        outcome.suggestions_received += suggestions.len();

        let accepted = select_non_conflicting(suggestions, config.semantic_merge_threshold);
        outcome.suggestions_accepted += accepted.len();

        for suggestion in accepted {
            let plan = MergePlan {
                keep_node_id: suggestion.keep_node_id.clone(),
                merge_node_ids: suggestion.merge_node_ids.clone(),
                alias_keys: vec![],
                conflicts: vec![],
                patch: MergePatch {
                    description: None,
                    tags: None,
                    links: None,
                    body_append: if suggestion.rationale.is_empty() {
                        None
                    } else {
                        Some(format!("(semantic dedup) {}", suggestion.rationale))
                    },
                },
            };
            match execute_merge_plan(store, &plan).await {
                Ok(()) => outcome.merges_executed += 1,
                Err(e) => outcome
                    .errors
                    .push(format!("merge `{}`: {e}", suggestion.keep_node_id)),
            }
        }
    }

    tracing::info!(
        "semantic dedup run: {} blocks, {} suggestions ({} accepted), {} merges executed, {} errors",
        outcome.blocks_considered,
        outcome.suggestions_received,
        outcome.suggestions_accepted,
        outcome.merges_executed,
        outcome.errors.len(),
    );

    Ok(outcome)
}
