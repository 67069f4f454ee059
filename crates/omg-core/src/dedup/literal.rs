//! Literal dedup: heuristic candidate clustering over the registry
//! (registry-only, no file reads), a single oracle confirmation call, and
//! merge execution (spec §4.9 "Literal dedup").

use chrono::Utc;

use crate::error::StoreError;
use crate::llm::{Gateway, Generator};
use crate::model::{NodeType, Registry, RegistryEntry};
use crate::similarity::{combined_similarity, key_prefix};
use crate::store::GraphStore;

use super::merge::{execute_merge_plan, parse_merge_plans};
use super::{is_stable_type, load_dedup_state, save_dedup_state, UnionFind};

#[derive(Debug, Clone)]
pub struct LiteralDedupConfig {
    pub similarity_threshold: f64,
    pub max_pairs_per_bucket: usize,
    pub max_cluster_size: usize,
    pub max_clusters_per_run: usize,
    pub stale_days_threshold: i64,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for LiteralDedupConfig {
    fn default() -> Self {
        LiteralDedupConfig {
            similarity_threshold: 0.82,
            max_pairs_per_bucket: 200,
            max_cluster_size: 5,
            max_clusters_per_run: 20,
            stale_days_threshold: 90,
            max_tokens: 4_096,
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiteralDedupOutcome {
    pub clusters_found: usize,
    pub merge_plans_received: usize,
    pub merges_executed: u32,
    pub merge_errors: Vec<String>,
    pub state_advanced: bool,
}

fn is_stale(entry: &RegistryEntry, stale_days_threshold: i64) -> bool {
    if is_stable_type(entry.node_type) {
        return false;
    }
    let Ok(updated) = chrono::DateTime::parse_from_rfc3339(&entry.updated) else {
        return false;
    };
    (Utc::now() - updated.with_timezone(&Utc)).num_days() > stale_days_threshold
}

/// Buckets non-archived, non-stale entries by `(keyPrefix, type)`, scores
/// all pairs within a bucket (capped at `maxPairsPerBucket`), and unions
/// pairs above `similarityThreshold` into clusters. Clusters are capped
/// at `maxClusterSize` members and the run at `maxClustersPerRun` clusters,
/// largest first.
pub fn build_candidate_clusters(registry: &Registry, config: &LiteralDedupConfig) -> Vec<Vec<String>> {
    let mut entries: Vec<&RegistryEntry> = registry
        .values()
        .filter(|e| !e.archived && !is_stale(e, config.stale_days_threshold))
        .collect();
    entries.sort_by(|a, b| a.id.cmp(&b.id));

    let mut buckets: std::collections::HashMap<(String, NodeType), Vec<usize>> = std::collections::HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        let prefix = entry.canonical_key.as_deref().map(key_prefix).unwrap_or("").to_string();
        buckets.entry((prefix, entry.node_type)).or_default().push(i);
    }

    let mut uf = UnionFind::new(entries.len());
    for indices in buckets.values() {
        let mut pairs_evaluated = 0usize;
        'bucket: for (a_pos, &a) in indices.iter().enumerate() {
            for &b in &indices[a_pos + 1..] {
                if pairs_evaluated >= config.max_pairs_per_bucket {
                    break 'bucket;
                }
                pairs_evaluated += 1;

                let key_a = entries[a].canonical_key.as_deref().unwrap_or("");
                let key_b = entries[b].canonical_key.as_deref().unwrap_or("");
                let sim = combined_similarity(&entries[a].description, &entries[b].description, key_a, key_b);
                if sim >= config.similarity_threshold {
                    uf.union(a, b);
                }
            }
        }
    }

    let mut groups: std::collections::HashMap<usize, Vec<String>> = std::collections::HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        let root = uf.find(i);
        groups.entry(root).or_default().push(entry.id.clone());
    }

    let mut clusters: Vec<Vec<String>> = groups
        .into_values()
        .filter(|g| g.len() >= 2)
        .map(|mut g| {
            g.sort();
            g.truncate(config.max_cluster_size);
            g
        })
        .collect();

    clusters.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    clusters.truncate(config.max_clusters_per_run);
    clusters
}

fn render_clusters_user_content(registry: &Registry, clusters: &[Vec<String>]) -> String {
    let mut out = String::new();
    for (i, cluster) in clusters.iter().enumerate() {
        out.push_str(&format!("### cluster {i}\n"));
        for id in cluster {
            if let Some(entry) = registry.get(id) {
                out.push_str(&format!(
                    "- {} | key={} | {}\n",
                    entry.id,
                    entry.canonical_key.as_deref().unwrap_or(""),
                    entry.description
                ));
            }
        }
        out.push('\n');
    }
    out
}

/// Runs the full three-pass literal dedup: snapshot + cluster, one oracle
/// call over all clusters, then execute the returned merge plans.
/// `lastDedupAt` advances as soon as the oracle call succeeds, independent
/// of any individual merge's outcome (spec §9 open question).
pub async fn run_literal_dedup<G: Generator>(
    store: &GraphStore,
    generator: &Gateway<G>,
    config: &LiteralDedupConfig,
) -> Result<LiteralDedupOutcome, StoreError> {
    let mut outcome = LiteralDedupOutcome::default();

    let registry = store.get_entries().await;
    let clusters = build_candidate_clusters(&registry, config);
    outcome.clusters_found = clusters.len();

    if clusters.is_empty() {
        return Ok(outcome);
    }

    let user_content = render_clusters_user_content(&registry, &clusters);
    let response = match generator
        .generate(&config.system_prompt, &user_content, config.max_tokens)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            outcome.merge_errors.push(format!("oracle call failed: {e}"));
            return Ok(outcome);
        }
    };

    let plans = match parse_merge_plans(&response.content) {
        Ok(plans) => plans,
        Err(e) => {
            outcome.merge_errors.push(format!("merge-plan response invalid: {e}"));
            return Ok(outcome);
        }
    };
    outcome.merge_plans_received = plans.len();

    // The oracle call succeeded and the response validated: advance state
    // now, before executing any individual merge (spec §9).
    let mut state = load_dedup_state(store.root()).await;
    state.last_dedup_at = Some(Utc::now().to_rfc3339());
    state.runs_completed += 1;
    save_dedup_state(store.root(), &state).await?;
    outcome.state_advanced = true;

    for plan in &plans {
        match execute_merge_plan(store, plan).await {
            Ok(()) => outcome.merges_executed += 1,
            Err(e) => outcome.merge_errors.push(format!("merge `{}`: {e}", plan.keep_node_id)),
        }
    }

    if outcome.merges_executed > 0 {
        let mut state = load_dedup_state(store.root()).await;
        state.total_merges += outcome.merges_executed as u64;
        save_dedup_state(store.root(), &state).await?;
    }

    tracing::info!(
        "literal dedup run: {} clusters, {} merge plans, {} merges executed, {} errors",
        outcome.clusters_found,
        outcome.merge_plans_received,
        outcome.merges_executed,
        outcome.merge_errors.len(),
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use std::path::PathBuf;

    fn entry(id: &str, key: &str, description: &str) -> RegistryEntry {
        RegistryEntry {
            id: id.to_string(),
            node_type: NodeType::Fact,
            description: description.to_string(),
            priority: Priority::Medium,
            created: "2026-01-01T00:00:00Z".into(),
            updated: Utc::now().to_rfc3339(),
            canonical_key: Some(key.to_string()),
            tags: vec![],
            links: vec![],
            archived: false,
            file_path: PathBuf::from(format!("nodes/fact/{id}.md")),
        }
    }

    #[test]
    fn clusters_near_duplicate_descriptions_in_same_bucket() {
        let mut registry = Registry::new();
        registry.insert(
            "a".into(),
            entry("a", "fact.coffee", "User drinks coffee every morning"),
        );
        registry.insert(
            "b".into(),
            entry("b", "fact.coffee-2", "User drinks coffee every morning"),
        );
        registry.insert("c".into(), entry("c", "fact.unrelated", "User owns a bicycle"));

        let clusters = build_candidate_clusters(&registry, &LiteralDedupConfig::default());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn different_key_prefixes_never_share_a_bucket() {
        let mut registry = Registry::new();
        registry.insert("a".into(), entry("a", "fact.x", "Same description text"));
        registry.insert("b".into(), entry("b", "preferences.x", "Same description text"));

        let clusters = build_candidate_clusters(&registry, &LiteralDedupConfig::default());
        assert!(clusters.is_empty());
    }

    #[test]
    fn excludes_stale_volatile_entries() {
        let mut registry = Registry::new();
        let mut old = entry("a", "fact.coffee", "User drinks coffee every morning");
        old.updated = "2020-01-01T00:00:00Z".into();
        let mut newer = entry("b", "fact.coffee-2", "User drinks coffee every morning");
        newer.updated = Utc::now().to_rfc3339();
        registry.insert("a".into(), old);
        registry.insert("b".into(), newer);

        let clusters = build_candidate_clusters(&registry, &LiteralDedupConfig::default());
        assert!(clusters.is_empty());
    }

    #[test]
    fn stable_types_bypass_staleness_filter() {
        let mut registry = Registry::new();
        let mut old = entry("a", "identity.name", "The user's name is Alex");
        old.node_type = NodeType::Identity;
        old.updated = "2020-01-01T00:00:00Z".into();
        let mut newer = entry("b", "identity.name-2", "The user's name is Alex");
        newer.node_type = NodeType::Identity;
        newer.updated = Utc::now().to_rfc3339();
        registry.insert("a".into(), old);
        registry.insert("b".into(), newer);

        let clusters = build_candidate_clusters(&registry, &LiteralDedupConfig::default());
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn cluster_size_capped() {
        let mut registry = Registry::new();
        for i in 0..8 {
            registry.insert(
                format!("n{i}"),
                entry(&format!("n{i}"), &format!("fact.x{i}"), "Repeated identical phrase"),
            );
        }
        let config = LiteralDedupConfig {
            max_cluster_size: 3,
            ..Default::default()
        };
        let clusters = build_candidate_clusters(&registry, &config);
        assert!(clusters[0].len() <= 3);
    }
}
