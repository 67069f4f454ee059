//! Reflection engine: groups nodes by domain and time window into bounded
//! clusters, asks the oracle to compress and archive, then applies the
//! result (spec §4.8).

mod cluster;
mod packet;
mod xml;

pub use cluster::{anchor_split, cluster_by_time_window, Cluster, ClusterConfig};
pub use packet::{build_compact_packet, render_packet, CompactPacket};
pub use xml::{parse_reflection, NodeUpdate, ParsedReflection, ReflectionNode};

use chrono::Utc;

use crate::error::{ReflectError, StoreError};
use crate::llm::{Gateway, Generator};
use crate::model::Node;
use crate::similarity::resolve_domain;
use crate::store::{slugify, GraphStore};

#[derive(Debug, Clone)]
pub struct ReflectionConfig {
    pub cluster: ClusterConfig,
    pub compression_level: u8,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        ReflectionConfig {
            cluster: ClusterConfig::default(),
            compression_level: 1,
            max_tokens: 4_096,
            system_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReflectionOutcome {
    pub clusters_processed: usize,
    pub reflection_nodes_written: u32,
    pub nodes_archived: u32,
    pub nodes_patched: u32,
    pub mocs_updated: Vec<String>,
    pub errors: Vec<String>,
    /// The value the caller should store as the session's
    /// `lastReflectionTotalTokens` (spec §4.8 step 8).
    pub final_total_observation_tokens: u64,
}

fn render_cluster_user_content(cluster: &Cluster, compression_level: u8) -> String {
    let mut out = format!(
        "domain: {}\ncompression-level: {}\n\n",
        cluster.domain, compression_level
    );
    for node in &cluster.nodes {
        let packet = build_compact_packet(node);
        out.push_str(&render_packet(&packet));
        out.push('\n');
    }
    out
}

/// Runs the full reflection pipeline: snapshot, cluster, oracle pass per
/// cluster, apply. `total_observation_tokens` is the session's running
/// total at call time; it's echoed back unconditionally into the outcome
/// so the caller can advance `lastReflectionTotalTokens` (spec §4.8 step 8
/// — advancing session state itself is the caller's concern, not this
/// pipeline's).
pub async fn run_reflection<G: Generator>(
    store: &GraphStore,
    generator: &Gateway<G>,
    config: &ReflectionConfig,
    total_observation_tokens: u64,
) -> Result<ReflectionOutcome, StoreError> {
    let mut outcome = ReflectionOutcome {
        final_total_observation_tokens: total_observation_tokens,
        ..Default::default()
    };

    let nodes = store.list_all_nodes().await;
    let with_domain: Vec<(String, Node)> = nodes
        .into_iter()
        .filter(|n| !n.archived)
        .map(|n| (resolve_domain(&n), n))
        .collect();

    let clusters = cluster_by_time_window(with_domain, &config.cluster);
    let final_clusters: Vec<Cluster> = clusters
        .into_iter()
        .flat_map(|c| anchor_split(c, &config.cluster))
        .collect();

    let mut touched_domains: std::collections::HashSet<String> = std::collections::HashSet::new();

    for cluster in &final_clusters {
        outcome.clusters_processed += 1;
        touched_domains.insert(cluster.domain.clone());

        let user_content = render_cluster_user_content(cluster, config.compression_level);
        let response = match generator
            .generate(&config.system_prompt, &user_content, config.max_tokens)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                outcome
                    .errors
                    .push(format!("cluster `{}`: oracle call failed: {e}", cluster.domain));
                continue;
            }
        };

        let Some(parsed) = parse_reflection(&response.content) else {
            outcome
                .errors
                .push(format!("cluster `{}`: {}", cluster.domain, ReflectError::ParseFailure));
            continue;
        };

        match apply_reflection(store, &parsed, &mut touched_domains).await {
            Ok(applied) => {
                outcome.reflection_nodes_written += applied.0;
                outcome.nodes_archived += applied.1;
                outcome.nodes_patched += applied.2;
            }
            Err(e) => outcome.errors.push(format!("cluster `{}`: {e}", cluster.domain)),
        }
    }

    for domain in &touched_domains {
        store.regenerate_moc(domain).await?;
        outcome.mocs_updated.push(domain.clone());
    }
    if !outcome.mocs_updated.is_empty() {
        store.regenerate_index().await?;
    }

    tracing::info!(
        "reflection run: {} clusters, {} nodes written, {} archived, {} patched, {} errors",
        outcome.clusters_processed,
        outcome.reflection_nodes_written,
        outcome.nodes_archived,
        outcome.nodes_patched,
        outcome.errors.len(),
    );

    Ok(outcome)
}

/// Writes new reflection nodes, archives superseded ones, applies targeted
/// patches. Returns `(written, archived, patched)`. Adds domains touched
/// by patched/new nodes to `touched_domains` so MOC regeneration covers
/// them even when they land outside the cluster's own domain.
async fn apply_reflection(
    store: &GraphStore,
    parsed: &ParsedReflection,
    touched_domains: &mut std::collections::HashSet<String>,
) -> Result<(u32, u32, u32), StoreError> {
    let mut written = 0u32;
    for reflection_node in &parsed.reflection_nodes {
        let now = Utc::now().to_rfc3339();
        let slug = slugify(&reflection_node.canonical_key);
        let node = Node {
            id: format!("omg/{}/{}", reflection_node.node_type.dir_name(), slug),
            node_type: reflection_node.node_type,
            description: reflection_node.description.clone(),
            priority: reflection_node.priority,
            created: now.clone(),
            updated: now,
            applies_to: None,
            sources: vec![],
            links: reflection_node.links.clone(),
            tags: reflection_node.tags.clone(),
            supersedes: vec![],
            compression_level: None,
            archived: false,
            canonical_key: Some(reflection_node.canonical_key.clone()),
            body: reflection_node.body.clone(),
        };
        touched_domains.insert(resolve_domain(&node));
        store.write_node(&node).await?;
        written += 1;
    }

    let mut archived = 0u32;
    for id in &parsed.archive_ids {
        store.archive(id).await?;
        archived += 1;
    }

    let mut patched = 0u32;
    for update in &parsed.node_updates {
        let entries = store.get_entries().await;
        let Some(entry) = entries.get(&update.id) else {
            continue;
        };
        let Some(mut node) = store.read_node(&store.root().join(&entry.file_path)).await else {
            continue;
        };

        if let Some(description) = &update.description {
            node.description = description.clone();
        }
        if let Some(tags) = &update.tags {
            node.tags = tags.clone();
        }
        if let Some(links) = &update.links {
            node.links = links.clone();
        }
        node.updated = Utc::now().to_rfc3339();
        touched_domains.insert(resolve_domain(&node));
        store.write_node(&node).await?;
        patched += 1;
    }

    Ok((written, archived, patched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerateParams, GenerateResponse, Usage};
    use crate::model::{NodeType, Priority};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedGenerator {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        fn model_name(&self) -> &str {
            "test-model"
        }

        async fn generate(&self, _params: GenerateParams) -> Result<GenerateResponse, String> {
            let mut responses = self.responses.lock().unwrap();
            let content = if responses.is_empty() {
                "<reflection></reflection>".to_string()
            } else {
                responses.remove(0)
            };
            Ok(GenerateResponse {
                content,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                },
            })
        }
    }

    fn fact_node(id: &str, updated: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: NodeType::Fact,
            description: "a fact".into(),
            priority: Priority::Medium,
            created: updated.to_string(),
            updated: updated.to_string(),
            applies_to: None,
            sources: vec![],
            links: vec![],
            tags: vec![],
            supersedes: vec![],
            compression_level: None,
            archived: false,
            canonical_key: Some(format!("misc.{}", id.replace('/', "-"))),
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn writes_reflection_node_and_archives_sources() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::load(dir.path()).await;
        store
            .write_node(&fact_node("omg/fact/a", "2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .write_node(&fact_node("omg/fact/b", "2026-01-02T00:00:00Z"))
            .await
            .unwrap();

        let gateway = Gateway::new(ScriptedGenerator {
            responses: Mutex::new(vec![r#"<reflection>
                <reflection-nodes>
                    <reflection-node type="reflection" priority="low">
                        <canonical-key>reflection.misc-jan</canonical-key>
                        <description>Compressed misc notes</description>
                        <content>summary</content>
                    </reflection-node>
                </reflection-nodes>
                <archive-nodes>
                    <id>omg/fact/a</id>
                    <id>omg/fact/b</id>
                </archive-nodes>
            </reflection>"#
                .to_string()]),
        });

        let outcome = run_reflection(&store, &gateway, &ReflectionConfig::default(), 1000)
            .await
            .unwrap();

        assert_eq!(outcome.reflection_nodes_written, 1);
        assert_eq!(outcome.nodes_archived, 2);
        assert_eq!(outcome.final_total_observation_tokens, 1000);

        let entries = store.get_entries().await;
        assert!(entries["omg/fact/a"].archived);
        assert!(entries["omg/fact/b"].archived);
        assert!(entries.contains_key("omg/reflection/reflection-misc-jan"));
    }

    #[tokio::test]
    async fn parse_failure_is_logged_not_thrown() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::load(dir.path()).await;
        store
            .write_node(&fact_node("omg/fact/a", "2026-01-01T00:00:00Z"))
            .await
            .unwrap();

        let gateway = Gateway::new(ScriptedGenerator {
            responses: Mutex::new(vec!["not xml at all".to_string()]),
        });

        let outcome = run_reflection(&store, &gateway, &ReflectionConfig::default(), 0)
            .await
            .unwrap();

        assert_eq!(outcome.reflection_nodes_written, 0);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[tokio::test]
    async fn node_update_patches_description_without_full_replace() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::load(dir.path()).await;
        store
            .write_node(&fact_node("omg/fact/a", "2026-01-01T00:00:00Z"))
            .await
            .unwrap();

        let gateway = Gateway::new(ScriptedGenerator {
            responses: Mutex::new(vec![r#"<reflection>
                <node-updates>
                    <node-update id="omg/fact/a">
                        <description>Refreshed</description>
                    </node-update>
                </node-updates>
            </reflection>"#
                .to_string()]),
        });

        run_reflection(&store, &gateway, &ReflectionConfig::default(), 0)
            .await
            .unwrap();

        let entries = store.get_entries().await;
        assert_eq!(entries["omg/fact/a"].description, "Refreshed");
    }
}
