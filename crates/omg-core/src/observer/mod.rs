//! Applies parsed oracle operations to the graph: upserts nodes, updates
//! touched MOCs, and replaces `now.md` (spec §4.5).

mod xml;

pub use xml::{parse_observations, ParsedObservations, ParsedOperation};

use chrono::Utc;

use crate::error::StoreError;
use crate::model::Node;
use crate::store::{atomic_write, date_prefix, slugify, GraphStore};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ObserverOutcome {
    pub nodes_created: u32,
    pub nodes_updated: u32,
    pub mocs_updated: Vec<String>,
    pub now_updated: bool,
    pub dropped_count: u32,
}

fn merge_union_preserving_order(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen: std::collections::HashSet<String> = existing.iter().cloned().collect();
    let mut merged = existing.to_vec();
    for item in incoming {
        if seen.insert(item.clone()) {
            merged.push(item.clone());
        }
    }
    merged
}

fn append_update_block(body: &str, date: &str, text: &str) -> String {
    if text.is_empty() {
        return body.to_string();
    }
    let mut out = body.to_string();
    if !out.contains("## Updates") {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("\n## Updates\n");
    }
    out.push_str(&format!("- {date}: {text}\n"));
    out
}

/// Applies every accepted operation to the graph, then regenerates the
/// MOCs and `now.md` touched along the way.
pub async fn apply_observations(
    store: &GraphStore,
    parsed: &ParsedObservations,
) -> Result<ObserverOutcome, StoreError> {
    let mut outcome = ObserverOutcome {
        dropped_count: parsed.dropped_count,
        ..Default::default()
    };

    for op in &parsed.operations {
        let now = Utc::now().to_rfc3339();
        let existing = find_by_canonical_key(store, &op.canonical_key).await;

        match existing {
            Some(mut node) => {
                node.tags = merge_union_preserving_order(&node.tags, &op.tags);
                node.links = merge_union_preserving_order(&node.links, &op.links);
                node.description = op.description.clone();
                node.priority = op.priority;
                node.body = append_update_block(&node.body, &date_prefix(&now).to_string(), &op.body);
                node.updated = now;
                store.write_node(&node).await?;
                outcome.nodes_updated += 1;
            }
            None => {
                let slug = slugify(&op.canonical_key);
                let id = format!("omg/{}/{}", op.node_type.dir_name(), slug);
                let node = Node {
                    id,
                    node_type: op.node_type,
                    description: op.description.clone(),
                    priority: op.priority,
                    created: now.clone(),
                    updated: now,
                    applies_to: None,
                    sources: vec![],
                    links: op.links.clone(),
                    tags: op.tags.clone(),
                    supersedes: vec![],
                    compression_level: None,
                    archived: false,
                    canonical_key: Some(op.canonical_key.clone()),
                    body: op.body.clone(),
                };
                store.write_node(&node).await?;
                outcome.nodes_created += 1;
            }
        }
    }

    for domain in &parsed.moc_updates {
        store.regenerate_moc(domain).await?;
        outcome.mocs_updated.push(domain.clone());
    }
    if !outcome.mocs_updated.is_empty() {
        store.regenerate_index().await?;
    }

    if let Some(now_text) = &parsed.now_update {
        let content = format!("# Now\n\n{now_text}\n");
        atomic_write(&store.root().join("now.md"), &content)
            .await
            .map_err(|source| StoreError::AtomicWrite {
                path: "now.md".to_string(),
                source,
            })?;
        outcome.now_updated = true;
    }

    Ok(outcome)
}

async fn find_by_canonical_key(store: &GraphStore, canonical_key: &str) -> Option<Node> {
    let entries = store.get_entries().await;
    let entry = entries
        .values()
        .find(|e| e.canonical_key.as_deref() == Some(canonical_key) && !e.archived)?;
    store.read_node(&store.root().join(&entry.file_path)).await
}
