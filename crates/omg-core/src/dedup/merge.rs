//! Shared merge plan, audit log, and merge executor used by both the
//! literal and semantic dedup engines (spec §4.9, glossary "Merge plan").

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{DedupError, StoreError};
use crate::store::{date_prefix, GraphStore};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergePatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub links: Option<Vec<String>>,
    #[serde(default)]
    pub body_append: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergePlan {
    pub keep_node_id: String,
    pub merge_node_ids: Vec<String>,
    #[serde(default)]
    pub alias_keys: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub patch: MergePatch,
}

impl MergePlan {
    /// Structural validation beyond what serde already enforces: a keeper
    /// and at least one node to merge into it, and no node merging into
    /// itself.
    pub fn validate(&self) -> Result<(), String> {
        if self.keep_node_id.trim().is_empty() {
            return Err("keepNodeId must not be empty".to_string());
        }
        if self.merge_node_ids.is_empty() {
            return Err("mergeNodeIds must not be empty".to_string());
        }
        if self.merge_node_ids.iter().any(|id| id == &self.keep_node_id) {
            return Err("mergeNodeIds must not include keepNodeId".to_string());
        }
        Ok(())
    }
}

fn union_preserving_order(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen: std::collections::HashSet<String> = existing.iter().cloned().collect();
    let mut merged = existing.to_vec();
    for item in incoming {
        if seen.insert(item.clone()) {
            merged.push(item.clone());
        }
    }
    merged
}

/// Applies a validated merge plan: unions tags/links onto the keeper,
/// appends `bodyAppend` under a dated block, extends `supersedes` with the
/// merged-away ids, archives the losers, and appends an audit entry.
/// Individual merge failures (missing keeper, missing file) are returned
/// as errors to the caller rather than panicking — the run continues with
/// the next plan either way.
pub async fn execute_merge_plan(store: &GraphStore, plan: &MergePlan) -> Result<(), DedupError> {
    plan.validate().map_err(DedupError::InvalidResponse)?;

    let entries = store.get_entries().await;
    let Some(keeper_entry) = entries.get(&plan.keep_node_id) else {
        return Err(DedupError::InvalidResponse(format!(
            "keepNodeId `{}` not found in registry",
            plan.keep_node_id
        )));
    };
    let Some(mut keeper) = store.read_node(&store.root().join(&keeper_entry.file_path)).await else {
        return Err(DedupError::InvalidResponse(format!(
            "keepNodeId `{}` file unreadable",
            plan.keep_node_id
        )));
    };

    if let Some(description) = &plan.patch.description {
        keeper.description = description.clone();
    }
    if let Some(tags) = &plan.patch.tags {
        keeper.tags = union_preserving_order(&keeper.tags, tags);
    }
    if let Some(links) = &plan.patch.links {
        keeper.links = union_preserving_order(&keeper.links, links);
    }
    if let Some(body_append) = &plan.patch.body_append {
        if !body_append.is_empty() {
            let date = date_prefix(&Utc::now().to_rfc3339()).to_string();
            if !keeper.body.is_empty() && !keeper.body.ends_with('\n') {
                keeper.body.push('\n');
            }
            keeper.body.push_str(&format!("\n## Merged ({date})\n{body_append}\n"));
        }
    }
    keeper.supersedes = union_preserving_order(&keeper.supersedes, &plan.merge_node_ids);
    keeper.updated = Utc::now().to_rfc3339();

    store.write_node(&keeper).await.map_err(DedupError::Store)?;

    for loser_id in &plan.merge_node_ids {
        store.archive(loser_id).await.map_err(DedupError::Store)?;
    }

    append_audit_entry(store.root(), plan).await.map_err(DedupError::Store)?;
    Ok(())
}

async fn append_audit_entry(root: &std::path::Path, plan: &MergePlan) -> Result<(), StoreError> {
    let line = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "keepNodeId": plan.keep_node_id,
        "mergedNodeIds": plan.merge_node_ids,
        "aliasKeys": plan.alias_keys,
        "conflicts": plan.conflicts,
        "patch": {
            "description": plan.patch.description,
            "tags": plan.patch.tags,
            "links": plan.patch.links,
            "bodyAppend": plan.patch.body_append,
        },
    });
    append_jsonl_line(&root.join(".dedup-audit.jsonl"), &line.to_string()).await
}

pub(crate) async fn append_jsonl_line(path: &std::path::Path, line: &str) -> Result<(), StoreError> {
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

/// Strips a leading/trailing triple-backtick fence (optionally tagged
/// `json`) before JSON parsing, matching the oracle-output tolerance used
/// throughout the rest of the pipeline.
pub fn strip_json_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(after_open) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let after_open = after_open.strip_prefix("json").unwrap_or(after_open);
    after_open.strip_suffix("```").unwrap_or(after_open).trim()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct MergePlanEnvelope {
    #[serde(rename = "mergePlans")]
    pub merge_plans: Vec<MergePlanRaw>,
}

/// Mirrors `MergePlan` but kept separate so `MergePlanEnvelope` can derive
/// `Serialize` for tests without requiring it on the validated type.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergePlanRaw {
    pub keep_node_id: String,
    pub merge_node_ids: Vec<String>,
    #[serde(default)]
    pub alias_keys: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub patch: MergePatchRaw,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MergePatchRaw {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub links: Option<Vec<String>>,
    #[serde(default)]
    pub body_append: Option<String>,
}

impl From<MergePlanRaw> for MergePlan {
    fn from(raw: MergePlanRaw) -> Self {
        MergePlan {
            keep_node_id: raw.keep_node_id,
            merge_node_ids: raw.merge_node_ids,
            alias_keys: raw.alias_keys,
            conflicts: raw.conflicts,
            patch: MergePatch {
                description: raw.patch.description,
                tags: raw.patch.tags,
                links: raw.patch.links,
                body_append: raw.patch.body_append,
            },
        }
    }
}

/// Parses the oracle's `{"mergePlans": [...]}` envelope, stripping a JSON
/// code fence first. Returns a descriptive error on malformed JSON rather
/// than panicking.
pub fn parse_merge_plans(raw: &str) -> Result<Vec<MergePlan>, String> {
    let stripped = strip_json_fence(raw);
    let envelope: MergePlanEnvelope = serde_json::from_str(stripped).map_err(|e| e.to_string())?;
    let plans: Vec<MergePlan> = envelope.merge_plans.into_iter().map(MergePlan::from).collect();
    for plan in &plans {
        plan.validate()?;
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, NodeType, Priority};
    use tempfile::TempDir;

    fn sample_node(id: &str, description: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: NodeType::Fact,
            description: description.to_string(),
            priority: Priority::Medium,
            created: "2026-01-01T00:00:00Z".into(),
            updated: "2026-01-01T00:00:00Z".into(),
            applies_to: None,
            sources: vec![],
            links: vec![],
            tags: vec!["a".into()],
            supersedes: vec![],
            compression_level: None,
            archived: false,
            canonical_key: Some("fact.x".into()),
            body: "Body".into(),
        }
    }

    #[test]
    fn strips_json_fence() {
        let raw = "```json\n{\"mergePlans\": []}\n```";
        assert_eq!(strip_json_fence(raw), "{\"mergePlans\": []}");
    }

    #[test]
    fn parses_merge_plans_envelope() {
        let raw = r#"{"mergePlans": [{"keepNodeId": "a", "mergeNodeIds": ["b"], "patch": {"description": "merged"}}]}"#;
        let plans = parse_merge_plans(raw).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].keep_node_id, "a");
        assert_eq!(plans[0].patch.description, Some("merged".to_string()));
    }

    #[test]
    fn rejects_plan_merging_node_into_itself() {
        let raw = r#"{"mergePlans": [{"keepNodeId": "a", "mergeNodeIds": ["a"]}]}"#;
        assert!(parse_merge_plans(raw).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_merge_plans("not json").is_err());
    }

    #[tokio::test]
    async fn executes_merge_unions_tags_and_archives_loser() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::load(dir.path()).await;
        store.write_node(&sample_node("omg/fact/keep", "Keeper")).await.unwrap();
        store.write_node(&sample_node("omg/fact/lose", "Loser")).await.unwrap();

        let plan = MergePlan {
            keep_node_id: "omg/fact/keep".into(),
            merge_node_ids: vec!["omg/fact/lose".into()],
            alias_keys: vec!["fact.lose".into()],
            conflicts: vec![],
            patch: MergePatch {
                description: Some("Merged description".into()),
                tags: Some(vec!["b".into()]),
                links: None,
                body_append: Some("extra context".into()),
            },
        };

        execute_merge_plan(&store, &plan).await.unwrap();

        let entries = store.get_entries().await;
        assert!(entries["omg/fact/lose"].archived);
        assert!(!entries["omg/fact/keep"].archived);

        let keeper = store
            .read_node(&store.root().join(&entries["omg/fact/keep"].file_path))
            .await
            .unwrap();
        assert_eq!(keeper.description, "Merged description");
        assert_eq!(keeper.tags, vec!["a".to_string(), "b".to_string()]);
        assert!(keeper.body.contains("extra context"));
        assert_eq!(keeper.supersedes, vec!["omg/fact/lose".to_string()]);

        let audit = tokio::fs::read_to_string(dir.path().join(".dedup-audit.jsonl"))
            .await
            .unwrap();
        assert!(audit.contains("omg/fact/keep"));
        assert!(audit.contains("fact.lose"));
    }

    #[tokio::test]
    async fn errors_on_unknown_keeper_without_panicking() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::load(dir.path()).await;
        let plan = MergePlan {
            keep_node_id: "omg/fact/missing".into(),
            merge_node_ids: vec!["omg/fact/also-missing".into()],
            alias_keys: vec![],
            conflicts: vec![],
            patch: MergePatch::default(),
        };
        assert!(execute_merge_plan(&store, &plan).await.is_err());
    }
}
