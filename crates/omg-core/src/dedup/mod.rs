//! Deduplication engines: a two-pass literal dedup (heuristic clustering +
//! oracle confirmation) and a separate LLM-driven semantic dedup, sharing
//! a merge executor and an append-only audit log (spec §4.9).

mod literal;
mod merge;
mod semantic;

pub use literal::{run_literal_dedup, LiteralDedupConfig, LiteralDedupOutcome};
pub use merge::{execute_merge_plan, parse_merge_plans, strip_json_fence, MergePatch, MergePlan};
pub use semantic::{run_semantic_dedup, SemanticDedupConfig, SemanticDedupOutcome, SemanticSuggestion};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::NodeType;
use crate::store::atomic_write;

const DEDUP_STATE_FILE: &str = ".dedup-state.json";

/// `omgRoot/.dedup-state.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DedupState {
    pub last_dedup_at: Option<String>,
    pub runs_completed: u64,
    pub total_merges: u64,
}

impl Default for DedupState {
    fn default() -> Self {
        DedupState {
            last_dedup_at: None,
            runs_completed: 0,
            total_merges: 0,
        }
    }
}

pub async fn load_dedup_state(root: &Path) -> DedupState {
    let path = root.join(DEDUP_STATE_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("dedup state corrupt, starting fresh: {e}");
            DedupState::default()
        }),
        Err(_) => DedupState::default(),
    }
}

pub async fn save_dedup_state(root: &Path, state: &DedupState) -> Result<(), StoreError> {
    let serialized = serde_json::to_string_pretty(state).map_err(|e| StoreError::InvalidPath(e.to_string()))?;
    atomic_write(&root.join(DEDUP_STATE_FILE), &serialized)
        .await
        .map_err(|source| StoreError::AtomicWrite {
            path: DEDUP_STATE_FILE.to_string(),
            source,
        })
}

/// Types whose dedup candidacy bypasses the staleness filter — identity
/// and preference facts rarely churn, so an old-but-unchanged node is
/// still a legitimate dedup target. Everything else is "volatile": it's
/// excluded from candidate clustering once its last update is older than
/// `staleDaysThreshold`, on the theory that it's already been superseded
/// or reflected over by the time it goes quiet.
pub fn is_stable_type(node_type: NodeType) -> bool {
    matches!(
        node_type,
        NodeType::Identity | NodeType::Preference | NodeType::Decision | NodeType::Project
    )
}

/// Simple union-find over registry-entry ids, used by both the literal
/// heuristic clustering pass and nothing else (semantic dedup blocks by
/// domain+time instead, see `semantic::group_into_blocks`).
pub(crate) struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}
