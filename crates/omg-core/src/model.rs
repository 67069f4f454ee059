//! The node and registry data model (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::NodeError;

/// The closed set of node categories. Determines the subdirectory under
/// `nodes/<type>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeType {
    Identity,
    Preference,
    Project,
    Decision,
    Fact,
    Episode,
    Reflection,
    Index,
    Moc,
    Now,
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        NodeType::Identity,
        NodeType::Preference,
        NodeType::Project,
        NodeType::Decision,
        NodeType::Fact,
        NodeType::Episode,
        NodeType::Reflection,
        NodeType::Index,
        NodeType::Moc,
        NodeType::Now,
    ];

    /// The directory name under `nodes/` this type's files live in.
    pub fn dir_name(&self) -> &'static str {
        match self {
            NodeType::Identity => "identity",
            NodeType::Preference => "preference",
            NodeType::Project => "project",
            NodeType::Decision => "decision",
            NodeType::Fact => "fact",
            NodeType::Episode => "episode",
            NodeType::Reflection => "reflection",
            NodeType::Index => "index",
            NodeType::Moc => "moc",
            NodeType::Now => "now",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<NodeType> {
        match s {
            "identity" => Some(NodeType::Identity),
            "preference" => Some(NodeType::Preference),
            "project" => Some(NodeType::Project),
            "decision" => Some(NodeType::Decision),
            "fact" => Some(NodeType::Fact),
            "episode" => Some(NodeType::Episode),
            "reflection" => Some(NodeType::Reflection),
            "index" => Some(NodeType::Index),
            "moc" => Some(NodeType::Moc),
            "now" => Some(NodeType::Now),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn from_str_loose(s: &str) -> Option<Priority> {
        match s {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// At least one of `session_scope`/`identity_key` must be present if this
/// struct is set on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppliesTo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<String>,
}

impl AppliesTo {
    pub fn is_valid(&self) -> bool {
        self.session_scope.is_some() || self.identity_key.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub session_key: String,
    pub kind: String,
    /// Epoch milliseconds, must be >= 0.
    pub timestamp: i64,
}

/// A persisted unit of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identifier of the form `namespace/slug`. Unique, immutable.
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub description: String,
    pub priority: Priority,
    /// ISO-8601 date-time.
    pub created: String,
    /// ISO-8601 date-time; invariant `updated >= created` lexicographically.
    pub updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applies_to: Option<AppliesTo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<u8>,
    #[serde(default)]
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_key: Option<String>,
    /// Free-form markdown following the front-matter. Not serialized into
    /// the YAML block itself — callers pass it separately to the store.
    #[serde(skip)]
    pub body: String,
}

impl Node {
    /// Validates the invariants in spec §3 that aren't already enforced by
    /// the type system. Returns field-pathed errors so callers can report
    /// exactly what's wrong without guessing.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.id.is_empty() {
            return Err(NodeError::InvalidField {
                field: "id".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.id.contains("..") || self.id.contains('\\') {
            return Err(NodeError::InvalidField {
                field: "id".into(),
                reason: "must not contain path traversal segments".into(),
            });
        }
        if self.description.trim().is_empty() {
            return Err(NodeError::InvalidField {
                field: "description".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.updated.as_str() < self.created.as_str() {
            return Err(NodeError::InvalidField {
                field: "updated".into(),
                reason: "must be >= created".into(),
            });
        }
        if let Some(level) = self.compression_level {
            if level > 3 {
                return Err(NodeError::InvalidField {
                    field: "compressionLevel".into(),
                    reason: "must be in 0..=3".into(),
                });
            }
        }
        if let Some(applies_to) = &self.applies_to {
            if !applies_to.is_valid() {
                return Err(NodeError::InvalidField {
                    field: "appliesTo".into(),
                    reason: "at least one of sessionScope/identityKey must be set".into(),
                });
            }
        }
        for source in &self.sources {
            if source.timestamp < 0 {
                return Err(NodeError::InvalidField {
                    field: "sources[].timestamp".into(),
                    reason: "must be >= 0".into(),
                });
            }
        }
        Ok(())
    }

    /// The first dotted segment of `canonicalKey`, used as a bucketing signal.
    /// Falls back to the canonical key itself when it has no dot, and to
    /// `""` when there is no canonical key at all.
    pub fn key_prefix(&self) -> &str {
        match &self.canonical_key {
            Some(key) => key.split('.').next().unwrap_or(""),
            None => "",
        }
    }
}

/// Arbitrary forward-compatible front-matter fields captured before being
/// narrowed into a typed `Node`. Unknown fields are stripped on read.
pub type RawFrontmatter = HashMap<String, JsonValue>;

/// An in-memory mirror of a node's front-matter-derived metadata, plus its
/// on-disk location. The scan-free index every pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub description: String,
    pub priority: Priority,
    pub created: String,
    pub updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    pub file_path: PathBuf,
}

impl RegistryEntry {
    pub fn from_node(node: &Node, file_path: PathBuf) -> Self {
        RegistryEntry {
            id: node.id.clone(),
            node_type: node.node_type,
            description: node.description.clone(),
            priority: node.priority,
            created: node.created.clone(),
            updated: node.updated.clone(),
            canonical_key: node.canonical_key.clone(),
            tags: node.tags.clone(),
            links: node.links.clone(),
            archived: node.archived,
            file_path,
        }
    }
}

/// `omgRoot/.registry.json`: `id -> RegistryEntry`.
pub type Registry = HashMap<String, RegistryEntry>;
