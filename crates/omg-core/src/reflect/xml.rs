//! Tolerant parsing of the reflection oracle's `<reflection>` response
//! (spec §4.8 step 6). Untrusted input, same posture as the observer
//! parser: malformed XML or a missing root degrades to `None`, never a
//! panic.

use regex::Regex;

use crate::model::{NodeType, Priority};

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionNode {
    pub canonical_key: String,
    pub node_type: NodeType,
    pub description: String,
    pub priority: Priority,
    pub body: String,
    pub tags: Vec<String>,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub id: String,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub links: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReflection {
    pub reflection_nodes: Vec<ReflectionNode>,
    pub archive_ids: Vec<String>,
    pub moc_updates: Vec<String>,
    pub node_updates: Vec<NodeUpdate>,
}

fn tag_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?si)<{tag}\s*>(.*?)</{tag}\s*>")).expect("static pattern compiles")
}

fn extract_tag(content: &str, tag: &str) -> Option<String> {
    tag_regex(tag).captures(content).map(|c| c[1].trim().to_string())
}

fn split_comma_list(s: Option<String>) -> Vec<String> {
    match s {
        None => Vec::new(),
        Some(s) => s
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    }
}

fn extract_attr(tag: &str, attr: &str) -> Option<String> {
    Regex::new(&format!(r#"{attr}\s*=\s*"([^"]*)""#))
        .ok()?
        .captures(tag)
        .map(|c| c[1].to_string())
}

/// Extracts the first `<reflection>...</reflection>` substring, tolerant
/// of code fences and preamble text around it, mirroring the observer's
/// `extract_observations_block`.
fn extract_reflection_block(raw: &str) -> Option<String> {
    let fence_stripped = Regex::new(r"(?si)```(?:xml)?\s*(.*?)```")
        .ok()?
        .captures(raw)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| raw.to_string());

    let haystack = if fence_stripped.contains("<reflection") {
        fence_stripped.as_str()
    } else {
        raw
    };

    let re = Regex::new(r"(?si)<reflection\b[^>]*>(.*)</reflection\s*>").ok()?;
    re.captures(haystack).map(|c| c[1].to_string())
}

fn parse_reflection_nodes(body: &str) -> Vec<ReflectionNode> {
    let Some(section) = extract_tag(body, "reflection-nodes") else {
        return Vec::new();
    };
    let node_re = Regex::new(r"(?si)<reflection-node([^>]*)>(.*?)</reflection-node\s*>")
        .expect("static pattern compiles");

    let mut nodes = Vec::new();
    for capture in node_re.captures_iter(&section) {
        let attrs = &capture[1];
        let inner = &capture[2];

        let canonical_key = extract_tag(inner, "canonical-key").unwrap_or_default();
        let description = extract_tag(inner, "description").unwrap_or_default();
        if canonical_key.is_empty() || description.is_empty() {
            tracing::warn!("dropping reflection-node: missing canonicalKey or description");
            continue;
        }
        let node_type = extract_attr(attrs, "type")
            .as_deref()
            .and_then(NodeType::from_str_loose)
            .unwrap_or(NodeType::Reflection);
        let priority = extract_attr(attrs, "priority")
            .as_deref()
            .and_then(Priority::from_str_loose)
            .unwrap_or(Priority::Medium);

        nodes.push(ReflectionNode {
            canonical_key,
            node_type,
            description,
            priority,
            body: extract_tag(inner, "content").unwrap_or_default(),
            tags: split_comma_list(extract_tag(inner, "tags")),
            links: split_comma_list(extract_tag(inner, "links")),
        });
    }
    nodes
}

fn parse_archive_ids(body: &str) -> Vec<String> {
    let Some(section) = extract_tag(body, "archive-nodes") else {
        return Vec::new();
    };
    let id_re = Regex::new(r"(?si)<id\s*>(.*?)</id\s*>").expect("static pattern compiles");
    id_re
        .captures_iter(&section)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_node_updates(body: &str) -> Vec<NodeUpdate> {
    let Some(section) = extract_tag(body, "node-updates") else {
        return Vec::new();
    };
    let update_re =
        Regex::new(r"(?si)<node-update([^>]*)>(.*?)</node-update\s*>").expect("static pattern compiles");

    let mut updates = Vec::new();
    for capture in update_re.captures_iter(&section) {
        let attrs = &capture[1];
        let inner = &capture[2];

        let Some(id) = extract_attr(attrs, "id") else {
            tracing::warn!("dropping node-update: missing id attribute");
            continue;
        };

        updates.push(NodeUpdate {
            id,
            description: extract_tag(inner, "description"),
            tags: extract_tag(inner, "tags").map(|s| split_comma_list(Some(s))),
            links: extract_tag(inner, "links").map(|s| split_comma_list(Some(s))),
        });
    }
    updates
}

/// Parses a free-form oracle response wrapping `<reflection>`. Never
/// throws: any parse failure or missing root yields `None`.
pub fn parse_reflection(raw: &str) -> Option<ParsedReflection> {
    let body = extract_reflection_block(raw)?;

    Some(ParsedReflection {
        reflection_nodes: parse_reflection_nodes(&body),
        archive_ids: parse_archive_ids(&body),
        moc_updates: split_comma_list(extract_tag(&body, "moc-updates")),
        node_updates: parse_node_updates(&body),
    })
}
