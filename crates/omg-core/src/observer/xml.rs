//! Tolerant parsing of the oracle's `<observations>` response (spec §4.5).
//! The oracle is untrusted input: malformed XML, a missing root, or
//! unknown fields never panic the pipeline — they degrade to an empty
//! result or a dropped operation.

use regex::Regex;

use crate::model::{NodeType, Priority};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedOperation {
    pub canonical_key: String,
    pub node_type: NodeType,
    pub description: String,
    pub priority: Priority,
    pub body: String,
    pub moc_hints: Vec<String>,
    pub tags: Vec<String>,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedObservations {
    pub operations: Vec<ParsedOperation>,
    /// All `mocHints` across accepted operations, deduplicated in
    /// insertion order.
    pub moc_updates: Vec<String>,
    pub now_update: Option<String>,
    pub dropped_count: u32,
    /// One short reason per dropped operation, in encounter order. Feeds
    /// the bootstrap write stage's `zero-operations` diagnostics.
    pub dropped_reasons: Vec<String>,
}

fn tag_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?si)<{tag}\s*>(.*?)</{tag}\s*>")).expect("static pattern compiles")
}

fn extract_tag(content: &str, tag: &str) -> Option<String> {
    tag_regex(tag)
        .captures(content)
        .map(|c| c[1].trim().to_string())
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

/// Extracts the first `<observations>...</observations>` substring,
/// tolerant of code fences and preamble text around it.
fn extract_observations_block(raw: &str) -> Option<String> {
    let fence_stripped = Regex::new(r"(?si)```(?:xml)?\s*(.*?)```")
        .ok()?
        .captures(raw)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| raw.to_string());

    let haystack = if fence_stripped.contains("<observations") {
        fence_stripped.as_str()
    } else {
        raw
    };

    let re = Regex::new(r"(?si)<observations\b[^>]*>(.*)</observations\s*>").ok()?;
    re.captures(haystack).map(|c| c[1].to_string())
}

fn parse_operation_attrs(tag: &str) -> (Option<String>, Option<String>) {
    let type_re = Regex::new(r#"type\s*=\s*"([^"]*)""#).unwrap();
    let priority_re = Regex::new(r#"priority\s*=\s*"([^"]*)""#).unwrap();
    (
        type_re.captures(tag).map(|c| c[1].to_string()),
        priority_re.captures(tag).map(|c| c[1].to_string()),
    )
}

/// Parses a free-form oracle response wrapping `<observations>`. Never
/// throws: any parse failure or missing root yields an empty output.
pub fn parse_observations(raw: &str) -> ParsedObservations {
    let Some(body) = extract_observations_block(raw) else {
        return ParsedObservations::default();
    };

    let operation_re =
        Regex::new(r"(?si)<operation([^>]*)>(.*?)</operation\s*>").expect("static pattern compiles");

    let mut operations = Vec::new();
    let mut moc_updates = Vec::new();
    let mut seen_moc_hints = std::collections::HashSet::new();
    let mut dropped_count = 0u32;
    let mut dropped_reasons = Vec::new();

    for capture in operation_re.captures_iter(&body) {
        let attrs = &capture[1];
        let inner = &capture[2];

        let (type_attr, priority_attr) = parse_operation_attrs(attrs);

        let canonical_key = extract_tag(inner, "canonical-key").unwrap_or_default();
        let description = extract_tag(inner, "description").unwrap_or_default();
        let body_text = extract_tag(inner, "content").unwrap_or_default();

        let node_type = type_attr.as_deref().and_then(NodeType::from_str_loose);
        let priority = priority_attr
            .as_deref()
            .and_then(Priority::from_str_loose)
            .unwrap_or_else(|| {
                if priority_attr.is_some() {
                    tracing::warn!("operation had unrecognized priority, defaulting to medium");
                }
                Priority::Medium
            });

        if canonical_key.is_empty() {
            tracing::warn!("dropping operation: missing canonicalKey");
            dropped_count += 1;
            dropped_reasons.push("missing-canonical-key".to_string());
            continue;
        }
        let Some(node_type) = node_type else {
            tracing::warn!("dropping operation: unknown type `{:?}`", type_attr);
            dropped_count += 1;
            dropped_reasons.push("unknown-type".to_string());
            continue;
        };
        if description.is_empty() {
            tracing::warn!("dropping operation: empty description");
            dropped_count += 1;
            dropped_reasons.push("empty-description".to_string());
            continue;
        }

        let moc_hints = split_comma_list(extract_tag(inner, "moc-hints"));
        for hint in &moc_hints {
            if seen_moc_hints.insert(hint.clone()) {
                moc_updates.push(hint.clone());
            }
        }

        operations.push(ParsedOperation {
            canonical_key,
            node_type,
            description,
            priority,
            body: body_text,
            moc_hints,
            tags: split_comma_list(extract_tag(inner, "tags")),
            links: split_comma_list(extract_tag(inner, "links")),
        });
    }

    let now_update = extract_tag(&body, "now-update").filter(|s| !s.is_empty());

    ParsedObservations {
        operations,
        moc_updates,
        now_update,
        dropped_count,
        dropped_reasons,
    }
}
