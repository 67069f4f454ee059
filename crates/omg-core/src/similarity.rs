//! Trigram/token-set Jaccard similarity, key-prefix resolution, and domain
//! assignment (spec §4.4).

use std::collections::HashSet;

use crate::model::{Node, RegistryEntry};

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "for", "of", "to", "in", "on",
    "at", "by", "with", "about", "against", "between", "into", "through", "during", "before",
    "after", "above", "below", "from", "up", "down", "out", "off", "over", "under", "again",
    "further", "is", "are", "was", "were", "be", "been", "being", "it", "this", "that",
];

fn stopwords() -> HashSet<&'static str> {
    STOPWORDS.iter().copied().collect()
}

/// Lowercase, split on non-alphanumeric, drop stopwords and empties.
pub fn tokenize_words(text: &str) -> HashSet<String> {
    let stop = stopwords();
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !stop.contains(*w))
        .map(|w| w.to_string())
        .collect()
}

/// Character trigrams with multiset counts (each occurrence is a distinct
/// element for the Jaccard computation below).
fn char_trigrams(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.to_lowercase().chars().collect();
    if chars.len() < 3 {
        return if chars.is_empty() {
            Vec::new()
        } else {
            vec![chars.iter().collect()]
        };
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

fn multiset_counts(items: &[String]) -> std::collections::HashMap<&str, u32> {
    let mut counts = std::collections::HashMap::new();
    for item in items {
        *counts.entry(item.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Multiset Jaccard: `sum(min) / sum(max)` over the union of keys. 1.0 for
/// two equal empty inputs (both represented as zero total), 0.0 when the
/// multisets are fully disjoint.
fn multiset_jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let counts_a = multiset_counts(a);
    let counts_b = multiset_counts(b);

    let mut keys: HashSet<&str> = HashSet::new();
    keys.extend(counts_a.keys().copied());
    keys.extend(counts_b.keys().copied());

    let mut sum_min = 0u32;
    let mut sum_max = 0u32;
    for key in keys {
        let ca = *counts_a.get(key).unwrap_or(&0);
        let cb = *counts_b.get(key).unwrap_or(&0);
        sum_min += ca.min(cb);
        sum_max += ca.max(cb);
    }

    if sum_max == 0 {
        0.0
    } else {
        sum_min as f64 / sum_max as f64
    }
}

pub fn trigram_jaccard(a: &str, b: &str) -> f64 {
    multiset_jaccard(&char_trigrams(a), &char_trigrams(b))
}

pub fn token_set_jaccard(a: &str, b: &str) -> f64 {
    let set_a = tokenize_words(a);
    let set_b = tokenize_words(b);

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// `0.4 * tokenSetJaccard(desc) + 0.6 * trigramJaccard(key)`. Keys weighted
/// higher because they are more stable than free-form descriptions.
pub fn combined_similarity(desc_a: &str, desc_b: &str, key_a: &str, key_b: &str) -> f64 {
    0.4 * token_set_jaccard(desc_a, desc_b) + 0.6 * trigram_jaccard(key_a, key_b)
}

/// The substring before the first `.`, or the whole string if there's no
/// dot; `""` for an empty string.
pub fn key_prefix(key: &str) -> &str {
    key.split('.').next().unwrap_or("")
}

/// Maps a key-prefix through the fixed singular/plural table in spec §4.4.
/// Anything not in the table, including near-misses like `decisioning`,
/// falls through to `misc`.
fn map_key_prefix_to_domain(prefix: &str) -> &'static str {
    match prefix {
        "identity" => "identity",
        "preference" | "preferences" => "preferences",
        "project" | "projects" => "projects",
        "decision" | "decisions" => "decisions",
        _ => "misc",
    }
}

/// (1) first link matching `omg/moc-<d>` wins; (2) else the key-prefix
/// mapping; (3) else `misc`.
pub fn resolve_domain(node: &Node) -> String {
    for link in &node.links {
        if let Some(domain) = link
            .rsplit('/')
            .next()
            .and_then(|last| last.strip_prefix("moc-"))
        {
            return domain.to_string();
        }
    }

    let prefix = node.canonical_key.as_deref().map(key_prefix).unwrap_or("");
    map_key_prefix_to_domain(prefix).to_string()
}

/// Same resolution rules as `resolve_domain`, but over the lighter-weight
/// `RegistryEntry` the store works with when it doesn't need a full node
/// body in hand (index/MOC regeneration).
pub fn resolve_domain_for_entry(entry: &RegistryEntry) -> String {
    for link in &entry.links {
        if let Some(domain) = link
            .rsplit('/')
            .next()
            .and_then(|last| last.strip_prefix("moc-"))
        {
            return domain.to_string();
        }
    }

    let prefix = entry.canonical_key.as_deref().map(key_prefix).unwrap_or("");
    map_key_prefix_to_domain(prefix).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeType, Priority};

    fn node_with(links: Vec<&str>, canonical_key: Option<&str>) -> Node {
        Node {
            id: "omg/fact/x".into(),
            node_type: NodeType::Fact,
            description: "d".into(),
            priority: Priority::Medium,
            created: "2026-01-01T00:00:00Z".into(),
            updated: "2026-01-01T00:00:00Z".into(),
            applies_to: None,
            sources: vec![],
            links: links.into_iter().map(String::from).collect(),
            tags: vec![],
            supersedes: vec![],
            compression_level: None,
            archived: false,
            canonical_key: canonical_key.map(String::from),
            body: String::new(),
        }
    }

    #[test]
    fn combined_similarity_is_one_for_identical_inputs() {
        let sim = combined_similarity("same text", "same text", "same.key", "same.key");
        assert!((sim - 1.0).abs() < 1e-9);
    }

    #[test]
    fn combined_similarity_is_zero_for_disjoint_inputs() {
        let sim = combined_similarity("zzz yyy", "aaa bbb", "qqq", "rrr");
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn combined_similarity_is_bounded() {
        let sim = combined_similarity("some words here", "other words there", "a.b", "a.c");
        assert!((0.0..=1.0).contains(&sim));
    }

    #[test]
    fn key_prefix_splits_on_dot() {
        assert_eq!(key_prefix("preferences.dark-mode"), "preferences");
        assert_eq!(key_prefix("noDot"), "noDot");
        assert_eq!(key_prefix(""), "");
    }

    #[test]
    fn domain_prefers_moc_link() {
        let node = node_with(vec!["omg/moc-projects"], Some("identity.name"));
        assert_eq!(resolve_domain(&node), "projects");
    }

    #[test]
    fn domain_falls_back_to_key_prefix_mapping() {
        let node = node_with(vec![], Some("decisions.pick-db"));
        assert_eq!(resolve_domain(&node), "decisions");
    }

    #[test]
    fn domain_defaults_to_misc() {
        let node = node_with(vec![], Some("widgets.thing"));
        assert_eq!(resolve_domain(&node), "misc");
    }

    #[test]
    fn domain_misc_without_canonical_key() {
        let node = node_with(vec![], None);
        assert_eq!(resolve_domain(&node), "misc");
    }
}
