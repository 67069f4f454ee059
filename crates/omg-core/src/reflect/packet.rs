//! Compact packet construction for the reflection oracle (spec §4.8 step 5,
//! glossary "Compact packet"). Bounds what gets sent per node: description,
//! up to 10 non-blank body lines, the last 3 `## Updates` bullets, and up
//! to 5 link targets.

use crate::model::Node;

#[derive(Debug, Clone, PartialEq)]
pub struct CompactPacket {
    pub canonical_key: String,
    pub description: String,
    pub body_lines: Vec<String>,
    pub recent_updates: Vec<String>,
    pub links: Vec<String>,
}

fn first_non_blank_lines(body: &str, limit: usize) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(limit)
        .map(str::to_string)
        .collect()
}

/// The last `limit` `- ` bullets under a `## Updates` heading, if present.
fn last_update_bullets(body: &str, limit: usize) -> Vec<String> {
    let Some(idx) = body.find("## Updates") else {
        return Vec::new();
    };
    let after = &body[idx..];
    let bullets: Vec<String> = after
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| line.starts_with("- "))
        .map(str::to_string)
        .collect();
    let start = bullets.len().saturating_sub(limit);
    bullets[start..].to_vec()
}

pub fn build_compact_packet(node: &Node) -> CompactPacket {
    CompactPacket {
        canonical_key: node.canonical_key.clone().unwrap_or_else(|| node.id.clone()),
        description: node.description.clone(),
        body_lines: first_non_blank_lines(&node.body, 10),
        recent_updates: last_update_bullets(&node.body, 3),
        links: node.links.iter().take(5).cloned().collect(),
    }
}

/// Renders a packet to the plain-text form sent in the oracle's user
/// message — one block per node, stable field order.
pub fn render_packet(packet: &CompactPacket) -> String {
    let mut out = format!(
        "### {}\n{}\n",
        packet.canonical_key, packet.description
    );
    if !packet.body_lines.is_empty() {
        out.push_str("Body:\n");
        for line in &packet.body_lines {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    if !packet.recent_updates.is_empty() {
        out.push_str("Recent updates:\n");
        for update in &packet.recent_updates {
            out.push_str("  ");
            out.push_str(update);
            out.push('\n');
        }
    }
    if !packet.links.is_empty() {
        out.push_str(&format!("Links: {}\n", packet.links.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeType, Priority};

    fn node_with_body(body: &str) -> Node {
        Node {
            id: "omg/fact/x".into(),
            node_type: NodeType::Fact,
            description: "A fact".into(),
            priority: Priority::Medium,
            created: "2026-01-01T00:00:00Z".into(),
            updated: "2026-01-01T00:00:00Z".into(),
            applies_to: None,
            sources: vec![],
            links: vec!["omg/fact/a".into(), "omg/fact/b".into()],
            tags: vec![],
            supersedes: vec![],
            compression_level: None,
            archived: false,
            canonical_key: Some("fact.x".into()),
            body: body.to_string(),
        }
    }

    #[test]
    fn takes_up_to_ten_non_blank_body_lines() {
        let body = (0..15).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n\n");
        let packet = build_compact_packet(&node_with_body(&body));
        assert_eq!(packet.body_lines.len(), 10);
        assert_eq!(packet.body_lines[0], "line 0");
    }

    #[test]
    fn takes_last_three_update_bullets() {
        let body = "intro\n\n## Updates\n- 2026-01-01: one\n- 2026-01-02: two\n- 2026-01-03: three\n- 2026-01-04: four\n";
        let packet = build_compact_packet(&node_with_body(body));
        assert_eq!(packet.recent_updates.len(), 3);
        assert_eq!(packet.recent_updates[0], "- 2026-01-02: two");
        assert_eq!(packet.recent_updates[2], "- 2026-01-04: four");
    }

    #[test]
    fn no_updates_section_yields_empty_recent_updates() {
        let packet = build_compact_packet(&node_with_body("just a body, no updates"));
        assert!(packet.recent_updates.is_empty());
    }

    #[test]
    fn caps_links_at_five() {
        let mut node = node_with_body("body");
        node.links = (0..8).map(|i| format!("omg/fact/n{i}")).collect();
        let packet = build_compact_packet(&node);
        assert_eq!(packet.links.len(), 5);
    }

    #[test]
    fn canonical_key_falls_back_to_id() {
        let mut node = node_with_body("body");
        node.canonical_key = None;
        let packet = build_compact_packet(&node);
        assert_eq!(packet.canonical_key, "omg/fact/x");
    }
}
