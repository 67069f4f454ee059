//! Post-bootstrap quality report over the final registry (spec §4.7
//! stage 6).

use crate::model::{NodeType, Registry};

#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    pub total: usize,
    pub identity_count: usize,
    pub preference_count: usize,
    pub warnings: Vec<String>,
}

pub fn build_quality_report(registry: &Registry) -> QualityReport {
    let entries: Vec<_> = registry.values().filter(|e| !e.archived).collect();
    let total = entries.len();
    let identity_count = entries.iter().filter(|e| e.node_type == NodeType::Identity).count();
    let preference_count = entries
        .iter()
        .filter(|e| e.node_type == NodeType::Preference)
        .count();

    let mut warnings = Vec::new();
    if identity_count == 0 {
        warnings.push("no identity nodes were created during bootstrap".to_string());
    }
    if preference_count == 0 {
        warnings.push("no preference nodes were created during bootstrap".to_string());
    }
    if total > 0 {
        let ratio = (identity_count + preference_count) as f64 / total as f64;
        if ratio < 0.05 {
            warnings.push(format!(
                "identity+preference nodes are only {:.1}% of the graph, below the 5% baseline",
                ratio * 100.0
            ));
        }
    }

    QualityReport {
        total,
        identity_count,
        preference_count,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, RegistryEntry};
    use std::path::PathBuf;

    fn entry(node_type: NodeType) -> RegistryEntry {
        RegistryEntry {
            id: format!("omg/{}/x", node_type.dir_name()),
            node_type,
            description: "d".into(),
            priority: Priority::Medium,
            created: "2026-01-01T00:00:00Z".into(),
            updated: "2026-01-01T00:00:00Z".into(),
            canonical_key: None,
            tags: vec![],
            links: vec![],
            archived: false,
            file_path: PathBuf::from("nodes/x.md"),
        }
    }

    #[test]
    fn warns_when_no_identity_nodes() {
        let mut registry = Registry::new();
        registry.insert("a".into(), entry(NodeType::Fact));
        let report = build_quality_report(&registry);
        assert!(report.warnings.iter().any(|w| w.contains("identity")));
    }

    #[test]
    fn warns_when_no_preference_nodes() {
        let mut registry = Registry::new();
        registry.insert("a".into(), entry(NodeType::Identity));
        let report = build_quality_report(&registry);
        assert!(report.warnings.iter().any(|w| w.contains("preference")));
    }

    #[test]
    fn no_warnings_with_healthy_mix() {
        let mut registry = Registry::new();
        registry.insert("a".into(), entry(NodeType::Identity));
        registry.insert("b".into(), entry(NodeType::Preference));
        let report = build_quality_report(&registry);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn archived_entries_excluded_from_counts() {
        let mut registry = Registry::new();
        let mut archived = entry(NodeType::Identity);
        archived.archived = true;
        registry.insert("a".into(), archived);
        let report = build_quality_report(&registry);
        assert_eq!(report.total, 0);
    }
}
