//! Domain + time-window clustering, with an anchor-split fallback for
//! clusters that still exceed the token budget (spec §4.8 steps 2-4).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::Node;
use crate::token::estimate_tokens;

#[derive(Debug, Clone)]
pub struct Cluster {
    pub domain: String,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub window_span_days: i64,
    pub max_input_tokens_per_cluster: u64,
    pub max_nodes_per_cluster: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            window_span_days: 7,
            max_input_tokens_per_cluster: 4_000,
            max_nodes_per_cluster: 20,
        }
    }
}

/// `estimateTokens(description) * 8` (approximating the body) plus the
/// token cost of every tag and link.
pub fn entry_token_estimate(node: &Node) -> u64 {
    estimate_tokens(&node.description) * 8
        + node.tags.iter().map(|t| estimate_tokens(t)).sum::<u64>()
        + node.links.iter().map(|l| estimate_tokens(l)).sum::<u64>()
}

fn parse_updated(updated: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(updated)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Groups nodes by domain, sorts each domain's nodes by `updated`
/// ascending, then walks flushing the current cluster whenever the time
/// span, token budget, or node-count cap would be exceeded.
pub fn cluster_by_time_window(nodes: Vec<(String, Node)>, config: &ClusterConfig) -> Vec<Cluster> {
    let mut by_domain: std::collections::BTreeMap<String, Vec<Node>> = std::collections::BTreeMap::new();
    for (domain, node) in nodes {
        by_domain.entry(domain).or_default().push(node);
    }

    let mut clusters = Vec::new();
    for (domain, mut domain_nodes) in by_domain {
        domain_nodes.sort_by(|a, b| a.updated.cmp(&b.updated));

        let mut current: Vec<Node> = Vec::new();
        let mut window_start: Option<DateTime<Utc>> = None;
        let mut current_tokens = 0u64;

        for node in domain_nodes {
            let node_tokens = entry_token_estimate(&node);
            let updated_dt = parse_updated(&node.updated);

            let span_exceeded = match (window_start, updated_dt) {
                (Some(start), Some(dt)) => (dt - start).num_hours() > config.window_span_days * 24,
                _ => false,
            };
            let token_exceeded = current_tokens + node_tokens > config.max_input_tokens_per_cluster;
            let count_exceeded = current.len() >= config.max_nodes_per_cluster;

            if !current.is_empty() && (span_exceeded || token_exceeded || count_exceeded) {
                clusters.push(Cluster {
                    domain: domain.clone(),
                    nodes: std::mem::take(&mut current),
                });
                current_tokens = 0;
                window_start = None;
            }

            if current.is_empty() {
                window_start = updated_dt;
            }
            current_tokens += node_tokens;
            current.push(node);
        }

        if !current.is_empty() {
            clusters.push(Cluster { domain, nodes: current });
        }
    }

    clusters
}

/// If a cluster still exceeds the token budget and holds more than two
/// nodes, partitions on the most common shared link (appearing in at
/// least 2 nodes but not all of them) and recurses on each half.
pub fn anchor_split(cluster: Cluster, config: &ClusterConfig) -> Vec<Cluster> {
    let total_tokens: u64 = cluster.nodes.iter().map(entry_token_estimate).sum();
    if total_tokens <= config.max_input_tokens_per_cluster || cluster.nodes.len() <= 2 {
        return vec![cluster];
    }

    let node_count = cluster.nodes.len();
    let mut link_counts: HashMap<String, usize> = HashMap::new();
    for node in &cluster.nodes {
        for link in &node.links {
            *link_counts.entry(link.clone()).or_insert(0) += 1;
        }
    }

    let anchor = link_counts
        .into_iter()
        .filter(|(_, count)| *count >= 2 && *count < node_count)
        .max_by_key(|(_, count)| *count)
        .map(|(link, _)| link);

    let Some(anchor) = anchor else {
        return vec![cluster];
    };

    let domain = cluster.domain.clone();
    let (with_anchor, without_anchor): (Vec<Node>, Vec<Node>) =
        cluster.nodes.into_iter().partition(|n| n.links.contains(&anchor));

    let mut result = Vec::new();
    if !with_anchor.is_empty() {
        result.extend(anchor_split(
            Cluster {
                domain: domain.clone(),
                nodes: with_anchor,
            },
            config,
        ));
    }
    if !without_anchor.is_empty() {
        result.extend(anchor_split(Cluster { domain, nodes: without_anchor }, config));
    }
    result
}
