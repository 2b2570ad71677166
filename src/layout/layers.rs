use std::collections::{HashMap, HashSet};

use crate::error::LayerError;
use crate::ir::{CanvasNode, Edge};

use super::types::LayerSet;

/// Node ids in input order, skipping malformed and repeated nodes.
pub(crate) fn valid_node_ids(nodes: &[CanvasNode]) -> Vec<&str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ids = Vec::with_capacity(nodes.len());
    for node in nodes {
        if let Err(err) = node.validate() {
            tracing::debug!(error = %err, "skipping node");
            continue;
        }
        if !seen.insert(node.id.as_str()) {
            tracing::debug!(node_id = %node.id, "skipping repeated node id");
            continue;
        }
        ids.push(node.id.as_str());
    }
    ids
}

/// Connection edges whose endpoints are both known, as `(source, target)` pairs.
pub(crate) fn valid_links<'a>(edges: &'a [Edge], known: &HashSet<&str>) -> Vec<(&'a str, &'a str)> {
    let mut links = Vec::new();
    for edge in edges {
        if let Err(err) = edge.validate() {
            tracing::debug!(error = %err, "skipping edge");
            continue;
        }
        let Some(target) = edge.target() else {
            continue;
        };
        if !known.contains(edge.source.as_str()) || !known.contains(target) {
            tracing::debug!(edge_id = %edge.id, "skipping edge with unknown endpoint");
            continue;
        }
        links.push((edge.source.as_str(), target));
    }
    links
}

/// Breadth-first topological layering.
///
/// Layer 0 holds every node without incoming edges (or the first node when the
/// graph is one big cycle). A node is placed the first time the frontier
/// reaches it and never again, so cycles terminate in O(V+E). Nodes the
/// frontier never reaches form one trailing layer.
pub fn build_layers(nodes: &[CanvasNode], edges: &[Edge]) -> LayerSet {
    let ids = valid_node_ids(nodes);
    if ids.is_empty() {
        return Vec::new();
    }
    let known: HashSet<&str> = ids.iter().copied().collect();

    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    for (source, target) in valid_links(edges, &known) {
        outgoing.entry(source).or_default().push(target);
        if source != target {
            *indegree.entry(target).or_default() += 1;
        }
    }

    let mut seeds: Vec<&str> = ids
        .iter()
        .copied()
        .filter(|id| indegree.get(id).copied().unwrap_or(0) == 0)
        .collect();
    if seeds.is_empty() {
        seeds.push(ids[0]);
    }

    let mut visited: HashSet<&str> = seeds.iter().copied().collect();
    let mut layers: LayerSet = vec![seeds.iter().map(|id| id.to_string()).collect()];
    let mut frontier = seeds;
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for id in &frontier {
            let Some(targets) = outgoing.get(id) else {
                continue;
            };
            for target in targets {
                if visited.insert(*target) {
                    next.push(*target);
                }
            }
        }
        if !next.is_empty() {
            layers.push(next.iter().map(|id| id.to_string()).collect());
        }
        frontier = next;
    }

    let unreached: Vec<String> = ids
        .iter()
        .filter(|id| !visited.contains(*id))
        .map(|id| id.to_string())
        .collect();
    if !unreached.is_empty() {
        layers.push(unreached);
    }
    layers
}

/// Checks that `layers` lists every valid node exactly once and nothing else.
pub fn validate_layers(layers: &LayerSet, nodes: &[CanvasNode]) -> Result<(), LayerError> {
    let ids = valid_node_ids(nodes);
    let known: HashSet<&str> = ids.iter().copied().collect();
    let mut placed: HashMap<&str, usize> = HashMap::new();

    for (layer_idx, layer) in layers.iter().enumerate() {
        for id in layer {
            if !known.contains(id.as_str()) {
                return Err(LayerError::UnknownNode {
                    node_id: id.clone(),
                    layer: layer_idx,
                });
            }
            if let Some(first) = placed.insert(id.as_str(), layer_idx) {
                return Err(LayerError::DuplicateNode {
                    node_id: id.clone(),
                    first,
                    second: layer_idx,
                });
            }
        }
    }

    match ids.iter().find(|id| !placed.contains_key(*id)) {
        Some(missing) => Err(LayerError::MissingNode(missing.to_string())),
        None => Ok(()),
    }
}
