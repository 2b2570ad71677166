use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::ir::{CanvasNode, Edge, NodeKind};

use super::layers::valid_node_ids;
use super::types::{FlatTree, VIRTUAL_ROOT_ID};

static PORT_DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)").unwrap());

/// First number embedded in a port id, `0` when there is none.
pub fn parse_port_index(port: &str) -> usize {
    PORT_DIGITS_RE
        .captures(port)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Compares ids the way a person reads them: `n2 < n10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a_chars = a.chars().peekable();
    let mut b_chars = b.chars().peekable();
    loop {
        match (a_chars.peek().copied(), b_chars.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ac), Some(bc)) if ac.is_ascii_digit() && bc.is_ascii_digit() => {
                let mut a_num = String::new();
                while let Some(c) = a_chars.peek().copied().filter(char::is_ascii_digit) {
                    a_num.push(c);
                    a_chars.next();
                }
                let mut b_num = String::new();
                while let Some(c) = b_chars.peek().copied().filter(char::is_ascii_digit) {
                    b_num.push(c);
                    b_chars.next();
                }
                let a_trim = a_num.trim_start_matches('0');
                let b_trim = b_num.trim_start_matches('0');
                let ordering = a_trim
                    .len()
                    .cmp(&b_trim.len())
                    .then_with(|| a_trim.cmp(b_trim));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(ac), Some(bc)) => {
                if ac != bc {
                    return ac.cmp(&bc);
                }
                a_chars.next();
                b_chars.next();
            }
        }
    }
}

/// Position of `port` among the node's declared out-ports, or the number in its id.
pub(crate) fn port_order(node: Option<&CanvasNode>, port: &str) -> usize {
    if let Some(node) = node
        && let Some(index) = node
            .effective_branches()
            .iter()
            .position(|branch| branch.as_str() == port)
    {
        return index;
    }
    parse_port_index(port)
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OutLink {
    pub target: String,
    pub order: usize,
}

/// Adjacency built from well-formed connection edges only.
#[derive(Debug, Clone, Default)]
pub(crate) struct Adjacency {
    /// Per source: distinct targets sorted by port order, first occurrence kept.
    pub children_by_port: HashMap<String, Vec<OutLink>>,
    /// Per target: distinct parents in edge order, never the target itself.
    pub parents: HashMap<String, Vec<String>>,
}

impl Adjacency {
    pub fn build(nodes: &[CanvasNode], edges: &[Edge]) -> Self {
        let ids = valid_node_ids(nodes);
        let known: HashSet<&str> = ids.iter().copied().collect();
        let by_id: HashMap<&str, &CanvasNode> = nodes
            .iter()
            .filter(|node| known.contains(node.id.as_str()))
            .map(|node| (node.id.as_str(), node))
            .collect();

        let mut raw: HashMap<String, Vec<OutLink>> = HashMap::new();
        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        for edge in edges {
            if edge.validate().is_err() {
                continue;
            }
            let Some(target) = edge.target() else {
                continue;
            };
            if !known.contains(edge.source.as_str()) || !known.contains(target) {
                continue;
            }
            let order = port_order(by_id.get(edge.source.as_str()).copied(), &edge.source_port);
            raw.entry(edge.source.clone()).or_default().push(OutLink {
                target: target.to_string(),
                order,
            });
            // a self-loop never makes a node its own parent
            if edge.source == target {
                continue;
            }
            let list = parents.entry(target.to_string()).or_default();
            if !list.iter().any(|p| p == &edge.source) {
                list.push(edge.source.clone());
            }
        }

        let mut children_by_port = HashMap::new();
        for (source, mut links) in raw {
            // stable: equal port orders keep edge order
            links.sort_by_key(|link| link.order);
            let mut seen: HashSet<String> = HashSet::new();
            links.retain(|link| seen.insert(link.target.clone()));
            children_by_port.insert(source, links);
        }

        Self {
            children_by_port,
            parents,
        }
    }

    pub fn children(&self, id: &str) -> &[OutLink] {
        self.children_by_port
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn indegree(&self, id: &str) -> usize {
        self.parents
            .get(id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn order_at_parent(&self, parent: &str, child: &str) -> usize {
        self.children(parent)
            .iter()
            .find(|link| link.target == child)
            .map(|link| link.order)
            .unwrap_or(usize::MAX)
    }
}

/// One main parent per node with incoming edges: lowest port order at the
/// parent, ties broken by natural id order.
pub(crate) fn resolve_main_parents(adjacency: &Adjacency, ids: &[&str]) -> HashMap<String, String> {
    let mut main = HashMap::new();
    for id in ids {
        let Some(parents) = adjacency.parents.get(*id) else {
            continue;
        };
        let best = parents
            .iter()
            .map(|pid| (adjacency.order_at_parent(pid, id), pid))
            .min_by(|(a_order, a_id), (b_order, b_id)| {
                a_order.cmp(b_order).then_with(|| natural_cmp(a_id, b_id))
            });
        if let Some((_, pid)) = best {
            main.insert(id.to_string(), pid.clone());
        }
    }
    main
}

/// Start nodes and nodes without incoming edges, in input order.
pub(crate) fn select_roots(nodes: &[CanvasNode], adjacency: &Adjacency, ids: &[&str]) -> Vec<String> {
    let starts: HashSet<&str> = nodes
        .iter()
        .filter(|node| node.kind == NodeKind::Start)
        .map(|node| node.id.as_str())
        .collect();
    let roots: Vec<String> = ids
        .iter()
        .filter(|id| starts.contains(**id) || adjacency.indegree(id) == 0)
        .map(|id| id.to_string())
        .collect();
    if roots.is_empty() {
        return ids.first().map(|id| vec![id.to_string()]).unwrap_or_default();
    }
    roots
}

/// Spanning forest over the flow graph, one main parent per node.
#[derive(Debug, Clone, Default)]
pub struct LayoutTree {
    pub roots: Vec<String>,
    pub children: BTreeMap<String, Vec<String>>,
    /// Children of every node in port order, including non-tree edges.
    pub heads: BTreeMap<String, Vec<String>>,
    pub main_parents: BTreeMap<String, String>,
}

impl LayoutTree {
    pub fn build(nodes: &[CanvasNode], edges: &[Edge]) -> Self {
        let ids = valid_node_ids(nodes);
        if ids.is_empty() {
            return Self::default();
        }
        let adjacency = Adjacency::build(nodes, edges);
        let main_parents = resolve_main_parents(&adjacency, &ids);
        let mut roots = select_roots(nodes, &adjacency, &ids);

        let mut tree_children: HashMap<&str, Vec<String>> = HashMap::new();
        for id in &ids {
            for link in adjacency.children(id) {
                if main_parents.get(&link.target).map(String::as_str) == Some(*id) {
                    tree_children
                        .entry(*id)
                        .or_default()
                        .push(link.target.clone());
                }
            }
        }

        // Walk from the roots; a node is attached the first time it is reached,
        // so main-parent cycles cannot loop.
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut pending_roots: Vec<String> = roots.clone();
        let mut next_orphan = 0usize;
        loop {
            for root in std::mem::take(&mut pending_roots) {
                if !visited.insert(root.clone()) {
                    continue;
                }
                let mut stack = vec![root];
                while let Some(current) = stack.pop() {
                    let mut attached = Vec::new();
                    for child in tree_children.get(current.as_str()).into_iter().flatten() {
                        if visited.insert(child.clone()) {
                            attached.push(child.clone());
                        }
                    }
                    for child in attached.iter().rev() {
                        stack.push(child.clone());
                    }
                    children.insert(current, attached);
                }
            }
            // Nodes only reachable through a main-parent cycle start a new tree.
            while next_orphan < ids.len() && visited.contains(ids[next_orphan]) {
                next_orphan += 1;
            }
            if next_orphan >= ids.len() {
                break;
            }
            let orphan = ids[next_orphan].to_string();
            roots.push(orphan.clone());
            pending_roots.push(orphan);
        }

        let heads = ids
            .iter()
            .map(|id| {
                let list = adjacency
                    .children(id)
                    .iter()
                    .map(|link| link.target.clone())
                    .collect();
                (id.to_string(), list)
            })
            .collect();

        Self {
            roots,
            children,
            heads,
            main_parents: main_parents.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn has_virtual_root(&self) -> bool {
        self.roots.len() > 1
    }

    pub fn children_of(&self, id: &str) -> &[String] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Depth of every node below its tree root (virtual root excluded).
    pub fn depths(&self) -> BTreeMap<String, usize> {
        let mut depths = BTreeMap::new();
        for root in &self.roots {
            let mut stack = vec![(root.as_str(), 0usize)];
            while let Some((id, depth)) = stack.pop() {
                depths.insert(id.to_string(), depth);
                for child in self.children_of(id) {
                    stack.push((child.as_str(), depth + 1));
                }
            }
        }
        depths
    }

    /// Flattens the forest under one root, adding the virtual root when
    /// there is more than one tree.
    pub fn to_tree(&self) -> Option<FlatTree> {
        let (mut tree, mut stack) = match self.roots.as_slice() {
            [] => return None,
            [single] => (FlatTree::new(single.clone()), vec![(FlatTree::ROOT, single.as_str())]),
            many => {
                let mut tree = FlatTree::new(VIRTUAL_ROOT_ID);
                let stack = many
                    .iter()
                    .map(|root| (tree.add_child(FlatTree::ROOT, root.clone()), root.as_str()))
                    .collect();
                (tree, stack)
            }
        };
        while let Some((index, id)) = stack.pop() {
            for child in self.children_of(id) {
                stack.push((tree.add_child(index, child.clone()), child.as_str()));
            }
        }
        Some(tree)
    }
}
