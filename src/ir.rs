use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Start,
    Terminal,
    Split,
    #[default]
    Normal,
    /// Transient marker rendered while dragging a line; never owns lines.
    DragHint,
}

impl NodeKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "start" => Some(Self::Start),
            "end" | "finish" | "terminal" => Some(Self::Terminal),
            "split" | "audience-split" | "event-split" | "ab-test" => Some(Self::Split),
            "normal" => Some(Self::Normal),
            "drag-hint" => Some(Self::DragHint),
            _ => None,
        }
    }
}

/// Identity of one logical output of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchId(pub String);

impl BranchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn implicit(index: usize) -> Self {
        Self(format!("out-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite key used for every duplicate check and lookup of lines.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchKey {
    pub node_id: String,
    pub branch_id: BranchId,
}

impl BranchKey {
    pub fn new(node_id: impl Into<String>, branch_id: BranchId) -> Self {
        Self {
            node_id: node_id.into(),
            branch_id,
        }
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node_id, self.branch_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub id: BranchId,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasNode {
    pub id: String,
    #[serde(default)]
    pub position: Option<Point>,
    #[serde(default)]
    pub size: Option<Size>,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub configured: bool,
    #[serde(default = "default_branch_count")]
    pub branch_count: usize,
    #[serde(default)]
    pub branches: Vec<BranchSpec>,
}

fn default_branch_count() -> usize {
    1
}

impl CanvasNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            position: None,
            size: None,
            kind,
            configured: false,
            branch_count: 1,
            branches: Vec::new(),
        }
    }

    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Point::new(x, y));
        self
    }

    pub fn sized(mut self, width: f32, height: f32) -> Self {
        self.size = Some(Size::new(width, height));
        self
    }

    pub fn configured(mut self) -> Self {
        self.configured = true;
        self
    }

    pub fn with_branch_count(mut self, count: usize) -> Self {
        self.branch_count = count;
        self
    }

    pub fn with_branches<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches = ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                BranchSpec {
                    label: id.clone(),
                    id: BranchId(id),
                }
            })
            .collect();
        self
    }

    /// Branches in port order: explicit configuration first, otherwise
    /// `max(branch_count, 1)` implicit `out-N` branches.
    pub fn effective_branches(&self) -> Vec<BranchId> {
        if !self.branches.is_empty() {
            return self.branches.iter().map(|b| b.id.clone()).collect();
        }
        (0..self.branch_count.max(1)).map(BranchId::implicit).collect()
    }

    pub fn effective_branch_count(&self) -> usize {
        if self.branches.is_empty() {
            self.branch_count.max(1)
        } else {
            self.branches.len()
        }
    }

    pub fn branch_index(&self, branch: &BranchId) -> Option<usize> {
        self.effective_branches().iter().position(|b| b == branch)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyNodeId);
        }
        let position_ok = self.position.is_none_or(|p| p.is_finite());
        let size_ok = self
            .size
            .is_none_or(|s| s.width.is_finite() && s.height.is_finite());
        if !position_ok || !size_ok {
            return Err(ValidationError::NonFiniteGeometry(self.id.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EdgeKind {
    Preview {
        anchor: Point,
    },
    #[serde(rename_all = "camelCase")]
    Connection {
        target: String,
        #[serde(default)]
        target_port: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub source_port: String,
    #[serde(flatten)]
    pub kind: EdgeKind,
}

impl Edge {
    pub fn connection(
        id: impl Into<String>,
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_port: source_port.into(),
            kind: EdgeKind::Connection {
                target: target.into(),
                target_port: "in".to_string(),
            },
        }
    }

    pub fn preview(
        id: impl Into<String>,
        source: impl Into<String>,
        source_port: impl Into<String>,
        anchor: Point,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_port: source_port.into(),
            kind: EdgeKind::Preview { anchor },
        }
    }

    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            EdgeKind::Connection { target, .. } => Some(target.as_str()),
            EdgeKind::Preview { .. } => None,
        }
    }

    pub fn is_preview(&self) -> bool {
        matches!(self.kind, EdgeKind::Preview { .. })
    }

    /// Checks shape only; endpoint existence is checked against a snapshot.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyEdgeId);
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::DanglingEdge(self.id.clone()));
        }
        match &self.kind {
            EdgeKind::Connection { target, .. } if target.trim().is_empty() => {
                Err(ValidationError::DanglingEdge(self.id.clone()))
            }
            EdgeKind::Preview { anchor } if !anchor.is_finite() => {
                Err(ValidationError::NonFiniteGeometry(self.id.clone()))
            }
            _ => Ok(()),
        }
    }
}

/// Read snapshot of the caller-owned graph for a single engine call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    #[serde(default)]
    pub nodes: Vec<CanvasNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl FlowSnapshot {
    pub fn new(nodes: Vec<CanvasNode>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Single lookup by id. Callers resolving many ids build
    /// [`node_lookup`](Self::node_lookup) once instead.
    pub fn node(&self, id: &str) -> Option<&CanvasNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Every node by id; the first of a duplicated id wins, as in [`node`](Self::node).
    pub fn node_lookup(&self) -> HashMap<&str, &CanvasNode> {
        let mut lookup = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            lookup.entry(node.id.as_str()).or_insert(node);
        }
        lookup
    }

    pub fn node_index(&self) -> BTreeMap<&str, &CanvasNode> {
        self.nodes
            .iter()
            .filter(|node| node.validate().is_ok())
            .map(|node| (node.id.as_str(), node))
            .collect()
    }

    /// Well-formed connection edges whose endpoints both exist.
    pub fn connections(&self) -> impl Iterator<Item = &Edge> {
        let ids: HashSet<&str> = self.nodes.iter().map(|node| node.id.as_str()).collect();
        self.edges.iter().filter(move |edge| {
            edge.validate().is_ok()
                && edge.target().is_some_and(|target| ids.contains(target))
                && ids.contains(edge.source.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_branches_follow_branch_count() {
        let node = CanvasNode::new("S", NodeKind::Split).with_branch_count(3);
        assert_eq!(
            node.effective_branches(),
            vec![
                BranchId::implicit(0),
                BranchId::implicit(1),
                BranchId::implicit(2)
            ]
        );
        assert_eq!(node.effective_branch_count(), 3);
    }

    #[test]
    fn explicit_branches_win_over_count() {
        let node = CanvasNode::new("S", NodeKind::Split)
            .with_branch_count(5)
            .with_branches(["yes", "no"]);
        assert_eq!(node.effective_branch_count(), 2);
        assert_eq!(node.branch_index(&BranchId::new("no")), Some(1));
    }

    #[test]
    fn zero_branch_count_still_has_one_branch() {
        let node = CanvasNode::new("A", NodeKind::Normal).with_branch_count(0);
        assert_eq!(node.effective_branches(), vec![BranchId::implicit(0)]);
    }

    #[test]
    fn edge_json_shape_round_trips_kind_tag() {
        let json = r#"{"id":"e1","source":"A","sourcePort":"out-0","kind":"connection","target":"B","targetPort":"in"}"#;
        let edge: Edge = serde_json::from_str(json).unwrap();
        assert_eq!(edge.target(), Some("B"));
        let preview = r#"{"id":"p1","source":"A","kind":"preview","anchor":{"x":1.0,"y":2.0}}"#;
        let edge: Edge = serde_json::from_str(preview).unwrap();
        assert!(edge.is_preview());
    }

    #[test]
    fn malformed_edges_fail_validation() {
        let edge = Edge::connection("e", "A", "out-0", "");
        assert!(edge.validate().is_err());
        let edge = Edge::connection("", "A", "out-0", "B");
        assert_eq!(edge.validate(), Err(ValidationError::EmptyEdgeId));
    }

    #[test]
    fn connections_skip_unknown_endpoints() {
        let snapshot = FlowSnapshot::new(
            vec![CanvasNode::new("A", NodeKind::Start)],
            vec![Edge::connection("e", "A", "out-0", "ghost")],
        );
        assert_eq!(snapshot.connections().count(), 0);
    }

    #[test]
    fn lookup_keeps_first_duplicate() {
        let snapshot = FlowSnapshot::new(
            vec![
                CanvasNode::new("A", NodeKind::Start),
                CanvasNode::new("A", NodeKind::Terminal),
                CanvasNode::new("B", NodeKind::Normal),
            ],
            Vec::new(),
        );
        let lookup = snapshot.node_lookup();
        assert_eq!(lookup.len(), 2);
        assert_eq!(lookup["A"].kind, NodeKind::Start);
        assert_eq!(snapshot.node("A").map(|n| n.kind), Some(NodeKind::Start));
    }

    #[test]
    fn connections_scale_to_long_chains() {
        let count = 50_000;
        let nodes = (0..count)
            .map(|i| CanvasNode::new(format!("n{i}"), NodeKind::Normal))
            .collect();
        let edges = (1..count)
            .map(|i| Edge::connection(format!("e{i}"), format!("n{}", i - 1), "out-0", format!("n{i}")))
            .collect();
        let snapshot = FlowSnapshot::new(nodes, edges);
        assert_eq!(snapshot.connections().count(), count - 1);
    }
}
