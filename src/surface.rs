//! Boundary to the canvas that owns nodes and edges.

use crate::ir::{CanvasNode, Edge, EdgeKind, FlowSnapshot, Point};

/// Partial update of a floating preview edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviewPatch {
    pub anchor: Option<Point>,
}

/// What the engine needs from a rendering surface. Implementations own the
/// graph; the engine reads it through [`snapshot`](Self::snapshot) at the
/// start of every call and writes back positions and line edges.
pub trait CanvasSurface {
    fn nodes(&self) -> Vec<CanvasNode>;
    fn edges(&self) -> Vec<Edge>;
    fn node_by_id(&self, id: &str) -> Option<CanvasNode>;

    /// Returns false when the node does not exist.
    fn set_node_position(&mut self, id: &str, position: Point) -> bool;
    fn add_edge(&mut self, edge: Edge) -> Edge;
    fn remove_edge(&mut self, id: &str) -> Option<Edge>;
    fn add_preview_edge(&mut self, edge: Edge) -> Edge;
    fn remove_preview_edge(&mut self, id: &str) -> Option<Edge>;
    fn update_preview_edge(&mut self, id: &str, patch: PreviewPatch) -> bool;

    fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot::new(self.nodes(), self.edges())
    }
}

/// In-memory surface used by the CLI, the WASM wrapper and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryCanvas {
    nodes: Vec<CanvasNode>,
    edges: Vec<Edge>,
}

impl MemoryCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: CanvasNode) {
        match self.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
    }

    /// Removes the node and every connection touching it. Preview edges are
    /// left for the line manager to retire.
    pub fn remove_node(&mut self, id: &str) -> Option<CanvasNode> {
        let index = self.nodes.iter().position(|n| n.id == id)?;
        self.edges.retain(|edge| {
            edge.is_preview() || (edge.source != id && edge.target() != Some(id))
        });
        Some(self.nodes.remove(index))
    }

    pub fn connection_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|edge| !edge.is_preview())
    }

    pub fn preview_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|edge| edge.is_preview())
    }

    fn upsert(&mut self, edge: Edge) -> Edge {
        match self.edges.iter_mut().find(|e| e.id == edge.id) {
            Some(existing) => *existing = edge.clone(),
            None => self.edges.push(edge.clone()),
        }
        edge
    }

    fn remove_where(&mut self, id: &str, preview: bool) -> Option<Edge> {
        let index = self
            .edges
            .iter()
            .position(|e| e.id == id && e.is_preview() == preview)?;
        Some(self.edges.remove(index))
    }
}

impl From<FlowSnapshot> for MemoryCanvas {
    fn from(snapshot: FlowSnapshot) -> Self {
        Self {
            nodes: snapshot.nodes,
            edges: snapshot.edges,
        }
    }
}

impl CanvasSurface for MemoryCanvas {
    fn nodes(&self) -> Vec<CanvasNode> {
        self.nodes.clone()
    }

    fn edges(&self) -> Vec<Edge> {
        self.edges.clone()
    }

    fn node_by_id(&self, id: &str) -> Option<CanvasNode> {
        self.nodes.iter().find(|n| n.id == id).cloned()
    }

    fn set_node_position(&mut self, id: &str, position: Point) -> bool {
        match self.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.position = Some(position);
                true
            }
            None => false,
        }
    }

    fn add_edge(&mut self, edge: Edge) -> Edge {
        self.upsert(edge)
    }

    fn remove_edge(&mut self, id: &str) -> Option<Edge> {
        self.remove_where(id, false)
    }

    fn add_preview_edge(&mut self, edge: Edge) -> Edge {
        self.upsert(edge)
    }

    fn remove_preview_edge(&mut self, id: &str) -> Option<Edge> {
        self.remove_where(id, true)
    }

    fn update_preview_edge(&mut self, id: &str, patch: PreviewPatch) -> bool {
        let Some(edge) = self.edges.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        match (&mut edge.kind, patch.anchor) {
            (EdgeKind::Preview { anchor }, Some(next)) => {
                *anchor = next;
                true
            }
            (EdgeKind::Preview { .. }, None) => true,
            (EdgeKind::Connection { .. }, _) => false,
        }
    }
}
