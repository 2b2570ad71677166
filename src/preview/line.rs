use serde::Serialize;

use crate::ir::{BranchKey, Edge, EdgeKind, Point};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum LineState {
    Preview {
        anchor: Point,
    },
    #[serde(rename_all = "camelCase")]
    Connection {
        target: String,
        target_port: String,
        target_point: Point,
    },
}

/// One line owned by a branch: a floating preview or a bound connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLine {
    pub id: String,
    pub key: BranchKey,
    pub branch_index: usize,
    pub source_point: Point,
    pub state: LineState,
    pub created_at: u64,
}

impl FlowLine {
    pub fn is_preview(&self) -> bool {
        matches!(self.state, LineState::Preview { .. })
    }

    pub fn target(&self) -> Option<&str> {
        match &self.state {
            LineState::Connection { target, .. } => Some(target.as_str()),
            LineState::Preview { .. } => None,
        }
    }

    /// The end point currently drawn: floating anchor or target in-port.
    pub fn end_point(&self) -> Point {
        match &self.state {
            LineState::Preview { anchor } => *anchor,
            LineState::Connection { target_point, .. } => *target_point,
        }
    }

    pub fn to_edge(&self) -> Edge {
        let kind = match &self.state {
            LineState::Preview { anchor } => EdgeKind::Preview { anchor: *anchor },
            LineState::Connection {
                target,
                target_port,
                ..
            } => EdgeKind::Connection {
                target: target.clone(),
                target_port: target_port.clone(),
            },
        };
        Edge {
            id: self.id.clone(),
            source: self.key.node_id.clone(),
            source_port: self.key.branch_id.to_string(),
            kind,
        }
    }
}

/// A removed line kept around so it can be restored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedLineRecord {
    pub line: FlowLine,
    /// Set when the line lived inside a branch group.
    pub group_id: Option<String>,
    pub deleted_at: u64,
}

/// All lines of a branch node, kept in branch order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchGroup {
    pub group_id: String,
    pub source: String,
    pub lines: Vec<FlowLine>,
    pub created_at: u64,
}

impl BranchGroup {
    pub(crate) fn insert_sorted(&mut self, line: FlowLine) {
        let at = self
            .lines
            .iter()
            .position(|existing| existing.branch_index > line.branch_index)
            .unwrap_or(self.lines.len());
        self.lines.insert(at, line);
    }
}
