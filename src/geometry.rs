//! Position calculator: anchor points derived from node geometry, and the
//! drift check that keeps line endpoints glued to their nodes.

use serde::Serialize;
use std::collections::HashMap;

use crate::config::PreviewConfig;
use crate::error::PositionError;
use crate::ir::{CanvasNode, FlowSnapshot, Point, Size};
use crate::preview::{FlowLine, LineState};

pub const DEFAULT_NODE_SIZE: Size = Size::new(120.0, 60.0);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeFrame {
    pub origin: Point,
    pub size: Size,
}

impl NodeFrame {
    pub fn center_x(&self) -> f32 {
        self.origin.x + self.size.width / 2.0
    }

    /// Bottom-center.
    pub fn out_port(&self) -> Point {
        Point::new(self.center_x(), self.origin.y + self.size.height)
    }

    /// Top-center.
    pub fn in_port(&self) -> Point {
        Point::new(self.center_x(), self.origin.y)
    }
}

pub fn node_frame(node: &CanvasNode) -> Result<NodeFrame, PositionError> {
    let origin = node
        .position
        .ok_or_else(|| PositionError::MissingPosition(node.id.clone()))?;
    let size = node.size.unwrap_or(DEFAULT_NODE_SIZE);
    if !origin.is_finite() || !size.width.is_finite() || !size.height.is_finite() {
        return Err(PositionError::NonFinite(node.id.clone()));
    }
    if size.width <= 0.0 || size.height <= 0.0 {
        return Err(PositionError::DegenerateSize(node.id.clone()));
    }
    Ok(NodeFrame { origin, size })
}

/// End point of the floating preview for branch `index` of `total`.
///
/// Every branch starts at the same out-port; the end points fan out
/// horizontally below the node.
pub fn preview_anchor(frame: &NodeFrame, index: usize, total: usize, config: &PreviewConfig) -> Point {
    let base_y = frame.origin.y + frame.size.height + config.preview_length;
    if total <= 1 {
        return Point::new(frame.center_x(), base_y);
    }
    let spacing = (frame.size.width * config.branch_spacing_ratio)
        .max(config.branch_spacing_min)
        .min(config.branch_spacing_max);
    let total_width = (total as f32 - 1.0) * spacing;
    Point::new(
        frame.center_x() - total_width / 2.0 + index as f32 * spacing,
        base_y,
    )
}

/// True when `current` is further than `threshold` from `expected`.
pub fn has_drifted(current: &Point, expected: &Point, threshold: f32) -> bool {
    current.distance(expected) > threshold
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    Unchanged,
    Corrected { drift: f32 },
}

type NodeLookup<'a> = HashMap<&'a str, &'a CanvasNode>;

fn expected_points(
    line: &FlowLine,
    nodes: &NodeLookup<'_>,
    config: &PreviewConfig,
) -> Result<(Point, Point), PositionError> {
    let source = nodes
        .get(line.key.node_id.as_str())
        .copied()
        .ok_or_else(|| PositionError::NodeNotFound(line.key.node_id.clone()))?;
    let frame = node_frame(source)?;
    let end = match &line.state {
        LineState::Preview { .. } => preview_anchor(
            &frame,
            line.branch_index,
            source.effective_branch_count(),
            config,
        ),
        LineState::Connection { target, .. } => {
            let target_node = nodes
                .get(target.as_str())
                .copied()
                .ok_or_else(|| PositionError::NodeNotFound(target.clone()))?;
            node_frame(target_node)?.in_port()
        }
    };
    Ok((frame.out_port(), end))
}

/// Checks one line against its nodes and rewrites the endpoints that drifted
/// past `threshold`. Nothing is written when any input is unusable.
pub fn sync_single_position(
    line: &mut FlowLine,
    snapshot: &FlowSnapshot,
    config: &PreviewConfig,
    threshold: f32,
) -> Result<SyncOutcome, PositionError> {
    sync_line(line, &snapshot.node_lookup(), config, threshold)
}

fn sync_line(
    line: &mut FlowLine,
    nodes: &NodeLookup<'_>,
    config: &PreviewConfig,
    threshold: f32,
) -> Result<SyncOutcome, PositionError> {
    if !line.source_point.is_finite() || !line.end_point().is_finite() {
        return Err(PositionError::NonFinite(line.id.clone()));
    }
    let (expected_source, expected_end) = expected_points(line, nodes, config)?;

    let source_drift = line.source_point.distance(&expected_source);
    let end_drift = line.end_point().distance(&expected_end);
    let mut corrected = 0.0_f32;

    if source_drift > threshold {
        line.source_point = expected_source;
        corrected = corrected.max(source_drift);
    }
    if end_drift > threshold {
        match &mut line.state {
            LineState::Preview { anchor } => *anchor = expected_end,
            LineState::Connection { target_point, .. } => *target_point = expected_end,
        }
        corrected = corrected.max(end_drift);
    }

    if corrected > 0.0 {
        Ok(SyncOutcome::Corrected { drift: corrected })
    } else {
        Ok(SyncOutcome::Unchanged)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    pub line_id: String,
    pub drift: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub line_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSyncReport {
    pub total: usize,
    pub success: usize,
    pub failure: usize,
    pub corrected: Vec<Correction>,
    pub failures: Vec<SyncFailure>,
}

pub fn batch_sync_positions<'a>(
    lines: impl IntoIterator<Item = &'a mut FlowLine>,
    snapshot: &FlowSnapshot,
    config: &PreviewConfig,
    threshold: f32,
) -> BatchSyncReport {
    let mut report = BatchSyncReport::default();
    let nodes = snapshot.node_lookup();
    for line in lines {
        report.total += 1;
        match sync_line(line, &nodes, config, threshold) {
            Ok(outcome) => {
                report.success += 1;
                if let SyncOutcome::Corrected { drift } = outcome {
                    report.corrected.push(Correction {
                        line_id: line.id.clone(),
                        drift,
                    });
                }
            }
            Err(err) => {
                report.failure += 1;
                report.failures.push(SyncFailure {
                    line_id: line.id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
    report
}
