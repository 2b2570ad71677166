//! Preview-line lifecycle.
//!
//! Every branch of a managed node owns at most one line, which is either a
//! floating preview or a connection bound to a target node. Lines of branch
//! nodes live in a [`BranchGroup`]; lines of single-output nodes are stored
//! directly. Deleted lines are parked as [`DeletedLineRecord`]s and keep
//! their branch reserved until they are restored or cleared.
//!
//! The manager never keeps references into caller data: every operation that
//! needs node geometry takes a [`FlowSnapshot`].

use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use crate::config::PreviewConfig;
use crate::error::LineError;
use crate::events::{EngineEvent, SharedSink, tracing_sink};
use crate::geometry::{self, BatchSyncReport, DEFAULT_NODE_SIZE, NodeFrame};
use crate::ir::{BranchId, BranchKey, CanvasNode, Edge, EdgeKind, FlowSnapshot, Point};
use crate::optimizer::scheduler::{Clock, SharedClock, SystemClock};

use super::ids::{LinePrefix, line_id};
use super::line::{BranchGroup, DeletedLineRecord, FlowLine, LineState};
use super::policy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOptions {
    /// Use the forced creation policy so unconfigured nodes get stubs too.
    #[serde(default)]
    pub force_update_all: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub total_preview_lines: usize,
    pub refreshed_nodes: usize,
    pub new_preview_lines_created: usize,
    pub adopted_connections: usize,
    pub reverted_connections: usize,
    pub removed_lines: usize,
    /// Caller-side preview edges the manager does not own.
    pub stale_preview_edges: Vec<String>,
    /// Tracked connections with a live target but no edge on the canvas.
    pub detached_connections: Vec<String>,
    /// Caller connections left alone because their branch is already connected.
    pub ignored_connections: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStats {
    pub main_lines: usize,
    pub branch_lines: usize,
    pub total_lines: usize,
    pub branches: usize,
    pub deleted_lines: usize,
    pub preview_lines: usize,
    pub connection_lines: usize,
    pub is_creating: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNodeReport {
    /// Ids of the previews that replaced connections into the node.
    pub reverted: Vec<String>,
    /// Ids of the node's own lines, removed without a record.
    pub removed: Vec<String>,
}

/// A node whose branches are not covered exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCountMismatch {
    pub node_id: String,
    pub expected: usize,
    pub live: usize,
    pub parked: usize,
}

/// Store mutations, drained by whoever mirrors lines onto a canvas.
#[derive(Debug, Clone, PartialEq)]
pub enum LineChange {
    Added(FlowLine),
    Updated(FlowLine),
    Removed { line_id: String, was_preview: bool },
}

pub struct PreviewLineManager {
    config: PreviewConfig,
    main_lines: BTreeMap<BranchKey, FlowLine>,
    groups: BTreeMap<String, BranchGroup>,
    deleted: Vec<DeletedLineRecord>,
    changes: Vec<LineChange>,
    sink: SharedSink,
    clock: SharedClock,
}

impl PreviewLineManager {
    pub fn new(config: PreviewConfig) -> Self {
        Self {
            config,
            main_lines: BTreeMap::new(),
            groups: BTreeMap::new(),
            deleted: Vec::new(),
            changes: Vec::new(),
            sink: tracing_sink(),
            clock: Rc::new(SystemClock::new()),
        }
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    // ---- queries ----

    pub fn lines(&self) -> impl Iterator<Item = &FlowLine> {
        self.main_lines
            .values()
            .chain(self.groups.values().flat_map(|group| group.lines.iter()))
    }

    pub fn line(&self, id: &str) -> Option<&FlowLine> {
        self.lines().find(|line| line.id == id)
    }

    pub fn line_for(&self, key: &BranchKey) -> Option<&FlowLine> {
        if let Some(line) = self.main_lines.get(key) {
            return Some(line);
        }
        self.groups
            .get(&key.node_id)?
            .lines
            .iter()
            .find(|line| &line.key == key)
    }

    pub fn lines_for_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a FlowLine> {
        // keys order by node id first, so a node's main lines are contiguous
        let first = BranchKey::new(node_id, BranchId::new(""));
        self.main_lines
            .range(first..)
            .take_while(move |(key, _)| key.node_id == node_id)
            .map(|(_, line)| line)
            .chain(
                self.groups
                    .get(node_id)
                    .into_iter()
                    .flat_map(|group| group.lines.iter()),
            )
    }

    pub fn group(&self, node_id: &str) -> Option<&BranchGroup> {
        self.groups.get(node_id)
    }

    pub fn deleted_records(&self) -> &[DeletedLineRecord] {
        &self.deleted
    }

    pub fn preview_count(&self, node_id: &str) -> usize {
        self.lines_for_node(node_id).filter(|l| l.is_preview()).count()
    }

    pub fn connection_count(&self, node_id: &str) -> usize {
        self.lines_for_node(node_id).filter(|l| !l.is_preview()).count()
    }

    pub fn stats(&self) -> PreviewStats {
        let main_lines = self.main_lines.len();
        let branch_lines = self.groups.values().map(|g| g.lines.len()).sum();
        let preview_lines = self.lines().filter(|l| l.is_preview()).count();
        let total_lines = main_lines + branch_lines;
        PreviewStats {
            main_lines,
            branch_lines,
            total_lines,
            branches: self.groups.len(),
            deleted_lines: self.deleted.len(),
            preview_lines,
            connection_lines: total_lines - preview_lines,
            is_creating: total_lines > 0,
        }
    }

    /// Nodes holding lines or parked records whose branches are not each
    /// covered by exactly one of them.
    pub fn invariant_violations(&self, snapshot: &FlowSnapshot) -> Vec<BranchCountMismatch> {
        let mut live: BTreeMap<&str, HashSet<&BranchId>> = BTreeMap::new();
        let mut live_count: BTreeMap<&str, usize> = BTreeMap::new();
        for line in self.lines() {
            live.entry(line.key.node_id.as_str())
                .or_default()
                .insert(&line.key.branch_id);
            *live_count.entry(line.key.node_id.as_str()).or_default() += 1;
        }
        let mut parked: BTreeMap<&str, Vec<&BranchId>> = BTreeMap::new();
        for record in &self.deleted {
            parked
                .entry(record.line.key.node_id.as_str())
                .or_default()
                .push(&record.line.key.branch_id);
        }

        let managed: HashSet<&str> = live.keys().chain(parked.keys()).copied().collect();
        let lookup = snapshot.node_lookup();
        let mut violations = Vec::new();
        for node_id in managed {
            let expected = lookup
                .get(node_id)
                .map(|node| node.effective_branch_count())
                .unwrap_or(0);
            let live_n = live_count.get(node_id).copied().unwrap_or(0);
            let parked_ids = parked.get(node_id).map(Vec::as_slice).unwrap_or(&[]);
            let overlapping = parked_ids
                .iter()
                .any(|b| live.get(node_id).is_some_and(|set| set.contains(b)));
            if live_n + parked_ids.len() != expected || overlapping {
                violations.push(BranchCountMismatch {
                    node_id: node_id.to_string(),
                    expected,
                    live: live_n,
                    parked: parked_ids.len(),
                });
            }
        }
        violations.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        violations
    }

    pub fn drain_changes(&mut self) -> Vec<LineChange> {
        std::mem::take(&mut self.changes)
    }

    // ---- operations ----

    /// Creates a floating preview on one branch of `node_id`.
    pub fn create(
        &mut self,
        snapshot: &FlowSnapshot,
        node_id: &str,
        branch: &BranchId,
    ) -> Result<FlowLine, LineError> {
        let node = snapshot
            .node(node_id)
            .filter(|node| node.validate().is_ok())
            .filter(|node| policy::should_create_preview_line_forced(node))
            .ok_or_else(|| LineError::InvalidSource(node_id.to_string()))?;
        let index = node
            .branch_index(branch)
            .ok_or_else(|| LineError::InvalidBranch {
                node_id: node_id.to_string(),
                branch_id: branch.to_string(),
            })?;
        let key = BranchKey::new(node_id, branch.clone());
        if self.line_for(&key).is_some() {
            return Err(LineError::BranchOccupied(key.to_string()));
        }
        // an explicit create supersedes a parked line on the same branch
        self.deleted.retain(|record| record.line.key != key);
        Ok(self.create_preview(node, key, index))
    }

    /// Creates previews on every free branch of `node_id`.
    pub fn create_for_node(
        &mut self,
        snapshot: &FlowSnapshot,
        node_id: &str,
    ) -> Result<Vec<FlowLine>, LineError> {
        let node = snapshot
            .node(node_id)
            .filter(|node| node.validate().is_ok())
            .filter(|node| policy::should_create_preview_line_forced(node))
            .ok_or_else(|| LineError::InvalidSource(node_id.to_string()))?;
        let mut created = Vec::new();
        for (index, branch) in policy::node_branches(node).into_iter().enumerate() {
            let key = BranchKey::new(node_id, branch);
            if self.line_for(&key).is_some() || self.is_parked(&key) {
                continue;
            }
            created.push(self.create_preview(node, key, index));
        }
        Ok(created)
    }

    pub fn convert_preview_to_connection(
        &mut self,
        snapshot: &FlowSnapshot,
        preview_id: &str,
        target_id: &str,
    ) -> Result<FlowLine, LineError> {
        let line = self
            .line(preview_id)
            .cloned()
            .ok_or_else(|| LineError::LineNotFound(preview_id.to_string()))?;
        if !line.is_preview() {
            return Err(LineError::NotAPreview(preview_id.to_string()));
        }
        if target_id.trim().is_empty() {
            return Err(LineError::EmptyTarget);
        }
        if target_id == line.key.node_id {
            return Err(LineError::SelfLoop {
                line_id: preview_id.to_string(),
                node_id: target_id.to_string(),
            });
        }
        let target = snapshot
            .node(target_id)
            .filter(|node| node.validate().is_ok())
            .ok_or_else(|| LineError::UnknownTarget(target_id.to_string()))?;

        let now = self.clock.now_ms();
        let connection = FlowLine {
            id: line_id(LinePrefix::Connection, &line.key, now),
            key: line.key.clone(),
            branch_index: line.branch_index,
            source_point: line.source_point,
            state: LineState::Connection {
                target: target_id.to_string(),
                target_port: "in".to_string(),
                target_point: frame_or_default(target).in_port(),
            },
            created_at: now,
        };
        self.swap_line(&line, connection.clone());
        Ok(connection)
    }

    pub fn convert_connection_to_preview(
        &mut self,
        snapshot: &FlowSnapshot,
        connection_id: &str,
    ) -> Result<FlowLine, LineError> {
        let line = self
            .line(connection_id)
            .cloned()
            .ok_or_else(|| LineError::LineNotFound(connection_id.to_string()))?;
        if line.is_preview() {
            return Err(LineError::NotAConnection(connection_id.to_string()));
        }
        Ok(self.revert_to_preview(snapshot.node(&line.key.node_id), &line))
    }

    /// Removes one line and parks it for [`restore`](Self::restore).
    pub fn delete_single(&mut self, line_id: &str) -> Result<DeletedLineRecord, LineError> {
        let key = self
            .line(line_id)
            .map(|line| line.key.clone())
            .ok_or_else(|| LineError::LineNotFound(line_id.to_string()))?;
        let Some((line, group_id)) = self.take_line(&key) else {
            return Err(LineError::LineNotFound(line_id.to_string()));
        };
        self.changes.push(LineChange::Removed {
            line_id: line.id.clone(),
            was_preview: line.is_preview(),
        });
        self.sink.emit(&EngineEvent::LineDeleted {
            line_id: line.id.clone(),
            key: key.clone(),
            recorded: true,
        });
        let record = DeletedLineRecord {
            line,
            group_id,
            deleted_at: self.clock.now_ms(),
        };
        self.deleted.push(record.clone());
        Ok(record)
    }

    /// Re-inserts a parked line, recreating its branch group if needed.
    /// A connection whose target is gone comes back as a preview.
    pub fn restore(&mut self, snapshot: &FlowSnapshot, line_id: &str) -> Result<FlowLine, LineError> {
        let position = self
            .deleted
            .iter()
            .position(|record| record.line.id == line_id)
            .ok_or_else(|| LineError::NothingToRestore(line_id.to_string()))?;
        let key = self.deleted[position].line.key.clone();
        if self.line_for(&key).is_some() {
            return Err(LineError::BranchOccupied(key.to_string()));
        }
        let record = self.deleted.remove(position);
        let mut line = record.line;

        let source = snapshot.node(&key.node_id);
        let dangling = line
            .target()
            .is_some_and(|target| snapshot.node(target).is_none());
        if dangling {
            let (source_point, anchor) = self.preview_points_or_offset(source, &line);
            line.source_point = source_point;
            line.state = LineState::Preview { anchor };
        }

        let as_branch = record.group_id.is_some() || source.is_some_and(policy::is_branch_node);
        self.insert_line(line.clone(), as_branch);
        self.changes.push(LineChange::Added(line.clone()));
        self.sink.emit(&EngineEvent::LineRestored {
            line_id: line.id.clone(),
            key,
        });
        Ok(line)
    }

    /// Reconciles the store with `snapshot`.
    ///
    /// Lines of vanished nodes or branches are dropped, connections into
    /// vanished targets revert to previews, caller connections are adopted
    /// into their branch, and every free branch of an eligible node gets a
    /// preview. Lines are matched by `(node, branch)` only, so siblings on
    /// different branches never displace each other.
    pub fn refresh_all(&mut self, snapshot: &FlowSnapshot, options: RefreshOptions) -> RefreshReport {
        let mut report = RefreshReport::default();
        let index = snapshot.node_index();

        let stale: Vec<BranchKey> = self
            .lines()
            .filter(|line| {
                index
                    .get(line.key.node_id.as_str())
                    .is_none_or(|node| node.branch_index(&line.key.branch_id).is_none())
            })
            .map(|line| line.key.clone())
            .collect();
        for key in stale {
            if let Some((line, _)) = self.take_line(&key) {
                report.removed_lines += 1;
                self.changes.push(LineChange::Removed {
                    line_id: line.id.clone(),
                    was_preview: line.is_preview(),
                });
                self.sink.emit(&EngineEvent::LineDeleted {
                    line_id: line.id,
                    key,
                    recorded: false,
                });
            }
        }
        self.deleted.retain(|record| {
            index
                .get(record.line.key.node_id.as_str())
                .is_some_and(|node| node.branch_index(&record.line.key.branch_id).is_some())
        });

        let orphaned: Vec<FlowLine> = self
            .lines()
            .filter(|line| line.target().is_some_and(|t| !index.contains_key(t)))
            .cloned()
            .collect();
        for line in orphaned {
            let source = index.get(line.key.node_id.as_str()).copied();
            self.revert_to_preview(source, &line);
            report.reverted_connections += 1;
        }

        let mut caller_connections: HashMap<BranchKey, &Edge> = HashMap::new();
        let mut caller_previews: Vec<(BranchKey, &Edge)> = Vec::new();
        for edge in &snapshot.edges {
            if let Err(err) = edge.validate() {
                self.sink.emit(&EngineEvent::ValidationSkipped {
                    item: edge.id.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
            let branch = BranchId::new(edge.source_port.clone());
            let has_branch = index
                .get(edge.source.as_str())
                .is_some_and(|source| source.branch_index(&branch).is_some());
            if !has_branch {
                if edge.is_preview() {
                    report.stale_preview_edges.push(edge.id.clone());
                }
                continue;
            }
            let key = BranchKey::new(edge.source.clone(), branch);
            match &edge.kind {
                EdgeKind::Connection { target, .. } => {
                    if target == &edge.source || !index.contains_key(target.as_str()) {
                        continue;
                    }
                    match caller_connections.entry(key) {
                        Entry::Vacant(slot) => {
                            slot.insert(edge);
                        }
                        Entry::Occupied(_) => report.ignored_connections.push(edge.id.clone()),
                    }
                }
                EdgeKind::Preview { .. } => caller_previews.push((key, edge)),
            }
        }

        let tracked: HashSet<String> = self.lines().map(|line| line.id.clone()).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        for node in &snapshot.nodes {
            if node.validate().is_err() || !seen.insert(node.id.as_str()) {
                continue;
            }
            let eligible = if options.force_update_all {
                policy::should_create_preview_line_forced(node)
            } else {
                policy::should_create_preview_line(node)
            };
            let managed = self.lines_for_node(&node.id).next().is_some()
                || self.deleted.iter().any(|r| r.line.key.node_id == node.id);
            if !eligible && !managed {
                continue;
            }
            report.refreshed_nodes += 1;

            for (branch_index, branch) in policy::node_branches(node).into_iter().enumerate() {
                let key = BranchKey::new(node.id.clone(), branch);
                if let Some(edge) = caller_connections.get(&key).copied() {
                    if self.adopt_connection(&index, node, &key, branch_index, edge) {
                        report.adopted_connections += 1;
                        continue;
                    }
                    if self.line_for(&key).is_some_and(|line| line.id != edge.id) {
                        report.ignored_connections.push(edge.id.clone());
                    }
                }
                if self.line_for(&key).is_some() || self.is_parked(&key) || !eligible {
                    continue;
                }
                let untracked_preview = caller_previews
                    .iter()
                    .find(|(k, edge)| k == &key && !tracked.contains(&edge.id))
                    .map(|(_, edge)| *edge);
                if let Some(edge) = untracked_preview {
                    self.adopt_preview(node, key, branch_index, edge);
                    continue;
                }
                self.create_preview(node, key, branch_index);
                report.new_preview_lines_created += 1;
            }
        }

        let tracked: HashSet<String> = self.lines().map(|line| line.id.clone()).collect();
        for (key, edge) in caller_previews {
            if tracked.contains(&edge.id) {
                continue;
            }
            if self.line_for(&key).is_some() {
                self.sink.emit(&EngineEvent::DuplicateRemoved {
                    line_id: edge.id.clone(),
                    key,
                });
            }
            report.stale_preview_edges.push(edge.id.clone());
        }

        let edge_ids: HashSet<&str> = snapshot.edges.iter().map(|e| e.id.as_str()).collect();
        report.detached_connections = self
            .lines()
            .filter(|line| !line.is_preview() && !edge_ids.contains(line.id.as_str()))
            .map(|line| line.id.clone())
            .collect();
        if !report.ignored_connections.is_empty() {
            tracing::debug!(
                edges = ?report.ignored_connections,
                "caller connections on already connected branches"
            );
        }

        report.total_preview_lines = self.lines().filter(|l| l.is_preview()).count();
        self.sink.emit(&EngineEvent::LinesRefreshed {
            total: report.total_preview_lines,
            refreshed_nodes: report.refreshed_nodes,
            created: report.new_preview_lines_created,
        });
        report
    }

    /// Connections into `node_id` fall back to previews on their source
    /// branch; the node's own lines and parked records are dropped.
    pub fn delete_node(&mut self, snapshot: &FlowSnapshot, node_id: &str) -> DeleteNodeReport {
        let mut report = DeleteNodeReport::default();
        let incoming: Vec<FlowLine> = self
            .lines()
            .filter(|line| line.target() == Some(node_id) && line.key.node_id != node_id)
            .cloned()
            .collect();
        let lookup = snapshot.node_lookup();
        for line in incoming {
            let source = lookup.get(line.key.node_id.as_str()).copied();
            report.reverted.push(self.revert_to_preview(source, &line).id);
        }

        let outgoing: Vec<BranchKey> = self
            .lines_for_node(node_id)
            .map(|line| line.key.clone())
            .collect();
        for key in outgoing {
            if let Some((line, _)) = self.take_line(&key) {
                self.changes.push(LineChange::Removed {
                    line_id: line.id.clone(),
                    was_preview: line.is_preview(),
                });
                self.sink.emit(&EngineEvent::LineDeleted {
                    line_id: line.id.clone(),
                    key,
                    recorded: false,
                });
                report.removed.push(line.id);
            }
        }
        self.groups.remove(node_id);
        self.deleted.retain(|record| record.line.key.node_id != node_id);
        report
    }

    /// Drops every line, group and parked record.
    pub fn clear_all(&mut self) -> usize {
        let removed: Vec<FlowLine> = self.lines().cloned().collect();
        for line in &removed {
            self.changes.push(LineChange::Removed {
                line_id: line.id.clone(),
                was_preview: line.is_preview(),
            });
        }
        self.main_lines.clear();
        self.groups.clear();
        self.deleted.clear();
        removed.len()
    }

    pub fn clear_deleted(&mut self) -> usize {
        let dropped = self.deleted.len();
        self.deleted.clear();
        dropped
    }

    /// Re-anchors every line against current node geometry.
    pub fn sync_positions(&mut self, snapshot: &FlowSnapshot, threshold: f32) -> BatchSyncReport {
        let lines = self
            .main_lines
            .values_mut()
            .chain(self.groups.values_mut().flat_map(|group| group.lines.iter_mut()));
        let report = geometry::batch_sync_positions(lines, snapshot, &self.config, threshold);

        for correction in &report.corrected {
            self.sink.emit(&EngineEvent::PositionCorrected {
                line_id: correction.line_id.clone(),
                drift: correction.drift,
            });
            if let Some(line) = self.line(&correction.line_id).cloned() {
                self.changes.push(LineChange::Updated(line));
            }
        }
        for failure in &report.failures {
            self.sink.emit(&EngineEvent::PositionSyncFailed {
                line_id: failure.line_id.clone(),
                reason: failure.reason.clone(),
            });
        }
        report
    }

    // ---- internals ----

    fn is_parked(&self, key: &BranchKey) -> bool {
        self.deleted.iter().any(|record| &record.line.key == key)
    }

    fn preview_points(&self, node: &CanvasNode, index: usize) -> (Point, Point) {
        let frame = frame_or_default(node);
        let anchor =
            geometry::preview_anchor(&frame, index, node.effective_branch_count(), &self.config);
        (frame.out_port(), anchor)
    }

    fn preview_points_or_offset(&self, source: Option<&CanvasNode>, line: &FlowLine) -> (Point, Point) {
        match source {
            Some(node) => self.preview_points(node, line.branch_index),
            None => (
                line.source_point,
                Point::new(
                    line.source_point.x,
                    line.source_point.y + self.config.preview_length,
                ),
            ),
        }
    }

    fn create_preview(&mut self, node: &CanvasNode, key: BranchKey, branch_index: usize) -> FlowLine {
        let now = self.clock.now_ms();
        let (source_point, anchor) = self.preview_points(node, branch_index);
        let line = FlowLine {
            id: line_id(LinePrefix::Preview, &key, now),
            key,
            branch_index,
            source_point,
            state: LineState::Preview { anchor },
            created_at: now,
        };
        self.insert_line(line.clone(), policy::is_branch_node(node));
        self.changes.push(LineChange::Added(line.clone()));
        self.sink.emit(&EngineEvent::LineCreated {
            line_id: line.id.clone(),
            key: line.key.clone(),
        });
        line
    }

    fn adopt_preview(&mut self, node: &CanvasNode, key: BranchKey, branch_index: usize, edge: &Edge) {
        let (source_point, computed) = self.preview_points(node, branch_index);
        let anchor = match &edge.kind {
            EdgeKind::Preview { anchor } => *anchor,
            EdgeKind::Connection { .. } => computed,
        };
        let line = FlowLine {
            id: edge.id.clone(),
            key,
            branch_index,
            source_point,
            state: LineState::Preview { anchor },
            created_at: self.clock.now_ms(),
        };
        // already on the canvas, so no change record
        self.insert_line(line, policy::is_branch_node(node));
    }

    /// Takes over a caller-side connection for `key`. Returns false when the
    /// branch already holds a connection, which then wins.
    fn adopt_connection(
        &mut self,
        index: &BTreeMap<&str, &CanvasNode>,
        node: &CanvasNode,
        key: &BranchKey,
        branch_index: usize,
        edge: &Edge,
    ) -> bool {
        let EdgeKind::Connection {
            target,
            target_port,
        } = &edge.kind
        else {
            return false;
        };
        let existing = self.line_for(key).cloned();
        if existing.as_ref().is_some_and(|line| !line.is_preview()) {
            return false;
        }
        let Some(target_node) = index.get(target.as_str()).copied() else {
            return false;
        };
        let line = FlowLine {
            id: edge.id.clone(),
            key: key.clone(),
            branch_index,
            source_point: frame_or_default(node).out_port(),
            state: LineState::Connection {
                target: target.clone(),
                target_port: target_port.clone(),
                target_point: frame_or_default(target_node).in_port(),
            },
            created_at: self.clock.now_ms(),
        };
        match existing {
            Some(preview) => {
                self.replace_line(key, line);
                self.changes.push(LineChange::Removed {
                    line_id: preview.id.clone(),
                    was_preview: true,
                });
                self.sink.emit(&EngineEvent::LineConverted {
                    from_id: preview.id,
                    to_id: edge.id.clone(),
                    key: key.clone(),
                    to_connection: true,
                });
            }
            None => {
                self.deleted.retain(|record| &record.line.key != key);
                self.insert_line(line, policy::is_branch_node(node));
            }
        }
        true
    }

    /// Swaps a connection for a fresh preview on the same branch; `source`
    /// is the line's node when it is still on the canvas.
    fn revert_to_preview(&mut self, source: Option<&CanvasNode>, line: &FlowLine) -> FlowLine {
        let now = self.clock.now_ms();
        let source = source.filter(|node| node.validate().is_ok());
        let (source_point, anchor) = self.preview_points_or_offset(source, line);
        let preview = FlowLine {
            id: line_id(LinePrefix::Preview, &line.key, now),
            key: line.key.clone(),
            branch_index: line.branch_index,
            source_point,
            state: LineState::Preview { anchor },
            created_at: now,
        };
        self.swap_line(line, preview.clone());
        preview
    }

    /// Replaces `old` by `new` in the same slot and records the change.
    fn swap_line(&mut self, old: &FlowLine, new: FlowLine) {
        self.replace_line(&old.key, new.clone());
        self.changes.push(LineChange::Removed {
            line_id: old.id.clone(),
            was_preview: old.is_preview(),
        });
        self.changes.push(LineChange::Added(new.clone()));
        self.sink.emit(&EngineEvent::LineConverted {
            from_id: old.id.clone(),
            to_id: new.id,
            key: new.key,
            to_connection: !matches!(new.state, LineState::Preview { .. }),
        });
    }

    fn insert_line(&mut self, line: FlowLine, as_branch: bool) {
        if !as_branch {
            self.main_lines.insert(line.key.clone(), line);
            return;
        }
        let node_id = line.key.node_id.clone();
        let created_at = self.clock.now_ms();
        self.groups
            .entry(node_id.clone())
            .or_insert_with(|| BranchGroup {
                group_id: format!("group_{node_id}"),
                source: node_id,
                lines: Vec::new(),
                created_at,
            })
            .insert_sorted(line);
    }

    fn replace_line(&mut self, key: &BranchKey, line: FlowLine) {
        if let Some(slot) = self.main_lines.get_mut(key) {
            *slot = line;
            return;
        }
        if let Some(slot) = self
            .groups
            .get_mut(&key.node_id)
            .and_then(|group| group.lines.iter_mut().find(|l| &l.key == key))
        {
            *slot = line;
        }
    }

    /// Removes the line on `key`; an emptied group goes with it.
    fn take_line(&mut self, key: &BranchKey) -> Option<(FlowLine, Option<String>)> {
        if let Some(line) = self.main_lines.remove(key) {
            return Some((line, None));
        }
        let group = self.groups.get_mut(&key.node_id)?;
        let position = group.lines.iter().position(|l| &l.key == key)?;
        let line = group.lines.remove(position);
        let group_id = group.group_id.clone();
        if group.lines.is_empty() {
            self.groups.remove(&key.node_id);
        }
        Some((line, Some(group_id)))
    }
}

fn frame_or_default(node: &CanvasNode) -> NodeFrame {
    geometry::node_frame(node).unwrap_or_else(|_| NodeFrame {
        origin: node
            .position
            .filter(Point::is_finite)
            .unwrap_or_default(),
        size: DEFAULT_NODE_SIZE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::ir::NodeKind;
    use crate::optimizer::scheduler::ManualClock;

    fn manager() -> (PreviewLineManager, RecordingSink) {
        let sink = RecordingSink::new();
        let manager = PreviewLineManager::new(PreviewConfig::default())
            .with_sink(Rc::new(sink.clone()))
            .with_clock(Rc::new(ManualClock::new()));
        (manager, sink)
    }

    fn split(id: &str, branches: usize) -> CanvasNode {
        CanvasNode::new(id, NodeKind::Split)
            .with_branch_count(branches)
            .configured()
            .at(100.0, 100.0)
            .sized(120.0, 60.0)
    }

    fn plain(id: &str, x: f32, y: f32) -> CanvasNode {
        CanvasNode::new(id, NodeKind::Normal)
            .configured()
            .at(x, y)
            .sized(120.0, 60.0)
    }

    fn scenario() -> FlowSnapshot {
        FlowSnapshot::new(vec![split("S", 2), plain("T", 100.0, 400.0)], Vec::new())
    }

    fn preview_ids(manager: &PreviewLineManager, node: &str) -> Vec<String> {
        manager
            .lines_for_node(node)
            .filter(|l| l.is_preview())
            .map(|l| l.id.clone())
            .collect()
    }

    #[test]
    fn refresh_creates_one_preview_per_branch() {
        let (mut manager, _) = manager();
        let snapshot = FlowSnapshot::new(vec![split("S", 2)], Vec::new());
        let report = manager.refresh_all(&snapshot, RefreshOptions::default());
        assert_eq!(report.new_preview_lines_created, 2);
        assert_eq!(manager.preview_count("S"), 2);
        assert_eq!(manager.stats().branches, 1);
        assert_eq!(manager.stats().branch_lines, 2);
        assert!(manager.invariant_violations(&snapshot).is_empty());
    }

    #[test]
    fn connecting_keeps_branch_count() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let first = preview_ids(&manager, "S")[0].clone();
        let connection = manager
            .convert_preview_to_connection(&snapshot, &first, "T")
            .unwrap();
        assert_eq!(connection.target(), Some("T"));
        assert!(connection.id.starts_with("conn_S_out-0_"));
        assert_eq!(manager.preview_count("S"), 1);
        assert_eq!(manager.connection_count("S"), 1);
        assert_eq!(manager.stats().connection_lines, 1);
        assert!(manager.invariant_violations(&snapshot).is_empty());
    }

    #[test]
    fn deleting_target_reverts_connection() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let first = preview_ids(&manager, "S")[0].clone();
        manager
            .convert_preview_to_connection(&snapshot, &first, "T")
            .unwrap();

        let report = manager.delete_node(&snapshot, "T");
        assert_eq!(report.reverted.len(), 1);
        assert_eq!(manager.preview_count("S"), 2);
        assert_eq!(manager.connection_count("S"), 0);
        let after = FlowSnapshot::new(vec![split("S", 2)], Vec::new());
        assert!(manager.invariant_violations(&after).is_empty());
    }

    #[test]
    fn deleting_source_drops_its_lines_and_records() {
        let (mut manager, sink) = manager();
        let snapshot = FlowSnapshot::new(
            vec![plain("P", 100.0, 0.0), split("S", 3), plain("T", 100.0, 400.0)],
            Vec::new(),
        );
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let upstream = preview_ids(&manager, "P")[0].clone();
        let incoming = manager
            .convert_preview_to_connection(&snapshot, &upstream, "S")
            .unwrap();
        let branches = preview_ids(&manager, "S");
        let outgoing = manager
            .convert_preview_to_connection(&snapshot, &branches[0], "T")
            .unwrap();
        let parked = manager.delete_single(&branches[1]).unwrap();
        assert_eq!(manager.stats().deleted_lines, 1);
        manager.drain_changes();

        let report = manager.delete_node(&snapshot, "S");
        assert_eq!(report.reverted.len(), 1);
        assert_eq!(report.removed.len(), 2);
        assert!(report.removed.contains(&outgoing.id));
        assert!(report.removed.contains(&branches[2]));
        assert_eq!(manager.lines_for_node("S").count(), 0);
        assert_eq!(manager.stats().deleted_lines, 0);
        assert_eq!(manager.stats().branches, 0);

        assert!(manager.line(&incoming.id).is_none());
        assert_eq!(manager.preview_count("P"), 1);
        assert_eq!(manager.connection_count("P"), 0);
        assert_eq!(manager.preview_count("T"), 1);

        let changes = manager.drain_changes();
        assert!(changes.iter().any(|change| matches!(
            change,
            LineChange::Removed { line_id, was_preview: false } if *line_id == outgoing.id
        )));
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::LineDeleted { recorded: false, .. })),
            2
        );

        let after = FlowSnapshot::new(
            vec![plain("P", 100.0, 0.0), plain("T", 100.0, 400.0)],
            Vec::new(),
        );
        assert!(manager.invariant_violations(&after).is_empty());
        assert_eq!(
            manager.restore(&after, &parked.line.id),
            Err(LineError::NothingToRestore(parked.line.id.clone()))
        );
    }

    #[test]
    fn self_loop_is_rejected_without_change() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let before = manager.stats();
        let first = preview_ids(&manager, "S")[0].clone();
        let err = manager
            .convert_preview_to_connection(&snapshot, &first, "S")
            .unwrap_err();
        assert!(matches!(err, LineError::SelfLoop { .. }));
        assert_eq!(manager.stats(), before);
        assert!(manager.line(&first).is_some());
    }

    #[test]
    fn bad_targets_are_rejected() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let first = preview_ids(&manager, "S")[0].clone();
        assert_eq!(
            manager.convert_preview_to_connection(&snapshot, &first, " "),
            Err(LineError::EmptyTarget)
        );
        assert_eq!(
            manager.convert_preview_to_connection(&snapshot, &first, "ghost"),
            Err(LineError::UnknownTarget("ghost".into()))
        );
        assert_eq!(
            manager.convert_preview_to_connection(&snapshot, "nope", "T"),
            Err(LineError::LineNotFound("nope".into()))
        );
    }

    #[test]
    fn round_trip_returns_branch_to_preview() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let total = manager.stats().total_lines;
        let first = preview_ids(&manager, "S")[0].clone();
        let connection = manager
            .convert_preview_to_connection(&snapshot, &first, "T")
            .unwrap();
        let preview = manager
            .convert_connection_to_preview(&snapshot, &connection.id)
            .unwrap();
        assert!(preview.is_preview());
        assert_eq!(preview.key, connection.key);
        assert_eq!(manager.stats().total_lines, total);
        assert_eq!(
            manager.convert_connection_to_preview(&snapshot, &preview.id),
            Err(LineError::NotAConnection(preview.id.clone()))
        );
    }

    #[test]
    fn sibling_branches_do_not_interfere() {
        let (mut manager, _) = manager();
        let snapshot = FlowSnapshot::new(vec![split("S", 3)], Vec::new());
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let keep: Vec<FlowLine> = manager
            .lines_for_node("S")
            .filter(|l| l.branch_index != 1)
            .cloned()
            .collect();
        let middle = manager
            .lines_for_node("S")
            .find(|l| l.branch_index == 1)
            .map(|l| l.id.clone())
            .unwrap();

        manager.delete_single(&middle).unwrap();
        for line in &keep {
            assert_eq!(manager.line(&line.id), Some(line));
        }
        let recreated = manager
            .create(&snapshot, "S", &BranchId::implicit(1))
            .unwrap();
        assert_ne!(recreated.id, middle);
        for line in &keep {
            assert_eq!(manager.line(&line.id), Some(line));
        }
        assert!(manager.invariant_violations(&snapshot).is_empty());
    }

    #[test]
    fn refresh_is_idempotent() {
        let (mut manager, _) = manager();
        let snapshot = FlowSnapshot::new(
            vec![
                CanvasNode::new("start", NodeKind::Start).at(0.0, 0.0),
                split("S", 2),
                plain("A", 300.0, 0.0),
                CanvasNode::new("end", NodeKind::Terminal).configured(),
            ],
            vec![Edge::connection("e1", "start", "out-0", "S")],
        );
        let first = manager.refresh_all(&snapshot, RefreshOptions::default());
        let total = manager.stats().total_lines;
        let second = manager.refresh_all(&snapshot, RefreshOptions::default());
        assert_eq!(manager.stats().total_lines, total);
        assert_eq!(second.new_preview_lines_created, 0);
        assert_eq!(first.total_preview_lines, second.total_preview_lines);
        // start adopts e1, S gets two previews, A one, the terminal none
        assert_eq!(first.adopted_connections, 1);
        assert_eq!(total, 4);
    }

    #[test]
    fn forced_refresh_covers_unconfigured_nodes() {
        let (mut manager, _) = manager();
        let snapshot = FlowSnapshot::new(vec![CanvasNode::new("A", NodeKind::Normal)], Vec::new());
        let normal = manager.refresh_all(&snapshot, RefreshOptions::default());
        assert_eq!(normal.new_preview_lines_created, 0);
        let forced = manager.refresh_all(
            &snapshot,
            RefreshOptions {
                force_update_all: true,
            },
        );
        assert_eq!(forced.new_preview_lines_created, 1);
        assert_eq!(manager.stats().main_lines, 1);
    }

    #[test]
    fn deleting_group_lines_removes_the_group_and_restore_recreates_it() {
        let (mut manager, sink) = manager();
        let snapshot = FlowSnapshot::new(vec![split("S", 2)], Vec::new());
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let ids = preview_ids(&manager, "S");

        manager.delete_single(&ids[0]).unwrap();
        assert_eq!(manager.stats().branches, 1);
        manager.delete_single(&ids[1]).unwrap();
        let stats = manager.stats();
        assert_eq!(stats.branches, 0);
        assert_eq!(stats.deleted_lines, 2);
        assert!(!stats.is_creating);
        assert!(manager.invariant_violations(&snapshot).is_empty());

        // parked branches are not refilled by a refresh
        let report = manager.refresh_all(&snapshot, RefreshOptions::default());
        assert_eq!(report.new_preview_lines_created, 0);

        let restored = manager.restore(&snapshot, &ids[1]).unwrap();
        assert_eq!(restored.id, ids[1]);
        assert_eq!(manager.group("S").map(|g| g.lines.len()), Some(1));
        assert_eq!(manager.stats().deleted_lines, 1);
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::LineRestored { .. })),
            1
        );
        assert_eq!(
            manager.restore(&snapshot, &ids[1]),
            Err(LineError::NothingToRestore(ids[1].clone()))
        );
    }

    #[test]
    fn restore_of_dangling_connection_comes_back_as_preview() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let first = preview_ids(&manager, "S")[0].clone();
        let connection = manager
            .convert_preview_to_connection(&snapshot, &first, "T")
            .unwrap();
        manager.delete_single(&connection.id).unwrap();

        let without_target = FlowSnapshot::new(vec![split("S", 2)], Vec::new());
        let restored = manager.restore(&without_target, &connection.id).unwrap();
        assert!(restored.is_preview());
        assert_eq!(manager.preview_count("S"), 2);
    }

    #[test]
    fn invalid_create_arguments_fail() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        assert_eq!(
            manager.create(&snapshot, "ghost", &BranchId::implicit(0)),
            Err(LineError::InvalidSource("ghost".into()))
        );
        assert!(matches!(
            manager.create(&snapshot, "S", &BranchId::new("nope")),
            Err(LineError::InvalidBranch { .. })
        ));
        manager.create(&snapshot, "S", &BranchId::implicit(0)).unwrap();
        assert!(matches!(
            manager.create(&snapshot, "S", &BranchId::implicit(0)),
            Err(LineError::BranchOccupied(_))
        ));
        assert_eq!(
            manager.delete_single("missing"),
            Err(LineError::LineNotFound("missing".into()))
        );
    }

    #[test]
    fn stale_caller_previews_are_reported() {
        let (mut manager, sink) = manager();
        let snapshot = FlowSnapshot::new(vec![split("S", 2)], Vec::new());
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let tracked: Vec<Edge> = manager.lines().map(FlowLine::to_edge).collect();
        let mut edges = tracked.clone();
        edges.push(Edge::preview("copy", "S", "out-0", Point::new(0.0, 0.0)));
        edges.push(Edge::preview("ghost", "gone", "out-0", Point::new(0.0, 0.0)));
        let with_copy = FlowSnapshot::new(vec![split("S", 2)], edges);

        let report = manager.refresh_all(&with_copy, RefreshOptions::default());
        assert_eq!(
            report.stale_preview_edges,
            vec!["ghost".to_string(), "copy".to_string()]
        );
        assert_eq!(manager.stats().total_lines, 2);
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::DuplicateRemoved { .. })),
            1
        );
    }

    #[test]
    fn caller_connection_replaces_tracked_preview() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let connected = FlowSnapshot::new(
            snapshot.nodes.clone(),
            vec![Edge::connection("edge-1", "S", "out-1", "T")],
        );
        let report = manager.refresh_all(&connected, RefreshOptions::default());
        assert_eq!(report.adopted_connections, 1);
        assert_eq!(manager.line("edge-1").and_then(FlowLine::target), Some("T"));
        assert_eq!(manager.preview_count("S"), 1);
        assert!(manager.invariant_violations(&connected).is_empty());
    }

    #[test]
    fn unmatched_connections_are_reported() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let first = preview_ids(&manager, "S")[0].clone();
        let tracked = manager
            .convert_preview_to_connection(&snapshot, &first, "T")
            .unwrap();

        // the canvas lost the tracked edge and gained two rivals on the same branch
        let rivals = FlowSnapshot::new(
            snapshot.nodes.clone(),
            vec![
                Edge::connection("dup-1", "S", "out-0", "T"),
                Edge::connection("dup-2", "S", "out-0", "T"),
            ],
        );
        let report = manager.refresh_all(&rivals, RefreshOptions::default());
        assert_eq!(report.adopted_connections, 0);
        assert_eq!(report.detached_connections, vec![tracked.id.clone()]);
        assert_eq!(
            report.ignored_connections,
            vec!["dup-2".to_string(), "dup-1".to_string()]
        );
        assert_eq!(manager.line(&tracked.id).and_then(FlowLine::target), Some("T"));

        let mirrored = FlowSnapshot::new(snapshot.nodes.clone(), vec![tracked.to_edge()]);
        let report = manager.refresh_all(&mirrored, RefreshOptions::default());
        assert!(report.detached_connections.is_empty());
        assert!(report.ignored_connections.is_empty());
    }

    #[test]
    fn refresh_adopts_every_link_of_a_long_chain() {
        let (mut manager, _) = manager();
        let count = 20_000;
        let nodes = (0..count)
            .map(|i| plain(&format!("n{i}"), 0.0, i as f32 * 100.0))
            .collect();
        let edges = (1..count)
            .map(|i| Edge::connection(format!("e{i}"), format!("n{}", i - 1), "out-0", format!("n{i}")))
            .collect();
        let snapshot = FlowSnapshot::new(nodes, edges);

        let report = manager.refresh_all(&snapshot, RefreshOptions::default());
        assert_eq!(report.adopted_connections, count - 1);
        assert_eq!(report.new_preview_lines_created, 1);
        assert!(report.detached_connections.is_empty());
        assert_eq!(manager.stats().total_lines, count);
        assert!(manager.invariant_violations(&snapshot).is_empty());

        let again = manager.refresh_all(&snapshot, RefreshOptions::default());
        assert_eq!(again.adopted_connections, 0);
        assert_eq!(manager.lines_for_node("n19999").count(), 1);
    }

    #[test]
    fn sync_positions_follows_moved_nodes() {
        let (mut manager, sink) = manager();
        let snapshot = FlowSnapshot::new(vec![plain("A", 0.0, 0.0)], Vec::new());
        manager.refresh_all(&snapshot, RefreshOptions::default());
        manager.drain_changes();

        let moved = FlowSnapshot::new(vec![plain("A", 200.0, 0.0)], Vec::new());
        let report = manager.sync_positions(&moved, 10.0);
        assert_eq!(report.corrected.len(), 1);
        let line = manager.lines().next().unwrap();
        assert_eq!(line.source_point, Point::new(260.0, 60.0));
        assert_eq!(
            sink.count(|e| matches!(e, EngineEvent::PositionCorrected { .. })),
            1
        );
        assert!(matches!(
            manager.drain_changes().as_slice(),
            [LineChange::Updated(_)]
        ));
    }

    #[test]
    fn clear_all_and_clear_deleted() {
        let (mut manager, _) = manager();
        let snapshot = scenario();
        manager.refresh_all(&snapshot, RefreshOptions::default());
        let first = preview_ids(&manager, "S")[0].clone();
        manager.delete_single(&first).unwrap();
        assert_eq!(manager.clear_deleted(), 1);
        assert_eq!(manager.clear_all(), 2);
        let stats = manager.stats();
        assert_eq!(stats.total_lines, 0);
        assert_eq!(stats.deleted_lines, 0);
        assert!(!stats.is_creating);
    }
}
