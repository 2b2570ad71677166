//! The editor facade: reads the canvas, lays it out, keeps preview lines in
//! step with the result and writes everything back.

use std::rc::Rc;

use crate::config::{EngineConfig, LayoutConfig};
use crate::error::{EngineError, LineError};
use crate::events::{EngineEvent, SharedSink, tracing_sink};
use crate::geometry::BatchSyncReport;
use crate::ir::FlowSnapshot;
use crate::layout::{
    LayerSet, LayoutOptions, LayoutResult, build_layers, compute_layout, content_fingerprint,
    layout_fingerprint,
};
use crate::optimizer::{
    Operation, OperationKey, OperationKind, OptimizerMetrics, PerformanceOptimizer, SharedClock,
    SystemClock, Ticket,
};
use crate::preview::{
    DeleteNodeReport, DeletedLineRecord, FlowLine, LineChange, PreviewLineManager, PreviewStats,
    RefreshOptions, RefreshReport,
};
use crate::surface::{CanvasSurface, PreviewPatch};

/// Work routed through the optimizer. Refresh and sync resolve to the
/// request itself and run against the canvas as it is when the ticket
/// settles.
#[derive(Debug, Clone, PartialEq)]
pub enum EditorTask {
    Layout(LayoutResult),
    Refresh(RefreshOptions),
    Sync,
}

pub struct FlowEditor<S: CanvasSurface> {
    surface: S,
    config: EngineConfig,
    manager: PreviewLineManager,
    optimizer: PerformanceOptimizer<EditorTask>,
    /// One ticket per queued execution; coalesced duplicates are not kept.
    pending: Vec<(OperationKey, Ticket<EditorTask>)>,
    sink: SharedSink,
}

impl<S: CanvasSurface> FlowEditor<S> {
    pub fn new(surface: S, config: EngineConfig) -> Self {
        Self::with_runtime(surface, config, Rc::new(SystemClock::new()), tracing_sink())
    }

    /// Builds an editor on an explicit clock and event sink.
    pub fn with_runtime(surface: S, config: EngineConfig, clock: SharedClock, sink: SharedSink) -> Self {
        let manager = PreviewLineManager::new(config.preview.clone())
            .with_sink(sink.clone())
            .with_clock(clock.clone());
        let optimizer =
            PerformanceOptimizer::new(config.optimizer.clone(), clock).with_sink(sink.clone());
        Self {
            surface,
            config,
            manager,
            optimizer,
            pending: Vec::new(),
            sink,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn into_surface(self) -> S {
        self.surface
    }

    pub fn manager(&self) -> &PreviewLineManager {
        &self.manager
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Swaps the layout settings. Cached layouts were computed with the old
    /// settings and are dropped.
    pub fn set_layout_config(&mut self, layout: LayoutConfig) {
        self.config.layout = layout;
        let dropped = self.optimizer.invalidate_cache(OperationKind::Layout);
        tracing::debug!(dropped, "layout cache invalidated");
    }

    fn snapshot(&self) -> FlowSnapshot {
        let snapshot = self.surface.snapshot();
        for node in &snapshot.nodes {
            if let Err(err) = node.validate() {
                self.sink.emit(&EngineEvent::ValidationSkipped {
                    item: node.id.clone(),
                    reason: err.to_string(),
                });
            }
        }
        snapshot
    }

    /// Connection edges only; preview edges never influence placement.
    fn layout_input(&self) -> FlowSnapshot {
        let snapshot = self.snapshot();
        let edges: Vec<_> = snapshot.connections().cloned().collect();
        FlowSnapshot::new(snapshot.nodes, edges)
    }

    pub fn layers(&self) -> LayerSet {
        let input = self.layout_input();
        let layers = build_layers(&input.nodes, &input.edges);
        self.sink.emit(&EngineEvent::LayersBuilt {
            layers: layers.len(),
            nodes: layers.iter().map(Vec::len).sum(),
        });
        layers
    }

    /// Lays the canvas out now, bypassing the optimizer.
    pub fn layout(&mut self, options: &LayoutOptions) -> LayoutResult {
        let input = self.layout_input();
        let result = compute_layout(&input.nodes, &input.edges, options, &self.config.layout);
        self.apply_layout(&result);
        result
    }

    /// Submits a layout through the optimizer. The result is applied to the
    /// canvas as soon as the ticket resolves, here or in [`poll`](Self::poll).
    pub fn request_layout(&mut self, options: LayoutOptions) -> Ticket<EditorTask> {
        let input = self.layout_input();
        let key = OperationKey::new(
            OperationKind::Layout,
            layout_fingerprint(&input.nodes, &input.edges, &options),
        );
        let layout_config = self.config.layout.clone();
        self.enqueue(
            key,
            Box::new(move || {
                Ok(EditorTask::Layout(compute_layout(
                    &input.nodes,
                    &input.edges,
                    &options,
                    &layout_config,
                )))
            }),
        )
    }

    /// Queues a preview-line refresh behind the optimizer. Identical
    /// requests against an unchanged canvas share one run.
    pub fn request_refresh(&mut self, options: RefreshOptions) -> Ticket<EditorTask> {
        let snapshot = self.surface.snapshot();
        let key = OperationKey::new(
            OperationKind::Refresh,
            content_fingerprint(&(&snapshot, options)),
        );
        self.enqueue(key, Box::new(move || Ok(EditorTask::Refresh(options))))
    }

    /// Queues a re-anchoring pass over every line.
    pub fn request_sync(&mut self) -> Ticket<EditorTask> {
        let snapshot = self.surface.snapshot();
        let key = OperationKey::new(OperationKind::Sync, content_fingerprint(&snapshot));
        self.enqueue(key, Box::new(|| Ok(EditorTask::Sync)))
    }

    fn enqueue(&mut self, key: OperationKey, operation: Operation<EditorTask>) -> Ticket<EditorTask> {
        let ticket = self.optimizer.submit(key, operation);
        let queued = self
            .pending
            .iter()
            .any(|(pending, queued)| *pending == key && !queued.is_ready());
        if !queued {
            self.pending.push((key, ticket.clone()));
        }
        self.settle();
        ticket
    }

    /// Advances the optimizer's timers and applies finished work.
    pub fn poll(&mut self) -> usize {
        let executed = self.optimizer.poll();
        self.settle();
        executed
    }

    /// Clock time at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<u64> {
        self.optimizer.next_deadline()
    }

    pub fn finish_warmup(&mut self) -> usize {
        let executed = self.optimizer.finish_warmup();
        self.settle();
        executed
    }

    /// Drops queued work and restarts the warm-up window; lines and canvas
    /// stay as they are.
    pub fn cancel_pending(&mut self) -> usize {
        let dropped = self.optimizer.reset();
        self.pending.clear();
        dropped
    }

    pub fn optimizer_metrics(&self) -> OptimizerMetrics {
        self.optimizer.metrics()
    }

    /// Applies resolved tickets in request order.
    fn settle(&mut self) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, ticket)| ticket.is_ready());
        self.pending = waiting;
        for (_, ticket) in ready {
            match ticket.result() {
                Some(Ok(EditorTask::Layout(result))) => self.apply_layout(&result),
                Some(Ok(EditorTask::Refresh(options))) => {
                    let report = self.refresh_preview_lines(options);
                    tracing::debug!(
                        created = report.new_preview_lines_created,
                        "queued refresh applied"
                    );
                }
                Some(Ok(EditorTask::Sync)) => {
                    self.sync_positions();
                }
                Some(Err(err)) => tracing::warn!(error = %err, "queued request dropped"),
                None => {}
            }
        }
    }

    fn apply_layout(&mut self, result: &LayoutResult) {
        for (id, position) in &result.positions {
            if !self.surface.set_node_position(id, *position) {
                tracing::debug!(node_id = %id, "laid-out node vanished from the canvas");
            }
        }
        self.sink.emit(&EngineEvent::LayoutComputed {
            nodes: result.positions.len(),
            virtual_root: result.virtual_root,
        });
        self.refresh_preview_lines(RefreshOptions {
            force_update_all: true,
        });
        self.sync_positions();
    }

    /// Refreshes every node's lines now, bypassing the optimizer.
    /// Connections whose edge was removed from the canvas fall back to
    /// previews.
    pub fn refresh_preview_lines(&mut self, options: RefreshOptions) -> RefreshReport {
        let snapshot = self.snapshot();
        let mut report = self.manager.refresh_all(&snapshot, options);
        for edge_id in &report.stale_preview_edges {
            self.surface.remove_preview_edge(edge_id);
        }
        for line_id in &report.detached_connections {
            match self.manager.convert_connection_to_preview(&snapshot, line_id) {
                Ok(_) => report.reverted_connections += 1,
                Err(err) => tracing::debug!(line_id = %line_id, error = %err, "detached connection kept"),
            }
        }
        self.apply_line_changes();
        report
    }

    /// Throttled refresh of a single node's lines. Returns `Ok(false)` when
    /// the request was dropped by the throttle.
    pub fn refresh_node(&mut self, node_id: &str) -> Result<bool, EngineError> {
        if !self.optimizer.allow_refresh(node_id) {
            return Ok(false);
        }
        let snapshot = self.snapshot();
        self.manager.create_for_node(&snapshot, node_id)?;
        self.manager
            .sync_positions(&snapshot, self.config.sync.drift_threshold);
        self.apply_line_changes();
        Ok(true)
    }

    pub fn sync_positions(&mut self) -> BatchSyncReport {
        let snapshot = self.snapshot();
        let report = self
            .manager
            .sync_positions(&snapshot, self.config.sync.drift_threshold);
        self.apply_line_changes();
        report
    }

    pub fn convert_preview_to_connection(
        &mut self,
        preview_id: &str,
        target_id: &str,
    ) -> Result<FlowLine, EngineError> {
        let snapshot = self.snapshot();
        let line = self
            .manager
            .convert_preview_to_connection(&snapshot, preview_id, target_id)?;
        self.apply_line_changes();
        Ok(line)
    }

    pub fn convert_connection_to_preview(&mut self, connection_id: &str) -> Result<FlowLine, EngineError> {
        let snapshot = self.snapshot();
        let line = self
            .manager
            .convert_connection_to_preview(&snapshot, connection_id)?;
        self.apply_line_changes();
        Ok(line)
    }

    pub fn delete_line(&mut self, line_id: &str) -> Result<DeletedLineRecord, EngineError> {
        let record = self.manager.delete_single(line_id)?;
        self.apply_line_changes();
        Ok(record)
    }

    pub fn restore_line(&mut self, line_id: &str) -> Result<FlowLine, EngineError> {
        let snapshot = self.snapshot();
        let line = self.manager.restore(&snapshot, line_id)?;
        self.apply_line_changes();
        Ok(line)
    }

    /// Retires the lines of a node the caller is removing. Connections into
    /// it fall back to previews on their source branch.
    pub fn delete_node(&mut self, node_id: &str) -> Result<DeleteNodeReport, EngineError> {
        let snapshot = self.snapshot();
        if snapshot.node(node_id).is_none() {
            return Err(LineError::InvalidSource(node_id.to_string()).into());
        }
        let report = self.manager.delete_node(&snapshot, node_id);
        self.optimizer.forget_node(node_id);
        let untracked: Vec<String> = snapshot
            .edges
            .iter()
            .filter(|edge| edge.source == node_id || edge.target() == Some(node_id))
            .filter(|edge| self.manager.line(&edge.id).is_none())
            .map(|edge| edge.id.clone())
            .collect();
        for edge_id in untracked {
            self.surface.remove_edge(&edge_id);
            self.surface.remove_preview_edge(&edge_id);
        }
        self.apply_line_changes();
        Ok(report)
    }

    pub fn stats(&self) -> PreviewStats {
        self.manager.stats()
    }

    fn apply_line_changes(&mut self) {
        for change in self.manager.drain_changes() {
            match change {
                LineChange::Added(line) if line.is_preview() => {
                    self.surface.add_preview_edge(line.to_edge());
                }
                LineChange::Added(line) => {
                    self.surface.add_edge(line.to_edge());
                }
                LineChange::Updated(line) => {
                    if line.is_preview() {
                        self.surface.update_preview_edge(
                            &line.id,
                            PreviewPatch {
                                anchor: Some(line.end_point()),
                            },
                        );
                    }
                }
                LineChange::Removed {
                    line_id,
                    was_preview,
                } => {
                    if was_preview {
                        self.surface.remove_preview_edge(&line_id);
                    } else {
                        self.surface.remove_edge(&line_id);
                    }
                }
            }
        }
    }
}
