//! Structured engine events.
//!
//! Every component reports what it did through an [`EventSink`] instead of
//! free-form log lines. [`TracingSink`] forwards to `tracing`; tests use
//! [`RecordingSink`] and assert on the emitted values.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ir::BranchKey;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ValidationSkipped {
        item: String,
        reason: String,
    },
    LayersBuilt {
        layers: usize,
        nodes: usize,
    },
    LayoutComputed {
        nodes: usize,
        virtual_root: bool,
    },
    LineCreated {
        line_id: String,
        key: BranchKey,
    },
    LineConverted {
        from_id: String,
        to_id: String,
        key: BranchKey,
        to_connection: bool,
    },
    LineDeleted {
        line_id: String,
        key: BranchKey,
        recorded: bool,
    },
    LineRestored {
        line_id: String,
        key: BranchKey,
    },
    DuplicateRemoved {
        line_id: String,
        key: BranchKey,
    },
    LinesRefreshed {
        total: usize,
        refreshed_nodes: usize,
        created: usize,
    },
    PositionCorrected {
        line_id: String,
        drift: f32,
    },
    PositionSyncFailed {
        line_id: String,
        reason: String,
    },
    OperationDeferred {
        id: String,
        kind: String,
    },
    OperationCoalesced {
        id: String,
        kind: String,
    },
    BatchExecuted {
        size: usize,
    },
    CacheHit {
        kind: String,
    },
    CacheMiss {
        kind: String,
    },
    RefreshThrottled {
        node_id: String,
    },
    OptimizerReset {
        dropped: usize,
    },
}

pub trait EventSink {
    fn emit(&self, event: &EngineEvent);
}

pub type SharedSink = Rc<dyn EventSink>;

/// Discards every event; for hosts that only want the return values.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &EngineEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ValidationSkipped { item, reason } => {
                tracing::warn!(item = %item, reason = %reason, "skipping malformed input");
            }
            EngineEvent::PositionSyncFailed { line_id, reason } => {
                tracing::warn!(line_id = %line_id, reason = %reason, "position sync failed");
            }
            EngineEvent::LayoutComputed {
                nodes,
                virtual_root,
            } => {
                tracing::info!(nodes, virtual_root, "layout computed");
            }
            EngineEvent::LinesRefreshed {
                total,
                refreshed_nodes,
                created,
            } => {
                tracing::info!(total, refreshed_nodes, created, "preview lines refreshed");
            }
            EngineEvent::BatchExecuted { size } => {
                tracing::debug!(size, "batch executed");
            }
            EngineEvent::RefreshThrottled { node_id } => {
                tracing::debug!(node_id = %node_id, "refresh dropped by throttle");
            }
            other => {
                tracing::debug!(event = ?other, "engine event");
            }
        }
    }
}

/// Keeps every event in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Rc<RefCell<Vec<EngineEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.borrow().clone()
    }

    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &EngineEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

pub fn tracing_sink() -> SharedSink {
    Rc::new(TracingSink)
}
