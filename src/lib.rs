//! Layout and preview-line engine for node-based flow editors.
//!
//! [`layout::build_layers`] and [`layout::compute_layout`] are pure functions
//! over a node/edge snapshot. [`preview::PreviewLineManager`] keeps exactly
//! one line per node branch. [`engine::FlowEditor`] ties both to a
//! [`surface::CanvasSurface`] and routes layout, refresh and sync requests
//! through [`optimizer::PerformanceOptimizer`].

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod geometry;
pub mod ir;
pub mod layout;
pub mod layout_dump;
pub mod optimizer;
pub mod preview;
pub mod surface;

#[cfg(feature = "cli")]
pub use cli::run;
pub use config::{EngineConfig, load_config};
pub use engine::{EditorTask, FlowEditor};
pub use error::{EngineError, LineError};
pub use ir::{BranchId, BranchKey, CanvasNode, Edge, FlowSnapshot, NodeKind, Point, Size};
pub use layout::{LayoutOptions, LayoutResult, build_layers, compute_layout};
pub use preview::{PreviewLineManager, RefreshOptions};
pub use surface::{CanvasSurface, MemoryCanvas};
