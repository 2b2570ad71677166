//! Preview lines: placeholder edges hanging off every open branch of a node
//! until the user connects them to a target.

pub mod ids;
mod line;
pub mod manager;
pub mod policy;

pub use line::{BranchGroup, DeletedLineRecord, FlowLine, LineState};
pub use manager::{
    BranchCountMismatch, DeleteNodeReport, LineChange, PreviewLineManager, PreviewStats,
    RefreshOptions, RefreshReport,
};
