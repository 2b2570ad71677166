use thiserror::Error;

/// Malformed node or edge input. Always recovered locally by skipping the item.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("node is missing an id")]
    EmptyNodeId,

    #[error("edge is missing an id")]
    EmptyEdgeId,

    #[error("edge '{0}' has a missing or unknown endpoint")]
    DanglingEdge(String),

    #[error("'{0}' carries non-finite geometry")]
    NonFiniteGeometry(String),
}

/// Broken layer output. These are programming errors in a layering pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("layer {layer} references unknown node '{node_id}'")]
    UnknownNode { node_id: String, layer: usize },

    #[error("node '{node_id}' appears in layer {first} and again in layer {second}")]
    DuplicateNode {
        node_id: String,
        first: usize,
        second: usize,
    },

    #[error("node '{0}' is missing from every layer")]
    MissingNode(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("node '{0}' is not present in the snapshot")]
    NodeNotFound(String),

    #[error("node '{0}' has no usable position")]
    MissingPosition(String),

    #[error("geometry of '{0}' is NaN or infinite")]
    NonFinite(String),

    #[error("node '{0}' has a zero or negative size")]
    DegenerateSize(String),
}

/// Failed line operation. The line store is left untouched when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LineError {
    #[error("line '{0}' does not exist")]
    LineNotFound(String),

    #[error("source node '{0}' is missing or does not accept lines")]
    InvalidSource(String),

    #[error("node '{node_id}' has no branch '{branch_id}'")]
    InvalidBranch { node_id: String, branch_id: String },

    #[error("branch '{0}' already owns a line")]
    BranchOccupied(String),

    #[error("target node id is empty")]
    EmptyTarget,

    #[error("target node '{0}' does not exist")]
    UnknownTarget(String),

    #[error("line '{line_id}' would connect node '{node_id}' to itself")]
    SelfLoop { line_id: String, node_id: String },

    #[error("line '{0}' is not a preview line")]
    NotAPreview(String),

    #[error("line '{0}' is not a connection")]
    NotAConnection(String),

    #[error("no deleted line '{0}' to restore")]
    NothingToRestore(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("operation '{0}' was cancelled before it ran")]
    Cancelled(String),

    #[error("operation '{id}' failed: {message}")]
    Failed { id: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Layer(#[from] LayerError),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Line(#[from] LineError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}
