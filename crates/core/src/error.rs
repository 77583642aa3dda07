//! Error taxonomy for the engine.

use crate::types::NodeId;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The graph is malformed: missing reference, duplicate id or cycle.
    #[error("Invalid graph: {0}")]
    Structural(String),

    /// A node executor failed.
    #[error("Node {node_id} failed: {message}")]
    NodeExecution { node_id: NodeId, message: String },

    /// The control surface was used incorrectly.
    #[error("Invalid operation: {0}")]
    Control(String),

    /// Reading or writing persisted state failed.
    #[error("State persistence error: {0}")]
    StateIo(String),
}

impl EngineError {
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural(message.into())
    }

    pub fn control(message: impl Into<String>) -> Self {
        Self::Control(message.into())
    }

    pub fn node(node_id: &NodeId, message: impl Into<String>) -> Self {
        Self::NodeExecution {
            node_id: node_id.clone(),
            message: message.into(),
        }
    }

    pub fn state_io(context: &str, error: impl std::fmt::Display) -> Self {
        Self::StateIo(format!("{}: {}", context, error))
    }

    /// Node id attached to an execution failure, if any
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::NodeExecution { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::state_io("JSON error", error)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        Self::state_io("I/O error", error)
    }
}
