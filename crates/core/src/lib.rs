// Core engine for pipeflow: node graphs, run control, scoped context,
// lifecycle events and persisted state

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod graph;
pub mod pipeline;
pub mod storage;
pub mod types;

pub use config::PipelineConfig;
pub use context::{Context, ContextId, ContextManager};
pub use error::{EngineError, Result};
pub use events::{Event, EventEmitter, EventKind, EventType};
pub use graph::{Edge, EdgeKind, Node, NodeGraph, NodeKind};
pub use pipeline::{Pipeline, PipelineState, StepResult};
pub use storage::StateManager;
pub use types::*;
