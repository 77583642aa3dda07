//! Run control over a node graph: pause, stop, stepping, skip/retry,
//! progress and persisted state.

mod gate;
mod orchestrator;
mod state;

pub use gate::RunGate;
pub use orchestrator::{Pipeline, StepResult};
pub use state::PipelineState;
