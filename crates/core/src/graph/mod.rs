pub mod dag;
pub mod edge;
pub mod node;
pub mod variants;

pub use dag::{virtual_outputs, NodeGraph};
pub use edge::{Edge, EdgeKind};
pub use node::{primary_input, Node, NodeKind};
pub use variants::{
    Branch, ConcurrentNode, ConditionNode, GroupNode, MergeNode, SubGraph, SuccessStrategy,
    TaskNode, SUBGRAPH_INPUT,
};
