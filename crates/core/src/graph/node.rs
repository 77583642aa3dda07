use super::variants::{ConcurrentNode, ConditionNode, GroupNode, MergeNode, TaskNode};
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::types::{NodeId, NodeStatus, Ports, ValidationResult, DEFAULT_INPUT, DEFAULT_OUTPUT};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

/// The fixed set of node behaviours
#[derive(Clone)]
pub enum NodeKind {
    Task(TaskNode),
    Condition(ConditionNode),
    Merge(MergeNode),
    Group(GroupNode),
    Concurrent(ConcurrentNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Condition(_) => "condition",
            Self::Merge(_) => "merge",
            Self::Group(_) => "group",
            Self::Concurrent(_) => "concurrent",
        }
    }
}

/// A unit of work in a graph.
///
/// Identity and configuration are fixed at build time; only the status moves
/// while the node runs. Cloning copies configuration and starts the clone
/// back at [`NodeStatus::Pending`].
pub struct Node {
    id: NodeId,
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    kind: NodeKind,
    status: Mutex<NodeStatus>,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            kind: self.kind.clone(),
            status: Mutex::new(NodeStatus::Pending),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        let outputs = match &kind {
            NodeKind::Condition(condition) => condition.branches().to_vec(),
            _ => vec![DEFAULT_OUTPUT.to_string()],
        };
        let inputs = match &kind {
            NodeKind::Merge(_) => Vec::new(),
            _ => vec![DEFAULT_INPUT.to_string()],
        };

        Self {
            name: id.0.clone(),
            id,
            inputs,
            outputs,
            kind,
            status: Mutex::new(NodeStatus::Pending),
        }
    }

    /// Task node running `executor` on its input value
    pub fn task<F, Fut>(id: impl Into<NodeId>, executor: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(id, NodeKind::Task(TaskNode::new(executor)))
    }

    /// Multi-branch condition: `selector` names the branch that receives the input
    pub fn condition<F, Fut, I, S>(id: impl Into<NodeId>, branches: I, selector: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(id, NodeKind::Condition(ConditionNode::new(branches, selector)))
    }

    /// Boolean condition routing the input to the `true` or `false` port
    pub fn predicate<F>(id: impl Into<NodeId>, predicate: F) -> Self
    where
        F: Fn(&Value, &Context) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::new(id, NodeKind::Condition(ConditionNode::boolean(predicate)))
    }

    /// Merge node with the default collecting reducer
    pub fn merge(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Merge(MergeNode::new()))
    }

    /// Merge node with a custom reducer
    pub fn merge_with<F, Fut>(id: impl Into<NodeId>, reducer: F) -> Self
    where
        F: Fn(Ports, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(id, NodeKind::Merge(MergeNode::with_reducer(reducer)))
    }

    pub fn group(id: impl Into<NodeId>, group: GroupNode) -> Self {
        Self::new(id, NodeKind::Group(group))
    }

    pub fn concurrent(id: impl Into<NodeId>, concurrent: ConcurrentNode) -> Self {
        Self::new(id, NodeKind::Concurrent(concurrent))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: NodeStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Return to pending so the node can run again
    pub fn reset(&self) {
        self.set_status(NodeStatus::Pending);
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();

        if self.id.0.trim().is_empty() {
            errors.push("node id must not be empty".to_string());
        }
        if let Some(port) = first_duplicate(&self.inputs) {
            errors.push(format!("duplicate input port '{}'", port));
        }
        if let Some(port) = first_duplicate(&self.outputs) {
            errors.push(format!("duplicate output port '{}'", port));
        }

        let mut result = ValidationResult::from_errors(errors);
        match &self.kind {
            NodeKind::Task(_) | NodeKind::Merge(_) => {}
            NodeKind::Condition(condition) => result.absorb("condition", condition.validate()),
            NodeKind::Group(group) => result.absorb("group", group.validate()),
            NodeKind::Concurrent(concurrent) => {
                result.absorb("concurrent", concurrent.validate())
            }
        }
        result
    }

    /// Run the node, moving it through running to success or failed.
    ///
    /// Executor failures come back as [`EngineError::NodeExecution`].
    pub fn execute<'a>(&'a self, context: &'a Context, inputs: Ports) -> BoxFuture<'a, Result<Ports>> {
        Box::pin(async move {
            self.set_status(NodeStatus::Running);
            tracing::debug!(node_id = %self.id, kind = self.kind.name(), "Executing node");

            let result = match &self.kind {
                NodeKind::Task(task) => task.run(primary_input(&inputs), context).await,
                NodeKind::Condition(condition) => {
                    condition.run(primary_input(&inputs), context).await
                }
                NodeKind::Merge(merge) => merge.run(&self.inputs, inputs, context).await,
                NodeKind::Group(group) => group.run(&self.id, context, inputs).await,
                NodeKind::Concurrent(concurrent) => {
                    concurrent.run(&self.id, context, inputs).await
                }
            };

            match result {
                Ok(outputs) => {
                    self.set_status(NodeStatus::Success);
                    Ok(outputs)
                }
                Err(e) => {
                    self.set_status(NodeStatus::Failed);
                    tracing::warn!(node_id = %self.id, error = %e, "Node failed");
                    Err(EngineError::node(&self.id, format!("{:#}", e)))
                }
            }
        })
    }
}

/// The single value a task or condition works on.
///
/// Prefers the `input` port, then a lone defined port, then all ports as an
/// object. No inputs at all yields null.
pub fn primary_input(inputs: &Ports) -> Value {
    if let Some(value) = inputs.get(DEFAULT_INPUT) {
        return value.clone();
    }
    match inputs.len() {
        0 => Value::Null,
        1 => inputs.values().next().cloned().unwrap_or(Value::Null),
        _ => Value::Object(inputs.clone()),
    }
}

fn first_duplicate(ports: &[String]) -> Option<&str> {
    let mut seen = HashSet::new();
    ports
        .iter()
        .find(|port| !seen.insert(port.as_str()))
        .map(|port| port.as_str())
}
