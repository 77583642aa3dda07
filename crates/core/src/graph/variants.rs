//! Behaviour of each node variant.

use super::dag::NodeGraph;
use super::edge::Edge;
use super::node::Node;
use crate::context::Context;
use crate::error::Result;
use crate::types::{single_output, NodeId, Ports, ValidationResult, DEFAULT_OUTPUT};
use anyhow::anyhow;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

/// Virtual source id carrying a group's or branch's inputs into its sub-graph
pub const SUBGRAPH_INPUT: &str = "$input";

pub type TaskFn = Arc<dyn Fn(Value, Context) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type SelectorFn =
    Arc<dyn Fn(Value, Context) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;
pub type ReducerFn = Arc<dyn Fn(Ports, Context) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Clone)]
pub struct TaskNode {
    executor: TaskFn,
}

impl TaskNode {
    pub fn new<F, Fut>(executor: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            executor: Arc::new(move |input, context| -> BoxFuture<'static, anyhow::Result<Value>> {
                Box::pin(executor(input, context))
            }),
        }
    }

    pub(crate) async fn run(&self, input: Value, context: &Context) -> anyhow::Result<Ports> {
        let output = (self.executor)(input, context.clone()).await?;
        Ok(single_output(output))
    }
}

#[derive(Clone)]
pub struct ConditionNode {
    branches: Vec<String>,
    selector: SelectorFn,
}

impl ConditionNode {
    pub fn new<F, Fut, I, S>(branches: I, selector: F) -> Self
    where
        F: Fn(Value, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            branches: branches.into_iter().map(Into::into).collect(),
            selector: Arc::new(move |input, context| -> BoxFuture<'static, anyhow::Result<String>> {
                Box::pin(selector(input, context))
            }),
        }
    }

    /// Two-way condition over the `true` / `false` ports
    pub fn boolean<F>(predicate: F) -> Self
    where
        F: Fn(&Value, &Context) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Self::new(["true", "false"], move |input, context| {
            let predicate = predicate.clone();
            async move { Ok(predicate(&input, &context)?.to_string()) }
        })
    }

    pub fn branches(&self) -> &[String] {
        &self.branches
    }

    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        if self.branches.is_empty() {
            errors.push("at least one branch is required".to_string());
        }
        let mut seen = HashSet::new();
        for branch in &self.branches {
            if branch.is_empty() {
                errors.push("branch names must not be empty".to_string());
            } else if !seen.insert(branch) {
                errors.push(format!("duplicate branch '{}'", branch));
            }
        }
        ValidationResult::from_errors(errors)
    }

    /// Route the input to exactly one declared branch
    pub(crate) async fn run(&self, input: Value, context: &Context) -> anyhow::Result<Ports> {
        let selected = (self.selector)(input.clone(), context.clone()).await?;
        if !self.branches.contains(&selected) {
            return Err(anyhow!(
                "selector returned undeclared branch '{}' (declared: {})",
                selected,
                self.branches.join(", ")
            ));
        }

        let mut outputs = Ports::new();
        outputs.insert(selected, input);
        Ok(outputs)
    }
}

#[derive(Clone, Default)]
pub struct MergeNode {
    reducer: Option<ReducerFn>,
}

impl MergeNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reducer<F, Fut>(reducer: F) -> Self
    where
        F: Fn(Ports, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            reducer: Some(Arc::new(
                move |inputs, context| -> BoxFuture<'static, anyhow::Result<Value>> {
                    Box::pin(reducer(inputs, context))
                },
            )),
        }
    }

    pub(crate) async fn run(
        &self,
        declared: &[String],
        inputs: Ports,
        context: &Context,
    ) -> anyhow::Result<Ports> {
        let merged = match &self.reducer {
            Some(reducer) => reducer(inputs, context.clone()).await?,
            None => collect_defined(declared, &inputs),
        };
        Ok(single_output(merged))
    }
}

/// Default reducer: declared ports in order, then any other port by name
pub fn collect_defined(declared: &[String], inputs: &Ports) -> Value {
    let mut values: Vec<Value> = declared
        .iter()
        .filter_map(|port| inputs.get(port).cloned())
        .collect();
    values.extend(
        inputs
            .iter()
            .filter(|(port, _)| !declared.contains(port))
            .map(|(_, value)| value.clone()),
    );
    Value::Array(values)
}

/// Nodes and internal edges rebuilt into a fresh graph on every run
#[derive(Clone, Default)]
pub struct SubGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl SubGraph {
    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Ephemeral graph with `$input` declared as a virtual source
    pub fn build(&self) -> Result<NodeGraph> {
        let mut graph = NodeGraph::new();
        graph.add_input(SUBGRAPH_INPUT)?;
        for node in &self.nodes {
            graph.add_node(node.clone())?;
        }
        for edge in &self.edges {
            graph.add_edge(edge.clone())?;
        }
        Ok(graph)
    }

    pub fn validate(&self) -> ValidationResult {
        if self.nodes.is_empty() {
            return ValidationResult::from_errors(vec!["sub-graph has no nodes".to_string()]);
        }
        match self.build() {
            Ok(graph) => graph.validate(),
            Err(e) => ValidationResult::from_errors(vec![e.to_string()]),
        }
    }

    /// Execute in a child of `parent`, destroyed afterwards
    pub async fn run(
        &self,
        parent: &Context,
        scope: &str,
        inputs: Ports,
    ) -> Result<HashMap<NodeId, Ports>> {
        let graph = self.build()?;
        let context = parent.create_child(scope)?;

        let mut initial_inputs = HashMap::new();
        initial_inputs.insert(NodeId::new(SUBGRAPH_INPUT), Value::Object(inputs));

        let result = graph.execute(&context, initial_inputs).await;
        context.destroy();
        result
    }
}

/// Sink outputs as a port map keyed by sink id
fn sinks_to_ports(sinks: HashMap<NodeId, Ports>) -> Ports {
    sinks
        .into_iter()
        .map(|(id, ports)| (id.0, Value::Object(ports)))
        .collect()
}

/// A nested graph executed as one node
#[derive(Clone, Default)]
pub struct GroupNode {
    graph: SubGraph,
}

impl GroupNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a child node
    pub fn node(mut self, node: Node) -> Self {
        self.graph.add_node(node);
        self
    }

    /// Register an internal edge. Use [`SUBGRAPH_INPUT`] as a source to read
    /// the group's inputs.
    pub fn edge(mut self, edge: Edge) -> Self {
        self.graph.add_edge(edge);
        self
    }

    pub fn graph(&self) -> &SubGraph {
        &self.graph
    }

    pub fn validate(&self) -> ValidationResult {
        self.graph.validate()
    }

    pub(crate) async fn run(
        &self,
        node_id: &NodeId,
        context: &Context,
        inputs: Ports,
    ) -> anyhow::Result<Ports> {
        let sinks = self.graph.run(context, node_id.as_str(), inputs).await?;

        let alias = if sinks.len() == 1 {
            sinks
                .values()
                .next()
                .and_then(|ports| ports.get(DEFAULT_OUTPUT).cloned())
        } else {
            None
        };

        let mut outputs = sinks_to_ports(sinks);
        if let Some(value) = alias {
            outputs.insert(DEFAULT_OUTPUT.to_string(), value);
        }
        Ok(outputs)
    }
}

/// Rule deciding whether a concurrent node succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuccessStrategy {
    /// At least one branch succeeded
    AnySuccess,
    /// Every branch succeeded
    AllSuccess,
    /// At least `required` critical branches succeeded
    CriticalQuota { required: usize },
}

#[derive(Clone)]
pub struct Branch {
    name: String,
    critical: bool,
    graph: SubGraph,
}

impl Branch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            critical: false,
            graph: SubGraph::default(),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.graph.add_node(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.graph.add_edge(edge);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }
}

/// Runs several branch sub-graphs at once
#[derive(Clone)]
pub struct ConcurrentNode {
    branches: Vec<Branch>,
    strategy: SuccessStrategy,
}

impl ConcurrentNode {
    pub fn new(strategy: SuccessStrategy) -> Self {
        Self {
            branches: Vec::new(),
            strategy,
        }
    }

    pub fn branch(mut self, branch: Branch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn strategy(&self) -> SuccessStrategy {
        self.strategy
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::valid();
        if self.branches.is_empty() {
            result.errors.push("at least one branch is required".to_string());
        }

        let mut seen = HashSet::new();
        for branch in &self.branches {
            if !seen.insert(branch.name.as_str()) {
                result.errors.push(format!("duplicate branch '{}'", branch.name));
            }
            result.absorb(&format!("branch {}", branch.name), branch.graph.validate());
        }

        if let SuccessStrategy::CriticalQuota { required } = self.strategy {
            let critical = self.branches.iter().filter(|b| b.critical).count();
            if required == 0 || required > critical {
                result.errors.push(format!(
                    "critical quota {} must be between 1 and the {} critical branches",
                    required, critical
                ));
            }
        }

        result.is_valid = result.errors.is_empty();
        result
    }

    /// Launch every branch, wait for all of them to settle, then apply the strategy
    pub(crate) async fn run(
        &self,
        node_id: &NodeId,
        context: &Context,
        inputs: Ports,
    ) -> anyhow::Result<Ports> {
        let runs = self.branches.iter().map(|branch| {
            let scope = format!("{}/{}", node_id, branch.name);
            let inputs = inputs.clone();
            async move { (branch, branch.graph.run(context, &scope, inputs).await) }
        });
        let settled = futures::future::join_all(runs).await;

        let mut outputs = Ports::new();
        let mut failures = Vec::new();
        let mut critical_successes = 0;

        for (branch, result) in settled {
            match result {
                Ok(sinks) => {
                    if branch.critical {
                        critical_successes += 1;
                    }
                    outputs.insert(branch.name.clone(), Value::Object(sinks_to_ports(sinks)));
                }
                Err(e) => {
                    tracing::debug!(node_id = %node_id, branch = %branch.name, error = %e, "Branch failed");
                    failures.push(format!("{}: {}", branch.name, e));
                }
            }
        }

        let satisfied = match self.strategy {
            SuccessStrategy::AnySuccess => !outputs.is_empty(),
            SuccessStrategy::AllSuccess => failures.is_empty(),
            SuccessStrategy::CriticalQuota { required } => critical_successes >= required,
        };

        if !satisfied {
            return Err(anyhow!(
                "{:?} not satisfied: {} of {} branches succeeded ({})",
                self.strategy,
                outputs.len(),
                self.branches.len(),
                failures.join("; ")
            ));
        }

        Ok(outputs)
    }
}
