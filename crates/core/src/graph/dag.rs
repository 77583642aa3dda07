use super::edge::Edge;
use super::node::Node;
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::types::{EdgeId, NodeId, NodeStatus, Ports, ValidationResult, DEFAULT_OUTPUT};
use futures::future::BoxFuture;
use petgraph::graphmap::DiGraphMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Id-keyed graph of nodes and edges.
///
/// Declaration order of nodes and edges is kept so that ordering decisions
/// (topological ties, ready-node selection, input gathering) are
/// deterministic. Forward and reverse adjacency are updated on every
/// mutation.
#[derive(Default)]
pub struct NodeGraph {
    nodes: HashMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    edges: HashMap<EdgeId, Edge>,
    edge_order: Vec<EdgeId>,
    virtual_inputs: Vec<NodeId>,
    outgoing: HashMap<NodeId, Vec<EdgeId>>,
    incoming: HashMap<NodeId, Vec<EdgeId>>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_taken(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id) || self.virtual_inputs.contains(id)
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        let id = node.id().clone();
        if self.is_taken(&id) {
            return Err(EngineError::structural(format!("Node {} already exists", id)));
        }

        self.node_order.push(id.clone());
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Declare a virtual source whose value is supplied at execution time
    pub fn add_input(&mut self, id: impl Into<NodeId>) -> Result<()> {
        let id = id.into();
        if self.is_taken(&id) {
            return Err(EngineError::structural(format!("Node {} already exists", id)));
        }
        self.virtual_inputs.push(id);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        if self.edges.contains_key(&edge.id) {
            return Err(EngineError::structural(format!("Edge {} already exists", edge.id)));
        }
        if !self.is_taken(&edge.source) {
            return Err(EngineError::structural(format!(
                "Edge {} references missing source node {}",
                edge.id, edge.source
            )));
        }
        if !self.nodes.contains_key(&edge.target) {
            return Err(EngineError::structural(format!(
                "Edge {} references missing target node {}",
                edge.id, edge.target
            )));
        }

        self.outgoing
            .entry(edge.source.clone())
            .or_default()
            .push(edge.id.clone());
        self.incoming
            .entry(edge.target.clone())
            .or_default()
            .push(edge.id.clone());
        self.edge_order.push(edge.id.clone());
        self.edges.insert(edge.id.clone(), edge);
        Ok(())
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Remove a node and every edge touching it
    pub fn remove_node(&mut self, id: &NodeId) -> bool {
        if self.nodes.remove(id).is_none() {
            return false;
        }
        self.node_order.retain(|n| n != id);

        let touching: Vec<EdgeId> = self
            .incoming
            .remove(id)
            .into_iter()
            .chain(self.outgoing.remove(id))
            .flatten()
            .collect();
        for edge_id in touching {
            self.remove_edge(&edge_id);
        }
        true
    }

    pub fn remove_edge(&mut self, id: &EdgeId) -> bool {
        let Some(edge) = self.edges.remove(id) else {
            return false;
        };
        self.edge_order.retain(|e| e != id);
        if let Some(out) = self.outgoing.get_mut(&edge.source) {
            out.retain(|e| e != id);
        }
        if let Some(inc) = self.incoming.get_mut(&edge.target) {
            inc.retain(|e| e != id);
        }
        true
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_order
    }

    /// Edges in declaration order
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edge_order.iter().filter_map(|id| self.edges.get(id))
    }

    pub fn virtual_inputs(&self) -> &[NodeId] {
        &self.virtual_inputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn incoming_edges(&self, id: &NodeId) -> Vec<&Edge> {
        self.incoming
            .get(id)
            .map(|ids| ids.iter().filter_map(|e| self.edges.get(e)).collect())
            .unwrap_or_default()
    }

    pub fn outgoing_edges(&self, id: &NodeId) -> Vec<&Edge> {
        self.outgoing
            .get(id)
            .map(|ids| ids.iter().filter_map(|e| self.edges.get(e)).collect())
            .unwrap_or_default()
    }

    /// Nodes feeding `id`, virtual inputs excluded
    pub fn predecessors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.incoming_edges(id)
            .into_iter()
            .map(|e| e.source.clone())
            .filter(|source| self.nodes.contains_key(source) && seen.insert(source.clone()))
            .collect()
    }

    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.outgoing_edges(id)
            .into_iter()
            .map(|e| e.target.clone())
            .filter(|target| seen.insert(target.clone()))
            .collect()
    }

    /// Nodes with no outgoing edges, in declaration order
    pub fn sink_nodes(&self) -> Vec<NodeId> {
        self.node_order
            .iter()
            .filter(|id| self.outgoing.get(*id).map_or(true, |out| out.is_empty()))
            .cloned()
            .collect()
    }

    /// Nodes with no predecessor nodes, in declaration order
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.node_order
            .iter()
            .filter(|id| self.predecessors(id).is_empty())
            .cloned()
            .collect()
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::valid();

        for node in self.nodes() {
            result.absorb(&format!("node {}", node.id()), node.validate());
        }

        for edge in self.edges() {
            if !self.is_taken(&edge.source) {
                result.errors.push(format!(
                    "edge {} references missing source node {}",
                    edge.id, edge.source
                ));
            }
            if !self.nodes.contains_key(&edge.target) {
                result.errors.push(format!(
                    "edge {} references missing target node {}",
                    edge.id, edge.target
                ));
            }
        }

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for id in &self.node_order {
            graph.add_node(id.as_str());
        }
        for edge in self.edges() {
            if self.nodes.contains_key(&edge.source) && self.nodes.contains_key(&edge.target) {
                graph.add_edge(edge.source.as_str(), edge.target.as_str(), ());
            }
        }
        if let Err(cycle) = petgraph::algo::toposort(&graph, None) {
            result.errors.push(format!(
                "graph contains a cycle involving node {}",
                cycle.node_id()
            ));
        }

        result.is_valid = result.errors.is_empty();
        result
    }

    /// Node ids ordered so that every node follows all of its predecessors.
    ///
    /// Reversed DFS post-order. Roots and successors are visited in reverse
    /// declaration order, which makes unrelated nodes come out in
    /// declaration order.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a NodeGraph,
            id: &'a NodeId,
            marks: &mut HashMap<&'a NodeId, Mark>,
            post_order: &mut Vec<NodeId>,
        ) -> Result<()> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(EngineError::structural(format!(
                        "Graph contains a cycle through node {}",
                        id
                    )))
                }
                None => {}
            }

            marks.insert(id, Mark::Visiting);
            if let Some(out) = graph.outgoing.get(id) {
                for edge_id in out.iter().rev() {
                    if let Some(edge) = graph.edges.get(edge_id) {
                        visit(graph, &edge.target, marks, post_order)?;
                    }
                }
            }
            marks.insert(id, Mark::Done);
            post_order.push(id.clone());
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut post_order = Vec::with_capacity(self.nodes.len());
        for id in self.node_order.iter().rev() {
            visit(self, id, &mut marks, &mut post_order)?;
        }

        post_order.reverse();
        Ok(post_order)
    }

    /// Gather a node's input ports from the outputs produced so far
    pub fn collect_inputs(&self, id: &NodeId, outputs: &HashMap<NodeId, Ports>) -> Result<Ports> {
        let mut inputs = Ports::new();

        for edge in self.incoming_edges(id) {
            let value = outputs
                .get(&edge.source)
                .and_then(|ports| ports.get(&edge.source_port));

            let delivered = edge.deliver(value).map_err(|e| {
                EngineError::node(id, format!("transform on edge {} failed: {:#}", edge.id, e))
            })?;

            if let Some(value) = delivered {
                if inputs.contains_key(&edge.target_port) {
                    tracing::warn!(
                        "Edge {} overwrites input port {} of node {}",
                        edge.id,
                        edge.target_port,
                        id
                    );
                }
                inputs.insert(edge.target_port.clone(), value);
            }
        }

        Ok(inputs)
    }

    /// Return every node to pending
    pub fn reset(&self) {
        for node in self.nodes.values() {
            node.reset();
        }
    }

    /// Run every node in topological order and return the sink outputs.
    ///
    /// Fails fast: the first node error stops the walk and is returned.
    /// Nodes must be pending; call [`reset`](Self::reset) before running the
    /// same graph again.
    pub fn execute<'a>(
        &'a self,
        context: &'a Context,
        initial_inputs: HashMap<NodeId, Value>,
    ) -> BoxFuture<'a, Result<HashMap<NodeId, Ports>>> {
        Box::pin(async move {
            if let Some(node) = self.nodes().find(|n| n.status() != NodeStatus::Pending) {
                return Err(EngineError::control(format!(
                    "Node {} is {:?}; reset the graph before executing it again",
                    node.id(),
                    node.status()
                )));
            }

            let order = self.topological_sort()?;
            tracing::debug!("Executing graph with {} nodes", order.len());

            let mut outputs: HashMap<NodeId, Ports> = initial_inputs
                .into_iter()
                .map(|(id, value)| (id, virtual_outputs(value)))
                .collect();

            for id in &order {
                let Some(node) = self.nodes.get(id) else {
                    continue;
                };

                if let Some(blocked) = self
                    .predecessors(id)
                    .into_iter()
                    .find(|p| self.nodes.get(p).map(|n| n.status()) != Some(NodeStatus::Success))
                {
                    return Err(EngineError::control(format!(
                        "Node {} is not ready: predecessor {} has not succeeded",
                        id, blocked
                    )));
                }

                let inputs = self.collect_inputs(id, &outputs)?;
                let result = node.execute(context, inputs).await?;
                outputs.insert(id.clone(), result);
            }

            let sinks = self
                .sink_nodes()
                .into_iter()
                .filter_map(|id| outputs.remove(&id).map(|ports| (id, ports)))
                .collect();
            Ok(sinks)
        })
    }
}

/// Pseudo-output of a virtual source: `{output: value}` plus, for an object
/// value, one port per field
pub fn virtual_outputs(value: Value) -> Ports {
    let mut ports = Ports::new();
    if let Value::Object(fields) = &value {
        for (key, field) in fields {
            ports.insert(key.clone(), field.clone());
        }
    }
    ports.insert(DEFAULT_OUTPUT.to_string(), value);
    ports
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop(id: &str) -> Node {
        Node::task(id, |v, _ctx| async move { Ok(v) })
    }

    fn chain(ids: &[&str]) -> NodeGraph {
        let mut graph = NodeGraph::new();
        for id in ids {
            graph.add_node(noop(id)).unwrap();
        }
        for pair in ids.windows(2) {
            graph
                .add_edge(Edge::new(format!("{}->{}", pair[0], pair[1]), pair[0], pair[1]))
                .unwrap();
        }
        graph
    }

    fn position(order: &[NodeId], id: &str) -> usize {
        order.iter().position(|n| n.as_str() == id).unwrap()
    }

    #[test]
    fn test_linear_order() {
        let graph = chain(&["step1", "step2", "step3"]);
        let order = graph.topological_sort().unwrap();

        assert_eq!(order.len(), 3);
        assert_eq!(order[0].as_str(), "step1");
        assert_eq!(order[1].as_str(), "step2");
        assert_eq!(order[2].as_str(), "step3");
    }

    #[test]
    fn test_order_respects_edges_and_declaration() {
        let mut graph = NodeGraph::new();
        for id in ["d", "b", "a", "c"] {
            graph.add_node(noop(id)).unwrap();
        }
        graph.add_edge(Edge::new("e1", "a", "d")).unwrap();
        graph.add_edge(Edge::new("e2", "b", "d")).unwrap();
        graph.add_edge(Edge::new("e3", "c", "b")).unwrap();

        let order = graph.topological_sort().unwrap();
        for edge in graph.edges() {
            assert!(position(&order, edge.source.as_str()) < position(&order, edge.target.as_str()));
        }

        // Unrelated roots keep declaration order
        assert!(position(&order, "a") < position(&order, "c"));
        assert_eq!(graph.topological_sort().unwrap(), order);
    }

    #[test]
    fn test_independent_nodes_follow_declaration_order() {
        let mut graph = NodeGraph::new();
        for id in ["x", "y", "z"] {
            graph.add_node(noop(id)).unwrap();
        }
        let order = graph.topological_sort().unwrap();
        let ids: Vec<&str> = order.iter().map(|n| n.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_duplicate_and_dangling_rejected() {
        let mut graph = chain(&["a", "b"]);

        assert!(matches!(graph.add_node(noop("a")), Err(EngineError::Structural(_))));
        assert!(matches!(
            graph.add_edge(Edge::new("e9", "a", "missing")),
            Err(EngineError::Structural(_))
        ));
        assert!(matches!(
            graph.add_edge(Edge::new("a->b", "a", "b")),
            Err(EngineError::Structural(_))
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = chain(&["step1", "step2"]);
        graph.add_edge(Edge::new("back", "step2", "step1")).unwrap();

        let validation = graph.validate();
        assert!(!validation.is_valid);
        assert!(validation.errors.iter().any(|e| e.contains("cycle")));

        let err = graph.topological_sort().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_valid_graph_validates() {
        let graph = chain(&["a", "b", "c"]);
        assert_eq!(graph.validate(), ValidationResult::valid());
    }

    #[test]
    fn test_remove_node_cascades_edges() {
        let mut graph = chain(&["a", "b", "c"]);

        assert!(graph.remove_node(&NodeId::new("b")));
        assert!(!graph.remove_node(&NodeId::new("b")));
        assert_eq!(graph.edges().count(), 0);
        assert!(graph.successors(&NodeId::new("a")).is_empty());
        assert!(graph.predecessors(&NodeId::new("c")).is_empty());
        assert_eq!(graph.sink_nodes().len(), 2);
        assert!(graph.validate().is_valid);
    }

    #[test]
    fn test_remove_edge_updates_adjacency() {
        let mut graph = chain(&["a", "b"]);
        let edge_id = EdgeId::new("a->b");

        assert!(graph.get_edge(&edge_id).is_some());
        assert!(graph.remove_edge(&edge_id));
        assert!(!graph.remove_edge(&edge_id));
        assert!(graph.get_edge(&edge_id).is_none());
        assert!(graph.outgoing_edges(&NodeId::new("a")).is_empty());
        assert_eq!(graph.entry_nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_execute_chain_returns_sink_outputs() {
        let mut graph = NodeGraph::new();
        graph
            .add_node(Node::task("A", |_v, _ctx| async move { Ok(json!(1)) }))
            .unwrap();
        graph
            .add_node(Node::task("B", |v, _ctx| async move {
                Ok(json!(v.as_i64().unwrap_or(0) * 2))
            }))
            .unwrap();
        graph
            .add_node(Node::task("C", |v, _ctx| async move { Ok(json!(v.to_string())) }))
            .unwrap();
        graph.add_edge(Edge::new("e1", "A", "B")).unwrap();
        graph.add_edge(Edge::new("e2", "B", "C")).unwrap();

        let ctx = Context::root("test");
        let sinks = graph.execute(&ctx, HashMap::new()).await.unwrap();

        assert_eq!(sinks.len(), 1);
        assert_eq!(sinks[&NodeId::new("C")], json!({"output": "2"}).as_object().cloned().unwrap());
    }

    #[tokio::test]
    async fn test_execute_with_virtual_input_and_transform() {
        let mut graph = NodeGraph::new();
        graph.add_input("request").unwrap();
        graph.add_node(noop("echo")).unwrap();
        graph
            .add_edge(
                Edge::new("e1", "request", "echo")
                    .from_port("size")
                    .with_transform(|v| Ok(json!(v.as_i64().unwrap_or(0) + 100))),
            )
            .unwrap();

        let mut initial = HashMap::new();
        initial.insert(NodeId::new("request"), json!({"size": 5}));

        let ctx = Context::root("test");
        let sinks = graph.execute(&ctx, initial).await.unwrap();
        assert_eq!(sinks[&NodeId::new("echo")].get("output"), Some(&json!(105)));
    }

    #[tokio::test]
    async fn test_condition_routes_data() {
        let mut graph = NodeGraph::new();
        graph.add_input("in").unwrap();
        graph
            .add_node(Node::predicate("check", |v, _ctx| Ok(v.as_i64().unwrap_or(0) >= 18)))
            .unwrap();
        graph
            .add_node(Node::task("adult", |v, _ctx| async move { Ok(json!(format!("adult:{}", v))) }))
            .unwrap();
        graph
            .add_node(Node::task("minor", |v, _ctx| async move { Ok(json!(format!("minor:{}", v))) }))
            .unwrap();
        graph.add_edge(Edge::new("e0", "in", "check")).unwrap();
        graph.add_edge(Edge::new("e1", "check", "adult").branch("true")).unwrap();
        graph.add_edge(Edge::new("e2", "check", "minor").branch("false")).unwrap();

        let mut initial = HashMap::new();
        initial.insert(NodeId::new("in"), json!(30));

        let ctx = Context::root("test");
        let sinks = graph.execute(&ctx, initial).await.unwrap();
        assert_eq!(sinks[&NodeId::new("adult")].get("output"), Some(&json!("adult:30")));
        assert_eq!(sinks[&NodeId::new("minor")].get("output"), Some(&json!("minor:null")));
    }

    #[tokio::test]
    async fn test_execute_fails_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = NodeGraph::new();
        graph
            .add_node(Node::task("first", |_v, _ctx| async move { anyhow::bail!("nope") }))
            .unwrap();
        let c = calls.clone();
        graph
            .add_node(Node::task("second", move |v, _ctx| {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok(v) }
            }))
            .unwrap();
        graph.add_edge(Edge::new("e1", "first", "second")).unwrap();

        let ctx = Context::root("test");
        let err = graph.execute(&ctx, HashMap::new()).await.unwrap_err();

        assert_eq!(err.node_id(), Some(&NodeId::new("first")));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            graph.get_node(&NodeId::new("first")).unwrap().status(),
            NodeStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_reexecution_requires_reset() {
        let graph = chain(&["a", "b"]);
        let ctx = Context::root("test");

        graph.execute(&ctx, HashMap::new()).await.unwrap();
        assert!(matches!(
            graph.execute(&ctx, HashMap::new()).await,
            Err(EngineError::Control(_))
        ));

        graph.reset();
        assert!(graph.execute(&ctx, HashMap::new()).await.is_ok());
    }

    #[test]
    fn test_virtual_outputs_expose_fields() {
        let ports = virtual_outputs(json!({"a": 1}));
        assert_eq!(ports.get("a"), Some(&json!(1)));
        assert_eq!(ports.get("output"), Some(&json!({"a": 1})));

        let ports = virtual_outputs(json!(7));
        assert_eq!(ports.len(), 1);
    }
}
