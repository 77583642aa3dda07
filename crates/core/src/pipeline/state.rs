use crate::types::{NodeId, NodeStatus, PipelineId, PipelineStatus, Ports};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Execution state of one pipeline.
///
/// A node only appears in `results` once it reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub id: PipelineId,
    pub status: PipelineStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub node_status: HashMap<NodeId, NodeStatus>,
    pub results: HashMap<NodeId, Ports>,
    #[serde(default)]
    pub errors: HashMap<NodeId, String>,
}

impl PipelineState {
    pub fn new<'a>(id: PipelineId, nodes: impl IntoIterator<Item = &'a NodeId>) -> Self {
        Self {
            id,
            status: PipelineStatus::Pending,
            started_at: None,
            ended_at: None,
            node_status: nodes
                .into_iter()
                .map(|n| (n.clone(), NodeStatus::Pending))
                .collect(),
            results: HashMap::new(),
            errors: HashMap::new(),
        }
    }

    pub fn status_of(&self, id: &NodeId) -> NodeStatus {
        self.node_status.get(id).copied().unwrap_or_default()
    }

    pub fn result_of(&self, id: &NodeId) -> Option<&Ports> {
        self.results.get(id)
    }

    pub fn mark_running(&mut self, id: &NodeId) {
        self.node_status.insert(id.clone(), NodeStatus::Running);
        self.errors.remove(id);
    }

    pub fn record_success(&mut self, id: &NodeId, outputs: Ports) {
        self.node_status.insert(id.clone(), NodeStatus::Success);
        self.results.insert(id.clone(), outputs);
        self.errors.remove(id);
    }

    pub fn record_failure(&mut self, id: &NodeId, error: String) {
        self.node_status.insert(id.clone(), NodeStatus::Failed);
        self.results.remove(id);
        self.errors.insert(id.clone(), error);
    }

    pub fn record_skip(&mut self, id: &NodeId, reason: &str) {
        let mut marker = Ports::new();
        marker.insert("skipped".to_string(), Value::Bool(true));
        marker.insert("reason".to_string(), Value::String(reason.to_string()));

        self.node_status.insert(id.clone(), NodeStatus::Skipped);
        self.results.insert(id.clone(), marker);
        self.errors.remove(id);
    }

    /// Forget everything recorded about a node
    pub fn clear_node(&mut self, id: &NodeId) {
        self.node_status.insert(id.clone(), NodeStatus::Pending);
        self.results.remove(id);
        self.errors.remove(id);
    }

    /// Share of nodes in a terminal status; 0 for an empty pipeline
    pub fn progress(&self) -> f64 {
        if self.node_status.is_empty() {
            return 0.0;
        }
        let done = self
            .node_status
            .values()
            .filter(|s| s.is_terminal())
            .count();
        done as f64 / self.node_status.len() as f64
    }

    /// Outputs of nodes that succeeded
    pub fn successful_outputs(&self) -> HashMap<NodeId, Ports> {
        self.results
            .iter()
            .filter(|(id, _)| self.status_of(id) == NodeStatus::Success)
            .map(|(id, ports)| (id.clone(), ports.clone()))
            .collect()
    }
}
