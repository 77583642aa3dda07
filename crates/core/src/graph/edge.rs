use crate::types::{EdgeId, NodeId, DEFAULT_INPUT, DEFAULT_OUTPUT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// How an edge delivers values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Plain,
    /// Carries a condition branch; an undefined source port delivers nothing
    Conditional,
    /// Marks one of several edges fanning a value out to parallel consumers.
    /// Metadata only: delivery is the same as [`EdgeKind::Plain`], and
    /// parallelism comes from concurrent nodes or from stepping several ready
    /// nodes at once.
    Parallel,
}

pub type Transform = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;
pub type Activation = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Directed data dependency between two node ports
#[derive(Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub source_port: String,
    pub target: NodeId,
    pub target_port: String,
    pub kind: EdgeKind,
    transform: Option<Transform>,
    predicate: Option<Activation>,
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("id", &self.id)
            .field("source", &format!("{}.{}", self.source, self.source_port))
            .field("target", &format!("{}.{}", self.target, self.target_port))
            .field("kind", &self.kind)
            .field("transform", &self.transform.is_some())
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Edge {
    /// Edge on the default ports (`output` -> `input`)
    pub fn new(id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: EdgeId::new(id),
            source: source.into(),
            source_port: DEFAULT_OUTPUT.to_string(),
            target: target.into(),
            target_port: DEFAULT_INPUT.to_string(),
            kind: EdgeKind::Plain,
            transform: None,
            predicate: None,
        }
    }

    pub fn from_port(mut self, port: impl Into<String>) -> Self {
        self.source_port = port.into();
        self
    }

    pub fn to_port(mut self, port: impl Into<String>) -> Self {
        self.target_port = port.into();
        self
    }

    pub fn with_kind(mut self, kind: EdgeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Route a condition branch: reads `branch` and marks the edge conditional
    pub fn branch(self, branch: impl Into<String>) -> Self {
        self.from_port(branch).with_kind(EdgeKind::Conditional)
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Only deliver values for which `predicate` holds
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Value to hand to the target, or `None` if the edge stays inactive
    pub fn deliver(&self, value: Option<&Value>) -> anyhow::Result<Option<Value>> {
        let value = match value {
            Some(Value::Null) if self.kind == EdgeKind::Conditional => return Ok(None),
            Some(value) => value.clone(),
            None => return Ok(None),
        };

        if let Some(predicate) = &self.predicate {
            if !predicate(&value) {
                return Ok(None);
            }
        }

        match &self.transform {
            Some(transform) => transform(value).map(Some),
            None => Ok(Some(value)),
        }
    }
}
