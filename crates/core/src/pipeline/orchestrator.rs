use super::gate::RunGate;
use super::state::PipelineState;
use crate::config::PipelineConfig;
use crate::context::Context;
use crate::error::{EngineError, Result};
use crate::events::{Event, EventEmitter, EventType};
use crate::graph::{virtual_outputs, NodeGraph};
use crate::storage::StateManager;
use crate::types::{NodeId, NodeStatus, PipelineId, PipelineStatus, Ports};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// Outcome of executing a single node through the step API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub node_id: NodeId,
    pub result: Ports,
}

enum WalkOutcome {
    Completed,
    Stopped,
}

/// Run-control wrapper around a [`NodeGraph`].
///
/// All methods take `&self`; share the pipeline behind an `Arc` to pause,
/// stop or observe it from other tasks while [`execute`](Self::execute) runs.
pub struct Pipeline {
    config: PipelineConfig,
    graph: NodeGraph,
    context: Context,
    events: Arc<EventEmitter>,
    state: RwLock<PipelineState>,
    gate: RunGate,
    state_manager: Option<StateManager>,
    initial_inputs: HashMap<NodeId, Value>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        graph: NodeGraph,
        context: Context,
        events: Arc<EventEmitter>,
    ) -> Result<Self> {
        config.validate()?;

        let validation = graph.validate();
        if !validation.is_valid {
            return Err(EngineError::structural(validation.errors.join("; ")));
        }

        if config.max_concurrency.is_some() || config.timeout_ms.is_some() || config.auto_retry {
            tracing::debug!(
                "Pipeline {} carries advisory limits (max_concurrency={:?}, timeout_ms={:?}, auto_retry={}) that are not enforced",
                config.id,
                config.max_concurrency,
                config.timeout_ms,
                config.auto_retry
            );
        }

        let state = PipelineState::new(config.id.clone(), graph.node_ids());

        Ok(Self {
            config,
            graph,
            context,
            events,
            state: RwLock::new(state),
            gate: RunGate::new(),
            state_manager: None,
            initial_inputs: HashMap::new(),
        })
    }

    /// Attach persistence used by checkpoints and [`restore_state`](Self::restore_state)
    pub fn with_state_manager(mut self, state_manager: StateManager) -> Self {
        self.state_manager = Some(state_manager);
        self
    }

    /// Values for the graph's virtual inputs
    pub fn with_initial_inputs(mut self, inputs: HashMap<NodeId, Value>) -> Self {
        self.initial_inputs = inputs;
        self
    }

    pub fn with_input(mut self, id: impl Into<NodeId>, value: Value) -> Self {
        self.initial_inputs.insert(id.into(), value);
        self
    }

    pub fn id(&self) -> &PipelineId {
        &self.config.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PipelineState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PipelineState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current execution state
    pub fn state(&self) -> PipelineState {
        self.read_state().clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.read_state().status
    }

    pub fn node_status(&self, id: &NodeId) -> NodeStatus {
        self.read_state().status_of(id)
    }

    pub fn node_result(&self, id: &NodeId) -> Option<Ports> {
        self.read_state().result_of(id).cloned()
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.gate.is_stopped()
    }

    fn emit(&self, event_type: EventType) {
        self.events.emit(Event::new(self.config.id.clone(), event_type));
    }

    fn require_node(&self, id: &NodeId) -> Result<()> {
        if self.graph.contains_node(id) {
            Ok(())
        } else {
            Err(EngineError::control(format!(
                "Node {} does not exist in pipeline {}",
                id, self.config.id
            )))
        }
    }

    /// Run the whole graph in topological order.
    ///
    /// Nodes that are skipped or already succeeded are left alone, and a node
    /// whose predecessors have not all succeeded stays pending, exactly as in
    /// [`get_executable_nodes`](Self::get_executable_nodes). The pause gate and
    /// stop flag are checked before every node. Returns the outputs of sink
    /// nodes that succeeded.
    pub async fn execute(&self) -> Result<HashMap<NodeId, Ports>> {
        {
            let mut state = self.write_state();
            if state.status == PipelineStatus::Running {
                return Err(EngineError::control(format!(
                    "Pipeline {} is already running",
                    self.config.id
                )));
            }
            self.gate.reset();
            state.status = PipelineStatus::Running;
            state.started_at = Some(chrono::Utc::now());
            state.ended_at = None;
        }

        tracing::info!("Starting pipeline execution: pipeline_id={}", self.config.id);
        self.emit(EventType::PipelineStart {
            node_count: self.graph.len(),
        });

        let started = Instant::now();
        let outcome = self.walk().await;

        match outcome {
            Ok(WalkOutcome::Completed) => {
                self.finish(PipelineStatus::Success, None, started).await;
                tracing::info!("Pipeline execution completed: pipeline_id={}", self.config.id);
                Ok(self.sink_outputs())
            }
            Ok(WalkOutcome::Stopped) => {
                self.emit(EventType::PipelineStop);
                self.finish(PipelineStatus::Cancelled, None, started).await;
                tracing::warn!("Pipeline execution stopped: pipeline_id={}", self.config.id);
                Ok(self.sink_outputs())
            }
            Err(e) => {
                self.finish(PipelineStatus::Failed, Some(e.to_string()), started)
                    .await;
                tracing::error!(
                    "Pipeline execution failed: pipeline_id={}, error={}",
                    self.config.id,
                    e
                );
                Err(e)
            }
        }
    }

    async fn walk(&self) -> Result<WalkOutcome> {
        let order = self.graph.topological_sort()?;

        for id in &order {
            if !self.gate.wait().await {
                return Ok(WalkOutcome::Stopped);
            }

            let status = self.node_status(id);
            if matches!(status, NodeStatus::Skipped | NodeStatus::Success) {
                tracing::debug!("Not executing node {}: already {:?}", id, status);
                continue;
            }

            let blocked = {
                let state = self.read_state();
                self.blocking_predecessor(&state, id)
            };
            if let Some(blocked) = blocked {
                tracing::debug!(
                    "Leaving node {} pending: predecessor {} is {:?}",
                    id,
                    blocked,
                    self.node_status(&blocked)
                );
                continue;
            }

            self.run_node(id).await?;
        }

        Ok(WalkOutcome::Completed)
    }

    async fn finish(&self, status: PipelineStatus, error: Option<String>, started: Instant) {
        {
            let mut state = self.write_state();
            state.status = status;
            state.ended_at = Some(chrono::Utc::now());
            self.gate.reset();
        }

        self.emit(EventType::PipelineEnd {
            status,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self.checkpoint().await;
    }

    /// Outputs produced so far, including virtual inputs
    fn available_outputs(&self) -> HashMap<NodeId, Ports> {
        let mut outputs = self.read_state().successful_outputs();
        for (id, value) in &self.initial_inputs {
            outputs.insert(id.clone(), virtual_outputs(value.clone()));
        }
        outputs
    }

    fn sink_outputs(&self) -> HashMap<NodeId, Ports> {
        let state = self.read_state();
        self.graph
            .sink_nodes()
            .into_iter()
            .filter(|id| state.status_of(id) == NodeStatus::Success)
            .filter_map(|id| state.result_of(&id).cloned().map(|ports| (id, ports)))
            .collect()
    }

    /// Execute one node and record the outcome
    async fn run_node(&self, id: &NodeId) -> Result<Ports> {
        let node = self.graph.get_node(id).ok_or_else(|| {
            EngineError::control(format!("Node {} does not exist in pipeline {}", id, self.config.id))
        })?;

        self.write_state().mark_running(id);
        self.emit(EventType::TaskStart { node_id: id.clone() });
        tracing::debug!("Executing node {} in pipeline {}", id, self.config.id);

        let started = Instant::now();
        let result = match self.graph.collect_inputs(id, &self.available_outputs()) {
            Ok(inputs) => node.execute(&self.context, inputs).await,
            Err(e) => {
                node.set_status(NodeStatus::Failed);
                Err(e)
            }
        };

        match result {
            Ok(outputs) => {
                self.write_state().record_success(id, outputs.clone());
                self.emit(EventType::TaskEnd {
                    node_id: id.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                self.checkpoint().await;
                Ok(outputs)
            }
            Err(e) => {
                self.write_state().record_failure(id, e.to_string());
                self.emit(EventType::TaskFailed {
                    node_id: id.clone(),
                    error: e.to_string(),
                    skipped: false,
                });
                self.checkpoint().await;
                Err(e)
            }
        }
    }

    /// Pause before the next node. Only effective while running.
    pub fn pause(&self) -> bool {
        if self.status() != PipelineStatus::Running || !self.gate.pause() {
            return false;
        }
        tracing::info!("Pipeline paused: pipeline_id={}", self.config.id);
        self.emit(EventType::PipelinePause);
        true
    }

    /// Release a pause. Only effective while running.
    pub fn resume(&self) -> bool {
        if self.status() != PipelineStatus::Running || !self.gate.resume() {
            return false;
        }
        tracing::info!("Pipeline resumed: pipeline_id={}", self.config.id);
        self.emit(EventType::PipelineResume);
        true
    }

    /// End the current run before the next node. Only effective while running.
    pub fn stop(&self) -> bool {
        if self.status() != PipelineStatus::Running {
            return false;
        }
        tracing::info!("Stop requested for pipeline {}", self.config.id);
        self.gate.stop();
        true
    }

    /// First predecessor of `id` that has not succeeded
    fn blocking_predecessor(&self, state: &PipelineState, id: &NodeId) -> Option<NodeId> {
        self.graph
            .predecessors(id)
            .into_iter()
            .find(|p| state.status_of(p) != NodeStatus::Success)
    }

    /// Pending nodes whose predecessors all succeeded, in declaration order
    pub fn get_executable_nodes(&self) -> Vec<NodeId> {
        let state = self.read_state();
        self.graph
            .node_ids()
            .iter()
            .filter(|id| state.status_of(id) == NodeStatus::Pending)
            .filter(|id| self.blocking_predecessor(&state, id).is_none())
            .cloned()
            .collect()
    }

    pub fn get_next_node(&self) -> Option<NodeId> {
        self.get_executable_nodes().into_iter().next()
    }

    /// Execute the next ready node, if any
    pub async fn next(&self) -> Result<Option<StepResult>> {
        let Some(node_id) = self.get_next_node() else {
            return Ok(None);
        };
        let result = self.run_node(&node_id).await?;
        Ok(Some(StepResult { node_id, result }))
    }

    /// Execute up to `count` ready nodes, stopping early when none is ready
    pub async fn step(&self, count: usize) -> Result<Vec<StepResult>> {
        let mut steps = Vec::with_capacity(count);
        for _ in 0..count {
            match self.next().await? {
                Some(step) => steps.push(step),
                None => break,
            }
        }
        Ok(steps)
    }

    /// Step until `node_id` has a recorded result
    pub async fn execute_until(&self, node_id: &NodeId) -> Result<Ports> {
        self.require_node(node_id)?;

        loop {
            if let Some(result) = self.node_result(node_id) {
                return Ok(result);
            }
            match self.next().await? {
                Some(step) if &step.node_id == node_id => return Ok(step.result),
                Some(_) => {}
                None => {
                    return Err(EngineError::control(format!(
                        "Execution exhausted before node {} produced a result",
                        node_id
                    )))
                }
            }
        }
    }

    /// Step while `predicate` holds for the current state
    pub async fn execute_while<F>(&self, predicate: F) -> Result<Vec<StepResult>>
    where
        F: Fn(&PipelineState) -> bool,
    {
        let mut steps = Vec::new();
        while predicate(&self.state()) {
            match self.next().await? {
                Some(step) => steps.push(step),
                None => break,
            }
        }
        Ok(steps)
    }

    /// Permanently skip a node; later runs never invoke its executor
    pub async fn skip_node(&self, node_id: &NodeId, reason: &str) -> Result<()> {
        self.require_node(node_id)?;

        if let Some(node) = self.graph.get_node(node_id) {
            node.set_status(NodeStatus::Skipped);
        }
        self.write_state().record_skip(node_id, reason);
        tracing::info!("Skipped node {}: {}", node_id, reason);

        self.emit(EventType::TaskFailed {
            node_id: node_id.clone(),
            error: reason.to_string(),
            skipped: true,
        });
        self.checkpoint().await;
        Ok(())
    }

    /// Clear a node's recorded outcome and execute it once more
    pub async fn retry_node(&self, node_id: &NodeId) -> Result<Ports> {
        self.require_node(node_id)?;

        self.write_state().clear_node(node_id);
        if let Some(node) = self.graph.get_node(node_id) {
            node.reset();
        }
        tracing::info!("Retrying node {} in pipeline {}", node_id, self.config.id);

        self.run_node(node_id).await
    }

    /// Share of nodes that succeeded, failed or were skipped
    pub fn get_progress(&self) -> f64 {
        self.read_state().progress()
    }

    fn wait_expired(&self, started: Instant, what: &str) -> Result<()> {
        match self.config.wait_timeout() {
            Some(limit) if started.elapsed() >= limit => Err(EngineError::control(format!(
                "Timed out after {:?} waiting for {}",
                limit, what
            ))),
            _ => Ok(()),
        }
    }

    /// Poll until `node_id` has a result. A failed node ends the wait with its error.
    pub async fn wait_for_node(&self, node_id: &NodeId) -> Result<Ports> {
        self.require_node(node_id)?;
        let started = Instant::now();

        loop {
            let (status, result, error) = {
                let state = self.read_state();
                (
                    state.status_of(node_id),
                    state.result_of(node_id).cloned(),
                    state.errors.get(node_id).cloned(),
                )
            };

            if let Some(result) = result {
                return Ok(result);
            }
            if status == NodeStatus::Failed {
                return Err(EngineError::node(
                    node_id,
                    error.unwrap_or_else(|| "Unknown error".to_string()),
                ));
            }

            self.wait_expired(started, &format!("node {}", node_id))?;
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Poll until the pipeline leaves the running status
    pub async fn wait_for_completion(&self) -> Result<PipelineStatus> {
        let started = Instant::now();

        loop {
            let status = self.status();
            if status != PipelineStatus::Running {
                return Ok(status);
            }

            self.wait_expired(started, &format!("pipeline {}", self.config.id))?;
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Return the pipeline and every node to pending
    pub fn reset(&self) -> Result<()> {
        let mut state = self.write_state();
        if state.status == PipelineStatus::Running {
            return Err(EngineError::control(format!(
                "Cannot reset pipeline {} while it is running",
                self.config.id
            )));
        }

        self.graph.reset();
        *state = PipelineState::new(self.config.id.clone(), self.graph.node_ids());
        self.gate.reset();
        Ok(())
    }

    fn require_state_manager(&self) -> Result<&StateManager> {
        self.state_manager.as_ref().ok_or_else(|| {
            EngineError::control(format!(
                "Pipeline {} has no state manager attached",
                self.config.id
            ))
        })
    }

    async fn checkpoint(&self) {
        if !self.config.persist_state || self.state_manager.is_none() {
            return;
        }
        if let Err(e) = self.save_state().await {
            tracing::warn!("Failed to checkpoint pipeline {}: {}", self.config.id, e);
        }
    }

    /// Persist the current state under the pipeline's state key
    pub async fn save_state(&self) -> Result<()> {
        let manager = self.require_state_manager()?;
        let state = self.state();
        manager.save_as(&self.config.state_key(), &state).await
    }

    /// Load a previously persisted state.
    ///
    /// Returns false when nothing was persisted. A state captured mid-run is
    /// restored as not running, with in-flight nodes back to pending.
    pub async fn restore_state(&self) -> Result<bool> {
        let manager = self.require_state_manager()?;
        let Some(mut restored) = manager
            .load_as::<PipelineState>(&self.config.state_key())
            .await?
        else {
            return Ok(false);
        };

        if restored.id != self.config.id {
            return Err(EngineError::StateIo(format!(
                "Persisted state belongs to pipeline {}, not {}",
                restored.id, self.config.id
            )));
        }

        if restored.status == PipelineStatus::Running {
            restored.status = PipelineStatus::Pending;
        }
        for id in self.graph.node_ids() {
            let status = restored.node_status.entry(id.clone()).or_default();
            if *status == NodeStatus::Running {
                *status = NodeStatus::Pending;
            }
        }
        restored
            .node_status
            .retain(|id, _| self.graph.contains_node(id));
        let node_status = &restored.node_status;
        restored
            .results
            .retain(|id, _| node_status.get(id).is_some_and(|s| s.is_terminal()));

        {
            let mut state = self.write_state();
            if state.status == PipelineStatus::Running {
                return Err(EngineError::control(format!(
                    "Cannot restore pipeline {} while it is running",
                    self.config.id
                )));
            }
            for node in self.graph.nodes() {
                node.set_status(restored.status_of(node.id()));
            }
            *state = restored;
        }

        tracing::info!("Restored state for pipeline {}", self.config.id);
        Ok(true)
    }

    /// Remove the persisted state, returning whether it existed
    pub async fn clear_persisted_state(&self) -> Result<bool> {
        let manager = self.require_state_manager()?;
        manager.remove(&self.config.state_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::graph::{Edge, Node};
    use crate::storage::{MemoryStateStore, StateStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    fn increment(name: &str) -> Node {
        Node::task(name, |v, _ctx| async move { Ok(json!(v.as_i64().unwrap_or(0) + 1)) })
    }

    fn counted(name: &str, calls: Arc<AtomicUsize>) -> Node {
        Node::task(name, move |v, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(v.as_i64().unwrap_or(0) + 1))
            }
        })
    }

    /// Increment task that waits for `gate` before finishing
    fn blocking(name: &str, gate: Arc<Notify>) -> Node {
        Node::task(name, move |v, _ctx| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(json!(v.as_i64().unwrap_or(0) + 1))
            }
        })
    }

    fn flaky(name: &str, calls: Arc<AtomicUsize>) -> Node {
        Node::task(name, move |v, _ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("boom");
                }
                Ok(json!(v.as_i64().unwrap_or(0) + 1))
            }
        })
    }

    fn chain(nodes: Vec<Node>) -> NodeGraph {
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id().clone()).collect();
        let mut graph = NodeGraph::new();
        for node in nodes {
            graph.add_node(node).unwrap();
        }
        for pair in ids.windows(2) {
            graph
                .add_edge(Edge::new(format!("{}->{}", pair[0], pair[1]), pair[0].clone(), pair[1].clone()))
                .unwrap();
        }
        graph
    }

    fn config() -> PipelineConfig {
        PipelineConfig::new("test").with_poll_interval(Duration::from_millis(5))
    }

    fn pipeline_with(config: PipelineConfig, graph: NodeGraph) -> Pipeline {
        Pipeline::new(
            config,
            graph,
            Context::root("test"),
            Arc::new(EventEmitter::default()),
        )
        .unwrap()
    }

    fn pipeline(graph: NodeGraph) -> Pipeline {
        pipeline_with(config(), graph)
    }

    fn record_events(pipeline: &Pipeline) -> Arc<Mutex<Vec<Event>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        pipeline
            .events()
            .on_any(move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    fn kinds(seen: &Mutex<Vec<Event>>) -> Vec<EventKind> {
        seen.lock().unwrap().iter().map(|e| e.kind()).collect()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_rejects_invalid_graph_and_config() {
        let mut graph = chain(vec![increment("a"), increment("b")]);
        graph.add_edge(Edge::new("b->a", "b", "a")).unwrap();
        let err = Pipeline::new(
            config(),
            graph,
            Context::root("test"),
            Arc::new(EventEmitter::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Structural(_)));

        let err = Pipeline::new(
            PipelineConfig::new(""),
            NodeGraph::new(),
            Context::root("test"),
            Arc::new(EventEmitter::default()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Control(_)));
    }

    #[tokio::test]
    async fn test_execute_chain() {
        let mut graph = chain(vec![increment("a"), increment("b"), increment("c")]);
        graph.add_input("seed").unwrap();
        graph.add_edge(Edge::new("seed->a", "seed", "a")).unwrap();

        let pipeline = pipeline(graph).with_input("seed", json!(10));
        let seen = record_events(&pipeline);

        let outputs = pipeline.execute().await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[&id("c")]["output"], json!(13));

        assert_eq!(pipeline.status(), PipelineStatus::Success);
        assert_eq!(pipeline.get_progress(), 1.0);
        assert_eq!(pipeline.node_result(&id("a")).unwrap()["output"], json!(11));

        let state = pipeline.state();
        assert!(state.started_at.is_some());
        assert!(state.ended_at.is_some());

        assert_eq!(
            kinds(&seen),
            vec![
                EventKind::PipelineStart,
                EventKind::TaskStart,
                EventKind::TaskEnd,
                EventKind::TaskStart,
                EventKind::TaskEnd,
                EventKind::TaskStart,
                EventKind::TaskEnd,
                EventKind::PipelineEnd,
            ]
        );
        let events = seen.lock().unwrap();
        assert!(events.iter().all(|e| e.pipeline_id == PipelineId::new("test")));
        assert!(matches!(
            events[0].event_type,
            EventType::PipelineStart { node_count: 3 }
        ));
    }

    #[tokio::test]
    async fn test_failure_fails_fast() {
        let c_calls = Arc::new(AtomicUsize::new(0));
        let failing = Node::task("b", |_v, _ctx| async move {
            Err::<Value, _>(anyhow::anyhow!("boom"))
        });
        let graph = chain(vec![increment("a"), failing, counted("c", c_calls.clone())]);
        let pipeline = pipeline(graph);
        let seen = record_events(&pipeline);

        let err = pipeline.execute().await.unwrap_err();
        assert_eq!(err.node_id(), Some(&id("b")));

        assert_eq!(pipeline.status(), PipelineStatus::Failed);
        assert_eq!(pipeline.node_status(&id("a")), NodeStatus::Success);
        assert_eq!(pipeline.node_status(&id("b")), NodeStatus::Failed);
        assert_eq!(pipeline.node_status(&id("c")), NodeStatus::Pending);
        assert_eq!(c_calls.load(Ordering::SeqCst), 0);
        assert!(pipeline.state().errors[&id("b")].contains("boom"));
        assert!(pipeline.node_result(&id("b")).is_none());

        assert!(kinds(&seen).contains(&EventKind::TaskFailed));
        let events = seen.lock().unwrap();
        match &events.last().unwrap().event_type {
            EventType::PipelineEnd { status, error, .. } => {
                assert_eq!(*status, PipelineStatus::Failed);
                assert!(error.as_deref().unwrap().contains("boom"));
            }
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_after_failure() {
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let graph = chain(vec![
            counted("a", a_calls.clone()),
            flaky("b", b_calls.clone()),
            increment("c"),
        ]);
        let pipeline = pipeline(graph);

        assert!(pipeline.execute().await.is_err());
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);

        let result = pipeline.retry_node(&id("b")).await.unwrap();
        assert_eq!(result["output"], json!(2));
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.node_status(&id("b")), NodeStatus::Success);
        assert!(pipeline.state().errors.is_empty());

        let outputs = pipeline.execute().await.unwrap();
        assert_eq!(outputs[&id("c")]["output"], json!(3));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
        assert_eq!(pipeline.status(), PipelineStatus::Success);
    }

    #[tokio::test]
    async fn test_skip_node() {
        let b_calls = Arc::new(AtomicUsize::new(0));
        let graph = chain(vec![increment("a"), counted("b", b_calls.clone()), increment("c")]);
        let pipeline = pipeline(graph);
        let seen = record_events(&pipeline);

        pipeline.skip_node(&id("b"), "manual").await.unwrap();
        assert_eq!(
            Value::Object(pipeline.node_result(&id("b")).unwrap()),
            json!({"skipped": true, "reason": "manual"})
        );

        let outputs = pipeline.execute().await.unwrap();
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.node_status(&id("b")), NodeStatus::Skipped);
        // c depends on the skipped node, so it never becomes ready
        assert_eq!(pipeline.node_status(&id("c")), NodeStatus::Pending);
        assert!(outputs.is_empty());
        assert_eq!(pipeline.status(), PipelineStatus::Success);

        let first = seen.lock().unwrap()[0].clone();
        assert!(matches!(
            &first.event_type,
            EventType::TaskFailed { skipped: true, error, .. } if error == "manual"
        ));

        assert!(matches!(
            pipeline.skip_node(&id("ghost"), "x").await,
            Err(EngineError::Control(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_and_step_agree_around_skipped_nodes() {
        // a -> b -> c, plus an independent d
        let build = || {
            let mut graph = chain(vec![increment("a"), increment("b"), increment("c")]);
            graph.add_node(increment("d")).unwrap();
            graph
        };

        let walked = pipeline(build());
        walked.skip_node(&id("b"), "manual").await.unwrap();
        walked.execute().await.unwrap();

        let stepped = pipeline(build());
        stepped.skip_node(&id("b"), "manual").await.unwrap();
        stepped.step(10).await.unwrap();

        for node in ["a", "b", "c", "d"] {
            assert_eq!(
                walked.node_status(&id(node)),
                stepped.node_status(&id(node)),
                "node {}",
                node
            );
        }
        assert_eq!(walked.node_status(&id("c")), NodeStatus::Pending);
        assert_eq!(walked.node_status(&id("d")), NodeStatus::Success);
        assert_eq!(walked.get_progress(), stepped.get_progress());
    }

    #[tokio::test]
    async fn test_resume_after_run_ended_is_rejected() {
        let release = Arc::new(Notify::new());
        let pipeline = Arc::new(pipeline(chain(vec![blocking("a", release.clone())])));
        let seen = record_events(&pipeline);

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.execute().await })
        };
        wait_until(|| pipeline.node_status(&id("a")) == NodeStatus::Running).await;

        // The last node is already past the gate, so the run still finishes
        assert!(pipeline.pause());
        release.notify_one();
        run.await.unwrap().unwrap();

        assert_eq!(pipeline.status(), PipelineStatus::Success);
        assert!(!pipeline.is_paused());
        assert!(!pipeline.resume());
        assert!(!kinds(&seen).contains(&EventKind::PipelineResume));
    }

    #[tokio::test]
    async fn test_stop_right_after_start_is_honoured() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(pipeline(chain(vec![counted("a", calls.clone())])));

        let handle = Arc::downgrade(&pipeline);
        pipeline.events().on(EventKind::PipelineStart, move |_| {
            if let Some(pipeline) = handle.upgrade() {
                assert!(pipeline.stop());
            }
        });

        pipeline.execute().await.unwrap();
        assert_eq!(pipeline.status(), PipelineStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!pipeline.is_stop_requested());
    }

    #[tokio::test]
    async fn test_reentrant_execute_rejected() {
        let release = Arc::new(Notify::new());
        let graph = chain(vec![blocking("a", release.clone()), increment("b")]);
        let pipeline = Arc::new(pipeline(graph));

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.execute().await })
        };
        wait_until(|| pipeline.node_status(&id("a")) == NodeStatus::Running).await;

        let before = pipeline.state();
        let err = pipeline.execute().await.unwrap_err();
        assert!(matches!(err, EngineError::Control(_)));
        assert_eq!(pipeline.state(), before);
        assert!(matches!(pipeline.reset(), Err(EngineError::Control(_))));

        release.notify_one();
        run.await.unwrap().unwrap();
        assert_eq!(pipeline.status(), PipelineStatus::Success);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let release = Arc::new(Notify::new());
        let graph = chain(vec![blocking("a", release.clone()), increment("b")]);
        let pipeline = Arc::new(pipeline(graph));
        let seen = record_events(&pipeline);

        assert!(!pipeline.pause());
        assert!(!pipeline.resume());

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.execute().await })
        };
        wait_until(|| pipeline.node_status(&id("a")) == NodeStatus::Running).await;

        assert!(pipeline.pause());
        assert!(!pipeline.pause());
        assert!(pipeline.is_paused());
        release.notify_one();

        wait_until(|| pipeline.node_status(&id("a")) == NodeStatus::Success).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pipeline.node_status(&id("b")), NodeStatus::Pending);
        assert_eq!(pipeline.status(), PipelineStatus::Running);

        assert!(pipeline.resume());
        assert_eq!(
            pipeline.wait_for_completion().await.unwrap(),
            PipelineStatus::Success
        );
        run.await.unwrap().unwrap();

        let kinds = kinds(&seen);
        let pause = kinds.iter().position(|k| *k == EventKind::PipelinePause).unwrap();
        let resume = kinds.iter().position(|k| *k == EventKind::PipelineResume).unwrap();
        assert!(pause < resume);
    }

    #[tokio::test]
    async fn test_stop_cancels_run() {
        let release = Arc::new(Notify::new());
        let b_calls = Arc::new(AtomicUsize::new(0));
        let graph = chain(vec![blocking("a", release.clone()), counted("b", b_calls.clone())]);
        let pipeline = Arc::new(pipeline(graph));
        let seen = record_events(&pipeline);

        assert!(!pipeline.stop());

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.execute().await })
        };
        wait_until(|| pipeline.node_status(&id("a")) == NodeStatus::Running).await;

        assert!(pipeline.stop());
        assert!(pipeline.is_stop_requested());
        release.notify_one();
        run.await.unwrap().unwrap();

        assert_eq!(pipeline.status(), PipelineStatus::Cancelled);
        assert_eq!(pipeline.node_status(&id("a")), NodeStatus::Success);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        let kinds = kinds(&seen);
        let n = kinds.len();
        assert_eq!(&kinds[n - 2..], &[EventKind::PipelineStop, EventKind::PipelineEnd]);

        // A new run picks up where the stopped one ended
        pipeline.execute().await.unwrap();
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.status(), PipelineStatus::Success);
    }

    #[tokio::test]
    async fn test_step_api() {
        let pipeline = pipeline(chain(vec![increment("a"), increment("b"), increment("c")]));

        assert_eq!(pipeline.get_executable_nodes(), vec![id("a")]);
        assert_eq!(pipeline.get_next_node(), Some(id("a")));

        let first = pipeline.next().await.unwrap().unwrap();
        assert_eq!(first.node_id, id("a"));
        assert_eq!(first.result["output"], json!(1));
        assert_eq!(pipeline.get_executable_nodes(), vec![id("b")]);

        let steps = pipeline.step(5).await.unwrap();
        assert_eq!(
            steps.iter().map(|s| s.node_id.clone()).collect::<Vec<_>>(),
            vec![id("b"), id("c")]
        );
        assert!(pipeline.next().await.unwrap().is_none());
        assert!(pipeline.get_next_node().is_none());
        assert_eq!(pipeline.get_progress(), 1.0);
    }

    #[tokio::test]
    async fn test_execute_until_and_while() {
        let pipeline = pipeline(chain(vec![
            increment("a"),
            increment("b"),
            increment("c"),
            increment("d"),
        ]));

        let steps = pipeline.execute_while(|s| s.progress() < 0.5).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(pipeline.node_status(&id("c")), NodeStatus::Pending);

        let result = pipeline.execute_until(&id("c")).await.unwrap();
        assert_eq!(result["output"], json!(3));
        assert_eq!(pipeline.node_status(&id("d")), NodeStatus::Pending);

        // Already available results come back without executing anything
        assert_eq!(pipeline.execute_until(&id("b")).await.unwrap()["output"], json!(2));

        assert!(matches!(
            pipeline.execute_until(&id("ghost")).await,
            Err(EngineError::Control(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_until_exhausted() {
        let pipeline = pipeline(chain(vec![increment("a"), increment("b"), increment("c")]));
        pipeline.skip_node(&id("b"), "not today").await.unwrap();

        let err = pipeline.execute_until(&id("c")).await.unwrap_err();
        assert!(matches!(err, EngineError::Control(_)));
        assert_eq!(pipeline.node_status(&id("a")), NodeStatus::Success);
        assert_eq!(pipeline.node_status(&id("c")), NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_empty_pipeline() {
        let pipeline = pipeline(NodeGraph::new());
        assert_eq!(pipeline.get_progress(), 0.0);
        assert!(pipeline.execute().await.unwrap().is_empty());
        assert_eq!(pipeline.status(), PipelineStatus::Success);
    }

    #[tokio::test]
    async fn test_wait_for_node() {
        let pipeline = pipeline_with(
            config().with_wait_timeout(Duration::from_millis(30)),
            chain(vec![
                increment("a"),
                Node::task("b", |_v, _ctx| async move {
                    Err::<Value, _>(anyhow::anyhow!("broken"))
                }),
            ]),
        );

        let err = pipeline.wait_for_node(&id("a")).await.unwrap_err();
        assert!(matches!(err, EngineError::Control(_)));

        assert!(pipeline.execute().await.is_err());
        assert_eq!(pipeline.wait_for_node(&id("a")).await.unwrap()["output"], json!(1));

        let err = pipeline.wait_for_node(&id("b")).await.unwrap_err();
        assert_eq!(err.node_id(), Some(&id("b")));
        assert!(err.to_string().contains("broken"));

        assert_eq!(
            pipeline.wait_for_completion().await.unwrap(),
            PipelineStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_reset() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = pipeline(chain(vec![counted("a", calls.clone()), increment("b")]));

        pipeline.execute().await.unwrap();
        pipeline.reset().unwrap();

        assert_eq!(pipeline.status(), PipelineStatus::Pending);
        assert_eq!(pipeline.node_status(&id("a")), NodeStatus::Pending);
        assert_eq!(pipeline.graph().get_node(&id("a")).unwrap().status(), NodeStatus::Pending);
        assert_eq!(pipeline.get_progress(), 0.0);

        pipeline.execute().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistence_requires_manager() {
        let pipeline = pipeline(chain(vec![increment("a")]));
        assert!(matches!(pipeline.save_state().await, Err(EngineError::Control(_))));
        assert!(matches!(pipeline.restore_state().await, Err(EngineError::Control(_))));
    }

    #[tokio::test]
    async fn test_restore_resumes_from_checkpoint() {
        let manager = StateManager::memory();
        let persisted = || config().with_persist_state(true);

        let first_a = Arc::new(AtomicUsize::new(0));
        let first = pipeline_with(
            persisted(),
            chain(vec![
                counted("a", first_a.clone()),
                flaky("b", Arc::new(AtomicUsize::new(0))),
                increment("c"),
            ]),
        )
        .with_state_manager(manager.clone());
        assert!(first.execute().await.is_err());
        assert!(manager.exists("pipeline_test").await.unwrap());

        let second_a = Arc::new(AtomicUsize::new(0));
        let second = pipeline_with(
            persisted(),
            chain(vec![counted("a", second_a.clone()), increment("b"), increment("c")]),
        )
        .with_state_manager(manager.clone());

        assert!(second.restore_state().await.unwrap());
        assert_eq!(second.status(), PipelineStatus::Failed);
        assert_eq!(second.node_status(&id("a")), NodeStatus::Success);
        assert_eq!(second.node_status(&id("b")), NodeStatus::Failed);
        assert_eq!(second.graph().get_node(&id("a")).unwrap().status(), NodeStatus::Success);

        let outputs = second.execute().await.unwrap();
        assert_eq!(outputs[&id("c")]["output"], json!(3));
        assert_eq!(second_a.load(Ordering::SeqCst), 0);
        assert_eq!(first_a.load(Ordering::SeqCst), 1);

        assert!(second.clear_persisted_state().await.unwrap());
        assert!(!second.clear_persisted_state().await.unwrap());
        assert!(!second.restore_state().await.unwrap());
    }

    /// Store whose loads wait for `release`
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStateStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait::async_trait]
    impl StateStore for GatedStore {
        async fn save(&self, key: &str, data: &Value) -> Result<()> {
            self.inner.save(key, data).await
        }

        async fn load(&self, key: &str) -> Result<Option<Value>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.load(key).await
        }

        async fn remove(&self, key: &str) -> Result<bool> {
            self.inner.remove(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        async fn keys(&self) -> Result<Vec<String>> {
            self.inner.keys().await
        }
    }

    #[tokio::test]
    async fn test_restore_refused_when_run_starts_during_load() {
        let store = Arc::new(GatedStore::default());
        let manager = StateManager::new(store.clone());

        let mut saved = PipelineState::new(PipelineId::new("test"), &[id("a"), id("b")]);
        saved.record_success(&id("a"), json!({"output": 7}).as_object().cloned().unwrap());
        manager.save_as("pipeline_test", &saved).await.unwrap();

        let release = Arc::new(Notify::new());
        let pipeline = Arc::new(
            pipeline(chain(vec![blocking("a", release.clone()), increment("b")]))
                .with_state_manager(manager),
        );

        let restore = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.restore_state().await })
        };
        store.entered.notified().await;

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.execute().await })
        };
        wait_until(|| pipeline.node_status(&id("a")) == NodeStatus::Running).await;

        store.release.notify_one();
        let err = restore.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Control(_)));
        assert_eq!(pipeline.status(), PipelineStatus::Running);
        assert_eq!(pipeline.node_status(&id("a")), NodeStatus::Running);
        assert_eq!(pipeline.graph().get_node(&id("a")).unwrap().status(), NodeStatus::Running);

        release.notify_one();
        let outputs = run.await.unwrap().unwrap();
        assert_eq!(outputs[&id("b")]["output"], json!(2));
    }

    #[tokio::test]
    async fn test_restore_demotes_running_nodes() {
        let manager = StateManager::memory();
        let pipeline = pipeline(chain(vec![increment("a"), increment("b")]))
            .with_state_manager(manager.clone());

        let mut stale = PipelineState::new(PipelineId::new("test"), pipeline.graph().node_ids());
        stale.status = PipelineStatus::Running;
        stale.record_success(&id("a"), json!({"output": 1}).as_object().cloned().unwrap());
        stale.mark_running(&id("b"));
        manager.save_as("pipeline_test", &stale).await.unwrap();

        assert!(pipeline.restore_state().await.unwrap());
        assert_eq!(pipeline.status(), PipelineStatus::Pending);
        assert_eq!(pipeline.node_status(&id("b")), NodeStatus::Pending);

        let outputs = pipeline.execute().await.unwrap();
        assert_eq!(outputs[&id("b")]["output"], json!(2));
    }
}
