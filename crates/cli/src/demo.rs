use crate::config::CliConfig;
use anyhow::{Context as _, Result};
use pipeflow_core::graph::{Edge, Node, NodeGraph};
use pipeflow_core::{Context, EventEmitter, Pipeline};
use serde_json::{json, Value};
use std::sync::Arc;

const DEMO_PIPELINE: &str = "demo";

/// Order pricing: sum the items, discount large orders, print a receipt
pub fn build_graph() -> Result<NodeGraph> {
    let mut graph = NodeGraph::new();
    graph.add_input("order")?;

    graph.add_node(
        Node::task("subtotal", |items, ctx| async move {
            let subtotal: f64 = items
                .as_array()
                .context("order items must be an array")?
                .iter()
                .filter_map(Value::as_f64)
                .sum();
            ctx.set("subtotal", subtotal)?;
            Ok(json!(subtotal))
        })
        .with_name("Sum item prices"),
    )?;

    graph.add_node(
        Node::predicate("large", |value, _ctx| {
            Ok(value.as_f64().unwrap_or_default() >= 50.0)
        })
        .with_name("Large order?"),
    )?;

    graph.add_node(Node::task("discount", |value, _ctx| async move {
        Ok(value.as_f64().map_or(Value::Null, |v| json!(v * 0.9)))
    }))?;
    graph.add_node(Node::task("standard", |value, _ctx| async move { Ok(value) }))?;

    graph.add_node(Node::merge("total").with_inputs(["discount", "standard"]))?;

    graph.add_node(Node::task("receipt", |totals, ctx| async move {
        let total = totals
            .as_array()
            .and_then(|values| values.iter().find_map(Value::as_f64))
            .context("no total was produced")?;
        let customer = ctx.get_as::<String>("customer").unwrap_or_default();
        let subtotal = ctx.get_as::<f64>("subtotal").unwrap_or_default();
        Ok(json!({
            "customer": customer,
            "subtotal": subtotal,
            "total": (total * 100.0).round() / 100.0,
        }))
    }))?;

    graph.add_edge(Edge::new("order-items", "order", "subtotal").from_port("items"))?;
    graph.add_edge(Edge::new("subtotal-large", "subtotal", "large"))?;
    graph.add_edge(Edge::new("large-discount", "large", "discount").branch("true"))?;
    graph.add_edge(Edge::new("large-standard", "large", "standard").branch("false"))?;
    graph.add_edge(
        Edge::new("discount-total", "discount", "total")
            .to_port("discount")
            .when(|v| !v.is_null()),
    )?;
    graph.add_edge(
        Edge::new("standard-total", "standard", "total")
            .to_port("standard")
            .when(|v| !v.is_null()),
    )?;
    graph.add_edge(Edge::new("total-receipt", "total", "receipt"))?;

    Ok(graph)
}

pub async fn run(config: &CliConfig) -> Result<()> {
    let events = Arc::new(EventEmitter::new(config.events.capacity));
    events.on_any(|event| {
        tracing::info!(
            "Event {:?}: {}",
            event.kind(),
            serde_json::to_string(&event.event_type).unwrap_or_default()
        );
    });

    let context = Context::root(DEMO_PIPELINE);
    context.set("customer", "acme")?;

    let pipeline = Pipeline::new(
        config.pipeline_config(DEMO_PIPELINE),
        build_graph()?,
        context.clone(),
        events,
    )?
    .with_state_manager(config.state_manager()?)
    .with_input("order", json!({"items": [12.5, 30.0, 7.5, 4.0]}));

    if pipeline.config().persist_state {
        pipeline.clear_persisted_state().await?;
    }

    let outputs = pipeline.execute().await.context("Demo pipeline failed")?;
    tracing::info!(
        "Demo finished with status {:?}, progress {:.0}%",
        pipeline.status(),
        pipeline.get_progress() * 100.0
    );

    println!("{}", serde_json::to_string_pretty(&outputs)?);
    context.destroy();
    Ok(())
}
