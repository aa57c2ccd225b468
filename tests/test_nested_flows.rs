use pocketgraph::node::builtin::{DelayNode, SetValueNode};
use pocketgraph::{
    Action, BasicFlow, BatchFlow, ExecutionContext, Flow, FlowBuilder, FlowError, FlowNode,
    FunctionNode, InMemorySharedStore, InMemoryStorage, Node, NodeError, NodeRunner, Params,
    Phase, Runner, SharedStore,
};
use serde_json::json;
use std::time::{Duration, Instant};

type Store = SharedStore<InMemoryStorage>;

fn set(
    key: &'static str,
    value: serde_json::Value,
    action: &'static str,
) -> impl NodeRunner<InMemoryStorage> {
    Node::new(SetValueNode::new(key, value, Action::simple(action)))
}

/// Flow whose only node loops back to itself forever
fn ticking_flow() -> BasicFlow<InMemoryStorage> {
    FlowBuilder::new()
        .start_node("tick")
        .node("tick", Node::new(DelayNode::new(Duration::from_millis(1), "again")))
        .route("tick", "again", "tick")
        .build()
        .unwrap()
}

/// Copies the `key` param into the store under the same name
fn param_to_store(key: &'static str) -> impl NodeRunner<InMemoryStorage> {
    Node::new(FunctionNode::new(
        "param_to_store",
        move |_store: &Store, ctx: &ExecutionContext| Ok(ctx.params().get_value(key).cloned()),
        |value: Option<serde_json::Value>, _ctx: &ExecutionContext| Ok(value),
        move |store: &mut Store,
              _: Option<serde_json::Value>,
              value: Option<serde_json::Value>,
              _ctx: &ExecutionContext| {
            if let Some(value) = value {
                store.put(key, value)?;
            }
            Ok(Action::none())
        },
    ))
}

#[tokio::test]
async fn test_nested_flow_basic() {
    let inner_flow = FlowBuilder::new()
        .start_node("step1")
        .node("step1", set("inner_result", json!("inner_done"), "complete"))
        .build()
        .unwrap();

    let mut outer_flow = FlowBuilder::new()
        .start_node("start")
        .node("start", set("outer_start", json!("outer_value"), "to_nested"))
        .node("nested", FlowNode::new(inner_flow).with_name("inner"))
        .node("end", set("outer_end", json!("final_value"), "done"))
        .route("start", "to_nested", "nested")
        .route("nested", "complete", "end")
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    let result = outer_flow.execute(&mut store).await.unwrap();

    // The sub-flow's last action is the nested node's action, and counts as one step
    assert_eq!(result.steps_executed, 3);
    assert_eq!(result.execution_path, vec!["start", "nested", "end"]);
    assert_eq!(result.final_action.name(), "done");
    assert_eq!(store.get("outer_start").unwrap(), Some(json!("outer_value")));
    assert_eq!(store.get("inner_result").unwrap(), Some(json!("inner_done")));
    assert_eq!(store.get("outer_end").unwrap(), Some(json!("final_value")));
}

#[tokio::test]
async fn test_deeply_nested_flows() {
    let level3 = FlowBuilder::new()
        .start_node("deep")
        .node("deep", set("level3", json!("deepest"), "level3_done"))
        .build()
        .unwrap();

    let level2 = FlowBuilder::new()
        .start_node("middle")
        .node("middle", set("level2", json!("middle"), "to_level3"))
        .node("level3", FlowNode::new(level3))
        .route("middle", "to_level3", "level3")
        .build()
        .unwrap();

    let mut level1 = FlowBuilder::new()
        .start_node("top")
        .node("top", set("level1", json!("top"), "to_level2"))
        .node("level2", FlowNode::new(level2))
        .node("finish", set("finished", json!(true), "done"))
        .route("top", "to_level2", "level2")
        .route("level2", "level3_done", "finish")
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    let result = level1.execute(&mut store).await.unwrap();

    assert_eq!(result.execution_path, vec!["top", "level2", "finish"]);
    for (key, value) in [
        ("level1", json!("top")),
        ("level2", json!("middle")),
        ("level3", json!("deepest")),
        ("finished", json!(true)),
    ] {
        assert_eq!(store.get(key).unwrap(), Some(value), "key {}", key);
    }
}

#[tokio::test]
async fn test_nested_flow_failure_propagates() {
    let failing = Node::new(FunctionNode::new(
        "broken",
        |_store: &Store, _ctx: &ExecutionContext| Ok(()),
        |_: (), _ctx: &ExecutionContext| -> Result<(), NodeError> {
            Err(NodeError::ExecutionError("disk full".into()))
        },
        |_store: &mut Store, _: (), _: (), _ctx: &ExecutionContext| Ok(Action::none()),
    ));

    let inner = FlowBuilder::new()
        .start_node("ok")
        .node("ok", set("before_failure", json!(1), "next"))
        .node("broken", failing)
        .route("ok", "next", "broken")
        .build()
        .unwrap();

    let mut outer = FlowBuilder::new()
        .start_node("inner")
        .node("inner", FlowNode::new(inner))
        .node("after", set("after", json!(true), "done"))
        .default_route("inner", "after")
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    let error = outer.execute(&mut store).await.unwrap_err();

    assert_eq!(error.failed_node(), Some("inner"));
    assert_eq!(error.phase(), Some(Phase::Exec));

    let cause = error.innermost();
    assert_eq!(cause.failed_node(), Some("broken"));
    assert_eq!(cause.phase(), Some(Phase::Exec));
    assert!(error.to_string().contains("disk full"));

    // writes made before the failure stay, nothing after it runs
    assert_eq!(store.get("before_failure").unwrap(), Some(json!(1)));
    assert_eq!(store.get("after").unwrap(), None);
}

#[tokio::test]
async fn test_outer_params_override_inner_flow_params() {
    let inner = FlowBuilder::new()
        .start_node("lang")
        .params(
            Params::builder()
                .value("lang", json!("de"))
                .value("tone", json!("formal"))
                .build(),
        )
        .node("lang", param_to_store("lang"))
        .node("tone", param_to_store("tone"))
        .default_route("lang", "tone")
        .build()
        .unwrap();

    let mut outer = FlowBuilder::new()
        .start_node("inner")
        .params(Params::builder().value("lang", json!("en")).build())
        .node("inner", FlowNode::new(inner))
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    outer.execute(&mut store).await.unwrap();

    assert_eq!(store.get("lang").unwrap(), Some(json!("en")));
    assert_eq!(store.get("tone").unwrap(), Some(json!("formal")));
}

#[tokio::test]
async fn test_outer_timeout_reaches_nested_flow() {
    // The inner flow loops forever on its own; only the outer deadline stops it
    let inner = FlowBuilder::new()
        .start_node("tick")
        .node("tick", Node::new(DelayNode::new(Duration::from_millis(10), "again")))
        .route("tick", "again", "tick")
        .build()
        .unwrap();

    let mut outer = FlowBuilder::new()
        .start_node("inner")
        .timeout(Duration::from_millis(40))
        .node("inner", FlowNode::new(inner))
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    let start = Instant::now();
    let error = outer.execute(&mut store).await.unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(error.failed_node(), Some("inner"));
    // the inner flow reports the limit it inherited, not its own running time
    assert!(matches!(
        error.innermost(),
        FlowError::Timeout(limit) if *limit == Duration::from_millis(40)
    ));
    assert!(error.is_overrun());
}

#[tokio::test]
async fn test_run_step_limit_reaches_nested_flow() {
    let mut outer = FlowBuilder::new()
        .start_node("inner")
        .node("inner", FlowNode::new(ticking_flow()))
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    let runner = Runner::cooperative().with_max_steps(5);
    let run = runner.run_async(&mut outer, &mut store);
    let error = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("step limit should stop the inner loop")
        .unwrap_err();

    assert_eq!(error.failed_node(), Some("inner"));
    // the wrapping node is one step, so the inner loop got the other four
    assert!(matches!(error.innermost(), FlowError::MaxStepsExceeded(5)));
    assert!(error.is_overrun());
}

#[tokio::test]
async fn test_outer_step_limit_counts_inner_steps() {
    let mut outer = FlowBuilder::new()
        .start_node("inner")
        .max_steps(3)
        .node("inner", FlowNode::new(ticking_flow()))
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    let error = outer.execute(&mut store).await.unwrap_err();

    assert!(matches!(error.innermost(), FlowError::MaxStepsExceeded(3)));
    // the flow's own config is left as built
    assert_eq!(outer.config().max_steps, Some(3));
}

#[tokio::test]
async fn test_run_step_limit_spans_batch_flow_runs() {
    let counted = FlowBuilder::new()
        .start_node("count")
        .node(
            "count",
            Node::new(FunctionNode::new(
                "count",
                |store: &Store, _ctx: &ExecutionContext| {
                    Ok(store.get_as::<u64>("runs")?.unwrap_or_default())
                },
                |runs: u64, _ctx: &ExecutionContext| Ok(runs + 1),
                |store: &mut Store, _: u64, runs: u64, _ctx: &ExecutionContext| {
                    store.put("runs", runs)?;
                    Ok(Action::none())
                },
            )),
        )
        .build()
        .unwrap();

    let batch = BatchFlow::new(counted, |_store: &Store, _ctx: &ExecutionContext| {
        Ok((0..10)
            .map(|run| Params::builder().value("run", json!(run)).build())
            .collect())
    });

    let mut outer = FlowBuilder::new()
        .start_node("batch")
        .node("batch", batch)
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    let error = Runner::cooperative()
        .with_max_steps(3)
        .run_async(&mut outer, &mut store)
        .await
        .unwrap_err();

    // one step for the batch node, then one per run until the budget is gone
    assert_eq!(error.item_index(), Some(2));
    assert!(matches!(error.innermost(), FlowError::MaxStepsExceeded(3)));
    assert_eq!(store.get("runs").unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_nested_batch_flow() {
    let per_city = FlowBuilder::new()
        .start_node("visit")
        .node(
            "visit",
            Node::new(FunctionNode::new(
                "visit",
                |store: &Store, ctx: &ExecutionContext| {
                    let city = ctx
                        .params()
                        .get::<String>("city")
                        .ok_or_else(|| NodeError::ValidationError("missing city".into()))?;
                    let visited = store.get_as::<Vec<String>>("visited")?.unwrap_or_default();
                    Ok((city, visited))
                },
                |(city, mut visited): (String, Vec<String>), _ctx: &ExecutionContext| {
                    visited.push(city);
                    Ok(visited)
                },
                |store: &mut Store, _, visited: Vec<String>, _ctx: &ExecutionContext| {
                    store.put("visited", visited)?;
                    Ok(Action::none())
                },
            )),
        )
        .build()
        .unwrap();

    let tour = BatchFlow::new(per_city, |store: &Store, _ctx: &ExecutionContext| {
        let cities: Vec<String> = store.require("cities")?;
        Ok(cities
            .into_iter()
            .map(|city| Params::builder().value("city", json!(city)).build())
            .collect())
    })
    .with_action("toured");

    let mut outer = FlowBuilder::new()
        .start_node("tour")
        .node("tour", tour)
        .node("report", set("report", json!("done"), "finished"))
        .route("tour", "toured", "report")
        .build()
        .unwrap();

    let mut store = InMemorySharedStore::new();
    store.put("cities", vec!["Lyon", "Porto", "Graz"]).unwrap();
    let result = outer.execute(&mut store).await.unwrap();

    assert_eq!(result.execution_path, vec!["tour", "report"]);
    assert_eq!(
        store.get("visited").unwrap(),
        Some(json!(["Lyon", "Porto", "Graz"]))
    );
    assert_eq!(store.get("report").unwrap(), Some(json!("done")));
}

#[tokio::test]
async fn test_nested_flow_is_reusable() {
    let inner: BasicFlow<InMemoryStorage> = FlowBuilder::new()
        .start_node("mark")
        .node("mark", set("marked", json!(true), "marked"))
        .build()
        .unwrap();
    let mut node = FlowNode::new(inner);

    for _ in 0..2 {
        let mut store = InMemorySharedStore::new();
        let action = node
            .invoke(&mut store, ExecutionContext::new("nested"))
            .await
            .unwrap();
        assert_eq!(action.name(), "marked");
        assert_eq!(store.get("marked").unwrap(), Some(json!(true)));
    }
    assert_eq!(node.name(), "flow");
}
