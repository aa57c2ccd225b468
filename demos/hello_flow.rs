//! pocketgraph hello flow
//!
//! Three nodes over one shared store: greet, pick a branch, report.
//! Run with `RUST_LOG=debug` to watch the routing decisions.

use pocketgraph::prelude::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut flow = FlowBuilder::new()
        .start_node("greet")
        .node("greet", Node::new(LogNode::new("Hello, pocketgraph!", "greeted")))
        .node(
            "check",
            Node::new(ConditionalNode::new(
                |store: &SharedStore<InMemoryStorage>| {
                    store.get_as::<bool>("vip").ok().flatten().unwrap_or(false)
                },
                "vip",
                "regular",
            )),
        )
        .node(
            "welcome_vip",
            Node::new(SetValueNode::new("message", json!("Welcome back!"), "done")),
        )
        .node(
            "welcome",
            Node::new(SetValueNode::new("message", json!("Nice to meet you."), "done")),
        )
        .route("greet", "greeted", "check")
        .route("check", "vip", "welcome_vip")
        .route("check", "regular", "welcome")
        .build()?;

    let mut store = InMemorySharedStore::new();
    store.put("user_name", "Explorer")?;
    store.put("vip", true)?;

    let result = Runner::blocking().run_async(&mut flow, &mut store).await?;

    println!("Steps executed: {}", result.steps_executed);
    println!("Execution path: {:?}", result.execution_path);
    println!("Final action:   {}", result.final_action);

    println!("\nStore contents:");
    let mut keys = store.keys()?;
    keys.sort();
    for key in keys {
        if let Some(value) = store.get(&key)? {
            println!("  {}: {}", key, value);
        }
    }

    Ok(())
}
