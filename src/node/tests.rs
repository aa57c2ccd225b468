use crate::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "builtin-nodes")]
#[tokio::test]
async fn test_log_node() {
    let mut store = InMemorySharedStore::new();
    let mut log_node = Node::new(LogNode::new("Test message", Action::simple("test_action")));

    let result = log_node.run(&mut store).await;
    assert_eq!(result.unwrap().name(), "test_action");
    assert!(store.is_empty().unwrap());
}

#[cfg(feature = "builtin-nodes")]
#[tokio::test]
async fn test_set_value_node() {
    let mut store = InMemorySharedStore::new();
    let mut set_node = Node::new(SetValueNode::new(
        "test_key",
        json!("test_value"),
        Action::simple("set_complete"),
    ));

    let result = set_node.run(&mut store).await;
    assert_eq!(result.unwrap().name(), "set_complete");
    assert_eq!(store.get("test_key").unwrap(), Some(json!("test_value")));
}

#[cfg(feature = "builtin-nodes")]
#[tokio::test]
async fn test_transform_node() {
    let mut store = InMemorySharedStore::new();
    store.put("input", "hello").unwrap();

    let mut transform = Node::new(TransformNode::new(
        "input",
        "output",
        |value: Option<JsonValue>| match value {
            Some(JsonValue::String(s)) => Ok(JsonValue::String(s.to_uppercase())),
            other => Err(NodeError::ValidationError(format!("expected a string, got {:?}", other))),
        },
        Action::none(),
    ));

    let action = transform.run(&mut store).await.unwrap();
    assert!(action.is_default());
    assert_eq!(store.get("output").unwrap(), Some(json!("HELLO")));

    // A missing input is handed to the transform, which rejects it in exec
    store.remove("input").unwrap();
    let failure = transform.run(&mut store).await.unwrap_err();
    assert_eq!(failure.phase, Phase::Exec);
}

#[cfg(feature = "builtin-nodes")]
#[tokio::test]
async fn test_conditional_node() {
    let mut store = InMemorySharedStore::new();
    store.put("flag", true).unwrap();

    let mut conditional_node = Node::new(ConditionalNode::new(
        |store: &SharedStore<InMemoryStorage>| {
            store.get_as::<bool>("flag").ok().flatten().unwrap_or(false)
        },
        "true_action",
        "false_action",
    ));

    let result = conditional_node.run(&mut store).await;
    assert_eq!(result.unwrap().name(), "true_action");

    store.put("flag", false).unwrap();
    let result = conditional_node.run(&mut store).await;
    assert_eq!(result.unwrap().name(), "false_action");
}

#[cfg(feature = "builtin-nodes")]
#[tokio::test]
async fn test_delay_node() {
    let mut store = InMemorySharedStore::new();
    let delay_duration = Duration::from_millis(50);
    let mut delay_node = Node::new(DelayNode::new(delay_duration, "delay_complete"));

    let start = Instant::now();
    let result = delay_node.run(&mut store).await;

    assert!(start.elapsed() >= delay_duration);
    assert_eq!(result.unwrap().name(), "delay_complete");
}

#[tokio::test]
async fn test_function_node() {
    let mut store = InMemorySharedStore::new();
    store.put("input", 42).unwrap();

    let mut function_node = Node::new(FunctionNode::new(
        "DoubleNode",
        |store: &SharedStore<InMemoryStorage>, _context: &ExecutionContext| {
            Ok(store.require::<i64>("input")?)
        },
        |input: i64, _context: &ExecutionContext| Ok(input * 2),
        |store: &mut SharedStore<InMemoryStorage>,
         _prep: i64,
         result: i64,
         _context: &ExecutionContext| {
            store.put("output", result)?;
            Ok(Action::simple("double_complete"))
        },
    ));

    let result = function_node.run(&mut store).await;
    assert_eq!(result.unwrap().name(), "double_complete");
    assert_eq!(store.get("output").unwrap(), Some(json!(84)));
}

/// Exec fails `failures` times, then returns the attempt index it succeeded on
fn flaky_node(
    failures: usize,
    calls: Arc<AtomicUsize>,
) -> FunctionNode<InMemoryStorage, (), usize> {
    FunctionNode::new(
        "flaky",
        |_store: &SharedStore<InMemoryStorage>, _ctx: &ExecutionContext| Ok(()),
        move |_: (), ctx: &ExecutionContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            if ctx.current_retry < failures {
                Err(NodeError::ExecutionError(format!("attempt {} failed", ctx.attempt())))
            } else {
                Ok(ctx.current_retry)
            }
        },
        |store: &mut SharedStore<InMemoryStorage>, _: (), retry: usize, _ctx: &ExecutionContext| {
            store.put("succeeded_on_retry", retry)?;
            Ok(Action::none())
        },
    )
}

#[tokio::test]
async fn test_retry_succeeds_on_third_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut node = Node::new(flaky_node(2, calls.clone())).with_retry(3);
    let mut store = InMemorySharedStore::new();

    let action = tokio_test::assert_ok!(node.run(&mut store).await);

    assert!(action.is_default());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.get("succeeded_on_retry").unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn test_retry_waits_between_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut node = Node::new(flaky_node(2, calls.clone()))
        .with_retry(RetryPolicy::attempts(3).with_delay(Duration::from_millis(20)));
    let mut store = InMemorySharedStore::new();

    let start = Instant::now();
    node.run(&mut store).await.unwrap();

    // two waits of 20ms
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn test_exhausted_retries_report_exec_failure() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut node = Node::new(flaky_node(5, calls.clone())).with_retry(3);
    let mut store = InMemorySharedStore::new();

    let failure = tokio_test::assert_err!(node.run(&mut store).await);

    assert_eq!(failure.phase, Phase::Exec);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.item, None);
    assert!(matches!(
        failure.downcast_ref::<NodeError>(),
        Some(NodeError::ExecutionError(msg)) if msg == "attempt 3 failed"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.get("succeeded_on_retry").unwrap(), None);
}

#[tokio::test]
async fn test_fallback_replaces_failed_exec() {
    let calls = Arc::new(AtomicUsize::new(0));
    let backend = flaky_node(5, calls.clone())
        .with_retry(2)
        .with_fallback(|_: (), _error, ctx: &ExecutionContext| Ok(100 + ctx.current_retry));
    let mut node = Node::new(backend);
    let mut store = InMemorySharedStore::new();

    node.run(&mut store).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.get("succeeded_on_retry").unwrap(), Some(json!(101)));
}

#[tokio::test]
async fn test_prep_failure_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let exec_calls = calls.clone();
    let mut node = Node::new(FunctionNode::new(
        "needs_input",
        |store: &SharedStore<InMemoryStorage>, _ctx: &ExecutionContext| {
            Ok(store.require::<String>("input")?)
        },
        move |input: String, _ctx: &ExecutionContext| {
            exec_calls.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        },
        |_store: &mut SharedStore<InMemoryStorage>,
         _p: String,
         _e: String,
         _ctx: &ExecutionContext| Ok(Action::none()),
    ))
    .with_retry(5);

    let mut store = InMemorySharedStore::new();
    let failure = node.run(&mut store).await.unwrap_err();

    assert_eq!(failure.phase, Phase::Prep);
    assert!(matches!(
        failure.downcast_ref::<NodeError>(),
        Some(NodeError::Store(StoreError::KeyNotFound(key))) if key == "input"
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_post_failure_reports_post_phase() {
    let mut node = Node::new(FunctionNode::new(
        "reject",
        |_store: &SharedStore<InMemoryStorage>, _ctx: &ExecutionContext| Ok(()),
        |_: (), _ctx: &ExecutionContext| Ok(()),
        |_store: &mut SharedStore<InMemoryStorage>, _: (), _: (), _ctx: &ExecutionContext| {
            Err(NodeError::ValidationError("result rejected".into()))
        },
    ));

    let mut store = InMemorySharedStore::new();
    let failure = node.run(&mut store).await.unwrap_err();
    assert_eq!(failure.phase, Phase::Post);
    assert_eq!(failure.to_string(), "post phase failed: Validation error: result rejected");
}

/// A hand-written backend declaring its own fallback
struct Summarizer {
    attempts_seen: Vec<usize>,
}

#[async_trait::async_trait]
impl NodeBackend<InMemoryStorage> for Summarizer {
    type PrepResult = String;
    type ExecResult = String;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<InMemoryStorage>,
        _context: &ExecutionContext,
    ) -> Result<String, NodeError> {
        Ok(store.require("text")?)
    }

    async fn exec(&self, _text: String, context: &ExecutionContext) -> Result<String, NodeError> {
        Err(format!("model unavailable on attempt {}", context.attempt()).into())
    }

    async fn exec_fallback(
        &self,
        text: String,
        _error: NodeError,
        _context: &ExecutionContext,
    ) -> Result<String, NodeError> {
        Ok(text.chars().take(5).collect())
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<InMemoryStorage>,
        _text: String,
        summary: String,
        context: &ExecutionContext,
    ) -> Result<Action, NodeError> {
        self.attempts_seen.push(context.current_retry);
        store.put("summary", summary)?;
        Ok(Action::simple("summarized"))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(2)
    }
}

#[tokio::test]
async fn test_backend_fallback_and_retry_policy() {
    let mut node = Node::new(Summarizer {
        attempts_seen: Vec::new(),
    });
    assert_eq!(node.retry_policy().max_attempts(), 2);

    let mut store = InMemorySharedStore::new();
    store.put("text", "pocketgraph").unwrap();

    let action = node.run(&mut store).await.unwrap();
    assert_eq!(action.name(), "summarized");
    assert_eq!(store.require::<String>("summary").unwrap(), "pocke");
    // post sees the context of the last attempt
    assert_eq!(node.backend().attempts_seen, vec![1]);
}

#[test]
fn test_execution_context() {
    let params = Params::builder().value("lang", json!("en")).build();
    let deadline = Deadline::after(Duration::from_secs(1));
    let context = ExecutionContext::new("root")
        .with_params(params)
        .with_deadline(Some(deadline))
        .with_step_budget(StepBudget::new(8));

    assert_eq!(context.current_retry, 0);
    assert_eq!(context.attempt(), 1);
    assert!(context.is_last_attempt());
    assert!(!context.execution_id().is_empty());

    let child = context.child("leaf");
    assert_eq!(child.node_id, "leaf");
    assert_eq!(child.params().get::<String>("lang"), Some("en".to_string()));
    assert_eq!(child.deadline(), Some(deadline));
    assert_eq!(child.step_budgets().len(), 1);
    assert_eq!(child.step_budgets()[0].limit(), 8);
    assert_ne!(child.execution_id(), context.execution_id());
}
