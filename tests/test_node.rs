use async_trait::async_trait;
use pocketgraph::{
    Action, ExecutionContext, InMemoryNode, InMemorySharedStore, InMemoryStorage, Node,
    NodeBackend, NodeError, Phase, RetryPolicy, SharedStore,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Copies `input` to `output` without declaring any action
struct DefaultNode;

#[async_trait]
impl NodeBackend<InMemoryStorage> for DefaultNode {
    type PrepResult = String;
    type ExecResult = String;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<InMemoryStorage>,
        _context: &ExecutionContext,
    ) -> Result<String, NodeError> {
        Ok(store.require("input")?)
    }

    async fn exec(&self, input: String, _context: &ExecutionContext) -> Result<String, NodeError> {
        Ok(input)
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<InMemoryStorage>,
        _prep: String,
        output: String,
        _context: &ExecutionContext,
    ) -> Result<Action, NodeError> {
        store.put("output", output)?;
        Ok(Action::none())
    }
}

#[tokio::test]
async fn test_default_node() {
    let mut node: InMemoryNode<DefaultNode> = Node::new(DefaultNode);
    let mut store = InMemorySharedStore::new();
    store.put("input", "value").unwrap();

    let action = node.run(&mut store).await.unwrap();

    assert!(action.is_default());
    assert_eq!(action.name(), "default");
    assert_eq!(store.get("output").unwrap(), Some(json!("value")));
    assert_eq!(node.retry_policy(), RetryPolicy::NONE);
}

#[tokio::test]
async fn test_node_writes_only_in_post() {
    let mut node = Node::new(DefaultNode);
    let mut store = InMemorySharedStore::new();

    // prep fails on the missing key, so nothing is written
    let failure = node.run(&mut store).await.unwrap_err();
    assert_eq!(failure.phase, Phase::Prep);
    assert!(store.is_empty().unwrap());
}

/// Fails until `fail_times` attempts have been made, recording when each
/// attempt started
struct RetryableNode {
    fail_times: usize,
    attempts: Arc<AtomicUsize>,
    started_at: Arc<Mutex<Vec<Instant>>>,
    policy: RetryPolicy,
}

impl RetryableNode {
    fn new(fail_times: usize, policy: RetryPolicy) -> Self {
        Self {
            fail_times,
            attempts: Arc::new(AtomicUsize::new(0)),
            started_at: Arc::new(Mutex::new(Vec::new())),
            policy,
        }
    }
}

#[async_trait]
impl NodeBackend<InMemoryStorage> for RetryableNode {
    type PrepResult = ();
    type ExecResult = String;
    type Error = NodeError;

    async fn prep(
        &self,
        _store: &SharedStore<InMemoryStorage>,
        _context: &ExecutionContext,
    ) -> Result<(), NodeError> {
        Ok(())
    }

    async fn exec(&self, _: (), context: &ExecutionContext) -> Result<String, NodeError> {
        self.started_at.lock().unwrap().push(Instant::now());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(context.attempt(), attempt);

        if attempt <= self.fail_times {
            Err(NodeError::ExecutionError(format!("failure {}", attempt)))
        } else {
            Ok(format!("succeeded after {} attempts", attempt))
        }
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<InMemoryStorage>,
        _: (),
        result: String,
        _context: &ExecutionContext,
    ) -> Result<Action, NodeError> {
        store.put("result", result)?;
        Ok(Action::simple("done"))
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[tokio::test]
async fn test_retryable_node_retries_and_succeeds() {
    let backend = RetryableNode::new(2, RetryPolicy::attempts(3));
    let attempts = backend.attempts.clone();
    let mut node = Node::new(backend);
    let mut store = InMemorySharedStore::new();

    let action = node.run(&mut store).await.unwrap();

    // Indistinguishable downstream from an immediate success
    assert_eq!(action.name(), "done");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        store.get("result").unwrap(),
        Some(json!("succeeded after 3 attempts"))
    );
}

#[tokio::test]
async fn test_retryable_node_fails_all_attempts() {
    let backend = RetryableNode::new(10, RetryPolicy::attempts(3));
    let attempts = backend.attempts.clone();
    let mut node = Node::new(backend);
    let mut store = InMemorySharedStore::new();

    let failure = node.run(&mut store).await.unwrap_err();

    assert_eq!(failure.phase, Phase::Exec);
    assert_eq!(failure.attempts, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(failure.to_string().contains("failure 3"));
    assert_eq!(store.get("result").unwrap(), None);
}

#[tokio::test]
async fn test_wrapper_retry_overrides_backend_policy() {
    let backend = RetryableNode::new(3, RetryPolicy::NONE);
    let attempts = backend.attempts.clone();
    let mut node = Node::new(backend).with_retry(4);
    let mut store = InMemorySharedStore::new();

    node.run(&mut store).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_exponential_backoff_spaces_attempts() {
    let policy = RetryPolicy::attempts(3)
        .with_delay(Duration::from_millis(20))
        .with_exponential_backoff(2.0, Duration::from_secs(1));
    let backend = RetryableNode::new(2, policy);
    let started_at = backend.started_at.clone();
    let mut node = Node::new(backend);
    let mut store = InMemorySharedStore::new();

    node.run(&mut store).await.unwrap();

    let started_at = started_at.lock().unwrap();
    assert_eq!(started_at.len(), 3);
    assert!(started_at[1] - started_at[0] >= Duration::from_millis(20));
    assert!(started_at[2] - started_at[1] >= Duration::from_millis(40));
}
