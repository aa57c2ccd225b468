//! # Node System
//!
//! Nodes are the units of work in a pocketgraph flow. Every node runs the same
//! three phases, in order, once per invocation:
//!
//! ### 1. Prep (`prep`)
//! - Reads its inputs from the shared store (read-only borrow)
//! - A failure here is a prep error: never retried, aborts the run
//!
//! ### 2. Exec (`exec`)
//! - Does the actual work: LLM calls, embeddings, computation
//! - Gets no store access at all, only the prep result
//! - Retried according to the node's [`RetryPolicy`]; once the budget is spent
//!   `exec_fallback` gets the last error and may substitute a result
//!
//! ### 3. Post (`post`)
//! - Writes results back into the store (mutable borrow)
//! - Returns the [`Action`] the flow uses to pick the next edge
//!
//! ## Writing a node
//!
//! ```rust
//! use pocketgraph::prelude::*;
//! use async_trait::async_trait;
//!
//! struct Shout;
//!
//! #[async_trait]
//! impl<S: StorageBackend> NodeBackend<S> for Shout {
//!     type PrepResult = String;
//!     type ExecResult = String;
//!     type Error = NodeError;
//!
//!     async fn prep(&self, store: &SharedStore<S>, _: &ExecutionContext)
//!         -> Result<Self::PrepResult, Self::Error> {
//!         Ok(store.require::<String>("input")?)
//!     }
//!
//!     async fn exec(&self, input: Self::PrepResult, _: &ExecutionContext)
//!         -> Result<Self::ExecResult, Self::Error> {
//!         Ok(input.to_uppercase())
//!     }
//!
//!     async fn post(&mut self, store: &mut SharedStore<S>, _prep: Self::PrepResult,
//!                   loud: Self::ExecResult, _: &ExecutionContext)
//!         -> Result<Action, Self::Error> {
//!         store.put("output", loud)?;
//!         Ok(Action::none())
//!     }
//! }
//! ```
//!
//! The [`Node`] wrapper drives a backend through the lifecycle. Inside a flow,
//! nodes are stored behind the type-erased [`NodeRunner`] trait, which is also
//! implemented by [`BatchNode`](batch::BatchNode), [`FlowNode`](crate::FlowNode)
//! and [`BatchFlow`](crate::BatchFlow).

use crate::params::Params;
use crate::shared_store::StoreError;
use crate::{Action, SharedStore, StorageBackend};
use async_trait::async_trait;
use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;
use tokio::time::sleep;
use tracing::{debug, warn};

pub mod batch;
pub mod builtin;
mod guard;
mod retry;

pub use guard::{Deadline, StepBudget};
pub use retry::{Backoff, RetryPolicy};

/// Boxed error carried out of a failed phase
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// Type aliases to reduce complexity warnings
type PrepFn<S, P> =
    Box<dyn Fn(&SharedStore<S>, &ExecutionContext) -> Result<P, NodeError> + Send + Sync>;
type ExecFn<P, E> = Box<dyn Fn(P, &ExecutionContext) -> Result<E, NodeError> + Send + Sync>;
type FallbackFn<P, E> =
    Box<dyn Fn(P, NodeError, &ExecutionContext) -> Result<E, NodeError> + Send + Sync>;
type PostFn<S, P, E> = Box<
    dyn Fn(&mut SharedStore<S>, P, E, &ExecutionContext) -> Result<Action, NodeError>
        + Send
        + Sync,
>;

/// Ready-made error type for node backends
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Execution error: {0}")]
    ExecutionError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Preparation error: {0}")]
    PrepError(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<String> for NodeError {
    fn from(s: String) -> Self {
        NodeError::ExecutionError(s)
    }
}

impl From<&str> for NodeError {
    fn from(s: &str) -> Self {
        NodeError::ExecutionError(s.to_string())
    }
}

/// Lifecycle phase a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prep,
    Exec,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Prep => f.write_str("prep"),
            Phase::Exec => f.write_str("exec"),
            Phase::Post => f.write_str("post"),
        }
    }
}

/// A node invocation that did not complete.
///
/// Carries the phase, the batch item index when one item sank the batch, and
/// for exec failures the number of attempts made before giving up.
#[derive(Debug)]
pub struct NodeFailure {
    pub phase: Phase,
    pub item: Option<usize>,
    pub attempts: usize,
    cause: BoxError,
}

impl NodeFailure {
    pub fn new(phase: Phase, cause: impl Into<BoxError>) -> Self {
        Self {
            phase,
            item: None,
            attempts: 0,
            cause: cause.into(),
        }
    }

    pub fn prep<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Self::new(Phase::Prep, error)
    }

    pub fn exec<E: StdError + Send + Sync + 'static>(error: E, attempts: usize) -> Self {
        Self {
            attempts,
            ..Self::new(Phase::Exec, error)
        }
    }

    pub fn post<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Self::new(Phase::Post, error)
    }

    pub fn at_item(mut self, index: usize) -> Self {
        self.item = Some(index);
        self
    }

    /// The underlying error
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.cause.as_ref()
    }

    /// Look through to the backend's concrete error type
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.cause.downcast_ref::<E>()
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} phase failed", self.phase)?;
        if let Some(item) = self.item {
            write!(f, " on item {}", item)?;
        }
        if self.phase == Phase::Exec && self.attempts > 0 {
            write!(f, " after {} attempt(s)", self.attempts)?;
        }
        write!(f, ": {}", self.cause)
    }
}

impl StdError for NodeFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.cause)
    }
}

/// Per-invocation metadata handed to every phase.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Id of the node being run (its registration id inside a flow)
    pub node_id: String,
    /// Current retry attempt (0-based)
    pub current_retry: usize,
    /// Attempt budget from the node's retry policy
    pub max_attempts: usize,
    /// Position of the item when running inside a batch
    pub item_index: Option<usize>,
    /// Unique id of this invocation
    pub execution_id: String,
    params: Params,
    deadline: Option<Deadline>,
    step_budgets: Vec<StepBudget>,
}

impl ExecutionContext {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            current_retry: 0,
            max_attempts: 1,
            item_index: None,
            execution_id: uuid::Uuid::new_v4().to_string(),
            params: Params::new(),
            deadline: None,
            step_budgets: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Deadline>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Add a step budget on top of the ones already inherited
    pub fn with_step_budget(mut self, budget: StepBudget) -> Self {
        self.step_budgets.push(budget);
        self
    }

    /// Fresh context for a node run under this one; keeps params and guards
    pub fn child(&self, node_id: impl Into<String>) -> Self {
        Self {
            step_budgets: self.step_budgets.clone(),
            ..Self::new(node_id)
                .with_params(self.params.clone())
                .with_deadline(self.deadline)
        }
    }

    pub(crate) fn for_item(&self, index: usize) -> Self {
        Self {
            item_index: Some(index),
            current_retry: 0,
            execution_id: uuid::Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    /// Step budgets of the runner and every enclosing flow
    pub fn step_budgets(&self) -> &[StepBudget] {
        &self.step_budgets
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> usize {
        self.current_retry + 1
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt() >= self.max_attempts
    }
}

/// The three-phase contract every node implements.
#[async_trait]
pub trait NodeBackend<S: StorageBackend>: Send + Sync {
    /// Value handed from `prep` to `exec` (cloned for each attempt)
    type PrepResult: Send + Sync + Clone + 'static;
    /// Value handed from `exec` to `post`
    type ExecResult: Send + Sync + 'static;
    type Error: StdError + Send + Sync + 'static;

    /// Read inputs from the store. Must not have side effects on the store.
    async fn prep(
        &self,
        store: &SharedStore<S>,
        context: &ExecutionContext,
    ) -> Result<Self::PrepResult, Self::Error>;

    /// Do the work. May be called several times under a retry policy.
    async fn exec(
        &self,
        prep_result: Self::PrepResult,
        context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error>;

    /// Write results and choose the next action.
    async fn post(
        &mut self,
        store: &mut SharedStore<S>,
        prep_result: Self::PrepResult,
        exec_result: Self::ExecResult,
        context: &ExecutionContext,
    ) -> Result<Action, Self::Error>;

    /// Called once retries are exhausted. The default re-raises the error;
    /// override it to substitute a result instead.
    async fn exec_fallback(
        &self,
        _prep_result: Self::PrepResult,
        error: Self::Error,
        _context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error> {
        Err(error)
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::NONE
    }
}

/// Type-erased node as stored in a flow graph.
#[async_trait]
pub trait NodeRunner<S: StorageBackend>: Send + Sync {
    /// Run the full lifecycle against `store`
    async fn invoke(
        &mut self,
        store: &mut SharedStore<S>,
        context: ExecutionContext,
    ) -> Result<Action, NodeFailure>;

    fn name(&self) -> &str;
}

/// Drives a [`NodeBackend`] through prep, exec (with retries and fallback) and post.
pub struct Node<B, S>
where
    B: NodeBackend<S>,
    S: StorageBackend,
{
    backend: B,
    retry: Option<RetryPolicy>,
    _phantom: PhantomData<S>,
}

impl<B, S> Node<B, S>
where
    B: NodeBackend<S>,
    S: StorageBackend,
{
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            retry: None,
            _phantom: PhantomData,
        }
    }

    /// Override the backend's own retry policy
    pub fn with_retry(mut self, policy: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(policy.into());
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_else(|| self.backend.retry_policy())
    }

    /// Run the node on its own, outside any flow
    pub async fn run(&mut self, store: &mut SharedStore<S>) -> Result<Action, NodeFailure> {
        let context = ExecutionContext::new(self.backend.name());
        self.run_with_context(store, context).await
    }

    pub async fn run_with_context(
        &mut self,
        store: &mut SharedStore<S>,
        mut context: ExecutionContext,
    ) -> Result<Action, NodeFailure> {
        let policy = self.retry_policy();
        context.max_attempts = policy.max_attempts();

        debug!(node = %context.node_id, execution_id = %context.execution_id, "node started");

        let prep_result = self
            .backend
            .prep(store, &context)
            .await
            .map_err(NodeFailure::prep)?;

        let exec_result = self
            .exec_with_retries(prep_result.clone(), &mut context, policy)
            .await?;

        let action = self
            .backend
            .post(store, prep_result, exec_result, &context)
            .await
            .map_err(NodeFailure::post)?;

        debug!(node = %context.node_id, action = %action, "node finished");
        Ok(action)
    }

    async fn exec_with_retries(
        &self,
        prep_result: B::PrepResult,
        context: &mut ExecutionContext,
        policy: RetryPolicy,
    ) -> Result<B::ExecResult, NodeFailure> {
        loop {
            match self.backend.exec(prep_result.clone(), context).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    let retry = context.current_retry + 1;
                    if let Some(delay) = policy.delay_for_retry(retry) {
                        warn!(
                            node = %context.node_id,
                            attempt = retry,
                            error = %error,
                            "exec failed, retrying"
                        );
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        context.current_retry = retry;
                        continue;
                    }

                    // All attempts used up
                    return self
                        .backend
                        .exec_fallback(prep_result, error, context)
                        .await
                        .map_err(|e| NodeFailure::exec(e, retry));
                }
            }
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

#[async_trait]
impl<B, S> NodeRunner<S> for Node<B, S>
where
    B: NodeBackend<S>,
    S: StorageBackend,
{
    async fn invoke(
        &mut self,
        store: &mut SharedStore<S>,
        context: ExecutionContext,
    ) -> Result<Action, NodeFailure> {
        self.run_with_context(store, context).await
    }

    fn name(&self) -> &str {
        self.backend.name()
    }
}

/// Convenience alias for nodes over the default in-memory store
pub type InMemoryNode<B> = Node<B, crate::storage::InMemoryStorage>;

/// A node assembled from closures, for quick prototyping and tests
pub struct FunctionNode<S, P, E>
where
    S: StorageBackend,
    P: Send + Sync + Clone + 'static,
    E: Send + Sync + 'static,
{
    name: String,
    prep_fn: PrepFn<S, P>,
    exec_fn: ExecFn<P, E>,
    post_fn: PostFn<S, P, E>,
    fallback_fn: Option<FallbackFn<P, E>>,
    retry: RetryPolicy,
}

impl<S, P, E> FunctionNode<S, P, E>
where
    S: StorageBackend,
    P: Send + Sync + Clone + 'static,
    E: Send + Sync + 'static,
{
    pub fn new<Prep, Exec, Post>(
        name: impl Into<String>,
        prep: Prep,
        exec: Exec,
        post: Post,
    ) -> Self
    where
        Prep: Fn(&SharedStore<S>, &ExecutionContext) -> Result<P, NodeError>
            + Send
            + Sync
            + 'static,
        Exec: Fn(P, &ExecutionContext) -> Result<E, NodeError> + Send + Sync + 'static,
        Post: Fn(&mut SharedStore<S>, P, E, &ExecutionContext) -> Result<Action, NodeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            prep_fn: Box::new(prep),
            exec_fn: Box::new(exec),
            post_fn: Box::new(post),
            fallback_fn: None,
            retry: RetryPolicy::NONE,
        }
    }

    pub fn with_retry(mut self, policy: impl Into<RetryPolicy>) -> Self {
        self.retry = policy.into();
        self
    }

    /// Substitute a result when exec keeps failing
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(P, NodeError, &ExecutionContext) -> Result<E, NodeError> + Send + Sync + 'static,
    {
        self.fallback_fn = Some(Box::new(fallback));
        self
    }
}

#[async_trait]
impl<S, P, E> NodeBackend<S> for FunctionNode<S, P, E>
where
    S: StorageBackend,
    P: Send + Sync + Clone + 'static,
    E: Send + Sync + 'static,
{
    type PrepResult = P;
    type ExecResult = E;
    type Error = NodeError;

    async fn prep(
        &self,
        store: &SharedStore<S>,
        context: &ExecutionContext,
    ) -> Result<Self::PrepResult, Self::Error> {
        (self.prep_fn)(store, context)
    }

    async fn exec(
        &self,
        prep_result: Self::PrepResult,
        context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error> {
        (self.exec_fn)(prep_result, context)
    }

    async fn post(
        &mut self,
        store: &mut SharedStore<S>,
        prep_result: Self::PrepResult,
        exec_result: Self::ExecResult,
        context: &ExecutionContext,
    ) -> Result<Action, Self::Error> {
        (self.post_fn)(store, prep_result, exec_result, context)
    }

    async fn exec_fallback(
        &self,
        prep_result: Self::PrepResult,
        error: Self::Error,
        context: &ExecutionContext,
    ) -> Result<Self::ExecResult, Self::Error> {
        match &self.fallback_fn {
            Some(fallback) => fallback(prep_result, error, context),
            None => Err(error),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

#[cfg(test)]
mod tests;
