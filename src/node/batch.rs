//! Batch nodes: one prep, `exec` once per item, one post.
//!
//! Items run either one at a time in input order ([`BatchMode::Sequential`])
//! or concurrently on the node's own task ([`BatchMode::Parallel`]). Either
//! way `post` receives the outputs in input order.

use super::{ExecutionContext, NodeFailure, NodeRunner, Phase, RetryPolicy};
use crate::{Action, SharedStore, StorageBackend};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::marker::PhantomData;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How a batch node schedules its items
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchMode {
    /// Item `i + 1` starts only after item `i` returned; the first unrecovered
    /// failure stops the batch
    #[default]
    Sequential,
    /// All items are in flight at once, optionally capped at `max_in_flight`
    Parallel { max_in_flight: Option<usize> },
}

/// Contract for nodes that process a list of items.
#[async_trait]
pub trait BatchNodeBackend<S: StorageBackend>: Send + Sync {
    type Item: Send + Sync + Clone + 'static;
    type Output: Send + Sync + 'static;
    type Error: StdError + Send + Sync + 'static;

    /// Produce the items to process
    async fn prep(
        &self,
        store: &SharedStore<S>,
        context: &ExecutionContext,
    ) -> Result<Vec<Self::Item>, Self::Error>;

    /// Process one item; `context.item_index` says which
    async fn exec(
        &self,
        item: Self::Item,
        context: &ExecutionContext,
    ) -> Result<Self::Output, Self::Error>;

    /// Per-item fallback once retries are spent. Re-raises by default.
    async fn exec_fallback(
        &self,
        _item: Self::Item,
        error: Self::Error,
        _context: &ExecutionContext,
    ) -> Result<Self::Output, Self::Error> {
        Err(error)
    }

    /// Receives the items and their outputs, both in input order
    async fn post(
        &mut self,
        store: &mut SharedStore<S>,
        items: Vec<Self::Item>,
        outputs: Vec<Self::Output>,
        context: &ExecutionContext,
    ) -> Result<Action, Self::Error>;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Retry policy applied to each item separately
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::NONE
    }
}

/// Drives a [`BatchNodeBackend`].
pub struct BatchNode<B, S>
where
    B: BatchNodeBackend<S>,
    S: StorageBackend,
{
    backend: B,
    mode: BatchMode,
    retry: Option<RetryPolicy>,
    _phantom: PhantomData<S>,
}

impl<B, S> BatchNode<B, S>
where
    B: BatchNodeBackend<S>,
    S: StorageBackend,
{
    /// Sequential batch node
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            mode: BatchMode::Sequential,
            retry: None,
            _phantom: PhantomData,
        }
    }

    /// Unbounded parallel batch node
    pub fn parallel(backend: B) -> Self {
        Self::new(backend).with_mode(BatchMode::Parallel {
            max_in_flight: None,
        })
    }

    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Parallel mode with at most `limit` item execs running at once
    pub fn with_max_in_flight(self, limit: usize) -> Self {
        self.with_mode(BatchMode::Parallel {
            max_in_flight: Some(limit.max(1)),
        })
    }

    pub fn with_retry(mut self, policy: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(policy.into());
        self
    }

    pub fn mode(&self) -> BatchMode {
        self.mode
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_else(|| self.backend.retry_policy())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

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

        let items = self
            .backend
            .prep(store, &context)
            .await
            .map_err(NodeFailure::prep)?;

        debug!(
            node = %context.node_id,
            items = items.len(),
            mode = ?self.mode,
            "batch started"
        );

        let outputs = match self.mode {
            BatchMode::Sequential => self.run_sequential(&items, &context, policy).await?,
            BatchMode::Parallel { max_in_flight } => {
                self.run_parallel(&items, &context, policy, max_in_flight)
                    .await?
            }
        };

        let action = self
            .backend
            .post(store, items, outputs, &context)
            .await
            .map_err(NodeFailure::post)?;

        debug!(node = %context.node_id, action = %action, "batch finished");
        Ok(action)
    }

    async fn run_sequential(
        &self,
        items: &[B::Item],
        context: &ExecutionContext,
        policy: RetryPolicy,
    ) -> Result<Vec<B::Output>, NodeFailure> {
        let mut outputs = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            outputs.push(self.run_item(item.clone(), index, context, policy).await?);
        }
        Ok(outputs)
    }

    async fn run_parallel(
        &self,
        items: &[B::Item],
        context: &ExecutionContext,
        policy: RetryPolicy,
        max_in_flight: Option<usize>,
    ) -> Result<Vec<B::Output>, NodeFailure> {
        // tokio's semaphore is fair, so permits are granted in input order
        let semaphore = max_in_flight.map(|limit| Semaphore::new(limit.max(1)));
        let semaphore = semaphore.as_ref();

        let pending = items.iter().cloned().enumerate().map(|(index, item)| async move {
            let _permit = match semaphore {
                Some(semaphore) => match semaphore.acquire().await {
                    Ok(permit) => Some(permit),
                    Err(e) => return Err(NodeFailure::new(Phase::Exec, e).at_item(index)),
                },
                None => None,
            };
            self.run_item(item, index, context, policy).await
        });

        // Every item settles before the lowest-index failure is reported
        join_all(pending).await.into_iter().collect()
    }

    async fn run_item(
        &self,
        item: B::Item,
        index: usize,
        parent: &ExecutionContext,
        policy: RetryPolicy,
    ) -> Result<B::Output, NodeFailure> {
        let mut context = parent.for_item(index);
        context.max_attempts = policy.max_attempts();

        loop {
            match self.backend.exec(item.clone(), &context).await {
                Ok(output) => return Ok(output),
                Err(error) => {
                    let retry = context.current_retry + 1;
                    if let Some(delay) = policy.delay_for_retry(retry) {
                        warn!(
                            node = %context.node_id,
                            item = index,
                            attempt = retry,
                            error = %error,
                            "item exec failed, retrying"
                        );
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        context.current_retry = retry;
                        continue;
                    }

                    return self
                        .backend
                        .exec_fallback(item, error, &context)
                        .await
                        .map_err(|e| NodeFailure::exec(e, retry).at_item(index));
                }
            }
        }
    }
}

#[async_trait]
impl<B, S> NodeRunner<S> for BatchNode<B, S>
where
    B: BatchNodeBackend<S>,
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
