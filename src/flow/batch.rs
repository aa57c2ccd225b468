//! Batch flows: run one sub-flow once per parameter set.
//!
//! Where a [`BatchNode`](crate::BatchNode) maps `exec` over items, a
//! [`BatchFlow`] maps a whole flow over a list of [`Params`]. Runs happen one
//! after another against the same store; each run sees the inherited params
//! with its own set layered on top.

use super::{Flow, FlowError};
use crate::node::{ExecutionContext, NodeError, NodeFailure, NodeRunner};
use crate::params::Params;
use crate::{Action, SharedStore, StorageBackend};
use async_trait::async_trait;
use std::marker::PhantomData;
use tracing::debug;

type PrepareFn<S> = Box<
    dyn Fn(&SharedStore<S>, &ExecutionContext) -> Result<Vec<Params>, NodeError> + Send + Sync,
>;

/// Runs `flow` once for every [`Params`] the prepare step returns.
pub struct BatchFlow<F, S>
where
    F: Flow<S>,
    S: StorageBackend,
{
    flow: F,
    prepare: PrepareFn<S>,
    action: Action,
    name: String,
    _phantom: PhantomData<S>,
}

impl<F, S> BatchFlow<F, S>
where
    F: Flow<S>,
    S: StorageBackend,
{
    /// `prepare` reads the store and returns one params set per run
    pub fn new<P>(flow: F, prepare: P) -> Self
    where
        P: Fn(&SharedStore<S>, &ExecutionContext) -> Result<Vec<Params>, NodeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            flow,
            prepare: Box::new(prepare),
            action: Action::none(),
            name: "batch_flow".to_string(),
            _phantom: PhantomData,
        }
    }

    /// Action emitted once every run has finished
    pub fn with_action(mut self, action: impl Into<Action>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    async fn run_all(
        &mut self,
        store: &mut SharedStore<S>,
        context: &ExecutionContext,
    ) -> Result<usize, NodeFailure> {
        let batches = (self.prepare)(store, context).map_err(NodeFailure::prep)?;
        let start_node_id = self.flow.config().start_node_id.clone();

        debug!(node = %context.node_id, runs = batches.len(), "batch flow started");

        let runs = batches.len();
        for (index, batch_params) in batches.iter().enumerate() {
            let run_context = context
                .child(context.node_id.clone())
                .with_params(context.params().merge(batch_params));

            self.flow
                .execute_with_context(store, &start_node_id, &run_context)
                .await
                .map_err(|e: FlowError| NodeFailure::exec(e, 1).at_item(index))?;
        }
        Ok(runs)
    }
}

#[async_trait]
impl<F, S> NodeRunner<S> for BatchFlow<F, S>
where
    F: Flow<S>,
    S: StorageBackend,
{
    async fn invoke(
        &mut self,
        store: &mut SharedStore<S>,
        context: ExecutionContext,
    ) -> Result<Action, NodeFailure> {
        let runs = self.run_all(store, &context).await?;
        debug!(node = %context.node_id, runs, action = %self.action, "batch flow finished");
        Ok(self.action.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
