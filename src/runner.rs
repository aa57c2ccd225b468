//! Top-level driver for flow runs.
//!
//! Every node shares the one async contract; the [`Runner`] decides how a run
//! is driven:
//!
//! - [`ExecutionMode::Blocking`]: [`Runner::run`] spins up a current-thread
//!   runtime for the call and blocks the caller until the flow finishes.
//! - [`ExecutionMode::Cooperative`]: [`Runner::run`] drives the flow on a
//!   multi-threaded runtime, and [`Runner::run_async`] runs it inside the
//!   caller's own runtime.
//!
//! Run-level guards ([`RunnerConfig::timeout`], [`RunnerConfig::max_steps`])
//! travel in the root [`ExecutionContext`] and apply to that run only. They
//! bound nested flows too, and stack with each flow's own limits: whichever
//! trips first ends the run. The flow itself is never modified.

use crate::flow::{Flow, FlowBuilder, FlowError, FlowExecutionResult};
use crate::node::{Deadline, ExecutionContext, NodeRunner, StepBudget};
use crate::{SharedStore, StorageBackend};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Block the calling thread on a private current-thread runtime
    #[default]
    Blocking,
    /// Run on a multi-threaded runtime, or the caller's via `run_async`
    Cooperative,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub mode: ExecutionMode,
    /// Time limit for the whole run, nested flows included
    pub timeout: Option<Duration>,
    /// Step limit for the whole run, nested flows' nodes included
    pub max_steps: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Runner {
    config: RunnerConfig,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn blocking() -> Self {
        Self::default()
    }

    pub fn cooperative() -> Self {
        Self::new(RunnerConfig {
            mode: ExecutionMode::Cooperative,
            ..RunnerConfig::default()
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.config.max_steps = Some(max_steps);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `flow` to completion from synchronous code.
    ///
    /// Fails with a configuration error when called from inside a tokio
    /// runtime; use [`run_async`](Self::run_async) there.
    pub fn run<F, S>(
        &self,
        flow: &mut F,
        store: &mut SharedStore<S>,
    ) -> Result<FlowExecutionResult, FlowError>
    where
        F: Flow<S>,
        S: StorageBackend,
    {
        if Handle::try_current().is_ok() {
            return Err(FlowError::InvalidConfiguration(
                "Runner::run called inside an async runtime; use run_async".to_string(),
            ));
        }

        let runtime = match self.config.mode {
            ExecutionMode::Blocking => Builder::new_current_thread().enable_all().build()?,
            ExecutionMode::Cooperative => Builder::new_multi_thread().enable_all().build()?,
        };
        runtime.block_on(self.run_async(flow, store))
    }

    /// Run `flow` inside the caller's runtime
    pub async fn run_async<F, S>(
        &self,
        flow: &mut F,
        store: &mut SharedStore<S>,
    ) -> Result<FlowExecutionResult, FlowError>
    where
        F: Flow<S>,
        S: StorageBackend,
    {
        let start_node_id = flow.config().start_node_id.clone();
        let context = self.root_context();

        let started = Instant::now();
        info!(
            mode = ?self.config.mode,
            start = %start_node_id,
            "flow run started"
        );

        let outcome = flow
            .execute_with_context(store, &start_node_id, &context)
            .await;

        match &outcome {
            Ok(result) => info!(
                steps = result.steps_executed,
                last_node = %result.last_node_id,
                action = %result.final_action,
                elapsed = ?started.elapsed(),
                "flow run finished"
            ),
            Err(e) => error!(error = %e, elapsed = ?started.elapsed(), "flow run failed"),
        }
        outcome
    }

    /// Run a single node as a one-node flow
    pub fn run_node<N, S>(
        &self,
        node: N,
        store: &mut SharedStore<S>,
    ) -> Result<FlowExecutionResult, FlowError>
    where
        N: NodeRunner<S> + 'static,
        S: StorageBackend + 'static,
    {
        let id = node.name().to_string();
        let mut flow = FlowBuilder::new().start_node(id.clone()).node(id, node).build()?;
        self.run(&mut flow, store)
    }

    fn root_context(&self) -> ExecutionContext {
        let context = ExecutionContext::new("run")
            .with_deadline(self.config.timeout.map(Deadline::after));
        match self.config.max_steps {
            Some(max_steps) => context.with_step_budget(StepBudget::new(max_steps)),
            None => context,
        }
    }
}
