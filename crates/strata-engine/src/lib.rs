//! strata-engine
//!
//! Reconciles a declared set of resource goals against the last recorded
//! snapshot of a stack: builds the goal graph, plans steps, executes them in
//! parallel through providers and checkpoints the snapshot as it goes.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod hooks;
pub mod planner;
pub mod provider;
pub mod secrets;
pub mod step;
pub mod summary;
pub mod working;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_core::{Goal, Snapshot};
use strata_storage::CheckpointStore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use crate::config::{DefaultTimeouts, EngineConfig};
pub use crate::error::{EngineError, HookError, PartialState, ProviderError};
pub use crate::events::{
    ChannelSink, EngineEvent, EventBus, EventKind, EventSink, JsonLinesSink, Severity, TracingSink,
};
pub use crate::hooks::{HookContext, HookRegistry};
pub use crate::provider::{PluginProvider, ProviderRegistry, ResourceProvider};
pub use crate::step::{ChangeKind, StepMetadata, StepOp, StepStatus};
pub use crate::summary::{Operation, RunResult, RunSummary};

/// A boxed, pinned, `Send` future used by the engine's traits so they stay
/// object-safe without `async_trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One stack's reconciliation engine.
///
/// Every operation consumes an [`EventBus`], emits a prelude first and a
/// summary last, and closes the bus before returning.
pub struct Engine {
    stack: String,
    project: String,
    store: Arc<dyn CheckpointStore>,
    providers: ProviderRegistry,
    hooks: HookRegistry,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        stack: impl Into<String>,
        project: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        providers: ProviderRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            stack: stack.into(),
            project: project.into(),
            store,
            providers,
            hooks: HookRegistry::default(),
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bring the stack to `goals`.
    pub async fn deploy(
        &self,
        goals: Vec<Goal>,
        events: EventBus,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        self.run(Operation::Deploy, goals, events, cancel).await
    }

    /// Plan a deploy of `goals` without executing anything or writing state.
    pub async fn preview(
        &self,
        goals: Vec<Goal>,
        events: EventBus,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        self.run(Operation::Preview, goals, events, cancel).await
    }

    /// Delete every resource of the stack.
    pub async fn destroy(
        &self,
        events: EventBus,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        self.run(Operation::Destroy, Vec::new(), events, cancel)
            .await
    }

    /// Re-read every resource from its provider and record what exists.
    pub async fn refresh(
        &self,
        events: EventBus,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        self.run(Operation::Refresh, Vec::new(), events, cancel)
            .await
    }

    async fn run(
        &self,
        operation: Operation,
        goals: Vec<Goal>,
        events: EventBus,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let mut summary = RunSummary {
            run_id: Uuid::new_v4(),
            operation,
            result: RunResult::Succeeded,
            counts: Default::default(),
            failed: 0,
            skipped: 0,
            cancelled: false,
            duration: Duration::ZERO,
        };
        tracing::info!(
            run_id = %summary.run_id,
            operation = ?operation,
            stack = %self.stack,
            store = %self.store.location(),
            "starting run"
        );
        events
            .emit(EventKind::Prelude {
                run_id: summary.run_id,
                operation,
                stack: self.stack.clone(),
                project: self.project.clone(),
                parallelism: self.config.parallelism(),
            })
            .await;

        let error = self
            .run_inner(operation, goals, &events, cancel, &mut summary)
            .await
            .err();

        summary.cancelled = cancel.is_cancelled();
        summary.duration = started.elapsed();
        if let Some(e) = &error {
            summary.result = RunResult::Failed;
            events.diagnostic(Severity::Error, None, e.to_string()).await;
        }
        events
            .emit(EventKind::Summary {
                result: summary.result,
                counts: summary.counts.clone(),
                failed: summary.failed,
                skipped: summary.skipped,
                duration_ms: summary.duration.as_millis() as u64,
                cancelled: summary.cancelled,
            })
            .await;
        events.close().await;

        tracing::info!(
            run_id = %summary.run_id,
            result = ?summary.result,
            failed = summary.failed,
            skipped = summary.skipped,
            "run finished"
        );
        match error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    async fn run_inner(
        &self,
        operation: Operation,
        goals: Vec<Goal>,
        events: &EventBus,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<(), EngineError> {
        let prior = self.store.load().await?.unwrap_or_default();
        for pending in &prior.pending_operations {
            let id = pending.id.as_deref().unwrap_or("unknown");
            events
                .diagnostic(
                    Severity::Warning,
                    Some(&pending.urn),
                    format!(
                        "a previous run was interrupted during {:?} (id {id}); the resource may need manual cleanup",
                        pending.op
                    ),
                )
                .await;
        }

        let plan = match operation {
            Operation::Refresh => planner::plan_refresh(&prior, &self.providers, &self.config)?,
            _ => self.plan(goals, &prior, cancel).await?,
        };
        for (urn, message) in &plan.warnings {
            events
                .diagnostic(Severity::Warning, urn.as_ref(), message.clone())
                .await;
        }

        if operation == Operation::Preview {
            for step in &plan.steps {
                events
                    .emit(EventKind::ResourcePre {
                        step: step.metadata(),
                        preview: true,
                    })
                    .await;
            }
            summary.counts = plan.counts();
            return Ok(());
        }

        let executor = executor::Executor {
            store: self.store.as_ref(),
            hooks: &self.hooks,
            config: &self.config,
            events,
            cancel,
        };
        let outcome = executor
            .execute(&plan, working::WorkingSnapshot::new(prior))
            .await;
        summary.counts = outcome.counts;
        summary.failed = outcome.failed;
        summary.skipped = outcome.skipped;
        summary.result = summary::result_for(outcome.failed, outcome.skipped);
        match outcome.fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn plan(
        &self,
        goals: Vec<Goal>,
        prior: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<planner::Plan, EngineError> {
        let graph = graph::build(
            goals,
            &graph::GraphInputs {
                stack: &self.stack,
                project: &self.project,
                prior,
                providers: &self.providers,
                hooks: &self.hooks,
            },
        )?;
        planner::plan(&planner::PlanContext {
            graph: &graph,
            prior,
            providers: &self.providers,
            hooks: &self.hooks,
            config: &self.config,
            cancel,
        })
        .await
    }
}
