//! Parallel step execution.
//!
//! Steps start once everything they wait on has finished, in step order,
//! with at most `parallelism` in flight. A failed or skipped step skips its
//! dependents while unrelated steps keep going. Every state change is
//! persisted before the step reports completion.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use strata_core::property::resolve_map_outputs;
use strata_core::{
    HookType, OperationType, OutputReference, PropertyMap, PropertyValue, ResourceHooks,
    ResourceState,
};
use strata_storage::CheckpointStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, ProviderError};
use crate::events::{EventBus, EventKind, Severity};
use crate::hooks::{HookContext, HookRegistry};
use crate::planner::{apply_ignore_changes, Plan};
use crate::provider::{
    CheckRequest, CreateRequest, DeleteRequest, ProviderClient, ReadRequest, UpdateRequest,
};
use crate::secrets::mask;
use crate::step::{ChangeKind, Removal, Step, StepId, StepOp, StepStatus};
use crate::working::WorkingSnapshot;

/// Totals of an executed plan.
#[derive(Debug, Default)]
pub struct Outcome {
    pub counts: BTreeMap<ChangeKind, usize>,
    pub failed: usize,
    pub skipped: usize,
    /// First persistence error; the run stopped scheduling when it occurred.
    pub fatal: Option<EngineError>,
}

pub struct Executor<'a> {
    pub store: &'a dyn CheckpointStore,
    pub hooks: &'a HookRegistry,
    pub config: &'a EngineConfig,
    pub events: &'a EventBus,
    pub cancel: &'a CancellationToken,
}

struct Applied {
    id: Option<String>,
    outputs: Option<PropertyMap>,
}

enum Failure {
    Step(String),
    /// The step's effect could not be persisted.
    Fatal(EngineError),
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Self::Fatal(e)
    }
}

type StepResult = Result<Applied, Failure>;

impl Executor<'_> {
    pub async fn execute(&self, plan: &Plan, working: WorkingSnapshot) -> Outcome {
        let working = Mutex::new(working);
        let dependents = plan.dependents();
        let mut remaining: Vec<usize> = plan.waits_on.iter().map(Vec::len).collect();
        let mut status: Vec<Option<StepStatus>> = vec![None; plan.steps.len()];
        let mut ready: BTreeSet<StepId> = (0..plan.steps.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut outcome = Outcome::default();
        let mut running = FuturesUnordered::new();
        let parallelism = self.config.parallelism();

        loop {
            while running.len() < parallelism && !self.halted(&outcome) {
                let Some(id) = ready.pop_first() else { break };
                let step = &plan.steps[id];
                let working = &working;
                running.push(async move { (id, self.run_step(step, working).await) });
            }

            let Some((id, result)) = running.next().await else {
                break;
            };
            let succeeded = match result {
                Ok(_) => {
                    status[id] = Some(StepStatus::Succeeded);
                    if let Some(kind) = plan.steps[id].op.change_kind() {
                        *outcome.counts.entry(kind).or_insert(0) += 1;
                    }
                    true
                }
                Err(failure) => {
                    status[id] = Some(StepStatus::Failed);
                    outcome.failed += 1;
                    if let Failure::Fatal(e) = failure {
                        tracing::error!(urn = %plan.steps[id].urn, error = %e, "persisting step result failed, halting");
                        outcome.fatal.get_or_insert(e);
                    }
                    false
                }
            };

            if succeeded {
                for &d in &dependents[id] {
                    remaining[d] -= 1;
                    if remaining[d] == 0 && status[d].is_none() {
                        ready.insert(d);
                    }
                }
            } else {
                self.skip_dependents(plan, &dependents, id, &mut status, &mut ready, &mut outcome)
                    .await;
            }
        }

        // Whatever never started was cut off by cancellation or a halt.
        for (id, step) in plan.steps.iter().enumerate() {
            if status[id].is_none() {
                status[id] = Some(StepStatus::Skipped);
                outcome.skipped += 1;
                self.post_skipped(step).await;
            }
        }

        drop(running);
        let mut working = working.into_inner();
        if outcome.fatal.is_none() {
            if let Err(e) = self.persist(&mut working).await {
                outcome.fatal = Some(e);
            }
        }
        outcome
    }

    fn halted(&self, outcome: &Outcome) -> bool {
        self.cancel.is_cancelled() || outcome.fatal.is_some()
    }

    async fn skip_dependents(
        &self,
        plan: &Plan,
        dependents: &[Vec<StepId>],
        failed: StepId,
        status: &mut [Option<StepStatus>],
        ready: &mut BTreeSet<StepId>,
        outcome: &mut Outcome,
    ) {
        let mut queue: VecDeque<StepId> = dependents[failed].iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if status[id].is_some() {
                continue;
            }
            status[id] = Some(StepStatus::Skipped);
            ready.remove(&id);
            outcome.skipped += 1;
            self.post_skipped(&plan.steps[id]).await;
            queue.extend(dependents[id].iter().copied());
        }
    }

    async fn post_skipped(&self, step: &Step) {
        self.events
            .emit(EventKind::ResourcePost {
                step: step.metadata(),
                status: StepStatus::Skipped,
                id: None,
                outputs: None,
                error: None,
                duration_ms: 0,
            })
            .await;
    }

    async fn run_step(&self, step: &Step, working: &Mutex<WorkingSnapshot>) -> StepResult {
        let started = Instant::now();
        self.events
            .emit(EventKind::ResourcePre {
                step: step.metadata(),
                preview: false,
            })
            .await;

        let result = match step.op {
            StepOp::Same => self.same(step, working).await,
            StepOp::Create | StepOp::CreateReplacement | StepOp::Update => {
                self.apply(step, working).await
            }
            StepOp::Delete | StepOp::DeleteReplaced => self.remove(step, working).await,
            StepOp::Read => self.read(step, working).await,
        };

        let (status, id, outputs, error) = match &result {
            Ok(applied) => (
                StepStatus::Succeeded,
                applied.id.clone(),
                applied.outputs.as_ref().map(mask),
                None,
            ),
            Err(Failure::Step(message)) => (StepStatus::Failed, None, None, Some(message.clone())),
            Err(Failure::Fatal(e)) => (StepStatus::Failed, None, None, Some(e.to_string())),
        };
        self.events
            .emit(EventKind::ResourcePost {
                step: step.metadata(),
                status,
                id,
                outputs,
                error,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
        result
    }

    async fn persist(&self, working: &mut WorkingSnapshot) -> Result<(), EngineError> {
        if let Some(snapshot) = working.next_write() {
            self.store.save(&snapshot).await?;
        }
        Ok(())
    }

    async fn begin(
        &self,
        working: &Mutex<WorkingSnapshot>,
        step: &Step,
        op: OperationType,
    ) -> Result<(), EngineError> {
        let mut w = working.lock().await;
        let id = step.old.as_ref().and_then(|o| o.state.id.clone());
        w.begin(step.id, &step.urn, op, id);
        self.persist(&mut w).await
    }

    /// The provider may still finish an abandoned call, so its pending
    /// operation stays in the checkpoint for the next run to report.
    fn keep_pending(&self, step: &Step, error: &ProviderError) {
        tracing::warn!(
            urn = %step.urn,
            error = %error,
            "provider call abandoned, keeping its pending operation"
        );
    }

    fn client(&self, step: &Step) -> Result<ProviderClient, Failure> {
        let provider = step
            .provider
            .clone()
            .ok_or_else(|| Failure::Step(format!("no provider for {}", step.urn)))?;
        Ok(ProviderClient::new(
            provider,
            self.cancel.clone(),
            self.config.timeouts.read(),
        ))
    }

    // ── Same ────────────────────────────────────────────────────────────────

    async fn same(&self, step: &Step, working: &Mutex<WorkingSnapshot>) -> StepResult {
        let (Some(goal), Some(old)) = (&step.goal, &step.old) else {
            return Err(Failure::Step("same step without prior state".into()));
        };
        let mut w = working.lock().await;
        let outputs = w.secrets.classify(
            &step.urn,
            &step.inputs,
            &goal.additional_secret_outputs,
            old.state.outputs.clone(),
        );
        let mut state = ResourceState::from_goal(
            step.urn.clone(),
            goal,
            old.state.id.clone(),
            step.inputs.clone(),
            outputs.clone(),
        );
        state.init_errors = old.state.init_errors.clone();
        state.created = old.state.created;
        state.modified = old.state.modified;
        w.record(step.ordinal, state);
        w.consume(old.index);
        self.persist(&mut w).await?;
        Ok(Applied {
            id: old.state.id.clone(),
            outputs: Some(outputs),
        })
    }

    // ── Create, replace, update ─────────────────────────────────────────────

    async fn apply(&self, step: &Step, working: &Mutex<WorkingSnapshot>) -> StepResult {
        let Some(goal) = &step.goal else {
            return Err(Failure::Step("create or update step without a goal".into()));
        };
        let (before, after, pending_op) = match step.op {
            StepOp::Update => (
                HookType::BeforeUpdate,
                HookType::AfterUpdate,
                OperationType::Updating,
            ),
            _ => (
                HookType::BeforeCreate,
                HookType::AfterCreate,
                OperationType::Creating,
            ),
        };

        let inputs = self.resolve_inputs(step, working).await?;
        let old_id = step.old.as_ref().and_then(|o| o.state.id.clone());

        self.hooks
            .run(&goal.hooks, self.hook_context(step, before, old_id.clone(), &inputs, None))
            .await
            .map_err(|e| Failure::Step(e.to_string()))?;

        if !goal.custom {
            let outputs = step
                .old
                .as_ref()
                .map(|o| o.state.outputs.clone())
                .unwrap_or_default();
            let mut w = working.lock().await;
            let mut state =
                ResourceState::from_goal(step.urn.clone(), goal, None, inputs.clone(), outputs);
            stamp(&mut state, step);
            w.record(step.ordinal, state);
            if let Some(old) = &step.old {
                w.consume(old.index);
            }
            self.persist(&mut w).await?;
            drop(w);
            self.after_hook(step, &goal.hooks, after, None, &inputs, None)
                .await;
            return Ok(Applied {
                id: None,
                outputs: None,
            });
        }

        let client = self.client(step)?;
        self.begin(working, step, pending_op).await?;

        let timeout_secs = step.timeout.as_secs();
        let (result, cancelled) = match (step.op, &step.old) {
            (StepOp::Update, Some(old)) => {
                let id = old.state.id.clone().unwrap_or_default();
                let completion = client
                    .update(UpdateRequest {
                        urn: step.urn.clone(),
                        id: id.clone(),
                        olds: old.state.outputs.clone(),
                        news: inputs.clone(),
                        timeout_secs,
                    })
                    .await;
                (
                    completion.result.map(|r| (id, r.outputs)),
                    completion.cancelled,
                )
            }
            _ => {
                let completion = client
                    .create(CreateRequest {
                        urn: step.urn.clone(),
                        news: inputs.clone(),
                        timeout_secs,
                    })
                    .await;
                (
                    completion.result.map(|r| (r.id, r.outputs)),
                    completion.cancelled,
                )
            }
        };

        let mut w = working.lock().await;
        match &result {
            Err(e) if outcome_unknown(e) => self.keep_pending(step, e),
            _ => w.end(step.id),
        }
        let applied = match &result {
            Ok((id, outputs)) => {
                let outputs = w.secrets.classify(
                    &step.urn,
                    &inputs,
                    &goal.additional_secret_outputs,
                    outputs.clone(),
                );
                let mut state = ResourceState::from_goal(
                    step.urn.clone(),
                    goal,
                    Some(id.clone()),
                    inputs.clone(),
                    outputs.clone(),
                );
                stamp(&mut state, step);
                self.commit(&mut w, step, state);
                Some((id.clone(), outputs))
            }
            Err(e) => {
                if let Some(mut state) = partial_state(step, &inputs, e) {
                    state.outputs = w.secrets.classify(
                        &step.urn,
                        &inputs,
                        &goal.additional_secret_outputs,
                        state.outputs,
                    );
                    tracing::warn!(urn = %step.urn, error = %e, "recording partially applied resource");
                    self.commit(&mut w, step, state);
                }
                None
            }
        };
        self.persist(&mut w).await?;
        drop(w);

        let Some((id, outputs)) = applied else {
            let e = result.err().unwrap_or(ProviderError::Cancelled);
            return Err(Failure::Step(e.to_string()));
        };
        if cancelled {
            return Err(Failure::Step(
                "cancelled while in flight; the completed result was recorded".into(),
            ));
        }

        self.after_hook(step, &goal.hooks, after, Some(id.clone()), &inputs, Some(&outputs))
            .await;
        Ok(Applied {
            id: Some(id),
            outputs: Some(outputs),
        })
    }

    /// Record the new state for the step's goal and retire what it replaces.
    fn commit(&self, w: &mut WorkingSnapshot, step: &Step, state: ResourceState) {
        w.record(step.ordinal, state);
        let Some(old) = &step.old else {
            return;
        };
        match step.op {
            StepOp::Update => w.consume(old.index),
            StepOp::CreateReplacement if !step.delete_before_replace => {
                w.mark_pending_replacement(old.index)
            }
            _ => {}
        }
    }

    /// Inputs with output references resolved against the current state,
    /// re-validated when anything had been unknown at plan time.
    async fn resolve_inputs(
        &self,
        step: &Step,
        working: &Mutex<WorkingSnapshot>,
    ) -> Result<PropertyMap, Failure> {
        let Some(goal) = &step.goal else {
            return Ok(step.inputs.clone());
        };
        if !step.inputs.values().any(PropertyValue::contains_unknowns) {
            return Ok(step.inputs.clone());
        }

        let resolved = {
            let w = working.lock().await;
            resolve_map_outputs(&goal.properties, &|r: &OutputReference| {
                w.outputs_of(&r.urn)
                    .and_then(|outputs| outputs.get(&r.property).cloned())
            })
        };
        let resolved = match &step.old {
            Some(old) if step.op == StepOp::Update => {
                apply_ignore_changes(&step.urn, &goal.ignore_changes, &old.state.inputs, resolved)
                    .map_err(|e| Failure::Step(e.to_string()))?
            }
            _ => resolved,
        };
        if !goal.custom {
            return Ok(resolved);
        }

        let client = self.client(step)?;
        let response = client
            .check(CheckRequest {
                urn: step.urn.clone(),
                olds: step.old.as_ref().map(|o| o.state.inputs.clone()),
                news: resolved,
            })
            .await
            .map_err(|e| Failure::Step(e.to_string()))?;
        if !response.failures.is_empty() {
            let failures: Vec<String> = response
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.property, f.reason))
                .collect();
            return Err(Failure::Step(failures.join("; ")));
        }
        Ok(response.inputs)
    }

    // ── Delete ──────────────────────────────────────────────────────────────

    async fn remove(&self, step: &Step, working: &Mutex<WorkingSnapshot>) -> StepResult {
        let Some(old) = &step.old else {
            return Err(Failure::Step("delete step without prior state".into()));
        };

        if step.removal != Removal::Provider {
            tracing::info!(urn = %step.urn, removal = ?step.removal, "removing from state only");
            let mut w = working.lock().await;
            w.consume(old.index);
            self.persist(&mut w).await?;
            return Ok(Applied {
                id: old.state.id.clone(),
                outputs: None,
            });
        }

        let hooks = self.known_hooks(step, &old.state.hooks).await;
        self.hooks
            .run(
                &hooks,
                self.hook_context(
                    step,
                    HookType::BeforeDelete,
                    old.state.id.clone(),
                    &old.state.inputs,
                    Some(&old.state.outputs),
                ),
            )
            .await
            .map_err(|e| Failure::Step(e.to_string()))?;

        let mut cancelled = false;
        if old.state.custom {
            let client = self.client(step)?;
            self.begin(working, step, OperationType::Deleting).await?;
            let completion = client
                .delete(DeleteRequest {
                    urn: step.urn.clone(),
                    id: old.state.id.clone().unwrap_or_default(),
                    olds: old.state.outputs.clone(),
                    timeout_secs: step.timeout.as_secs(),
                })
                .await;
            cancelled = completion.cancelled;

            let mut w = working.lock().await;
            match &completion.result {
                Err(e) if outcome_unknown(e) => self.keep_pending(step, e),
                _ => w.end(step.id),
            }
            if completion.result.is_ok() {
                w.consume(old.index);
            }
            self.persist(&mut w).await?;
            drop(w);
            if let Err(e) = completion.result {
                return Err(Failure::Step(e.to_string()));
            }
        } else {
            let mut w = working.lock().await;
            w.consume(old.index);
            self.persist(&mut w).await?;
        }

        if cancelled {
            return Err(Failure::Step(
                "cancelled while in flight; the completed delete was recorded".into(),
            ));
        }
        self.after_hook(
            step,
            &hooks,
            HookType::AfterDelete,
            old.state.id.clone(),
            &old.state.inputs,
            Some(&old.state.outputs),
        )
        .await;
        Ok(Applied {
            id: old.state.id.clone(),
            outputs: None,
        })
    }

    // ── Read ────────────────────────────────────────────────────────────────

    async fn read(&self, step: &Step, working: &Mutex<WorkingSnapshot>) -> StepResult {
        let Some(old) = &step.old else {
            return Err(Failure::Step("read step without prior state".into()));
        };
        let client = self.client(step)?;
        self.begin(working, step, OperationType::Reading).await?;

        let result = client
            .read(ReadRequest {
                urn: step.urn.clone(),
                id: old.state.id.clone().unwrap_or_default(),
                inputs: old.state.inputs.clone(),
            })
            .await;

        let mut w = working.lock().await;
        w.end(step.id);
        let applied = match result {
            Ok(response) => match response.id {
                None => {
                    tracing::info!(urn = %step.urn, "resource no longer exists");
                    w.consume(old.index);
                    Ok(Applied {
                        id: None,
                        outputs: None,
                    })
                }
                Some(id) => {
                    let mut state = old.state.clone();
                    if !response.inputs.is_empty() {
                        state.inputs = response.inputs;
                    }
                    state.outputs = w.secrets.classify(
                        &step.urn,
                        &state.inputs,
                        &state.additional_secret_outputs,
                        response.outputs,
                    );
                    state.id = Some(id.clone());
                    let outputs = state.outputs.clone();
                    w.refresh(old.index, state);
                    Ok(Applied {
                        id: Some(id),
                        outputs: Some(outputs),
                    })
                }
            },
            Err(e) => Err(Failure::Step(e.to_string())),
        };
        self.persist(&mut w).await?;
        applied
    }

    // ── Hooks ───────────────────────────────────────────────────────────────

    fn hook_context(
        &self,
        step: &Step,
        hook_type: HookType,
        id: Option<String>,
        inputs: &PropertyMap,
        outputs: Option<&PropertyMap>,
    ) -> HookContext {
        HookContext {
            urn: step.urn.clone(),
            hook_type,
            id,
            inputs: inputs.clone(),
            outputs: outputs.cloned().unwrap_or_default(),
        }
    }

    async fn after_hook(
        &self,
        step: &Step,
        hooks: &ResourceHooks,
        hook_type: HookType,
        id: Option<String>,
        inputs: &PropertyMap,
        outputs: Option<&PropertyMap>,
    ) {
        let ctx = self.hook_context(step, hook_type, id, inputs, outputs);
        if let Err(e) = self.hooks.run(hooks, ctx).await {
            self.events
                .diagnostic(Severity::Warning, Some(&step.urn), e.to_string())
                .await;
        }
    }

    /// Hooks recorded on a prior state may no longer be registered; those
    /// are skipped with a warning rather than failing the delete.
    async fn known_hooks(&self, step: &Step, hooks: &ResourceHooks) -> ResourceHooks {
        let unknown = self.hooks.unknown(hooks);
        if unknown.is_empty() {
            return hooks.clone();
        }
        for name in &unknown {
            self.events
                .diagnostic(
                    Severity::Warning,
                    Some(&step.urn),
                    format!("skipping unknown hook '{name}'"),
                )
                .await;
        }
        hooks
            .iter()
            .map(|(hook_type, names)| {
                let names = names
                    .iter()
                    .filter(|n| self.hooks.contains(n))
                    .cloned()
                    .collect();
                (*hook_type, names)
            })
            .collect()
    }
}

/// True if a failed mutating call may still have taken effect.
fn outcome_unknown(error: &ProviderError) -> bool {
    matches!(error, ProviderError::Timeout(_) | ProviderError::Cancelled)
}

fn stamp(state: &mut ResourceState, step: &Step) {
    let now = jiff::Timestamp::now();
    state.created = match (&step.old, step.op) {
        (Some(old), StepOp::Update) => old.state.created.or(Some(now)),
        _ => Some(now),
    };
    state.modified = Some(now);
}

/// The state to record after a failed create or update that still left
/// something behind.
fn partial_state(step: &Step, inputs: &PropertyMap, error: &ProviderError) -> Option<ResourceState> {
    let goal = step.goal.as_ref()?;
    let partial = error.partial()?;
    let (id, outputs) = match (step.op, &step.old) {
        (StepOp::Update, Some(old)) => {
            let outputs = if partial.outputs.is_empty() {
                old.state.outputs.clone()
            } else {
                partial.outputs.clone()
            };
            (old.state.id.clone(), outputs)
        }
        _ => (Some(partial.id.clone()?), partial.outputs.clone()),
    };
    let mut state = ResourceState::from_goal(step.urn.clone(), goal, id, inputs.clone(), outputs);
    state.init_errors = vec![error.to_string()];
    stamp(&mut state, step);
    Some(state)
}
