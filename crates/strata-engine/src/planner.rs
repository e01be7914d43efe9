//! Diff and step planning.
//!
//! Goals are visited in topological order and each produces exactly one
//! outcome (same, create, update or replace); prior states no goal claims
//! produce deletes. The plan also records which steps must finish before
//! which, which is all the executor needs to schedule them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use strata_core::property::resolve_map_outputs;
use strata_core::{
    Goal, OutputReference, PropertyMap, PropertyPath, PropertyValue, ResourceState, Snapshot, Urn,
};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::graph::{GoalGraph, ResolvedGoal};
use crate::hooks::HookRegistry;
use crate::provider::{
    CheckRequest, DiffChanges, DiffRequest, DiffResponse, ProviderClient, ProviderRegistry,
    ResourceProvider,
};
use crate::step::{ChangeKind, OldState, Removal, Step, StepId, StepOp};

pub struct Plan {
    pub steps: Vec<Step>,
    /// `waits_on[i]` lists the steps that must reach a terminal state before
    /// step `i` may start.
    pub waits_on: Vec<Vec<StepId>>,
    /// Non-fatal findings to surface as warning diagnostics.
    pub warnings: Vec<(Option<Urn>, String)>,
}

impl Plan {
    pub fn counts(&self) -> BTreeMap<ChangeKind, usize> {
        let mut counts = BTreeMap::new();
        for step in &self.steps {
            if let Some(kind) = step.op.change_kind() {
                *counts.entry(kind).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Steps that depend on step `id`, inverted from `waits_on`.
    pub fn dependents(&self) -> Vec<Vec<StepId>> {
        let mut dependents = vec![Vec::new(); self.steps.len()];
        for (step, waits) in self.waits_on.iter().enumerate() {
            for &w in waits {
                dependents[w].push(step);
            }
        }
        dependents
    }
}

pub struct PlanContext<'a> {
    pub graph: &'a GoalGraph,
    pub prior: &'a Snapshot,
    pub providers: &'a ProviderRegistry,
    pub hooks: &'a HookRegistry,
    pub config: &'a EngineConfig,
    pub cancel: &'a CancellationToken,
}

pub async fn plan(ctx: &PlanContext<'_>) -> Result<Plan, EngineError> {
    let mut planner = Planner {
        ctx,
        steps: Vec::new(),
        primary: HashMap::new(),
        disposal: HashMap::new(),
        replacements: Vec::new(),
        same_outputs: HashMap::new(),
        protected: Vec::new(),
        warnings: Vec::new(),
    };

    for resolved in &ctx.graph.goals {
        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        planner.plan_goal(resolved).await?;
    }
    planner.plan_deletes()?;

    if !planner.protected.is_empty() {
        let mut urns = planner.protected;
        urns.sort();
        urns.dedup();
        return Err(EngineError::Protected { urns });
    }

    planner.propagate_delete_before_replace();
    let waits_on = planner.wire();
    let plan = Plan {
        steps: planner.steps,
        waits_on,
        warnings: planner.warnings,
    };
    check_acyclic(&plan)?;

    tracing::info!(
        steps = plan.steps.len(),
        counts = ?plan.counts(),
        "plan ready"
    );
    Ok(plan)
}

struct Replacement {
    urn: Urn,
    create: StepId,
    delete: StepId,
    delete_before_replace: bool,
}

struct Planner<'a> {
    ctx: &'a PlanContext<'a>,
    steps: Vec<Step>,
    /// Goal URN → the step that brings it to its desired state.
    primary: HashMap<Urn, StepId>,
    /// Prior state index → the step that removes it.
    disposal: HashMap<usize, StepId>,
    replacements: Vec<Replacement>,
    /// Outputs of goals planned as same, usable to resolve references now.
    same_outputs: HashMap<Urn, PropertyMap>,
    protected: Vec<Urn>,
    warnings: Vec<(Option<Urn>, String)>,
}

impl Planner<'_> {
    fn push(&mut self, mut step: Step) -> StepId {
        let id = self.steps.len();
        step.id = id;
        tracing::debug!(urn = %step.urn, op = ?step.op, id, "step planned");
        self.steps.push(step);
        id
    }

    fn client(&self, provider: &Arc<dyn ResourceProvider>) -> ProviderClient {
        ProviderClient::new(
            provider.clone(),
            self.ctx.cancel.clone(),
            self.ctx.config.timeouts.read(),
        )
    }

    fn goal_step(
        &self,
        op: StepOp,
        resolved: &ResolvedGoal,
        old: Option<OldState>,
        inputs: PropertyMap,
        diff: Vec<String>,
    ) -> Step {
        let timeouts = &resolved.goal.custom_timeouts;
        let defaults = &self.ctx.config.timeouts;
        let timeout = match op {
            StepOp::Update => timeouts.update_duration().unwrap_or(defaults.update()),
            _ => timeouts.create_duration().unwrap_or(defaults.create()),
        };
        Step {
            id: 0,
            op,
            urn: resolved.urn.clone(),
            goal: Some(resolved.goal.clone()),
            old,
            inputs,
            diff,
            provider: resolved.provider.clone(),
            removal: Removal::Provider,
            delete_before_replace: false,
            ordinal: resolved.ordinal,
            timeout,
        }
    }

    async fn plan_goal(&mut self, resolved: &ResolvedGoal) -> Result<(), EngineError> {
        let goal = &resolved.goal;
        let urn = &resolved.urn;
        let old = resolved.old.map(|index| OldState {
            index,
            state: self.ctx.prior.resources[index].clone(),
        });

        let news = resolve_map_outputs(&goal.properties, &|r: &OutputReference| {
            self.same_outputs
                .get(&r.urn)
                .and_then(|outputs| outputs.get(&r.property).cloned())
        });

        if let Some(old) = &old {
            for hook in self.ctx.hooks.unknown(&old.state.hooks) {
                self.warnings.push((
                    Some(old.state.urn.clone()),
                    format!("prior state references unknown hook '{hook}'"),
                ));
            }
        }

        let Some(provider) = resolved.provider.clone() else {
            // Components: no provider, inputs compared directly.
            let step = match old {
                None => self.goal_step(StepOp::Create, resolved, None, news, Vec::new()),
                Some(old) if old.state.inputs == news => {
                    self.same_outputs
                        .insert(urn.clone(), old.state.outputs.clone());
                    let inputs = old.state.inputs.clone();
                    self.goal_step(StepOp::Same, resolved, Some(old), inputs, Vec::new())
                }
                Some(old) => {
                    let diff = changed_keys(&old.state.inputs, &news);
                    self.goal_step(StepOp::Update, resolved, Some(old), news, diff)
                }
            };
            let id = self.push(step);
            self.primary.insert(urn.clone(), id);
            return Ok(());
        };

        let client = self.client(&provider);

        let Some(old) = old else {
            let inputs = self.check(&client, resolved, None, news).await?;
            let step = self.goal_step(StepOp::Create, resolved, None, inputs, Vec::new());
            let id = self.push(step);
            self.primary.insert(urn.clone(), id);
            return Ok(());
        };

        let news = apply_ignore_changes(urn, &goal.ignore_changes, &old.state.inputs, news)?;
        let provider_changed = provider_identity(goal) != state_provider_identity(&old.state);
        let needs_update = !old.state.init_errors.is_empty();

        if !provider_changed && !needs_update && news == old.state.inputs {
            self.same_outputs
                .insert(urn.clone(), old.state.outputs.clone());
            let step = self.goal_step(StepOp::Same, resolved, Some(old), news, Vec::new());
            let id = self.push(step);
            self.primary.insert(urn.clone(), id);
            return Ok(());
        }

        let inputs = self
            .check(&client, resolved, Some(old.state.inputs.clone()), news)
            .await?;

        let diff = if provider_changed {
            tracing::info!(urn = %urn, "provider changed, resource will be replaced");
            DiffResponse {
                changes: DiffChanges::Some,
                ..DiffResponse::default()
            }
        } else {
            client
                .diff(DiffRequest {
                    urn: urn.clone(),
                    id: old.state.id.clone().unwrap_or_default(),
                    old_inputs: old.state.inputs.clone(),
                    old_outputs: old.state.outputs.clone(),
                    news: inputs.clone(),
                    ignore_changes: goal.ignore_changes.clone(),
                })
                .await
                .map_err(|source| EngineError::Provider {
                    urn: urn.clone(),
                    source,
                })?
        };

        let computed = changed_keys(&old.state.inputs, &inputs);
        let has_changes = match diff.changes {
            DiffChanges::None => false,
            DiffChanges::Some => true,
            DiffChanges::Unknown => !computed.is_empty(),
        };
        let mut changed: BTreeSet<String> = if diff.changed_keys.is_empty() {
            computed.into_iter().collect()
        } else {
            diff.changed_keys.iter().cloned().collect()
        };
        changed.extend(diff.replaces.iter().cloned());

        let forced = has_changes
            && replace_on_changes_hit(urn, &goal.replace_on_changes, &old.state.inputs, &inputs)?;
        let replace = provider_changed || !diff.replaces.is_empty() || forced;
        let changed: Vec<String> = changed.into_iter().collect();

        if replace {
            if old.state.protect {
                self.protected.push(old.state.urn.clone());
            }
            let delete_before_replace = goal
                .delete_before_replace
                .unwrap_or(diff.delete_before_replace);
            self.plan_replacement(resolved, old, inputs, changed, delete_before_replace);
            return Ok(());
        }

        let op = if has_changes || needs_update || inputs.values().any(PropertyValue::contains_unknowns) {
            StepOp::Update
        } else {
            self.same_outputs
                .insert(urn.clone(), old.state.outputs.clone());
            StepOp::Same
        };
        let step = self.goal_step(op, resolved, Some(old), inputs, changed);
        let id = self.push(step);
        self.primary.insert(urn.clone(), id);
        Ok(())
    }

    fn plan_replacement(
        &mut self,
        resolved: &ResolvedGoal,
        old: OldState,
        inputs: PropertyMap,
        diff: Vec<String>,
        delete_before_replace: bool,
    ) {
        let index = old.index;
        let delete_timeout = resolved
            .goal
            .custom_timeouts
            .delete_duration()
            .or_else(|| old.state.custom_timeouts.delete_duration())
            .unwrap_or(self.ctx.config.timeouts.delete());
        let old_provider = self
            .ctx
            .providers
            .get(old.state.provider_package())
            .or_else(|| resolved.provider.clone());

        let mut create = self.goal_step(
            StepOp::CreateReplacement,
            resolved,
            Some(old.clone()),
            inputs,
            diff.clone(),
        );
        create.delete_before_replace = delete_before_replace;

        let delete = Step {
            id: 0,
            op: StepOp::DeleteReplaced,
            urn: old.state.urn.clone(),
            goal: None,
            old: Some(old),
            inputs: PropertyMap::new(),
            diff,
            provider: old_provider,
            removal: Removal::Provider,
            delete_before_replace,
            ordinal: resolved.ordinal,
            timeout: delete_timeout,
        };

        let (create, delete) = if delete_before_replace {
            let delete = self.push(delete);
            (self.push(create), delete)
        } else {
            let create = self.push(create);
            (create, self.push(delete))
        };
        self.primary.insert(resolved.urn.clone(), create);
        self.disposal.insert(index, delete);
        self.replacements.push(Replacement {
            urn: resolved.urn.clone(),
            create,
            delete,
            delete_before_replace,
        });
    }

    async fn check(
        &self,
        client: &ProviderClient,
        resolved: &ResolvedGoal,
        olds: Option<PropertyMap>,
        news: PropertyMap,
    ) -> Result<PropertyMap, EngineError> {
        let urn = &resolved.urn;
        let response = client
            .check(CheckRequest {
                urn: urn.clone(),
                olds,
                news,
            })
            .await
            .map_err(|source| EngineError::Provider {
                urn: urn.clone(),
                source,
            })?;
        if !response.failures.is_empty() {
            return Err(EngineError::CheckFailed {
                urn: urn.clone(),
                failures: response
                    .failures
                    .into_iter()
                    .map(|f| format!("{}: {}", f.property, f.reason))
                    .collect(),
            });
        }
        Ok(response.inputs)
    }

    fn plan_deletes(&mut self) -> Result<(), EngineError> {
        let prior = self.ctx.prior;

        // Every prior URN that will be gone once the plan completes.
        let mut doomed: HashSet<&Urn> = prior
            .resources
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.ctx.graph.is_claimed(*i))
            .map(|(_, r)| &r.urn)
            .collect();
        for index in self.disposal.keys() {
            doomed.insert(&prior.resources[*index].urn);
        }

        // Reverse order so dependents are planned before what they depend on.
        for (index, state) in prior.resources.iter().enumerate().rev() {
            if self.ctx.graph.is_claimed(index) {
                continue;
            }
            if state.protect {
                self.protected.push(state.urn.clone());
            }

            let removal = if state.retain_on_delete {
                Removal::Retain
            } else {
                match &state.deleted_with {
                    Some(anchor) if doomed.contains(anchor) => Removal::DeletedWith(anchor.clone()),
                    _ => Removal::Provider,
                }
            };

            let provider = if removal == Removal::Provider && state.custom {
                let package = state.provider_package();
                Some(self.ctx.providers.get(package).ok_or_else(|| {
                    EngineError::UnknownProvider {
                        urn: state.urn.clone(),
                        package: package.to_string(),
                    }
                })?)
            } else {
                None
            };

            for hook in self.ctx.hooks.unknown(&state.hooks) {
                self.warnings.push((
                    Some(state.urn.clone()),
                    format!("prior state references unknown hook '{hook}'"),
                ));
            }

            let op = if state.delete {
                StepOp::DeleteReplaced
            } else {
                StepOp::Delete
            };
            let step = Step {
                id: 0,
                op,
                urn: state.urn.clone(),
                goal: None,
                old: Some(OldState {
                    index,
                    state: state.clone(),
                }),
                inputs: PropertyMap::new(),
                diff: Vec::new(),
                provider,
                removal,
                delete_before_replace: false,
                ordinal: usize::MAX,
                timeout: state
                    .custom_timeouts
                    .delete_duration()
                    .unwrap_or(self.ctx.config.timeouts.delete()),
            };
            let id = self.push(step);
            self.disposal.insert(index, id);
        }
        Ok(())
    }

    /// A replaced dependent of a delete-before-replace resource must be
    /// deleted before it and created after it, so it is switched to
    /// delete-before-replace as well. Replacements are in goal order, so one
    /// pass carries the switch down whole dependency chains.
    fn propagate_delete_before_replace(&mut self) {
        let graph = self.ctx.graph;
        let by_urn: HashMap<Urn, usize> = self
            .replacements
            .iter()
            .enumerate()
            .map(|(i, r)| (r.urn.clone(), i))
            .collect();
        for i in 0..self.replacements.len() {
            if !self.replacements[i].delete_before_replace {
                continue;
            }
            let anchor = self.replacements[i].urn.clone();
            for dependent in graph.dependents_of(&anchor) {
                let Some(&j) = by_urn.get(&dependent.urn) else {
                    continue;
                };
                let r = &mut self.replacements[j];
                if r.delete_before_replace {
                    continue;
                }
                tracing::info!(
                    urn = %r.urn,
                    dependency = %anchor,
                    "dependency is deleted before replacement, deleting dependent first too"
                );
                r.delete_before_replace = true;
                let (create, delete) = (r.create, r.delete);
                self.steps[create].delete_before_replace = true;
                self.steps[delete].delete_before_replace = true;
            }
        }
    }

    /// Build the step dependency lists.
    fn wire(&self) -> Vec<Vec<StepId>> {
        let graph = self.ctx.graph;
        let prior = self.ctx.prior;
        let mut waits: Vec<BTreeSet<StepId>> = vec![BTreeSet::new(); self.steps.len()];

        // Goals wait for the goals they depend on.
        for resolved in &graph.goals {
            let Some(&step) = self.primary.get(&resolved.urn) else {
                continue;
            };
            for dependency in resolved.goal.all_dependencies() {
                if let Some(&dep_step) = self.primary.get(dependency) {
                    waits[step].insert(dep_step);
                }
            }
        }

        // Replacement halves.
        for r in &self.replacements {
            if r.delete_before_replace {
                waits[r.create].insert(r.delete);
            } else {
                waits[r.delete].insert(r.create);
                for dependent in graph.dependents_of(&r.urn) {
                    if let Some(&step) = self.primary.get(&dependent.urn) {
                        waits[r.delete].insert(step);
                    }
                }
            }
        }

        // A resource is removed only after everything that referred to it.
        let dbr_deletes: HashSet<StepId> = self
            .replacements
            .iter()
            .filter(|r| r.delete_before_replace)
            .map(|r| r.delete)
            .collect();
        for (&index, &delete) in &self.disposal {
            let target = &prior.resources[index].urn;
            for (other, state) in prior.resources.iter().enumerate() {
                if other == index || !state.refers_to(target) {
                    continue;
                }
                if let Some(&other_step) = self.disposal.get(&other) {
                    let anchored_here = matches!(
                        &self.steps[other_step].removal,
                        Removal::DeletedWith(anchor) if anchor == target
                    );
                    if !anchored_here && !self.is_replacement_of(other_step, index) {
                        waits[delete].insert(other_step);
                    }
                }
                if dbr_deletes.contains(&delete) {
                    continue;
                }
                let claimant_step = graph
                    .claimant(other)
                    .and_then(|claimant| self.primary.get(&claimant.urn).copied());
                if let Some(step) = claimant_step.filter(|&step| step != delete) {
                    waits[delete].insert(step);
                }
            }
        }

        // DeletedWith removals follow their anchor's deletion.
        for &removal_step in self.disposal.values() {
            let Removal::DeletedWith(anchor) = &self.steps[removal_step].removal else {
                continue;
            };
            for (&index, &anchor_step) in &self.disposal {
                if &prior.resources[index].urn == anchor {
                    waits[removal_step].insert(anchor_step);
                }
            }
        }

        waits.into_iter().map(|w| w.into_iter().collect()).collect()
    }

    /// True if `step` replaces the resource at prior `index`; the two halves
    /// of a replacement are already ordered against each other.
    fn is_replacement_of(&self, step: StepId, index: usize) -> bool {
        self.steps[step]
            .old
            .as_ref()
            .is_some_and(|old| old.index == index)
    }
}

/// One read step per custom resource that has an ID. Reads are independent
/// of each other.
pub fn plan_refresh(
    prior: &Snapshot,
    providers: &ProviderRegistry,
    config: &EngineConfig,
) -> Result<Plan, EngineError> {
    let mut steps = Vec::new();
    for (index, state) in prior.resources.iter().enumerate() {
        if !state.custom || state.id.is_none() {
            continue;
        }
        let package = state.provider_package();
        let provider = providers
            .get(package)
            .ok_or_else(|| EngineError::UnknownProvider {
                urn: state.urn.clone(),
                package: package.to_string(),
            })?;
        steps.push(Step {
            id: steps.len(),
            op: StepOp::Read,
            urn: state.urn.clone(),
            goal: None,
            old: Some(OldState {
                index,
                state: state.clone(),
            }),
            inputs: PropertyMap::new(),
            diff: Vec::new(),
            provider: Some(provider),
            removal: Removal::Provider,
            delete_before_replace: false,
            ordinal: index,
            timeout: config.timeouts.read(),
        });
    }
    Ok(Plan {
        waits_on: vec![Vec::new(); steps.len()],
        steps,
        warnings: Vec::new(),
    })
}

fn check_acyclic(plan: &Plan) -> Result<(), EngineError> {
    let mut remaining: Vec<usize> = plan.waits_on.iter().map(Vec::len).collect();
    let dependents = plan.dependents();
    let mut ready: Vec<StepId> = (0..plan.steps.len()).filter(|&i| remaining[i] == 0).collect();
    let mut seen = 0;
    while let Some(step) = ready.pop() {
        seen += 1;
        for &d in &dependents[step] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.push(d);
            }
        }
    }
    if seen == plan.steps.len() {
        return Ok(());
    }
    let mut members: Vec<Urn> = remaining
        .iter()
        .enumerate()
        .filter(|(_, n)| **n > 0)
        .map(|(i, _)| plan.steps[i].urn.clone())
        .collect();
    members.sort();
    members.dedup();
    Err(EngineError::Cycle { members })
}

// ── Property helpers ────────────────────────────────────────────────────────

/// Top-level keys whose values differ between `olds` and `news`.
pub fn changed_keys(olds: &PropertyMap, news: &PropertyMap) -> Vec<String> {
    let keys: BTreeSet<&String> = olds.keys().chain(news.keys()).collect();
    keys.into_iter()
        .filter(|k| olds.get(*k) != news.get(*k))
        .cloned()
        .collect()
}

fn parse_paths(urn: &Urn, paths: &[String]) -> Result<Vec<PropertyPath>, EngineError> {
    paths
        .iter()
        .map(|p| {
            PropertyPath::from_str(p).map_err(|e| EngineError::InvalidGoal {
                urn: urn.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Keep the old value (or absence) at every ignored path.
pub fn apply_ignore_changes(
    urn: &Urn,
    ignore_changes: &[String],
    olds: &PropertyMap,
    mut news: PropertyMap,
) -> Result<PropertyMap, EngineError> {
    for path in parse_paths(urn, ignore_changes)? {
        let path = path.concrete_prefix();
        if path.segments().is_empty() {
            return Ok(olds.clone());
        }
        match path.get(olds) {
            Some(value) => {
                path.set(&mut news, value.clone());
            }
            None => {
                path.delete(&mut news);
            }
        }
    }
    Ok(news)
}

fn replace_on_changes_hit(
    urn: &Urn,
    replace_on_changes: &[String],
    olds: &PropertyMap,
    news: &PropertyMap,
) -> Result<bool, EngineError> {
    for path in parse_paths(urn, replace_on_changes)? {
        let path = path.concrete_prefix();
        if path.segments().is_empty() || path.get(olds) != path.get(news) {
            return Ok(true);
        }
    }
    Ok(false)
}

type ProviderIdentity<'a> = (&'a str, Option<&'a Urn>);

fn provider_identity(goal: &Goal) -> ProviderIdentity<'_> {
    (
        goal.provider_package(),
        goal.provider.as_ref().and_then(|p| p.resource.as_ref()),
    )
}

fn state_provider_identity(state: &ResourceState) -> ProviderIdentity<'_> {
    (
        state.provider_package(),
        state.provider.as_ref().and_then(|p| p.resource.as_ref()),
    )
}
