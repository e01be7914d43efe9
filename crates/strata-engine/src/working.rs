//! The in-progress snapshot of a run.
//!
//! New states land in goal order ahead of the prior records that have not
//! been dealt with yet, which keeps every materialized snapshot in valid
//! topological order while steps complete in any order.

use std::collections::{BTreeMap, HashSet};

use strata_core::{
    Manifest, OperationType, PendingOperation, PropertyMap, ResourceState, Snapshot, Urn,
};

use crate::secrets::SecretLedger;
use crate::step::StepId;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
pub struct WorkingSnapshot {
    manifest: Manifest,
    base: Vec<ResourceState>,
    consumed: Vec<bool>,
    pending_replacement: HashSet<usize>,
    /// New states keyed by goal ordinal.
    done: BTreeMap<usize, ResourceState>,
    pending: BTreeMap<StepId, PendingOperation>,
    last_written: Snapshot,
    pub secrets: SecretLedger,
}

impl WorkingSnapshot {
    pub fn new(prior: Snapshot) -> Self {
        let mut secrets = SecretLedger::default();
        for state in &prior.resources {
            secrets.observe(&state.urn, &state.outputs);
        }
        Self {
            manifest: prior.manifest.clone(),
            consumed: vec![false; prior.resources.len()],
            base: prior.resources.clone(),
            pending_replacement: HashSet::new(),
            done: BTreeMap::new(),
            pending: BTreeMap::new(),
            last_written: prior,
            secrets,
        }
    }

    pub fn begin(&mut self, step: StepId, urn: &Urn, op: OperationType, id: Option<String>) {
        self.pending.insert(
            step,
            PendingOperation {
                urn: urn.clone(),
                op,
                id,
                started: jiff::Timestamp::now(),
            },
        );
    }

    pub fn end(&mut self, step: StepId) {
        self.pending.remove(&step);
    }

    /// Record the new state of the goal at `ordinal`.
    pub fn record(&mut self, ordinal: usize, state: ResourceState) {
        self.secrets.observe(&state.urn, &state.outputs);
        self.done.insert(ordinal, state);
    }

    /// The prior record at `index` is gone from the stack.
    pub fn consume(&mut self, index: usize) {
        if let Some(slot) = self.consumed.get_mut(index) {
            *slot = true;
        }
        self.pending_replacement.remove(&index);
    }

    /// The prior record at `index` has been superseded and awaits deletion.
    pub fn mark_pending_replacement(&mut self, index: usize) {
        self.pending_replacement.insert(index);
    }

    /// Replace a prior record in place, as a refresh does.
    pub fn refresh(&mut self, index: usize, state: ResourceState) {
        if let Some(slot) = self.base.get_mut(index) {
            self.secrets.observe(&state.urn, &state.outputs);
            *slot = state;
        }
    }

    /// Current outputs of the live resource `urn`.
    pub fn outputs_of(&self, urn: &Urn) -> Option<&PropertyMap> {
        if let Some(state) = self.done.values().find(|s| &s.urn == urn) {
            return Some(&state.outputs);
        }
        self.base
            .iter()
            .enumerate()
            .find(|(i, s)| {
                &s.urn == urn
                    && !s.delete
                    && !self.consumed[*i]
                    && !self.pending_replacement.contains(i)
            })
            .map(|(_, s)| &s.outputs)
    }

    pub fn materialize(&self) -> Snapshot {
        let mut resources: Vec<ResourceState> = self.done.values().cloned().collect();
        for (index, state) in self.base.iter().enumerate() {
            if self.consumed[index] {
                continue;
            }
            let mut state = state.clone();
            if self.pending_replacement.contains(&index) {
                state.delete = true;
            }
            resources.push(state);
        }
        scrub_dangling(&mut resources);
        Snapshot {
            manifest: self.manifest.clone(),
            resources,
            pending_operations: self.pending.values().cloned().collect(),
        }
    }

    /// The snapshot to persist, or `None` if nothing changed since the last
    /// write. Manifest time alone does not count as a change.
    pub fn next_write(&mut self) -> Option<Snapshot> {
        let mut snapshot = self.materialize();
        if snapshot.resources == self.last_written.resources
            && snapshot.pending_operations == self.last_written.pending_operations
        {
            return None;
        }
        snapshot.manifest.time = Some(jiff::Timestamp::now());
        snapshot.manifest.engine_version = ENGINE_VERSION.to_string();
        self.manifest = snapshot.manifest.clone();
        self.last_written = snapshot.clone();
        Some(snapshot)
    }
}

/// Drop references to resources that no longer precede the referrer.
///
/// This only triggers when a resource vanished while something still points
/// at it: a delete-before-replace whose create has not run, or a refresh
/// that found a resource gone.
fn scrub_dangling(resources: &mut [ResourceState]) {
    let mut seen: HashSet<Urn> = HashSet::new();
    for state in resources.iter_mut() {
        let missing: Vec<Urn> = state
            .references()
            .into_iter()
            .filter(|urn| !seen.contains(*urn))
            .cloned()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(urn = %state.urn, missing = ?missing, "dropping dangling references");
            state.dependencies.retain(|u| !missing.contains(u));
            for deps in state.property_dependencies.values_mut() {
                deps.retain(|u| !missing.contains(u));
            }
            state.property_dependencies.retain(|_, deps| !deps.is_empty());
            if state.parent.as_ref().is_some_and(|p| missing.contains(p)) {
                state.parent = None;
            }
            if state.deleted_with.as_ref().is_some_and(|d| missing.contains(d)) {
                state.deleted_with = None;
            }
            if let Some(provider) = &mut state.provider {
                if provider.resource.as_ref().is_some_and(|r| missing.contains(r)) {
                    provider.resource = None;
                }
            }
        }
        seen.insert(state.urn.clone());
    }
}
