//! Goal graph: URN assignment, alias resolution and dependency ordering.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use strata_core::{Goal, Snapshot, Urn};

use crate::error::EngineError;
use crate::hooks::HookRegistry;
use crate::provider::{ProviderRegistry, ResourceProvider};

/// A goal with its identity settled.
pub struct ResolvedGoal {
    pub urn: Urn,
    pub goal: Goal,
    /// Index of the prior state this goal continues, if any.
    pub old: Option<usize>,
    pub provider: Option<Arc<dyn ResourceProvider>>,
    /// Position in topological order.
    pub ordinal: usize,
}

/// Goals in a stable topological order: dependencies first, ties broken by
/// declaration order.
pub struct GoalGraph {
    pub goals: Vec<ResolvedGoal>,
    by_urn: HashMap<Urn, usize>,
    claimed: HashMap<usize, usize>,
}

impl GoalGraph {
    pub fn get(&self, urn: &Urn) -> Option<&ResolvedGoal> {
        self.by_urn.get(urn).map(|&i| &self.goals[i])
    }

    pub fn ordinal_of(&self, urn: &Urn) -> Option<usize> {
        self.by_urn.get(urn).copied()
    }

    /// The goal that continues prior state `index`, if any.
    pub fn claimant(&self, index: usize) -> Option<&ResolvedGoal> {
        self.claimed.get(&index).map(|&i| &self.goals[i])
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.claimed.contains_key(&index)
    }

    /// Goals that list `urn` among their dependencies.
    pub fn dependents_of<'a>(&'a self, urn: &'a Urn) -> impl Iterator<Item = &'a ResolvedGoal> {
        self.goals
            .iter()
            .filter(move |g| g.goal.all_dependencies().contains(&urn))
    }
}

pub struct GraphInputs<'a> {
    pub stack: &'a str,
    pub project: &'a str,
    pub prior: &'a Snapshot,
    pub providers: &'a ProviderRegistry,
    pub hooks: &'a HookRegistry,
}

pub fn build(goals: Vec<Goal>, inputs: &GraphInputs<'_>) -> Result<GoalGraph, EngineError> {
    // URNs, uniqueness.
    let mut urns: Vec<Urn> = Vec::with_capacity(goals.len());
    let mut declared: HashMap<Urn, usize> = HashMap::new();
    for (i, goal) in goals.iter().enumerate() {
        let urn = Urn::new(
            inputs.stack,
            inputs.project,
            goal.parent.as_ref(),
            &goal.resource_type,
            &goal.name,
        );
        if declared.insert(urn.clone(), i).is_some() {
            return Err(EngineError::DuplicateUrn(urn));
        }
        urns.push(urn);
    }

    let olds = resolve_aliases(&goals, &urns, inputs.prior)?;

    // Providers and hooks.
    let mut providers: Vec<Option<Arc<dyn ResourceProvider>>> = Vec::with_capacity(goals.len());
    for (goal, urn) in goals.iter().zip(&urns) {
        if let Some(hook) = inputs.hooks.unknown(&goal.hooks).first() {
            return Err(EngineError::UnknownHook {
                urn: urn.clone(),
                hook: hook.to_string(),
            });
        }
        if !goal.custom {
            providers.push(None);
            continue;
        }
        let package = goal.provider_package();
        let provider = inputs
            .providers
            .get(package)
            .ok_or_else(|| EngineError::UnknownProvider {
                urn: urn.clone(),
                package: package.to_string(),
            })?;
        providers.push(Some(provider));
    }

    // Edges run from dependency to dependent.
    let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(goals.len(), goals.len());
    let nodes: Vec<NodeIndex> = (0..goals.len()).map(|i| graph.add_node(i)).collect();
    for (i, goal) in goals.iter().enumerate() {
        for dependency in goal.all_dependencies() {
            let Some(&d) = declared.get(dependency) else {
                return Err(EngineError::UnknownDependency {
                    urn: urns[i].clone(),
                    dependency: dependency.clone(),
                });
            };
            graph.update_edge(nodes[d], nodes[i], ());
        }
    }

    let order = stable_toposort(&graph, &nodes).ok_or_else(|| {
        let members = tarjan_scc(&graph)
            .into_iter()
            .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .map(|scc| {
                let mut members: Vec<Urn> = scc.iter().map(|n| urns[graph[*n]].clone()).collect();
                members.sort();
                members
            })
            .unwrap_or_default();
        EngineError::Cycle { members }
    })?;

    let mut slots: Vec<Option<Goal>> = goals.into_iter().map(Some).collect();
    let mut resolved = Vec::with_capacity(order.len());
    let mut by_urn = HashMap::new();
    let mut claimed = HashMap::new();
    for (ordinal, declared_index) in order.into_iter().enumerate() {
        let Some(goal) = slots[declared_index].take() else {
            continue;
        };
        let urn = urns[declared_index].clone();
        by_urn.insert(urn.clone(), ordinal);
        if let Some(old) = olds[declared_index] {
            claimed.insert(old, ordinal);
        }
        resolved.push(ResolvedGoal {
            urn,
            goal,
            old: olds[declared_index],
            provider: providers[declared_index].take(),
            ordinal,
        });
    }

    tracing::debug!(goals = resolved.len(), claimed = claimed.len(), "goal graph built");
    Ok(GoalGraph {
        goals: resolved,
        by_urn,
        claimed,
    })
}

/// Match each goal to the prior state it continues.
///
/// A goal's own URN wins; otherwise the longest alias present in the prior
/// snapshot is used. Two goals claiming the same prior state is an error.
fn resolve_aliases(
    goals: &[Goal],
    urns: &[Urn],
    prior: &Snapshot,
) -> Result<Vec<Option<usize>>, EngineError> {
    let live: HashMap<&Urn, usize> = prior
        .resources
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.delete)
        .map(|(i, r)| (&r.urn, i))
        .collect();

    let mut olds = Vec::with_capacity(goals.len());
    let mut claims: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, (goal, urn)) in goals.iter().zip(urns).enumerate() {
        let old = live.get(urn).copied().or_else(|| {
            goal.aliases
                .iter()
                .filter_map(|alias| live.get(alias).map(|&index| (alias, index)))
                .max_by(|(a, _), (b, _)| {
                    a.as_str()
                        .len()
                        .cmp(&b.as_str().len())
                        .then_with(|| b.cmp(a))
                })
                .map(|(alias, index)| {
                    tracing::debug!(urn = %urn, alias = %alias, "goal matched prior state by alias");
                    index
                })
        });
        if let Some(index) = old {
            claims.entry(index).or_default().push(i);
        }
        olds.push(old);
    }

    let mut contested: Vec<(usize, Vec<usize>)> =
        claims.into_iter().filter(|(_, c)| c.len() > 1).collect();
    contested.sort();
    if let Some((index, claimants)) = contested.into_iter().next() {
        return Err(EngineError::AmbiguousAlias {
            prior: prior.resources[index].urn.clone(),
            claimants: claimants.into_iter().map(|i| urns[i].clone()).collect(),
        });
    }
    Ok(olds)
}

/// Kahn's algorithm, always taking the earliest-declared ready node.
/// Returns `None` if the graph has a cycle.
fn stable_toposort(graph: &DiGraph<usize, ()>, nodes: &[NodeIndex]) -> Option<Vec<usize>> {
    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for next in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
            let j = graph[next];
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.insert(j);
            }
        }
    }

    (order.len() == nodes.len()).then_some(order)
}
