//! Dependency-aware scheduling
//!
//! Builds the provider graph from the catalog's provides/requires contract
//! plus hard dependencies, prunes tests that cannot run on this device, and
//! emits a deterministic topological execution order. Catalog-authoring
//! bugs (cycles, ambiguous producers, duplicate or unknown ids) abort the
//! whole run here, before any request is sent.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

use crate::catalog::{Catalog, TestId};
use crate::common::{Error, Result};
use crate::protocol::ParameterRegistry;

/// Why a test was removed from the execution order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// The device does not declare support for the target parameter
    UnsupportedParameter,
    /// A required property has no enabled producer in the catalog
    UnresolvedRequirement { property: String },
    /// A hard dependency or a required property's producer is itself
    /// not runnable
    NotRunnableDependency { dependency: TestId },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedParameter => {
                write!(f, "parameter not supported by the device")
            }
            Self::UnresolvedRequirement { property } => {
                write!(f, "required property '{}' has no producer", property)
            }
            Self::NotRunnableDependency { dependency } => {
                write!(f, "depends on '{}' which will not run", dependency)
            }
        }
    }
}

/// A valid execution plan over a catalog
///
/// Indices refer into the catalog's declaration order. Skipped tests keep
/// their place in the final report but never execute.
#[derive(Debug)]
pub struct Schedule {
    /// Catalog indices in execution order
    pub ordered: Vec<usize>,
    /// Pruned tests with their reasons, in catalog order
    pub skipped: Vec<(usize, SkipReason)>,
}

/// Compute the execution plan for a catalog against one device
///
/// Ties in the topological order are broken by catalog declaration order,
/// so repeated runs against the same device produce the same sequence.
pub fn plan(catalog: &Catalog, registry: &dyn ParameterRegistry) -> Result<Schedule> {
    let tests = catalog.tests();

    // Identity and producer maps; duplicates and ambiguity are authoring
    // bugs that abort scheduling.
    let mut index_of: HashMap<&TestId, usize> = HashMap::new();
    for (i, test) in tests.iter().enumerate() {
        if index_of.insert(&test.id, i).is_some() {
            return Err(Error::DuplicateTestId(test.id.clone()));
        }
    }

    let mut producer_of: HashMap<&str, usize> = HashMap::new();
    for (i, test) in tests.iter().enumerate() {
        for name in &test.provides {
            if let Some(&first) = producer_of.get(name.as_str()) {
                return Err(Error::AmbiguousProducer {
                    property: name.clone(),
                    first: tests[first].id.clone(),
                    second: test.id.clone(),
                });
            }
            producer_of.insert(name, i);
        }
    }

    // Resolve hard dependencies up front; an unknown id is an authoring bug.
    let mut hard_deps: Vec<Vec<usize>> = Vec::with_capacity(tests.len());
    for test in tests {
        let mut deps = Vec::new();
        for dep in &test.hard_dependencies {
            let &dep_index = index_of.get(dep).ok_or_else(|| Error::UnknownDependency {
                test: test.id.clone(),
                dependency: dep.clone(),
            })?;
            deps.push(dep_index);
        }
        hard_deps.push(deps);
    }

    // Prune to a fixed point: unsupported parameters seed the set, and
    // not-runnable status propagates through provides chains and hard
    // dependencies, which can be multiple hops deep.
    let mut skip: Vec<Option<SkipReason>> = tests
        .iter()
        .map(|test| {
            (!registry.is_supported(test.parameter)).then_some(SkipReason::UnsupportedParameter)
        })
        .collect();

    loop {
        let mut changed = false;
        for i in 0..tests.len() {
            if skip[i].is_some() {
                continue;
            }
            let mut reason = None;
            for name in &tests[i].requires {
                match producer_of.get(name.as_str()) {
                    None => {
                        reason = Some(SkipReason::UnresolvedRequirement {
                            property: name.clone(),
                        });
                    }
                    Some(&p) if skip[p].is_some() => {
                        reason = Some(SkipReason::NotRunnableDependency {
                            dependency: tests[p].id.clone(),
                        });
                    }
                    Some(_) => continue,
                }
                break;
            }
            if reason.is_none() {
                for &dep in &hard_deps[i] {
                    if skip[dep].is_some() {
                        reason = Some(SkipReason::NotRunnableDependency {
                            dependency: tests[dep].id.clone(),
                        });
                        break;
                    }
                }
            }
            if let Some(reason) = reason {
                tracing::debug!(test = %tests[i].id, %reason, "test not runnable");
                skip[i] = Some(reason);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Edge provider -> consumer among the runnable tests.
    let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); tests.len()];
    for i in 0..tests.len() {
        if skip[i].is_some() {
            continue;
        }
        for name in &tests[i].requires {
            let p = producer_of[name.as_str()];
            if p != i {
                preds[i].insert(p);
            }
        }
        for &dep in &hard_deps[i] {
            preds[i].insert(dep);
        }
    }

    // Kahn's algorithm with a sorted ready set: the smallest catalog index
    // among ready tests always runs next.
    let mut indegree: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); tests.len()];
    for (i, pred) in preds.iter().enumerate() {
        for &p in pred {
            successors[p].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..tests.len())
        .filter(|&i| skip[i].is_none() && indegree[i] == 0)
        .collect();
    let mut remaining: BTreeSet<usize> = (0..tests.len())
        .filter(|&i| skip[i].is_none())
        .collect();

    let mut ordered = Vec::with_capacity(remaining.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        remaining.remove(&next);
        ordered.push(next);
        for &succ in &successors[next] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 && remaining.contains(&succ) {
                ready.insert(succ);
            }
        }
    }

    if !remaining.is_empty() {
        let cycle = extract_cycle(&remaining, &preds, tests.len());
        let ids: Vec<TestId> = cycle.iter().map(|&i| tests[i].id.clone()).collect();
        return Err(Error::dependency_cycle(&ids));
    }

    let skipped: Vec<(usize, SkipReason)> = skip
        .into_iter()
        .enumerate()
        .filter_map(|(i, reason)| reason.map(|r| (i, r)))
        .collect();

    tracing::info!(
        scheduled = ordered.len(),
        skipped = skipped.len(),
        "execution plan computed"
    );

    Ok(Schedule { ordered, skipped })
}

/// Walk predecessor edges inside the leftover set until a node repeats.
/// Every leftover node has a leftover predecessor, so this terminates.
fn extract_cycle(
    remaining: &BTreeSet<usize>,
    preds: &[BTreeSet<usize>],
    len: usize,
) -> Vec<usize> {
    let Some(&start) = remaining.iter().next() else {
        return Vec::new();
    };
    let mut position: HashMap<usize, usize> = HashMap::with_capacity(len);
    let mut path = Vec::new();
    let mut node = start;
    loop {
        if let Some(&pos) = position.get(&node) {
            let mut cycle = path[pos..].to_vec();
            cycle.reverse();
            return cycle;
        }
        position.insert(node, path.len());
        path.push(node);
        match preds[node].iter().find(|p| remaining.contains(p)) {
            Some(&pred) => node = pred,
            // cannot happen for a leftover node, but a partial path still
            // names useful members in the error message
            None => return path,
        }
    }
}
