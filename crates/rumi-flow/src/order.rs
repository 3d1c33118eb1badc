// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable dependency ordering for flow steps.

use crate::model::Step;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Compute the execution order of `steps` as indices into the slice.
///
/// The order is a stable topological sort over `depends_on`: among ready
/// steps the one declared first runs first. Dependency ids that match no
/// step are ignored with a warning. A cycle falls back to declaration order
/// with a diagnostic.
pub fn execution_order(steps: &[Step]) -> Vec<usize> {
    let index_by_id: BTreeMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut deps: Vec<BTreeSet<usize>> = Vec::with_capacity(steps.len());
    for step in steps {
        let mut set = BTreeSet::new();
        for dep in &step.depends_on {
            match index_by_id.get(dep.as_str()) {
                Some(&idx) => {
                    if steps[idx].phase != step.phase {
                        warn!(
                            target: "rumi.flow",
                            step = %step.id,
                            dependency = %dep,
                            "cross-phase dependency"
                        );
                    }
                    set.insert(idx);
                }
                None => {
                    warn!(
                        target: "rumi.flow",
                        step = %step.id,
                        dependency = %dep,
                        "dependency id matches no step, ignoring"
                    );
                }
            }
        }
        deps.push(set);
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut done: BTreeSet<usize> = BTreeSet::new();
    while order.len() < steps.len() {
        let next = (0..steps.len())
            .find(|i| !done.contains(i) && deps[*i].iter().all(|d| done.contains(d)));
        match next {
            Some(i) => {
                done.insert(i);
                order.push(i);
            }
            None => {
                warn!(
                    target: "rumi.flow",
                    "dependency cycle detected, falling back to declaration order"
                );
                return (0..steps.len()).collect();
            }
        }
    }
    order
}
