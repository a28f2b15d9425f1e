//! Plan: an immutable-after-construction DAG whose nodes are markers,
//! each holding a list of (host, manifest-name) pairs, with edges as
//! prerequisite relations.

use crate::error::Error;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

pub type Marker = String;
pub type Host = String;
pub type ManifestName = String;

/// Mutable accumulator fed one plan-step record at a time; finishes into an
/// immutable, acyclicity-checked [`Plan`].
#[derive(Default)]
pub struct PlanBuilder {
    manifests: IndexMap<Marker, Vec<(Host, ManifestName)>>,
    dependency: HashMap<Marker, HashSet<Marker>>,
    waiting: HashSet<Marker>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        PlanBuilder::default()
    }

    /// Appends `(host, manifest)` under `marker`, preserving registration
    /// order, and unions `prerequisites` into `marker`'s dependency set.
    pub fn add_record(
        &mut self,
        host: impl Into<String>,
        manifest: impl Into<String>,
        marker: impl Into<String>,
        prerequisites: impl IntoIterator<Item = String>,
    ) {
        let marker = marker.into();
        self.manifests
            .entry(marker.clone())
            .or_default()
            .push((host.into(), manifest.into()));
        self.dependency
            .entry(marker.clone())
            .or_default()
            .extend(prerequisites);
        self.waiting.insert(marker);
    }

    /// Finishes construction, checking acyclicity. Any cycle is fatal.
    pub fn build(self) -> Result<Plan, Error> {
        check_acyclic(&self.dependency)?;
        Ok(Plan {
            manifests: self.manifests,
            dependency: self.dependency,
            waiting: self.waiting,
            in_progress: HashSet::new(),
            finished: HashSet::new(),
        })
    }
}

fn check_acyclic(dependency: &HashMap<Marker, HashSet<Marker>>) -> Result<(), Error> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Visiting,
        Done,
    }
    let mut state: HashMap<&Marker, State> = HashMap::new();

    fn visit<'a>(
        node: &'a Marker,
        dependency: &'a HashMap<Marker, HashSet<Marker>>,
        state: &mut HashMap<&'a Marker, State>,
        stack: &mut Vec<&'a Marker>,
    ) -> Result<(), Error> {
        match state.get(node) {
            Some(State::Done) => return Ok(()),
            Some(State::Visiting) => {
                let cycle: HashSet<String> = stack.iter().map(|s| (*s).clone()).collect();
                return Err(Error::PlanCycle { markers: cycle });
            }
            None => {}
        }
        state.insert(node, State::Visiting);
        stack.push(node);
        if let Some(prereqs) = dependency.get(node) {
            for prereq in prereqs {
                visit(prereq, dependency, state, stack)?;
            }
        }
        stack.pop();
        state.insert(node, State::Done);
        Ok(())
    }

    for marker in dependency.keys() {
        let mut stack = Vec::new();
        visit(marker, dependency, &mut state, &mut stack)?;
    }
    Ok(())
}

/// Immutable DAG of markers. `waiting`, `in_progress`, and `finished` are
/// disjoint and their union is the full marker set at all times; a marker
/// moves waiting → in_progress → finished, never entering `in_progress`
/// before all its prerequisites are `finished`.
pub struct Plan {
    pub manifests: IndexMap<Marker, Vec<(Host, ManifestName)>>,
    pub dependency: HashMap<Marker, HashSet<Marker>>,
    pub waiting: HashSet<Marker>,
    pub in_progress: HashSet<Marker>,
    pub finished: HashSet<Marker>,
}

impl Plan {
    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty() && self.in_progress.is_empty()
    }

    /// Markers in `waiting` whose prerequisites are all `finished`,
    /// iterated in the plan's registration order.
    pub fn unblocked(&self) -> Vec<Marker> {
        self.manifests
            .keys()
            .filter(|m| self.waiting.contains(*m))
            .filter(|m| {
                self.dependency
                    .get(*m)
                    .map(|reqs| reqs.is_subset(&self.finished))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn start(&mut self, marker: &Marker) {
        self.waiting.remove(marker);
        self.in_progress.insert(marker.clone());
    }

    pub fn finish(&mut self, marker: &Marker) {
        self.in_progress.remove(marker);
        self.finished.insert(marker.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod acyclicity {
        use super::*;

        #[test]
        fn a_topological_order_exists_after_planning() {
            let mut b = PlanBuilder::new();
            b.add_record("h1", "m1", "prerequisite_1", []);
            b.add_record("h2", "m2", "prerequisite_2", []);
            b.add_record(
                "h1",
                "m3",
                "final",
                ["prerequisite_1".to_string(), "prerequisite_2".to_string()],
            );
            let plan = b.build().unwrap();
            assert_eq!(plan.waiting.len(), 3);
        }

        #[test]
        fn cycle_is_fatal() {
            let mut b = PlanBuilder::new();
            b.add_record("h1", "m1", "a", ["b".to_string()]);
            b.add_record("h1", "m2", "b", ["a".to_string()]);
            assert!(matches!(b.build(), Err(Error::PlanCycle { .. })));
        }
    }

    mod scenario_s2 {
        use super::*;

        #[test]
        fn final_marker_unblocks_only_after_both_prerequisites_finish() {
            let mut b = PlanBuilder::new();
            b.add_record("h1", "m1", "prerequisite_1", []);
            b.add_record("h2", "m2", "prerequisite_2", []);
            b.add_record(
                "h1",
                "m3",
                "final",
                ["prerequisite_1".to_string(), "prerequisite_2".to_string()],
            );
            let mut plan = b.build().unwrap();

            let unblocked = plan.unblocked();
            assert!(unblocked.contains(&"prerequisite_1".to_string()));
            assert!(unblocked.contains(&"prerequisite_2".to_string()));
            assert!(!unblocked.contains(&"final".to_string()));

            plan.start(&"prerequisite_1".to_string());
            plan.start(&"prerequisite_2".to_string());
            assert!(plan.unblocked().is_empty());

            plan.finish(&"prerequisite_1".to_string());
            assert!(plan.unblocked().is_empty());
            plan.finish(&"prerequisite_2".to_string());

            assert_eq!(plan.unblocked(), vec!["final".to_string()]);
        }
    }
}
