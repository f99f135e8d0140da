//! Task dependency graph.
//!
//! Vertices are task names; an edge `a -> b` means b depends on a, so a
//! must finish first. The graph is derived once per run and queried for
//! the topological order, the parallel execution phases, and induced
//! subgraphs for targeted runs. All orderings tie-break by ascending task
//! name so plans are deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use indexmap::IndexMap;

use crate::config::{Config, Task};
use crate::error::DagError;

/// The dependency graph, stored as vertex -> direct dependencies.
#[derive(Debug, Clone)]
pub struct Dag {
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl Dag {
    /// Builds the graph from config tasks, rejecting unknown dependencies
    /// and cycles. A cycle is reported with a witness path
    /// `v0 -> v1 -> ... -> v0`; a self-dependency is a cycle of length 1.
    pub fn build(config: &Config) -> Result<Self, DagError> {
        validate_deps(&config.tasks)?;

        let deps: BTreeMap<String, BTreeSet<String>> = config
            .tasks
            .values()
            .map(|task| (task.name.clone(), task.deps.clone()))
            .collect();

        let dag = Self { deps };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<(), DagError> {
        let mut finished: BTreeSet<&str> = BTreeSet::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut on_stack: BTreeSet<&str> = BTreeSet::new();

        // Iterative DFS over predecessors; a back edge closes a cycle.
        for start in self.deps.keys() {
            if finished.contains(start.as_str()) {
                continue;
            }
            self.dfs_cycle(start, &mut finished, &mut stack, &mut on_stack)?;
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        vertex: &'a str,
        finished: &mut BTreeSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut BTreeSet<&'a str>,
    ) -> Result<(), DagError> {
        stack.push(vertex);
        on_stack.insert(vertex);

        if let Some(deps) = self.deps.get(vertex) {
            for dep in deps {
                if on_stack.contains(dep.as_str()) {
                    // The stack holds the dependency chain; reversing it
                    // yields the execution-order witness path.
                    let from = stack.iter().position(|v| *v == dep).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[from..].iter().map(|v| v.to_string()).collect();
                    path.push(dep.clone());
                    path.reverse();
                    return Err(DagError::Cycle { path });
                }
                if !finished.contains(dep.as_str()) {
                    self.dfs_cycle(dep, finished, stack, on_stack)?;
                }
            }
        }

        stack.pop();
        on_stack.remove(vertex);
        finished.insert(vertex);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Kahn's algorithm; independent vertices come out name-ascending.
    pub fn topological_sort(&self) -> Vec<String> {
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = self
            .deps
            .iter()
            .map(|(v, deps)| (v.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(v, _)| *v)
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while let Some(next) = ready.iter().next().copied() {
            ready.remove(next);
            remaining.remove(next);
            order.push(next.to_string());
            for (vertex, deps) in remaining.iter_mut() {
                if deps.remove(next) && deps.is_empty() {
                    ready.insert(*vertex);
                }
            }
        }
        order
    }

    /// Groups vertices into phases: phase 0 holds the roots, phase k+1
    /// the vertices whose predecessors all live in phases <= k. Phase
    /// members are name-ascending.
    pub fn execution_phases(&self) -> Vec<Vec<String>> {
        let mut levels: HashMap<&str, usize> = HashMap::new();
        for vertex in self.deps.keys() {
            self.level_of(vertex, &mut levels);
        }

        let mut phases: Vec<Vec<String>> = Vec::new();
        for (vertex, level) in levels {
            if phases.len() <= level {
                phases.resize_with(level + 1, Vec::new);
            }
            phases[level].push(vertex.to_string());
        }
        for phase in &mut phases {
            phase.sort();
        }
        phases
    }

    fn level_of<'a>(&'a self, vertex: &'a str, levels: &mut HashMap<&'a str, usize>) -> usize {
        if let Some(level) = levels.get(vertex) {
            return *level;
        }
        let level = self
            .deps
            .get(vertex)
            .map(|deps| {
                deps.iter()
                    .map(|dep| self.level_of(dep, levels) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        levels.insert(vertex, level);
        level
    }

    /// Transitive predecessors of `vertex`, dependencies-first.
    pub fn dependencies(&self, vertex: &str) -> Result<Vec<String>, DagError> {
        if !self.contains(vertex) {
            return Err(DagError::UnknownVertex(vertex.to_string()));
        }
        let mut wanted = BTreeSet::new();
        self.collect_deps(vertex, &mut wanted);
        Ok(self
            .topological_sort()
            .into_iter()
            .filter(|v| wanted.contains(v.as_str()))
            .collect())
    }

    fn collect_deps<'a>(&'a self, vertex: &str, out: &mut BTreeSet<&'a str>) {
        if let Some(deps) = self.deps.get(vertex) {
            for dep in deps {
                if out.insert(dep.as_str()) {
                    self.collect_deps(dep, out);
                }
            }
        }
    }

    /// The induced subgraph on the targets and everything they depend on.
    pub fn subgraph_for(&self, targets: &[String]) -> Result<Dag, DagError> {
        let mut keep: BTreeSet<String> = BTreeSet::new();
        for target in targets {
            if !self.contains(target) {
                return Err(DagError::UnknownVertex(target.clone()));
            }
            keep.insert(target.clone());
            keep.extend(self.dependencies(target)?);
        }

        let deps = self
            .deps
            .iter()
            .filter(|(vertex, _)| keep.contains(vertex.as_str()))
            .map(|(vertex, deps)| {
                (
                    vertex.clone(),
                    deps.iter().filter(|d| keep.contains(*d)).cloned().collect(),
                )
            })
            .collect();
        Ok(Dag { deps })
    }
}

/// Reports every (task, missing dependency) pair before graph build.
pub fn validate_deps(tasks: &IndexMap<String, Task>) -> Result<(), DagError> {
    let mut missing = Vec::new();
    for task in tasks.values() {
        for dep in &task.deps {
            if !tasks.contains_key(dep) {
                missing.push((task.name.clone(), dep.clone()));
            }
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        missing.sort();
        Err(DagError::MissingDeps { missing })
    }
}
