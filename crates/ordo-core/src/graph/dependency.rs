//! Dependency graph over task ids.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on
//! - Reverse edges: task -> tasks that depend on it
//! - Invariant: edges and reverse_edges are kept in sync
//! - Node insertion order is remembered; every traversal walks neighbours in
//!   that order, so results are deterministic for a stable input order.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{CyclicDependencyError, Task, TaskId};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes in insertion order.
    nodes: Vec<TaskId>,
    position: HashMap<TaskId, usize>,

    /// Forward edges: task -> tasks it depends on.
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks waiting for it.
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from a snapshot of tasks.
    ///
    /// Edges pointing at ids outside the snapshot are dropped: only the
    /// given set is ordered.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        let mut graph = Self::new();
        for task in &tasks {
            graph.add_node(task.id);
        }
        for task in &tasks {
            for dep in &task.dependencies {
                if graph.contains(*dep) {
                    graph.add_dependency(task.id, *dep);
                }
            }
        }
        graph
    }

    pub fn add_node(&mut self, id: TaskId) {
        if let Entry::Vacant(e) = self.position.entry(id) {
            e.insert(self.nodes.len());
            self.nodes.push(id);
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.position.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Both ids become nodes if they were not already.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.add_node(task);
        self.add_node(depends_on);
        self.edges.entry(task).or_default().insert(depends_on);
        self.reverse_edges
            .entry(depends_on)
            .or_default()
            .insert(task);
    }

    /// Remove a dependency: `task` no longer depends on `depends_on`.
    pub fn remove_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task) {
            e.get_mut().remove(&depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on) {
            e.get_mut().remove(&task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: TaskId) {
        if self.position.remove(&id).is_none() {
            return;
        }
        for dep in self.edges.remove(&id).unwrap_or_default() {
            self.remove_dependency(id, dep);
        }
        for dependent in self.reverse_edges.remove(&id).unwrap_or_default() {
            self.remove_dependency(dependent, id);
        }
        self.nodes.retain(|node| *node != id);
        for (i, node) in self.nodes.iter().enumerate() {
            self.position.insert(*node, i);
        }
    }

    pub fn has_dependencies(&self, task: TaskId) -> bool {
        self.edges.get(&task).is_some_and(|deps| !deps.is_empty())
    }

    /// Direct dependencies of `task`, in node insertion order.
    pub fn dependencies_of(&self, task: TaskId) -> Vec<TaskId> {
        self.ordered(self.edges.get(&task))
    }

    /// Tasks that directly depend on `task`, in node insertion order.
    pub fn dependents_of(&self, task: TaskId) -> Vec<TaskId> {
        self.ordered(self.reverse_edges.get(&task))
    }

    fn ordered(&self, set: Option<&HashSet<TaskId>>) -> Vec<TaskId> {
        let Some(set) = set else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = set.iter().copied().collect();
        ids.sort_by_key(|id| self.position.get(id).copied().unwrap_or(usize::MAX));
        ids
    }

    /// Full transitive closure of `task`'s dependencies, depth-first.
    ///
    /// Every node is visited once, so diamonds do not cause re-traversal.
    /// The task itself is never part of the result.
    pub fn all_dependencies(&self, task: TaskId) -> Vec<TaskId> {
        let mut visited: HashSet<TaskId> = HashSet::from([task]);
        let mut out = Vec::new();
        let mut stack: Vec<TaskId> = self.dependencies_of(task).into_iter().rev().collect();

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            out.push(node);
            for dep in self.dependencies_of(node).into_iter().rev() {
                if !visited.contains(&dep) {
                    stack.push(dep);
                }
            }
        }
        out
    }

    /// Find a cycle with a coloured depth-first search.
    ///
    /// Returns the path that closes on itself (first and last id equal), or
    /// `None` when the graph is acyclic. O(V + E).
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut color: HashMap<TaskId, Color> =
            self.nodes.iter().map(|id| (*id, Color::White)).collect();

        for &start in &self.nodes {
            if color[&start] != Color::White {
                continue;
            }

            // (node, its dependencies, index of the next one to visit)
            let mut stack: Vec<(TaskId, Vec<TaskId>, usize)> = Vec::new();
            let mut path: Vec<TaskId> = Vec::new();

            color.insert(start, Color::Gray);
            path.push(start);
            stack.push((start, self.dependencies_of(start), 0));

            while let Some((node, deps, next)) = stack.last_mut() {
                if *next == deps.len() {
                    color.insert(*node, Color::Black);
                    path.pop();
                    stack.pop();
                    continue;
                }

                let dep = deps[*next];
                *next += 1;

                match color.get(&dep).copied().unwrap_or(Color::Black) {
                    Color::Gray => {
                        let from = path.iter().position(|id| *id == dep).unwrap_or(0);
                        let mut cycle = path[from..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Color::White => {
                        color.insert(dep, Color::Gray);
                        path.push(dep);
                        stack.push((dep, self.dependencies_of(dep), 0));
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }

    /// Would adding `task -> depends_on` close a cycle?
    ///
    /// Returns the cycle the new edge would create, starting and ending at
    /// `task`. Checked transitively: the edge closes a cycle exactly when
    /// `task` is reachable from `depends_on`.
    pub fn would_create_cycle(&self, task: TaskId, depends_on: TaskId) -> Option<Vec<TaskId>> {
        if task == depends_on {
            return Some(vec![task, task]);
        }

        let mut parent: HashMap<TaskId, TaskId> = HashMap::new();
        let mut visited: HashSet<TaskId> = HashSet::from([depends_on]);
        let mut queue = VecDeque::from([depends_on]);

        while let Some(node) = queue.pop_front() {
            for dep in self.dependencies_of(node) {
                if !visited.insert(dep) {
                    continue;
                }
                parent.insert(dep, node);
                if dep == task {
                    // Walk back from `task` to `depends_on`.
                    let mut back = vec![task];
                    let mut current = task;
                    while let Some(&p) = parent.get(&current) {
                        back.push(p);
                        current = p;
                    }
                    back.reverse();
                    let mut cycle = vec![task];
                    cycle.extend(back);
                    return Some(cycle);
                }
                queue.push_back(dep);
            }
        }
        None
    }

    /// Topological order with Kahn's algorithm: every dependency precedes
    /// its dependents.
    ///
    /// Ties among simultaneously ready tasks are broken FIFO by insertion
    /// order. A cycle is reported with its path, never as a partial order.
    pub fn resolve(&self) -> Result<Vec<TaskId>, CyclicDependencyError> {
        let mut in_degree: HashMap<TaskId, usize> = self
            .nodes
            .iter()
            .map(|id| (*id, self.edges.get(id).map_or(0, HashSet::len)))
            .collect();

        let mut ready: VecDeque<TaskId> = self
            .nodes
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dependent in self.dependents_of(id) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(CyclicDependencyError {
                cycle: self.find_cycle().unwrap_or_default(),
            });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: u128) -> Vec<TaskId> {
        (1..=n).map(TaskId::from_u128).collect()
    }

    #[test]
    fn new_graph_is_empty() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert!(!graph.has_dependencies(TaskId::from_u128(1)));
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids(2)[..] else { unreachable!() };

        graph.add_dependency(b, a); // B depends on A

        assert!(graph.has_dependencies(b));
        assert!(!graph.has_dependencies(a));
        assert_eq!(graph.dependencies_of(b), vec![a]);
        assert_eq!(graph.dependents_of(a), vec![b]);
    }

    #[test]
    fn remove_dependency_removes_both_edges() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids(2)[..] else { unreachable!() };

        graph.add_dependency(b, a);
        graph.remove_dependency(b, a);

        assert!(!graph.has_dependencies(b));
        assert!(graph.dependents_of(a).is_empty());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn remove_node_drops_edges_in_both_directions() {
        let mut graph = DependencyGraph::new();
        let [a, b, c] = ids(3)[..] else { unreachable!() };
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);

        graph.remove_node(b);

        assert!(!graph.contains(b));
        assert!(graph.dependents_of(a).is_empty());
        assert!(!graph.has_dependencies(c));
        assert_eq!(graph.resolve().unwrap(), vec![a, c]);
    }

    #[test]
    fn diamond_closure_visits_shared_dependency_once() {
        // A -> {B, C}, B -> D, C -> D
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids(4)[..] else { unreachable!() };
        graph.add_dependency(a, b);
        graph.add_dependency(a, c);
        graph.add_dependency(b, d);
        graph.add_dependency(c, d);

        let all = graph.all_dependencies(a);
        assert_eq!(all.len(), 3);
        assert_eq!(all, vec![b, d, c]);
        assert_eq!(all.iter().filter(|id| **id == d).count(), 1);
    }

    #[test]
    fn detect_simple_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b] = ids(2)[..] else { unreachable!() };
        graph.add_dependency(a, b);
        graph.add_dependency(b, a);

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle, vec![a, b, a]);
    }

    #[test]
    fn detect_self_dependency() {
        let mut graph = DependencyGraph::new();
        let a = TaskId::from_u128(1);
        graph.add_dependency(a, a);
        assert_eq!(graph.find_cycle(), Some(vec![a, a]));
    }

    #[test]
    fn detect_longer_cycle_reports_only_the_loop() {
        // B -> A, C -> B, D -> C, B -> D: the loop is B -> D -> C -> B
        let mut graph = DependencyGraph::new();
        let [a, b, c, d] = ids(4)[..] else { unreachable!() };
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);
        graph.add_dependency(d, c);
        graph.add_dependency(b, d);

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(!cycle.contains(&a));
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn dag_with_convergent_paths_has_no_cycle() {
        let mut graph = DependencyGraph::new();
        let [a, b, c, d, e] = ids(5)[..] else { unreachable!() };
        graph.add_dependency(b, a);
        graph.add_dependency(c, a);
        graph.add_dependency(d, b);
        graph.add_dependency(e, b);
        graph.add_dependency(d, c);
        graph.add_dependency(e, c);

        assert!(graph.find_cycle().is_none());
        assert!(graph.resolve().is_ok());
    }

    #[test]
    fn would_create_cycle_is_checked_transitively() {
        // C -> B -> A; adding A -> C closes A -> C -> B -> A
        let mut graph = DependencyGraph::new();
        let [a, b, c] = ids(3)[..] else { unreachable!() };
        graph.add_dependency(b, a);
        graph.add_dependency(c, b);

        assert_eq!(graph.would_create_cycle(a, c), Some(vec![a, c, b, a]));
        assert_eq!(graph.would_create_cycle(a, a), Some(vec![a, a]));
        assert!(graph.would_create_cycle(c, a).is_none());
    }

    #[test]
    fn resolve_reports_cycle_instead_of_partial_order() {
        let mut graph = DependencyGraph::new();
        let [a, b, c] = ids(3)[..] else { unreachable!() };
        graph.add_node(a);
        graph.add_dependency(b, c);
        graph.add_dependency(c, b);

        let err = graph.resolve().unwrap_err();
        assert_eq!(err.cycle.first(), err.cycle.last());
        assert!(err.cycle.contains(&b) && err.cycle.contains(&c));
    }

    #[test]
    fn resolve_breaks_ties_by_insertion_order() {
        let mut graph = DependencyGraph::new();
        let [a, b, c] = ids(3)[..] else { unreachable!() };
        graph.add_node(c);
        graph.add_node(a);
        graph.add_node(b);

        assert_eq!(graph.resolve().unwrap(), vec![c, a, b]);
    }
}
