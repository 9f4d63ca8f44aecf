//! Dependency graph and execution ordering.

mod dependency;

pub use dependency::DependencyGraph;

use crate::domain::{CyclicDependencyError, Task};

/// Order `tasks` so that every dependency precedes its dependents.
///
/// Only edges between tasks of the given set are considered. Among tasks
/// that become runnable at the same time, input order wins. Returns the
/// cycle instead of a partial order when the set is not a DAG.
pub fn resolve(tasks: Vec<Task>) -> Result<Vec<Task>, CyclicDependencyError> {
    let graph = DependencyGraph::from_tasks(&tasks);
    if let Some(cycle) = graph.find_cycle() {
        return Err(CyclicDependencyError { cycle });
    }
    let order = graph.resolve()?;

    let mut by_id: std::collections::HashMap<_, _> =
        tasks.into_iter().map(|task| (task.id, task)).collect();
    Ok(order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect())
}
