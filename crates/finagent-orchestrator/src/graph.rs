//! Task dependency graph (DAG) for one request

use crate::error::{OrchestratorError, Result};
use crate::task::{TaskId, TaskSpec};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Validated, acyclic set of tasks for one request
///
/// Tasks keep their insertion order, which also breaks ties in the
/// topological order so that identical requests always sort identically.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskSpec>,
    index: HashMap<TaskId, usize>,
    /// dependents[i] = indices of tasks that depend on task i
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl TaskGraph {
    /// Build and validate a graph
    ///
    /// Fails on duplicate ids, dependencies outside the graph and cycles.
    pub fn from_specs(tasks: Vec<TaskSpec>) -> Result<Self> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id().clone(), i).is_some() {
                return Err(OrchestratorError::DuplicateTask(task.id().clone()));
            }
        }

        let mut dependents = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in task.dependencies() {
                let Some(&d) = index.get(dep) else {
                    return Err(OrchestratorError::UnknownDependency {
                        task_id: task.id().clone(),
                        missing: dep.clone(),
                    });
                };
                if !dependents[d].contains(&i) {
                    dependents[d].push(i);
                }
            }
        }

        let mut graph = Self {
            tasks,
            index,
            dependents,
            order: Vec::new(),
        };
        graph.order = graph.sort()?;
        Ok(graph)
    }

    /// Kahn's algorithm with a min-heap on insertion index
    fn sort(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self
            .tasks
            .iter()
            .map(|task| self.unique_deps(task).len())
            .collect();

        let mut heap: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(Reverse(i)) = heap.pop() {
            order.push(i);
            for &dependent in &self.dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    heap.push(Reverse(dependent));
                }
            }
        }

        if order.len() != self.tasks.len() {
            return Err(OrchestratorError::CyclicDependency(self.describe_cycle()));
        }
        Ok(order)
    }

    fn unique_deps(&self, task: &TaskSpec) -> Vec<usize> {
        let mut deps: Vec<usize> = task
            .dependencies()
            .iter()
            .filter_map(|dep| self.index.get(dep).copied())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Find one cycle and render it as `a -> b -> a`
    fn describe_cycle(&self) -> String {
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut color = vec![0u8; self.tasks.len()];
        let mut stack: Vec<usize> = Vec::new();

        fn visit(
            graph: &TaskGraph,
            node: usize,
            color: &mut [u8],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            color[node] = 1;
            stack.push(node);
            for dep in graph.unique_deps(&graph.tasks[node]) {
                if color[dep] == 1 {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                if color[dep] == 0 {
                    if let Some(cycle) = visit(graph, dep, color, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            color[node] = 2;
            None
        }

        for start in 0..self.tasks.len() {
            if color[start] == 0 {
                if let Some(cycle) = visit(self, start, &mut color, &mut stack) {
                    return cycle
                        .iter()
                        .map(|&i| self.tasks[i].id().as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ");
                }
            }
        }
        "unknown cycle".to_string()
    }

    /// Get a task by id
    pub fn get(&self, id: &TaskId) -> Option<&TaskSpec> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Stable topological order
    pub fn topological_order(&self) -> impl Iterator<Item = &TaskSpec> + '_ {
        self.order.iter().map(|&i| &self.tasks[i])
    }

    /// Execution stages: tasks in the same stage can run in parallel
    pub fn stages(&self) -> Vec<Vec<&TaskSpec>> {
        let mut level = vec![0usize; self.tasks.len()];
        for &i in &self.order {
            for &dependent in &self.dependents[i] {
                level[dependent] = level[dependent].max(level[i] + 1);
            }
        }

        let depth = level.iter().copied().max().map_or(0, |max| max + 1);
        let mut stages: Vec<Vec<&TaskSpec>> = vec![Vec::new(); depth];
        for &i in &self.order {
            stages[level[i]].push(&self.tasks[i]);
        }
        stages
    }

    /// Tasks that directly depend on `id`
    pub fn dependents(&self, id: &TaskId) -> Vec<&TaskSpec> {
        self.index
            .get(id)
            .map(|&i| self.dependents[i].iter().map(|&d| &self.tasks[d]).collect())
            .unwrap_or_default()
    }

    /// Every task reachable from `id`, in topological order
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<&TaskSpec> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };

        let mut reached = vec![false; self.tasks.len()];
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &dependent in &self.dependents[node] {
                if !reached[dependent] {
                    reached[dependent] = true;
                    stack.push(dependent);
                }
            }
        }

        self.order
            .iter()
            .filter(|&&i| reached[i])
            .map(|&i| &self.tasks[i])
            .collect()
    }

    /// Tasks without dependencies
    pub fn roots(&self) -> Vec<&TaskSpec> {
        self.tasks
            .iter()
            .filter(|task| task.dependencies().is_empty())
            .collect()
    }
}
