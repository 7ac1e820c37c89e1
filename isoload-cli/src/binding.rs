//! Task Binding
//!
//! Turns registered load-task operations into schedulable tasks. Every
//! operation `op` becomes a task named `op_task` that runs `op` through an
//! [`Isolate`] transport; the operation itself is never invoked in the
//! scheduling process.

use crate::supervisor::{ExecutionError, Isolate};
use isoload_core::{OperationDef, Registry, TaskDefinition};
use isoload_ipc::ResultPayload;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Suffix appended to an operation name to form its task name
pub const TASK_SUFFIX: &str = "_task";

/// A schedulable task bound to one operation
#[derive(Clone)]
pub struct BoundTask {
    /// Task name (`<operation>_task`)
    pub name: String,
    /// Operation executed in isolation
    pub operation: &'static str,
    /// Task-definition type that declared the operation
    pub owner: &'static str,
    /// Relative scheduling weight
    pub weight: u32,
    executor: Arc<dyn Isolate>,
}

impl fmt::Debug for BoundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundTask")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .field("owner", &self.owner)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

impl BoundTask {
    fn new(def: &OperationDef, executor: Arc<dyn Isolate>) -> Self {
        Self {
            name: format!("{}{TASK_SUFFIX}", def.name),
            operation: def.name,
            owner: def.owner,
            weight: def.weight,
            executor,
        }
    }

    /// Run the operation once in a fresh worker
    pub fn run(&self, timeout: Duration) -> Result<ResultPayload, ExecutionError> {
        self.executor.execute(self.operation, timeout)
    }
}

/// Selects which task definitions contribute tasks
#[derive(Debug, Default)]
pub struct TaskBinder {
    owners: Vec<&'static str>,
    all: bool,
    filter: Option<Regex>,
}

impl TaskBinder {
    /// Binder with nothing selected
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the load tasks of `T`
    pub fn with<T: TaskDefinition>(mut self) -> Self {
        if !self.owners.contains(&T::NAME) {
            self.owners.push(T::NAME);
        }
        self
    }

    /// Bind every load task in the registry
    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    /// Keep only tasks whose operation name matches `pattern`
    pub fn filter(mut self, pattern: Regex) -> Self {
        self.filter = Some(pattern);
        self
    }

    fn selected(&self, def: &OperationDef) -> bool {
        if !self.all && !self.owners.contains(&def.owner) {
            return false;
        }
        self.filter.as_ref().is_none_or(|re| re.is_match(def.name))
    }

    /// Build the task table, every task invoking `executor`
    pub fn bind(&self, registry: &Registry, executor: Arc<dyn Isolate>) -> TaskTable {
        if !self.all {
            for owner in &self.owners {
                if registry.operations_of(owner).next().is_none() {
                    tracing::warn!(target: "isoload::binding", owner, "task definition has no registered operations");
                }
            }
        }

        let mut seen = BTreeSet::new();
        let mut tasks = Vec::new();
        for def in registry.load_tasks().filter(|def| self.selected(def)) {
            let task = BoundTask::new(def, Arc::clone(&executor));
            if !seen.insert(task.name.clone()) {
                tracing::debug!(target: "isoload::binding", task = %task.name, "already bound");
                continue;
            }
            tracing::debug!(
                target: "isoload::binding",
                task = %task.name,
                owner = task.owner,
                weight = task.weight,
                "bound task"
            );
            tasks.push(task);
        }
        TaskTable { tasks }
    }
}

/// Tasks available to virtual users
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    tasks: Vec<BoundTask>,
}

impl TaskTable {
    /// All bound tasks, ordered by operation name
    pub fn tasks(&self) -> &[BoundTask] {
        &self.tasks
    }

    /// Number of tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing was bound
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Look a task up by task name
    pub fn get(&self, name: &str) -> Option<&BoundTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Task names in table order
    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Pick a task at random, proportionally to its weight
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&BoundTask> {
        match self.tasks.len() {
            0 => None,
            1 => self.tasks.first(),
            _ => match WeightedIndex::new(self.tasks.iter().map(|t| t.weight)) {
                Ok(index) => self.tasks.get(index.sample(rng)),
                // All weights zero: fall back to uniform
                Err(_) => self.tasks.get(rng.gen_range(0..self.tasks.len())),
            },
        }
    }
}
