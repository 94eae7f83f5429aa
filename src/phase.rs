//! Grouping tasks into ordered phases.
//!
//! A phase is every task sharing one `parallel_group`. Phases run strictly
//! in ascending group order, so requiring each dependency to sit in a
//! strictly earlier group is enough to rule out cycles and same-phase
//! ordering hazards with a single check.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::error::{Result, TasklineError};
use crate::ledger::{Task, TaskStatus};

/// All tasks of one parallel group, in ledger order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Phase {
    pub group: u32,
    pub tasks: Vec<Task>,
}

/// A file declared by more than one task of the same phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOverlap {
    pub file: String,
    pub task_ids: Vec<String>,
}

impl Phase {
    /// Whether every task is already done, so the phase needs no dispatch.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_done())
    }

    /// Tasks that still need an attempt.
    #[must_use]
    pub fn pending_tasks(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| !t.status.is_done()).collect()
    }

    /// Number of tasks in `status`.
    #[must_use]
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Task titles, in ledger order.
    #[must_use]
    pub fn titles(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.title.as_str()).collect()
    }

    /// Files claimed by two or more tasks of this phase.
    ///
    /// These tasks run concurrently and may race on the same file. File
    /// ownership is advisory planner metadata, so this only informs a
    /// warning; it never blocks dispatch.
    #[must_use]
    pub fn file_overlaps(&self) -> Vec<FileOverlap> {
        let mut owners: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for task in self.tasks.iter().filter(|t| !t.status.is_done()) {
            for file in &task.files {
                let entry = owners.entry(file.as_str()).or_default();
                if !entry.contains(&task.id) {
                    entry.push(task.id.clone());
                }
            }
        }

        owners
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(file, task_ids)| FileOverlap {
                file: file.to_string(),
                task_ids,
            })
            .collect()
    }
}

/// Group tasks into phases ordered by group number and validate dependencies.
///
/// # Errors
///
/// - [`TasklineError::UnknownDependency`] when a dependency id is not in `tasks`
/// - [`TasklineError::DependencyOrderViolation`] when a dependency is in the
///   same or a later group
///
/// # Example
///
/// ```
/// use taskline::ledger::Task;
/// use taskline::phase::build_phases;
///
/// let a = Task::new("A", "schema");
/// let mut b = Task::new("B", "repository");
/// b.parallel_group = 2;
/// b.depends_on = vec!["A".to_string()];
///
/// let phases = build_phases(&[b, a]).unwrap();
/// assert_eq!(phases.len(), 2);
/// assert_eq!(phases[0].tasks[0].id, "A");
/// ```
pub fn build_phases(tasks: &[Task]) -> Result<Vec<Phase>> {
    let groups: HashMap<&str, u32> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.parallel_group))
        .collect();

    for task in tasks {
        for dep in &task.depends_on {
            let Some(&dep_group) = groups.get(dep.as_str()) else {
                return Err(TasklineError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            };
            if dep_group >= task.parallel_group {
                return Err(TasklineError::DependencyOrderViolation {
                    task: task.id.clone(),
                    task_group: task.parallel_group,
                    dependency: dep.clone(),
                    dependency_group: dep_group,
                });
            }
        }
    }

    let mut by_group: BTreeMap<u32, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        by_group
            .entry(task.parallel_group)
            .or_default()
            .push(task.clone());
    }

    Ok(by_group
        .into_iter()
        .map(|(group, tasks)| Phase { group, tasks })
        .collect())
}
