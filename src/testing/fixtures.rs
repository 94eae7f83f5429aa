//! Unit directories for tests.

use std::path::Path;

use crate::error::{Result, TasklineError};
use crate::ledger::{Ledger, Task, TaskStatus};
use crate::unit::UnitLayout;

/// Build a task for a fixture ledger.
#[must_use]
pub fn sample_task(id: &str, group: u32, deps: &[&str]) -> Task {
    let mut task = Task::new(id, format!("Task {id}"));
    task.parallel_group = group;
    task.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
    task.description = format!("Implement {id}.");
    task
}

/// A unit directory under a caller-owned root (usually a `TempDir`).
///
/// # Example
///
/// ```rust,ignore
/// let temp = TempDir::new()?;
/// let fixture = UnitFixture::new(temp.path(), "auth")?
///     .with_tasks(&[sample_task("A", 1, &[])])?;
/// assert_eq!(fixture.status_of("A")?, TaskStatus::Pending);
/// ```
#[derive(Debug, Clone)]
pub struct UnitFixture {
    layout: UnitLayout,
}

impl UnitFixture {
    /// Create `<root>/.taskline/<unit>/`.
    pub fn new(root: &Path, unit: &str) -> Result<Self> {
        let layout = UnitLayout::resolve(root, unit);
        std::fs::create_dir_all(layout.root())?;
        Ok(Self { layout })
    }

    /// Write `tasks` as the ledger.
    pub fn with_tasks(self, tasks: &[Task]) -> Result<Self> {
        self.ledger().save(tasks)?;
        Ok(self)
    }

    /// Write raw ledger text.
    pub fn with_ledger_text(self, text: &str) -> Result<Self> {
        std::fs::write(self.layout.tasks_path(), text)?;
        Ok(self)
    }

    /// Write `context.md`.
    pub fn with_context(self, text: &str) -> Result<Self> {
        std::fs::write(self.layout.context_path(), text)?;
        Ok(self)
    }

    #[must_use]
    pub fn layout(&self) -> &UnitLayout {
        &self.layout
    }

    #[must_use]
    pub fn ledger(&self) -> Ledger {
        Ledger::open(self.layout.tasks_path())
    }

    pub fn tasks(&self) -> Result<Vec<Task>> {
        self.ledger().load()
    }

    /// Current ledger status of task `id`.
    pub fn status_of(&self, id: &str) -> Result<TaskStatus> {
        self.tasks()?
            .into_iter()
            .find(|t| t.id == id)
            .map(|t| t.status)
            .ok_or_else(|| TasklineError::TaskNotFound { id: id.to_string() })
    }
}
