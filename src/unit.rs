//! On-disk layout of a unit: the ledger and everything derived from it.

use std::path::{Path, PathBuf};

use crate::config::TASKLINE_DIR;
use crate::error::{Result, TasklineError};

/// Paths of one unit's artifacts under `<project>/.taskline/<unit>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitLayout {
    project_dir: PathBuf,
    name: String,
    root: PathBuf,
}

impl UnitLayout {
    /// Compute the layout for `unit` inside `project_dir`.
    #[must_use]
    pub fn resolve(project_dir: impl AsRef<Path>, unit: &str) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        let root = project_dir.join(TASKLINE_DIR).join(unit);
        Self {
            project_dir,
            name: unit.to_string(),
            root,
        }
    }

    /// Fail with `MissingFile` unless the unit and its ledger exist.
    pub fn ensure_ready(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(TasklineError::MissingFile {
                path: self.root.clone(),
            });
        }
        if !self.tasks_path().is_file() {
            return Err(TasklineError::MissingFile {
                path: self.tasks_path(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working tree the agent operates in.
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn tasks_path(&self) -> PathBuf {
        self.root.join("tasks.md")
    }

    #[must_use]
    pub fn context_path(&self) -> PathBuf {
        self.root.join("context.md")
    }

    #[must_use]
    pub fn questions_path(&self) -> PathBuf {
        self.root.join("questions.md")
    }

    #[must_use]
    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    #[must_use]
    pub fn summaries_dir(&self) -> PathBuf {
        self.root.join("summaries")
    }

    /// Upstream project context, empty when the planner wrote none.
    pub fn read_context(&self) -> Result<String> {
        match std::fs::read_to_string(self.context_path()) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}
