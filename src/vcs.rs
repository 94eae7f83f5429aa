//! Version-control checkpoints.
//!
//! After a successful phase the driver commits the whole working tree so
//! the next phase starts from a durable point. The [`Checkpointer`] trait
//! keeps the engine independent of git; [`GitCheckpointer`] shells out to
//! the `git` binary.
//!
//! The engine's own state directory (`.taskline/`) lives inside the working
//! tree but is never part of a checkpoint: every git call is limited to a
//! pathspec that excludes it.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::config::TASKLINE_DIR;
use crate::error::{Result, TasklineError};

/// Local, synchronous checkpoint operations.
pub trait Checkpointer: Send + Sync {
    /// Current checkpoint id, `None` before the first commit.
    fn head(&self) -> Result<Option<String>>;

    /// Whether the working tree differs from the last checkpoint.
    fn has_changes(&self) -> Result<bool>;

    /// Stage everything and commit with `message`, returning the new id.
    fn commit_all(&self, message: &str) -> Result<String>;

    /// Diff of the working tree against the last checkpoint.
    fn diff_uncommitted(&self) -> Result<String>;

    /// Diff of the working tree against checkpoint `base`.
    fn diff_since(&self, base: &str) -> Result<String>;
}

/// [`Checkpointer`] over a git working tree.
#[derive(Debug, Clone)]
pub struct GitCheckpointer {
    repo_dir: PathBuf,
}

impl GitCheckpointer {
    #[must_use]
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    #[must_use]
    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Run `git <args> -- . :(exclude).taskline`.
    fn git_tracked(&self, operation: &str, args: &[&str]) -> Result<String> {
        let exclude = format!(":(exclude){TASKLINE_DIR}");
        let mut full: Vec<&str> = args.to_vec();
        full.extend(["--", ".", exclude.as_str()]);
        self.git(operation, &full)
    }

    /// New files only show up in a diff once the index knows about them.
    fn mark_untracked(&self) -> Result<()> {
        let listing = self.git_tracked(
            "ls-files",
            &["ls-files", "--others", "--exclude-standard", "-z"],
        )?;
        let untracked: Vec<&str> = listing.split('\0').filter(|p| !p.is_empty()).collect();
        if untracked.is_empty() {
            return Ok(());
        }

        let mut args = vec!["add", "--intent-to-add", "--"];
        args.extend(untracked);
        self.git("add", &args)?;
        Ok(())
    }

    fn git(&self, operation: &str, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .map_err(|e| TasklineError::git(operation, e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(TasklineError::git(
                operation,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

impl Checkpointer for GitCheckpointer {
    fn head(&self) -> Result<Option<String>> {
        // rev-parse fails on an unborn branch
        match self.git("rev-parse", &["rev-parse", "--verify", "-q", "HEAD"]) {
            Ok(hash) => Ok(Some(hash.trim().to_string())),
            Err(TasklineError::Git { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn has_changes(&self) -> Result<bool> {
        let status = self.git_tracked("status", &["status", "--porcelain"])?;
        Ok(!status.trim().is_empty())
    }

    fn commit_all(&self, message: &str) -> Result<String> {
        self.git_tracked("add", &["add", "-A"])?;
        self.git("commit", &["commit", "-q", "-m", message])?;
        let hash = self
            .head()?
            .ok_or_else(|| TasklineError::git("commit", "no HEAD after commit"))?;
        debug!("Committed checkpoint {}", hash);
        Ok(hash)
    }

    fn diff_uncommitted(&self) -> Result<String> {
        self.mark_untracked()?;
        match self.head()? {
            Some(_) => self.git_tracked("diff", &["diff", "HEAD"]),
            None => self.git_tracked("diff", &["diff"]),
        }
    }

    fn diff_since(&self, base: &str) -> Result<String> {
        self.mark_untracked()?;
        self.git_tracked("diff", &["diff", base])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_repo() -> Option<(TempDir, GitCheckpointer)> {
        which::which("git").ok()?;
        let temp = TempDir::new().unwrap();
        let vcs = GitCheckpointer::new(temp.path());
        vcs.git("init", &["init", "-q"]).ok()?;
        vcs.git("config", &["config", "user.email", "test@example.com"]).ok()?;
        vcs.git("config", &["config", "user.name", "Test"]).ok()?;
        Some((temp, vcs))
    }

    #[test]
    fn test_commit_cycle() {
        let Some((temp, vcs)) = git_repo() else {
            return;
        };

        assert_eq!(vcs.head().unwrap(), None);
        assert!(!vcs.has_changes().unwrap());

        std::fs::write(temp.path().join("a.txt"), "one\n").unwrap();
        assert!(vcs.has_changes().unwrap());

        let first = vcs.commit_all("phase 1: a").unwrap();
        assert_eq!(vcs.head().unwrap().as_deref(), Some(first.as_str()));
        assert!(!vcs.has_changes().unwrap());

        std::fs::write(temp.path().join("a.txt"), "two\n").unwrap();
        assert!(vcs.diff_uncommitted().unwrap().contains("+two"));

        vcs.commit_all("phase 2: a").unwrap();
        let diff = vcs.diff_since(&first).unwrap();
        assert!(diff.contains("-one"));
        assert!(diff.contains("+two"));
    }

    #[test]
    fn test_diff_includes_new_files() {
        let Some((temp, vcs)) = git_repo() else {
            return;
        };

        std::fs::write(temp.path().join("a.txt"), "one\n").unwrap();
        let first = vcs.commit_all("phase 1: a").unwrap();

        std::fs::write(temp.path().join("fresh.rs"), "pub fn fresh() {}\n").unwrap();
        let diff = vcs.diff_uncommitted().unwrap();
        assert!(diff.contains("fresh.rs"), "diff was: {diff}");
        assert!(diff.contains("+pub fn fresh() {}"));

        let since = vcs.diff_since(&first).unwrap();
        assert!(since.contains("+pub fn fresh() {}"));

        // The diff must not leave anything half-staged that breaks a commit
        vcs.commit_all("phase 2: fresh").unwrap();
        assert!(!vcs.has_changes().unwrap());
    }

    #[test]
    fn test_engine_state_is_never_checkpointed() {
        let Some((temp, vcs)) = git_repo() else {
            return;
        };

        let state = temp.path().join(TASKLINE_DIR).join("auth");
        std::fs::create_dir_all(state.join("history")).unwrap();
        std::fs::write(state.join("tasks.md"), "# Tasks\n").unwrap();
        std::fs::write(state.join("tasks.md.lock"), "").unwrap();
        std::fs::write(state.join("history/001-A.md"), "transcript\n").unwrap();

        assert!(!vcs.has_changes().unwrap());
        assert!(!vcs.diff_uncommitted().unwrap().contains("tasks.md"));

        std::fs::write(temp.path().join("a.txt"), "one\n").unwrap();
        assert!(vcs.has_changes().unwrap());
        vcs.commit_all("phase 1: a").unwrap();

        let files = vcs.git("ls-files", &["ls-files"]).unwrap();
        assert_eq!(files.trim(), "a.txt");
        assert!(!vcs.has_changes().unwrap());
    }

    #[test]
    fn test_not_a_repository() {
        let temp = TempDir::new().unwrap();
        let vcs = GitCheckpointer::new(temp.path());
        if which::which("git").is_err() {
            return;
        }
        assert!(matches!(
            vcs.has_changes(),
            Err(TasklineError::Git { .. })
        ));
    }
}
