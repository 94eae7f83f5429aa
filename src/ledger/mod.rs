//! The task ledger: typed task records and their on-disk document.
//!
//! The ledger is both the plan and the progress record. It is read without
//! locking (only status lines change, and every write is an atomic rename)
//! and mutated only through [`Ledger`], which wraps each read-modify-write
//! in the ledger's [`FileLock`].
//!
//! # Lifecycle
//!
//! ```text
//! pending ──> running ──> completed
//!    ^           │   └──> failed
//!    │           │   └──> skipped
//!    └───────────┘  (crash recovery / retry reset)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use taskline::ledger::{Ledger, TaskStatus};
//!
//! let ledger = Ledger::open(".taskline/auth/tasks.md");
//! let recovered = ledger.reset_running()?;
//! ledger.update_status("T3", TaskStatus::Running)?;
//! println!("{}", ledger.progress()?);
//! ```

pub mod parser;
pub mod questions;
pub mod writer;

pub use parser::parse;
pub use writer::write;

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TasklineError};
use crate::lock::FileLock;
use writer::{patch_field, MissingField};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

// ============================================================================
// Task Status
// ============================================================================

/// Status of a task in the ledger (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Not yet attempted, or reset for another attempt
    #[default]
    Pending,
    /// An attempt is in flight
    Running,
    /// Finished successfully
    Completed,
    /// Last attempt failed
    Failed,
    /// Deliberately not run
    Skipped,
}

impl TaskStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Skipped,
    ];

    /// Ledger spelling of this status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// Whether the phase executor treats the task as already done.
    ///
    /// # Example
    ///
    /// ```
    /// use taskline::ledger::TaskStatus;
    ///
    /// assert!(TaskStatus::Skipped.is_done());
    /// assert!(!TaskStatus::Failed.is_done());
    /// ```
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TasklineError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| TasklineError::InvalidStatus {
                value: s.trim().to_string(),
            })
    }
}

// ============================================================================
// Task
// ============================================================================

/// One unit of work from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, unique within the ledger
    pub id: String,
    /// Short human label
    pub title: String,
    /// Current status
    pub status: TaskStatus,
    /// Tasks sharing a group run concurrently; groups run in ascending order
    pub parallel_group: u32,
    /// Ids of tasks that must complete first (all in earlier groups)
    pub depends_on: Vec<String>,
    /// Work instruction for the agent
    pub description: String,
    /// Paths the task expects to touch (advisory)
    pub files: Vec<String>,
    /// Number of prior attempts, informational
    pub retry_count: u32,
}

impl Task {
    /// Create a pending task in group 1.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Pending,
            parallel_group: 1,
            depends_on: Vec::new(),
            description: String::new(),
            files: Vec::new(),
            retry_count: 0,
        }
    }

    /// Whether every dependency is completed in `statuses`.
    #[must_use]
    pub fn dependencies_met(&self, statuses: &HashMap<&str, TaskStatus>) -> bool {
        self.depends_on
            .iter()
            .all(|dep| statuses.get(dep.as_str()) == Some(&TaskStatus::Completed))
    }
}

/// Pending tasks whose dependencies are all completed, in ledger order.
#[must_use]
pub fn runnable_tasks(tasks: &[Task]) -> Vec<&Task> {
    let statuses: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && t.dependencies_met(&statuses))
        .collect()
}

// ============================================================================
// Progress
// ============================================================================

/// Status counts across a ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Progress {
    /// Count statuses in `tasks`.
    #[must_use]
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut progress = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::Running => progress.running += 1,
                TaskStatus::Completed => progress.completed += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Skipped => progress.skipped += 1,
            }
        }
        progress
    }

    /// Share of tasks that are done (completed or skipped), 0-100.
    #[must_use]
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.completed + self.skipped) as f64 * 100.0 / self.total as f64
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} done ({:.0}%), {} failed, {} pending, {} running",
            self.completed + self.skipped,
            self.total,
            self.percent_complete(),
            self.failed,
            self.pending,
            self.running
        )
    }
}

// ============================================================================
// Ledger file
// ============================================================================

/// File-backed ledger guarded by a [`FileLock`].
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    lock: FileLock,
}

impl Ledger {
    /// Open the ledger at `path` with the default lock timeout.
    #[must_use]
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock = FileLock::new(&path);
        Self { path, lock }
    }

    /// Set the lock timeout used for updates.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock = self.lock.with_timeout(timeout);
        self
    }

    /// Path of the ledger document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the ledger document exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read and parse the ledger without locking.
    pub fn load(&self) -> Result<Vec<Task>> {
        let text = self.read_text()?;
        parse(&text)
    }

    /// Replace the whole ledger with `tasks`.
    pub fn save(&self, tasks: &[Task]) -> Result<()> {
        self.lock.with_lock(|| self.write_atomic(&write(tasks)))
    }

    /// Current status counts.
    pub fn progress(&self) -> Result<Progress> {
        Ok(Progress::from_tasks(&self.load()?))
    }

    /// Set the status of task `id`.
    ///
    /// # Errors
    ///
    /// - [`TasklineError::TaskNotFound`] when no block has that id
    /// - [`TasklineError::MalformedTask`] when the block has no status line
    /// - [`TasklineError::LockTimeout`] when the lock is contended too long
    pub fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let previous = self.lock.with_lock(|| {
            let text = self.read_text()?;
            let (patched, previous) =
                patch_field(&text, id, "status", status.as_str(), MissingField::Reject)?;
            self.write_atomic(&patched)?;
            Ok(previous)
        })?;

        debug!(
            "Task {} status {} -> {}",
            id,
            previous.as_deref().unwrap_or("?"),
            status
        );
        Ok(())
    }

    /// Set the status of task `id` from its ledger spelling.
    ///
    /// Fails with [`TasklineError::InvalidStatus`] for values outside the set.
    pub fn update_status_str(&self, id: &str, status: &str) -> Result<()> {
        let status = TaskStatus::from_str(status)?;
        self.update_status(id, status)
    }

    /// Increment `retry_count` for task `id`, returning the new value.
    pub fn bump_retry_count(&self, id: &str) -> Result<u32> {
        self.lock.with_lock(|| {
            let text = self.read_text()?;
            let current = parse(&text)?
                .into_iter()
                .find(|t| t.id == id)
                .map(|t| t.retry_count)
                .ok_or_else(|| TasklineError::TaskNotFound { id: id.to_string() })?;
            let next = current + 1;
            let (patched, _) = patch_field(
                &text,
                id,
                "retry_count",
                &next.to_string(),
                MissingField::Insert,
            )?;
            self.write_atomic(&patched)?;
            Ok(next)
        })
    }

    /// Reset every `running` task to `pending` in one critical section.
    ///
    /// A `running` task found at startup belongs to a run that died
    /// mid-attempt; its side effects are unknown, so it is redone.
    pub fn reset_running(&self) -> Result<Vec<String>> {
        let recovered = self.lock.with_lock(|| {
            let mut text = self.read_text()?;
            let stale: Vec<String> = parse(&text)?
                .into_iter()
                .filter(|t| t.status == TaskStatus::Running)
                .map(|t| t.id)
                .collect();

            if stale.is_empty() {
                return Ok(stale);
            }

            for id in &stale {
                let (patched, _) = patch_field(
                    &text,
                    id,
                    "status",
                    TaskStatus::Pending.as_str(),
                    MissingField::Reject,
                )?;
                text = patched;
            }
            self.write_atomic(&text)?;
            Ok(stale)
        })?;

        if !recovered.is_empty() {
            info!(
                "Recovered {} interrupted task(s): {}",
                recovered.len(),
                recovered.join(", ")
            );
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------------
    // Async entry points
    //
    // Lock acquisition polls with a blocking sleep, so callers on the async
    // runtime go through a blocking thread instead of stalling a worker.
    // ------------------------------------------------------------------------

    /// [`Ledger::load`] on a blocking thread.
    pub async fn load_async(&self) -> Result<Vec<Task>> {
        self.blocking(|ledger| ledger.load()).await
    }

    /// [`Ledger::update_status`] on a blocking thread.
    pub async fn update_status_async(&self, id: &str, status: TaskStatus) -> Result<()> {
        let id = id.to_string();
        self.blocking(move |ledger| ledger.update_status(&id, status)).await
    }

    /// [`Ledger::bump_retry_count`] on a blocking thread.
    pub async fn bump_retry_count_async(&self, id: &str) -> Result<u32> {
        let id = id.to_string();
        self.blocking(move |ledger| ledger.bump_retry_count(&id)).await
    }

    /// [`Ledger::reset_running`] on a blocking thread.
    pub async fn reset_running_async(&self) -> Result<Vec<String>> {
        self.blocking(|ledger| ledger.reset_running()).await
    }

    /// [`Ledger::progress`] on a blocking thread.
    pub async fn progress_async(&self) -> Result<Progress> {
        self.blocking(|ledger| ledger.progress()).await
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Ledger) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || op(&ledger))
            .await
            .map_err(|e| {
                TasklineError::Other(anyhow::anyhow!(
                    "Ledger operation on {} panicked: {}",
                    self.path.display(),
                    e
                ))
            })?
    }

    fn read_text(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TasklineError::MissingFile {
                    path: self.path.clone(),
                }
            } else {
                e.into()
            }
        })
    }

    fn write_atomic(&self, text: &str) -> Result<()> {
        write_atomic(&self.path, text)
    }
}

/// Write `text` to `path` through a temp file and rename.
pub(crate) fn write_atomic(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(TMP_SUFFIX);
    let tmp_path = path.with_file_name(tmp_name);

    let mut tmp_file = File::create(&tmp_path)?;
    tmp_file.write_all(text.as_bytes())?;
    tmp_file.sync_all()?;
    drop(tmp_file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn ledger_with(tasks: &[Task]) -> (Ledger, TempDir) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let ledger = Ledger::open(temp.path().join("tasks.md"));
        ledger.save(tasks).expect("save should succeed");
        (ledger, temp)
    }

    fn task(id: &str, group: u32, deps: &[&str], status: TaskStatus) -> Task {
        let mut t = Task::new(id, format!("Task {id}"));
        t.parallel_group = group;
        t.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
        t.status = status;
        t
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("running".parse::<TaskStatus>().unwrap(), TaskStatus::Running);
        assert_eq!(" SKIPPED ".parse::<TaskStatus>().unwrap(), TaskStatus::Skipped);
        let err = "done".parse::<TaskStatus>().unwrap_err();
        assert!(matches!(err, TasklineError::InvalidStatus { value } if value == "done"));
    }

    #[test]
    fn test_status_display_round_trips() {
        for status in TaskStatus::ALL {
            assert_eq!(status.to_string().parse::<TaskStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_runnable_tasks() {
        let tasks = vec![
            task("A", 1, &[], TaskStatus::Completed),
            task("B", 1, &[], TaskStatus::Failed),
            task("C", 2, &["A"], TaskStatus::Pending),
            task("D", 2, &["B"], TaskStatus::Pending),
            task("E", 2, &["A"], TaskStatus::Running),
        ];
        let ids: Vec<_> = runnable_tasks(&tasks).iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["C"]);
    }

    #[test]
    fn test_progress_counts() {
        let tasks = vec![
            task("A", 1, &[], TaskStatus::Completed),
            task("B", 1, &[], TaskStatus::Skipped),
            task("C", 1, &[], TaskStatus::Failed),
            task("D", 1, &[], TaskStatus::Pending),
        ];
        let progress = Progress::from_tasks(&tasks);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.failed, 1);
        assert!((progress.percent_complete() - 50.0).abs() < f64::EPSILON);
        assert!(progress.to_string().contains("2/4 done (50%)"));
    }

    #[test]
    fn test_empty_progress_is_complete() {
        assert!((Progress::default().percent_complete() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_status_persists() {
        let (ledger, _temp) = ledger_with(&[task("A", 1, &[], TaskStatus::Pending)]);
        ledger.update_status("A", TaskStatus::Running).unwrap();
        assert_eq!(ledger.load().unwrap()[0].status, TaskStatus::Running);
        assert!(!ledger.path().with_file_name("tasks.md.tmp").exists());
    }

    #[test]
    fn test_update_status_unknown_task() {
        let (ledger, _temp) = ledger_with(&[task("A", 1, &[], TaskStatus::Pending)]);
        let err = ledger.update_status("nope", TaskStatus::Running).unwrap_err();
        assert!(matches!(err, TasklineError::TaskNotFound { .. }));
    }

    #[test]
    fn test_update_status_str_rejects_invalid() {
        let (ledger, _temp) = ledger_with(&[task("A", 1, &[], TaskStatus::Pending)]);
        let err = ledger.update_status_str("A", "finished").unwrap_err();
        assert!(matches!(err, TasklineError::InvalidStatus { .. }));
        assert_eq!(ledger.load().unwrap()[0].status, TaskStatus::Pending);
    }

    #[test]
    fn test_update_status_missing_status_line() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.md");
        fs::write(&path, "## A\n- **id**: A\n").unwrap();
        let ledger = Ledger::open(&path);
        let err = ledger.update_status("A", TaskStatus::Running).unwrap_err();
        assert!(matches!(err, TasklineError::MalformedTask { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        let ledger = Ledger::open(temp.path().join("absent.md"));
        assert!(!ledger.exists());
        assert!(matches!(
            ledger.load().unwrap_err(),
            TasklineError::MissingFile { .. }
        ));
    }

    #[test]
    fn test_update_preserves_hand_edits() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.md");
        let text = "# Plan for auth\n\nSome planner notes.\n\n## A\n- **id**: A\n- **status**: pending\n- **description**: do it\n";
        fs::write(&path, text).unwrap();

        Ledger::open(&path)
            .update_status("A", TaskStatus::Completed)
            .unwrap();

        let after = fs::read_to_string(&path).unwrap();
        assert_eq!(after, text.replace("pending", "completed"));
    }

    #[test]
    fn test_bump_retry_count() {
        let (ledger, _temp) = ledger_with(&[task("A", 1, &[], TaskStatus::Pending)]);
        assert_eq!(ledger.bump_retry_count("A").unwrap(), 1);
        assert_eq!(ledger.bump_retry_count("A").unwrap(), 2);
        assert_eq!(ledger.load().unwrap()[0].retry_count, 2);
    }

    #[test]
    fn test_bump_retry_count_inserts_missing_field() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.md");
        fs::write(&path, "## A\n- **id**: A\n- **status**: failed\n").unwrap();
        let ledger = Ledger::open(&path);
        assert_eq!(ledger.bump_retry_count("A").unwrap(), 1);
        assert_eq!(ledger.load().unwrap()[0].retry_count, 1);
    }

    #[test]
    fn test_reset_running() {
        let (ledger, _temp) = ledger_with(&[
            task("A", 1, &[], TaskStatus::Running),
            task("B", 1, &[], TaskStatus::Completed),
            task("C", 2, &["A"], TaskStatus::Running),
        ]);
        let recovered = ledger.reset_running().unwrap();
        assert_eq!(recovered, vec!["A", "C"]);

        let statuses: Vec<_> = ledger.load().unwrap().iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![TaskStatus::Pending, TaskStatus::Completed, TaskStatus::Pending]
        );
    }

    #[test]
    fn test_reset_running_noop() {
        let (ledger, _temp) = ledger_with(&[task("A", 1, &[], TaskStatus::Completed)]);
        assert!(ledger.reset_running().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_updates_lose_nothing() {
        let tasks: Vec<Task> = (0..8)
            .map(|i| task(&format!("T{i}"), 1, &[], TaskStatus::Pending))
            .collect();
        let (ledger, _temp) = ledger_with(&tasks);

        let barrier = Arc::new(Barrier::new(tasks.len()));
        let handles: Vec<_> = (0..tasks.len())
            .map(|i| {
                let ledger = ledger.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger.update_status(&format!("T{i}"), TaskStatus::Running)
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let loaded = ledger.load().unwrap();
        assert_eq!(loaded.len(), 8);
        assert!(loaded.iter().all(|t| t.status == TaskStatus::Running));
    }

    #[tokio::test]
    async fn test_async_update_waits_for_lock_without_stalling_runtime() {
        let (ledger, _temp) = ledger_with(&[task("A", 1, &[], TaskStatus::Pending)]);
        let (held_tx, held_rx) = std::sync::mpsc::channel();

        let holder = {
            let lock = FileLock::new(ledger.path());
            std::thread::spawn(move || {
                lock.with_lock(|| {
                    held_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(())
                })
            })
        };
        held_rx.recv().unwrap();

        // Single-threaded runtime: the ticker only advances if the update
        // is not blocking the executor thread.
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };

        ledger
            .update_status_async("A", TaskStatus::Running)
            .await
            .unwrap();
        ticker.abort();
        holder.join().unwrap().unwrap();

        assert!(ticks.load(std::sync::atomic::Ordering::SeqCst) >= 5);
        assert_eq!(ledger.load_async().await.unwrap()[0].status, TaskStatus::Running);
        assert_eq!(ledger.bump_retry_count_async("A").await.unwrap(), 1);
        assert_eq!(ledger.reset_running_async().await.unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_async_update_times_out_on_held_lock() {
        let (ledger, _temp) = ledger_with(&[task("A", 1, &[], TaskStatus::Pending)]);
        let ledger = ledger.with_lock_timeout(Duration::from_millis(50));
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = {
            let lock = FileLock::new(ledger.path());
            std::thread::spawn(move || {
                lock.with_lock(|| {
                    held_tx.send(()).unwrap();
                    release_rx.recv().ok();
                    Ok(())
                })
            })
        };
        held_rx.recv().unwrap();

        let err = ledger
            .update_status_async("A", TaskStatus::Completed)
            .await
            .unwrap_err();
        release_tx.send(()).unwrap();
        holder.join().unwrap().unwrap();

        assert!(matches!(err, TasklineError::LockTimeout { .. }));
        assert_eq!(ledger.load().unwrap()[0].status, TaskStatus::Pending);
    }
}
