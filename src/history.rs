//! Durable records derived from a run: attempt transcripts and phase summaries.
//!
//! Transcripts land in `history/NNN-<task-id>.md`, numbered in completion
//! order across the whole unit. Summaries land in
//! `summaries/phase-<group>.md` and feed later phases' instructions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tracing::debug;

use crate::error::Result;
use crate::ledger::write_atomic;
use crate::lock::FileLock;
use crate::prompt::PhaseSummary;

fn history_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{3,})-(.+)\.md$").expect("valid history regex"))
}

fn summary_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^phase-(\d+)\.md$").expect("valid summary regex"))
}

/// Task id made safe for a file name.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// One saved transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub number: u32,
    pub task_stem: String,
    pub path: PathBuf,
}

/// Numbered transcript files of one unit.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
    lock: FileLock,
}

impl HistoryStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let lock = FileLock::new(dir.join("index"));
        Self { dir, lock }
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock = self.lock.with_timeout(timeout);
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All entries, ordered by number.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().to_string();
            let Some(caps) = history_name_re().captures(&name) else {
                continue;
            };
            let Ok(number) = caps[1].parse() else {
                continue;
            };
            entries.push(HistoryEntry {
                number,
                task_stem: caps[2].to_string(),
                path: item.path(),
            });
        }
        entries.sort_by_key(|e| e.number);
        Ok(entries)
    }

    /// Save `transcript` for `task_id` under the next free number.
    pub fn save(&self, task_id: &str, transcript: &str) -> Result<PathBuf> {
        let path = self.lock.with_lock(|| {
            let next = self.entries()?.last().map_or(1, |e| e.number + 1);
            let path = self
                .dir
                .join(format!("{next:03}-{}.md", file_stem(task_id)));
            let stamped = format!(
                "<!-- task {task_id}, saved {} -->\n{transcript}",
                Utc::now().to_rfc3339()
            );
            write_atomic(&path, &stamped)?;
            Ok(path)
        })?;
        debug!("Saved transcript {}", path.display());
        Ok(path)
    }

}

/// Concatenate the transcripts at `paths`, each under its file name.
///
/// Callers pass the files saved by the attempts they care about, so
/// transcripts left over from earlier runs of the same task stay out.
pub fn collect_transcripts(paths: &[PathBuf]) -> Result<String> {
    let mut out = String::new();
    for path in paths {
        let text = fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        out.push_str(&format!("===== {name} =====\n{}\n\n", text.trim_end()));
    }
    Ok(out)
}

/// Per-phase summary files of one unit.
#[derive(Debug, Clone)]
pub struct SummaryStore {
    dir: PathBuf,
}

impl SummaryStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path_for(&self, group: u32) -> PathBuf {
        self.dir.join(format!("phase-{group}.md"))
    }

    /// Write (or replace) the summary of `group`.
    pub fn save(&self, group: u32, text: &str) -> Result<PathBuf> {
        let path = self.path_for(group);
        write_atomic(&path, text.trim())?;
        Ok(path)
    }

    /// Every summary, ordered by group.
    pub fn load_all(&self) -> Result<Vec<PhaseSummary>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        for item in read_dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().to_string();
            let Some(group) = summary_name_re()
                .captures(&name)
                .and_then(|caps| caps[1].parse().ok())
            else {
                continue;
            };
            summaries.push(PhaseSummary {
                group,
                text: fs::read_to_string(item.path())?,
            });
        }
        summaries.sort_by_key(|s| s.group);
        Ok(summaries)
    }

    /// Summaries of phases before `group`.
    pub fn load_before(&self, group: u32) -> Result<Vec<PhaseSummary>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|s| s.group < group)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_save_numbers_sequentially() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path().join("history"));

        let first = store.save("T1", "one").unwrap();
        let second = store.save("T2", "two").unwrap();
        let third = store.save("T1", "again").unwrap();

        assert!(first.ends_with("001-T1.md"));
        assert!(second.ends_with("002-T2.md"));
        assert!(third.ends_with("003-T1.md"));

        let entries: Vec<_> = store
            .entries()
            .unwrap()
            .into_iter()
            .filter(|e| e.task_stem == "T1")
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].number, 3);
    }

    #[test]
    fn test_unsafe_ids_are_sanitized() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path());
        let path = store.save("auth/login step", "x").unwrap();
        assert!(path.ends_with("001-auth_login_step.md"));
        assert_eq!(store.entries().unwrap()[0].task_stem, "auth_login_step");
    }

    #[test]
    fn test_concurrent_saves_get_distinct_numbers() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(HistoryStore::new(temp.path().join("history")));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.save(&format!("T{i}"), "log").unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let numbers: Vec<u32> = store.entries().unwrap().iter().map(|e| e.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_collect_transcripts() {
        let temp = TempDir::new().unwrap();
        let store = HistoryStore::new(temp.path());
        store.save("T2", "stale log from an earlier run").unwrap();
        store.save("T1", "first log").unwrap();
        let current = store.save("T2", "second log").unwrap();

        let text = collect_transcripts(&[current]).unwrap();
        assert!(text.contains("===== 003-T2.md ====="));
        assert!(text.contains("second log"));
        assert!(!text.contains("first log"));
        assert!(!text.contains("stale log"));
    }

    #[test]
    fn test_summaries() {
        let temp = TempDir::new().unwrap();
        let store = SummaryStore::new(temp.path().join("summaries"));
        assert!(store.load_all().unwrap().is_empty());

        store.save(10, "tenth\n").unwrap();
        store.save(2, "second").unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.iter().map(|s| s.group).collect::<Vec<_>>(), vec![2, 10]);
        assert_eq!(all[1].text, "tenth");

        let before = store.load_before(10).unwrap();
        assert_eq!(before.len(), 1);
    }
}
