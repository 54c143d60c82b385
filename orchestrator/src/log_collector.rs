//! Log collector (C5): per-task append-only log buffer with bounded retention.
//!
//! Grounded on `app/utils/task_log_collector.py`'s `TaskLogCollector`: one JSONL
//! file per `(task_id, bindtype)`, rewritten in full on every append and truncated
//! to the last `max_logs_per_file` entries. Concurrency-safety here is a single
//! `tokio::sync::Mutex` guarding the whole collector, matching the source's single
//! `asyncio.Lock()` (the source serialises all log I/O, not just per-file).

use chrono::{DateTime, Utc};
use shared::logentry::{LogBindType, LogEntry, LogLevel};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::error;

pub struct LogCollector {
    base_dir: PathBuf,
    max_logs_per_file: usize,
    lock: Mutex<()>,
}

impl LogCollector {
    pub fn new(base_dir: PathBuf, max_logs_per_file: usize) -> Self {
        LogCollector {
            base_dir,
            max_logs_per_file,
            lock: Mutex::new(()),
        }
    }

    fn file_path(&self, task_id: &str, bindtype: LogBindType) -> PathBuf {
        self.base_dir
            .join(bindtype.as_str())
            .join(format!("{task_id}.jsonl"))
    }

    fn read_file(path: &Path) -> Vec<LogEntry> {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str::<LogEntry>(l) {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::debug!(error = %e, line = %l, "failed to parse log line, skipping");
                    None
                }
            })
            .collect()
    }

    fn write_file(&self, path: &Path, mut entries: Vec<LogEntry>) {
        if entries.len() > self.max_logs_per_file {
            let drop_count = entries.len() - self.max_logs_per_file;
            entries.drain(0..drop_count);
        }
        let mut buf = String::new();
        for entry in &entries {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    buf.push_str(&line);
                    buf.push('\n');
                }
                Err(e) => error!(error = %e, "failed to serialise log entry"),
            }
        }
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, buf) {
            error!(path = %path.display(), error = %e, "failed to write log file");
        }
    }

    pub async fn add_log(
        &self,
        task_id: &str,
        bindtype: LogBindType,
        level: LogLevel,
        message: impl Into<String>,
        module: impl Into<String>,
        function: impl Into<String>,
    ) {
        let _guard = self.lock.lock().await;
        let path = self.file_path(task_id, bindtype);
        let mut entries = Self::read_file(&path);
        entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            module: module.into(),
            function: function.into(),
            message: message.into(),
            task_id: Some(task_id.to_string()),
            bindtype: Some(bindtype),
        });
        self.write_file(&path, entries);
    }

    /// Returns entries in chronological order; `limit` selects the newest
    /// `limit` matching entries (spec §4.5).
    pub async fn get_logs(
        &self,
        task_id: &str,
        bindtype: LogBindType,
        since: Option<DateTime<Utc>>,
        level_filter: Option<&[LogLevel]>,
        limit: Option<usize>,
    ) -> Vec<LogEntry> {
        let _guard = self.lock.lock().await;
        let path = self.file_path(task_id, bindtype);
        let mut entries: Vec<LogEntry> = Self::read_file(&path)
            .into_iter()
            .filter(|e| since.map(|s| e.timestamp >= s).unwrap_or(true))
            .filter(|e| {
                level_filter
                    .map(|levels| levels.iter().any(|l| l.as_str() == e.level.as_str()))
                    .unwrap_or(true)
            })
            .collect();
        if let Some(limit) = limit {
            if entries.len() > limit {
                let drop_count = entries.len() - limit;
                entries.drain(0..drop_count);
            }
        }
        entries
    }

    pub async fn remove_task_logs(&self, task_id: &str) {
        let _guard = self.lock.lock().await;
        for bindtype in [LogBindType::TaskLog, LogBindType::SystemLog] {
            let path = self.file_path(task_id, bindtype);
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn logs_cap_at_max_and_keep_newest() {
        let dir = TempDir::new().unwrap();
        let collector = LogCollector::new(dir.path().to_path_buf(), 5);
        for i in 0..12 {
            collector
                .add_log(
                    "t1",
                    LogBindType::TaskLog,
                    LogLevel::Info,
                    format!("line {i}"),
                    "runner",
                    "run_once",
                )
                .await;
        }
        let logs = collector
            .get_logs("t1", LogBindType::TaskLog, None, None, None)
            .await;
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[0].message, "line 7");
        assert_eq!(logs[4].message, "line 11");
    }

    #[tokio::test]
    async fn limit_selects_newest_matching_entries() {
        let dir = TempDir::new().unwrap();
        let collector = LogCollector::new(dir.path().to_path_buf(), 1000);
        for i in 0..10 {
            collector
                .add_log(
                    "t1",
                    LogBindType::TaskLog,
                    LogLevel::Info,
                    format!("line {i}"),
                    "runner",
                    "run_once",
                )
                .await;
        }
        let logs = collector
            .get_logs("t1", LogBindType::TaskLog, None, None, Some(3))
            .await;
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[2].message, "line 9");
    }

    #[tokio::test]
    async fn remove_task_logs_deletes_all_bindtypes() {
        let dir = TempDir::new().unwrap();
        let collector = LogCollector::new(dir.path().to_path_buf(), 1000);
        collector
            .add_log("t1", LogBindType::TaskLog, LogLevel::Info, "x", "r", "f")
            .await;
        collector.remove_task_logs("t1").await;
        let logs = collector
            .get_logs("t1", LogBindType::TaskLog, None, None, None)
            .await;
        assert!(logs.is_empty());
    }
}
