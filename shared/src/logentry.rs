//! The log entry type owned by the log collector (C5).
//!
//! Grounded on `app/utils/task_log_collector.py`'s `LogEntry` dataclass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

/// Which stream a log line belongs to. The source's `LogBindType`; the core only
/// ever reads `TaskLog` back out (spec §6: `logs` endpoint is `bindtype=task_log`
/// only) but the collector stores whatever bindtype the caller tags a line with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogBindType {
    TaskLog,
    SystemLog,
}

impl LogBindType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogBindType::TaskLog => "task_log",
            LogBindType::SystemLog => "system_log",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub module: String,
    pub function: String,
    pub message: String,
    pub task_id: Option<String>,
    pub bindtype: Option<LogBindType>,
}
