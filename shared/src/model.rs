//! The task data model: `TaskInfo`, its status/mode enums, and the creation payload.
//!
//! Grounded on `backend/app/manager/task_info.py` (the `TaskInfo` dataclass and
//! `TaskStatus` enum) and `backend/app/manager/task_manager.py`'s constructor, which
//! is where `TaskInfo`'s optional fields and their defaults come from.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One of the supported task flavours. Currently a single variant; kept as a tagged
/// enum because the source treats it as an open set (`task_type` is validated against
/// "the sole supported variant" rather than hardcoded as a boolean).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Xhs,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Xhs => "xhs_type",
        }
    }
}

/// Lifecycle state of a task. At most one task system-wide may be `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Error,
}

/// Which run-phases the task runner performs on a given execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Standard,
    Interaction,
    Publish,
}

impl Default for TaskMode {
    fn default() -> Self {
        TaskMode::Standard
    }
}

/// `[start_hour, end_hour]`, `0 <= start < end <= 23`. `None` means unrestricted.
pub type ValidTimeRange = Option<(u8, u8)>;

/// The creation payload accepted by `POST /api/v1/tasks`.
///
/// The source treats this as a free-form `kwargs` dict; per the design notes we
/// type the known fields and keep an `extra` escape hatch for anything else the
/// caller sends (round-tripped verbatim, never interpreted by the core).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreationSpec {
    pub sys_type: String,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    pub xhs_account_id: String,
    pub xhs_account_name: String,
    #[serde(default)]
    pub user_query: Option<String>,
    #[serde(default)]
    pub user_topic: Option<String>,
    #[serde(default)]
    pub user_style: Option<String>,
    #[serde(default)]
    pub user_target_audience: Option<String>,
    #[serde(default)]
    pub task_end_time: Option<NaiveDate>,
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub valid_time_range: Option<(u8, u8)>,
    #[serde(default)]
    pub mode: Option<TaskMode>,
    #[serde(default)]
    pub interaction_note_count: Option<u8>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The durable, in-memory record the scheduler operates on.
///
/// One per `(task_type, account_id)` pair. Mutated only by the Scheduler (status,
/// timing), by the API (content/cadence edits, pause/resume/reorder) and by the
/// runner (`login_status`). See crate-level docs for the full invariant list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub account_id: String,
    pub account_name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,

    pub interval_seconds: u32,
    pub valid_time_range: ValidTimeRange,
    pub task_end_time: NaiveDate,
    pub mode: TaskMode,
    pub interaction_note_count: u8,

    pub last_execution_time: Option<DateTime<Utc>>,
    pub next_execution_time: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub login_status: Option<bool>,
    pub login_status_checked_at: Option<DateTime<Utc>>,

    /// The full creation payload, retained verbatim so the runner can be
    /// reconstructed from `kwargs + sys_type` after a restart.
    pub kwargs: TaskCreationSpec,
    pub sys_type: String,

    /// Set by pause/resume; consulted by the runner at the top of `run_once` and by
    /// the scheduler when selecting ready tasks. Persisted so a restart remembers
    /// "the user pressed pause" (design notes: unify the two pause channels).
    #[serde(default)]
    pub paused: bool,
}

impl TaskInfo {
    pub fn update_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn update_execution_time(&mut self, at: DateTime<Utc>) {
        self.last_execution_time = Some(at);
        self.updated_at = at;
    }

    pub fn update_next_execution_time(&mut self, next: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.next_execution_time = next;
        self.updated_at = now;
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        today >= self.task_end_time
    }
}
