//! Dispatcher store (C3): the durable registry of every `TaskInfo` plus the
//! account -> tasks index.
//!
//! Grounded on `task_dispatcher.py`'s `_save_state`/`_load_state`: one JSON
//! document, atomic on every write, `running` entries coerced back to `pending`
//! on load (the owning process died), and stale `next_execution_time` values
//! recomputed against the current window. A malformed entry is logged and
//! skipped rather than failing the whole load (spec §7: `CorruptState`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared::clock::{in_window, next_window_start};
use shared::model::{TaskInfo, TaskStatus};
use shared::utils::atomic_write;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct OnDiskDocument {
    version: u32,
    saved_at: chrono::DateTime<Utc>,
    tasks: Vec<serde_json::Value>,
    /// Persisted alongside `tasks` for on-disk schema fidelity; rebuilt from
    /// `tasks` on load rather than trusted, since it's fully derivable and a
    /// stale index would otherwise need its own corruption handling.
    #[serde(default)]
    account_tasks: HashMap<String, Vec<String>>,
}

/// In-memory registry backing the scheduler. Not thread-safe on its own: callers
/// hold it behind the scheduler's `RwLock`/`Mutex` (see `scheduler::Scheduler`).
pub struct DispatcherStore {
    path: PathBuf,
    tasks: HashMap<String, TaskInfo>,
    account_tasks: HashMap<String, Vec<String>>,
}

impl DispatcherStore {
    pub fn new(path: PathBuf) -> Self {
        DispatcherStore {
            path,
            tasks: HashMap::new(),
            account_tasks: HashMap::new(),
        }
    }

    /// Load from disk if present, applying the recovery rules above. A missing
    /// file is not an error: it means a fresh install.
    pub fn load(path: PathBuf) -> shared::Result<Self> {
        let mut store = DispatcherStore::new(path.clone());
        if !path.exists() {
            return Ok(store);
        }
        let bytes = std::fs::read(&path)?;
        let doc: OnDiskDocument = match serde_json::from_slice(&bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "dispatcher store unreadable, starting empty");
                return Ok(store);
            }
        };

        let now = Utc::now();
        for raw in doc.tasks {
            match serde_json::from_value::<TaskInfo>(raw.clone()) {
                Ok(mut task) => {
                    if task.status == TaskStatus::Running {
                        info!(task_id = %task.task_id, "recovering crashed task: running -> pending");
                        task.status = TaskStatus::Pending;
                    }
                    if let Some(next) = task.next_execution_time {
                        if next <= now && task.status == TaskStatus::Pending {
                            task.next_execution_time =
                                Some(recompute_next_execution_time(&task, now));
                        }
                    }
                    store.account_tasks
                        .entry(task.account_id.clone())
                        .or_default()
                        .push(task.task_id.clone());
                    store.tasks.insert(task.task_id.clone(), task);
                }
                Err(e) => {
                    warn!(error = %e, entry = %raw, "skipping corrupt task entry on load");
                }
            }
        }
        Ok(store)
    }

    pub fn persist(&self) -> shared::Result<()> {
        let mut tasks: Vec<&TaskInfo> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.task_id.clone());
        let serialised = tasks
            .iter()
            .map(|t| serde_json::to_value(t))
            .collect::<Result<Vec<_>, _>>()?;
        let doc = OnDiskDocument {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            tasks: serialised,
            account_tasks: self.account_tasks.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        atomic_write(&self.path, &bytes)?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskInfo> {
        self.tasks.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut TaskInfo> {
        self.tasks.get_mut(task_id)
    }

    pub fn find_by_account(&self, task_type: shared::model::TaskType, account_id: &str) -> Option<&TaskInfo> {
        self.account_tasks
            .get(account_id)?
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .find(|t| t.task_type == task_type)
    }

    pub fn insert(&mut self, task: TaskInfo) {
        self.account_tasks
            .entry(task.account_id.clone())
            .or_default()
            .push(task.task_id.clone());
        self.tasks.insert(task.task_id.clone(), task);
    }

    pub fn remove(&mut self, task_id: &str) -> Option<TaskInfo> {
        let task = self.tasks.remove(task_id)?;
        if let Some(ids) = self.account_tasks.get_mut(&task.account_id) {
            ids.retain(|id| id != task_id);
        }
        Some(task)
    }

    pub fn list(&self) -> impl Iterator<Item = &TaskInfo> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Recompute `next_execution_time` for a task whose stored value has lapsed
/// (spec §4.3: "every `next_execution_time` in the past is recomputed against the
/// current window"). Shares the window-snap logic with the scheduling rules in
/// `scheduler::compute_next_execution_time`, but starts from "now" rather than
/// from `last_execution_time + interval`, since the process was down in between.
pub fn recompute_next_execution_time(task: &TaskInfo, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    let base = if in_window(now, task.valid_time_range) {
        now
    } else {
        next_window_start(now, task.valid_time_range)
    };
    if in_window(base, task.valid_time_range) {
        base
    } else {
        next_window_start(base, task.valid_time_range)
    }
}

#[allow(dead_code)]
pub fn store_path_for(app_data_dir: &Path) -> PathBuf {
    app_data_dir.join("dispatcher").join("dispatch_config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use shared::model::{TaskCreationSpec, TaskMode, TaskType};
    use tempfile::TempDir;

    fn sample_task(id: &str, status: TaskStatus) -> TaskInfo {
        let now = Utc::now();
        TaskInfo {
            task_id: id.to_string(),
            account_id: format!("acct-{id}"),
            account_name: "acct".to_string(),
            task_type: TaskType::Xhs,
            status,
            interval_seconds: 900,
            valid_time_range: None,
            task_end_time: NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
            mode: TaskMode::Standard,
            interaction_note_count: 3,
            last_execution_time: None,
            next_execution_time: Some(now - chrono::Duration::hours(1)),
            created_at: now,
            updated_at: now,
            login_status: None,
            login_status_checked_at: None,
            kwargs: TaskCreationSpec {
                sys_type: "mac_intel".to_string(),
                task_type: Some(TaskType::Xhs),
                xhs_account_id: format!("acct-{id}"),
                xhs_account_name: "acct".to_string(),
                user_query: None,
                user_topic: None,
                user_style: None,
                user_target_audience: None,
                task_end_time: None,
                interval: Some(900),
                valid_time_range: None,
                mode: None,
                interaction_note_count: None,
                extra: Default::default(),
            },
            sys_type: "mac_intel".to_string(),
            paused: false,
        }
    }

    #[test]
    fn persists_and_reloads_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dispatch_config.json");
        let mut store = DispatcherStore::new(path.clone());
        store.insert(sample_task("t1", TaskStatus::Pending));
        store.persist().unwrap();

        let reloaded = DispatcherStore::load(path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("t1").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn running_status_coerced_to_pending_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dispatch_config.json");
        let mut store = DispatcherStore::new(path.clone());
        store.insert(sample_task("t2", TaskStatus::Running));
        store.persist().unwrap();

        let reloaded = DispatcherStore::load(path).unwrap();
        assert_eq!(reloaded.get("t2").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn stale_next_execution_time_recomputed_forward() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dispatch_config.json");
        let mut store = DispatcherStore::new(path.clone());
        store.insert(sample_task("t3", TaskStatus::Pending));
        store.persist().unwrap();

        let reloaded = DispatcherStore::load(path).unwrap();
        let next = reloaded.get("t3").unwrap().next_execution_time.unwrap();
        assert!(next > Utc::now() - chrono::Duration::seconds(5));
    }

    #[test]
    fn corrupt_entry_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dispatch_config.json");
        let doc = OnDiskDocument {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            tasks: vec![serde_json::json!({"not": "a task"})],
            account_tasks: HashMap::new(),
        };
        atomic_write(&path, &serde_json::to_vec(&doc).unwrap()).unwrap();

        let reloaded = DispatcherStore::load(path).unwrap();
        assert!(reloaded.is_empty());
    }
}
