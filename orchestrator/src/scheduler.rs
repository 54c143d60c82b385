//! Scheduler (C9): the single global execution loop.
//!
//! Grounded on `task_dispatcher.py`'s `TaskDispatcher` main loop. The source
//! keeps a single `asyncio.Lock` that every execution path acquires before
//! touching a task's runner; we translate that one-lock-for-everything shape into
//! a `tokio::sync::Mutex<()>` held for the duration of `run_once`, exactly the
//! way `server/src/scheduler.rs` held its own per-probe execution lock in the
//! teacher. Task bookkeeping (`DispatcherStore`) sits behind its own `RwLock`
//! so API reads (`GET /tasks`) never block on an in-flight run.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shared::clock::{in_window, next_window_start};
use shared::model::{TaskCreationSpec, TaskInfo, TaskStatus, TaskType};
use shared::utils::validate_account_id;
use shared::OrchestratorError;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{interval_at, Duration, Instant};
use tracing::{info, warn};

use crate::dispatcher_store::DispatcherStore;
use crate::task_runner::TaskRunner;

/// Computes the next run time for a task that has already run once, stepping
/// from `from` (normally `last_execution_time`) by `interval_seconds` (spec
/// §4.9 rule 2). If the stepped candidate has already lapsed (`<= now`, e.g.
/// the process was down past several intervals), it falls back to "next due
/// slot from now" the same way rule 1 does, and if even that still lands in
/// the past it steps one interval forward from now. The result is always
/// snapped into the valid-time-range window.
pub fn compute_next_execution_time(task: &TaskInfo, from: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let iv = ChronoDuration::seconds(task.interval_seconds as i64);
    let mut base = from + iv;
    if base <= now {
        base = rule1_next_execution_time(now, task.valid_time_range);
        if base <= now {
            base = now + iv;
        }
    }
    rule1_next_execution_time(base, task.valid_time_range)
}

/// Rule 1 (spec §4.9): a task with no execution history yet runs as soon as
/// possible, snapped into its valid-time-range window if it has one. Shared by
/// `add_task`, `resume_task` and `update_task` (cadence edits on a
/// never-yet-run task).
fn rule1_next_execution_time(base: DateTime<Utc>, valid_time_range: Option<(u8, u8)>) -> DateTime<Utc> {
    if in_window(base, valid_time_range) {
        base
    } else {
        next_window_start(base, valid_time_range)
    }
}

/// Content-field edits accepted by `update_task`; kept as a small struct rather
/// than five positional `Option<String>` parameters.
#[derive(Debug, Default)]
pub struct ContentEdits {
    pub user_query: Option<String>,
    pub user_topic: Option<String>,
    pub user_style: Option<String>,
    pub user_target_audience: Option<String>,
}

/// What the scheduler reports about its current run, for `GET /api/v1/dispatcher/status`.
#[derive(Debug, Clone)]
pub struct DispatcherStatus {
    pub running: bool,
    pub current_task_id: Option<String>,
    pub pending_count: usize,
    pub paused_count: usize,
    pub loop_enabled: bool,
}

pub struct Scheduler {
    store: RwLock<DispatcherStore>,
    runner: Arc<TaskRunner>,
    execution_lock: Mutex<()>,
    current_task_id: RwLock<Option<String>>,
    max_sleep_secs: u64,
    wake: Notify,
    stopped: RwLock<bool>,
    /// Toggled by `POST /api/v1/dispatcher/start|stop`; distinct from `stopped`,
    /// which tears the loop task down entirely at process shutdown.
    loop_enabled: RwLock<bool>,
}

impl Scheduler {
    pub fn new(store: DispatcherStore, runner: Arc<TaskRunner>, max_sleep_secs: u64) -> Self {
        Scheduler {
            store: RwLock::new(store),
            runner,
            execution_lock: Mutex::new(()),
            current_task_id: RwLock::new(None),
            max_sleep_secs: max_sleep_secs.max(1),
            wake: Notify::new(),
            stopped: RwLock::new(false),
            loop_enabled: RwLock::new(true),
        }
    }

    pub async fn start_loop(&self) {
        *self.loop_enabled.write().await = true;
        self.wake.notify_one();
    }

    pub async fn stop_loop(&self) {
        *self.loop_enabled.write().await = false;
    }

    /// Registers a new task after the usual creation-time checks: `(task_type,
    /// account_id)` must be unique, `account_id` must pass `validate_account_id`,
    /// and `interval_seconds` must already have been clamped by the caller (the
    /// API layer consults the license gate's interval bounds before this call;
    /// the scheduler itself does not re-check the license).
    pub async fn add_task(&self, spec: TaskCreationSpec) -> shared::Result<TaskInfo> {
        validate_account_id(&spec.xhs_account_id)?;
        let task_type = spec.task_type.unwrap_or(TaskType::Xhs);

        let mut store = self.store.write().await;
        if store.find_by_account(task_type, &spec.xhs_account_id).is_some() {
            return Err(OrchestratorError::Conflict(format!(
                "a {} task already exists for account '{}'",
                task_type.as_str(),
                spec.xhs_account_id
            ))
            .into());
        }

        let now = Utc::now();
        let task_end_time = spec
            .task_end_time
            .unwrap_or_else(|| (now + ChronoDuration::days(365)).date_naive());
        let interval_seconds = spec.interval.unwrap_or(900);
        let valid_time_range = spec.valid_time_range;
        let mode = spec.mode.unwrap_or_default();
        let interaction_note_count = spec.interaction_note_count.unwrap_or(3);

        let task_id = format!("{}_{}", task_type.as_str(), spec.xhs_account_id);
        let next_execution_time = rule1_next_execution_time(now, valid_time_range);

        let task = TaskInfo {
            task_id: task_id.clone(),
            account_id: spec.xhs_account_id.clone(),
            account_name: spec.xhs_account_name.clone(),
            task_type,
            status: TaskStatus::Pending,
            interval_seconds,
            valid_time_range,
            task_end_time,
            mode,
            interaction_note_count,
            last_execution_time: None,
            next_execution_time: Some(next_execution_time),
            created_at: now,
            updated_at: now,
            login_status: None,
            login_status_checked_at: None,
            sys_type: spec.sys_type.clone(),
            kwargs: spec,
            paused: false,
        };

        store.insert(task.clone());
        store.persist()?;
        drop(store);
        self.wake.notify_one();
        info!(task_id = %task_id, "task created");
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TaskInfo> {
        self.store.read().await.get(task_id).cloned()
    }

    pub async fn list_tasks(&self) -> Vec<TaskInfo> {
        self.store.read().await.list().cloned().collect()
    }

    /// Pausing takes a task out of the queue entirely: `next_execution_time` is
    /// cleared so a paused task never shows up as "due" (spec §4.9).
    pub async fn pause_task(&self, task_id: &str) -> shared::Result<()> {
        let mut store = self.store.write().await;
        let task = store
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
        let now = Utc::now();
        task.paused = true;
        task.update_status(TaskStatus::Paused, now);
        task.update_next_execution_time(None, now);
        store.persist()
    }

    /// Resuming re-enters the task into the queue as if it had just been
    /// created: `next_execution_time` is recomputed via rule 1 (next due slot
    /// from now, snapped into the window), not resumed from wherever it was
    /// paused.
    pub async fn resume_task(&self, task_id: &str) -> shared::Result<()> {
        let mut store = self.store.write().await;
        let task = store
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
        let now = Utc::now();
        let next = rule1_next_execution_time(now, task.valid_time_range);
        task.paused = false;
        task.update_status(TaskStatus::Pending, now);
        task.update_next_execution_time(Some(next), now);
        store.persist()?;
        drop(store);
        self.wake.notify_one();
        Ok(())
    }

    /// Shifts a task's `next_execution_time` by `offset_seconds` from its
    /// current value (spec §4.9's "reorder" operation: jump the queue by an
    /// offset, snapped back into the window, never bypassing it). Only valid
    /// for a task that is currently waiting its turn: a `Running`, `Paused` or
    /// `Completed` task is refused, as is an offset that would push the task
    /// past its `task_end_time`.
    pub async fn reorder_task(&self, task_id: &str, offset_seconds: i64) -> shared::Result<()> {
        let mut store = self.store.write().await;
        let task = store
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;

        if matches!(
            task.status,
            TaskStatus::Running | TaskStatus::Paused | TaskStatus::Completed
        ) {
            return Err(OrchestratorError::Conflict(format!(
                "task '{task_id}' cannot be reordered while {:?}",
                task.status
            ))
            .into());
        }

        let now = Utc::now();
        let base = task.next_execution_time.unwrap_or(now) + ChronoDuration::seconds(offset_seconds);
        if base.date_naive() >= task.task_end_time {
            return Err(OrchestratorError::Conflict(
                "reorder would push the task past its task_end_time".to_string(),
            )
            .into());
        }
        let next = rule1_next_execution_time(base, task.valid_time_range);
        task.update_next_execution_time(Some(next), now);
        store.persist()?;
        drop(store);
        self.wake.notify_one();
        Ok(())
    }

    /// Property edits (spec §4.9 "Property edits"). Content fields live on
    /// `task.kwargs`, since that's the struct the runner reads to do its work;
    /// cadence/lifecycle fields live directly on `TaskInfo`. A cadence change
    /// recomputes `next_execution_time` unless `task_end_time` has already
    /// passed, in which case the task is retired to `completed`.
    pub async fn update_task(
        &self,
        task_id: &str,
        interval_seconds: Option<u32>,
        valid_time_range: Option<Option<(u8, u8)>>,
        task_end_time: Option<chrono::NaiveDate>,
        mode: Option<shared::model::TaskMode>,
        interaction_note_count: Option<u8>,
        content: ContentEdits,
    ) -> shared::Result<TaskInfo> {
        let mut store = self.store.write().await;
        let task = store
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;

        let mut cadence_changed = false;
        if let Some(v) = interval_seconds {
            task.interval_seconds = v;
            cadence_changed = true;
        }
        if let Some(v) = valid_time_range {
            task.valid_time_range = v;
            cadence_changed = true;
        }
        if let Some(v) = task_end_time {
            task.task_end_time = v;
            cadence_changed = true;
        }
        if let Some(v) = mode {
            task.mode = v;
        }
        if let Some(v) = interaction_note_count {
            task.interaction_note_count = v;
        }
        if let Some(v) = content.user_query {
            task.kwargs.user_query = Some(v);
        }
        if let Some(v) = content.user_topic {
            task.kwargs.user_topic = Some(v);
        }
        if let Some(v) = content.user_style {
            task.kwargs.user_style = Some(v);
        }
        if let Some(v) = content.user_target_audience {
            task.kwargs.user_target_audience = Some(v);
        }

        let now = Utc::now();
        if cadence_changed && task.status != TaskStatus::Completed {
            if now.date_naive() >= task.task_end_time {
                task.update_status(TaskStatus::Completed, now);
                task.next_execution_time = None;
            } else {
                let next = match task.last_execution_time {
                    // Rule 1: never run yet, treat like a freshly created task.
                    None => rule1_next_execution_time(now, task.valid_time_range),
                    // Rule 2: has run before, step from the last run under the new cadence.
                    Some(last) => compute_next_execution_time(task, last, now),
                };
                task.update_next_execution_time(Some(next), now);
            }
        } else {
            task.updated_at = now;
        }

        let result = task.clone();
        store.persist()?;
        Ok(result)
    }

    pub async fn remove_task(&self, task_id: &str) -> shared::Result<()> {
        let mut store = self.store.write().await;
        store
            .remove(task_id)
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
        store.persist()
    }

    /// Runs a task immediately, outside its regular schedule, bypassing the
    /// time-window check (spec §4.9: "execute now" ignores the window but still
    /// respects the single-global-execution-mutex and the paused flag). Blocks
    /// until the run completes. A run already in flight (anywhere, not just for
    /// this task) or a task that has already reached `completed` fails fast with
    /// `Conflict` instead of queueing behind the mutex.
    pub async fn execute_task_immediately(&self, task_id: &str) -> shared::Result<()> {
        if self.current_task_id.read().await.is_some() {
            return Err(OrchestratorError::Conflict(
                "another task is already executing".to_string(),
            )
            .into());
        }

        let mut task = self
            .store
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(task_id.to_string()))?;
        if task.status == TaskStatus::Completed {
            return Err(OrchestratorError::Conflict(format!(
                "task '{task_id}' has already completed"
            ))
            .into());
        }

        let _permit = self.execution_lock.lock().await;
        *self.current_task_id.write().await = Some(task_id.to_string());
        self.run_and_record(&mut task, true).await;
        *self.current_task_id.write().await = None;
        Ok(())
    }

    pub async fn status(&self) -> DispatcherStatus {
        let store = self.store.read().await;
        let pending_count = store
            .list()
            .filter(|t| t.status == TaskStatus::Pending && !t.paused)
            .count();
        let paused_count = store.list().filter(|t| t.paused).count();
        DispatcherStatus {
            running: self.current_task_id.read().await.is_some(),
            current_task_id: self.current_task_id.read().await.clone(),
            pending_count,
            paused_count,
            loop_enabled: *self.loop_enabled.read().await,
        }
    }

    pub async fn stop(&self) {
        *self.stopped.write().await = true;
        self.wake.notify_one();
    }

    /// The main loop (spec §4.9): collect ready tasks, run the earliest-due one
    /// under the global execution lock, persist, and sleep until the next
    /// candidate or `max_sleep_secs`, whichever is sooner. Early-wakes on
    /// `add_task`/`resume_task`/`reorder_task`/`stop` via `self.wake`.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval_at(Instant::now(), Duration::from_secs(1));
        loop {
            if *self.stopped.read().await {
                info!("scheduler loop stopping");
                return;
            }

            let ready = if *self.loop_enabled.read().await {
                self.pick_ready_task().await
            } else {
                None
            };
            if let Some(task_id) = ready {
                let _permit = self.execution_lock.lock().await;
                let mut task = match self.store.read().await.get(&task_id).cloned() {
                    Some(t) => t,
                    None => continue,
                };
                *self.current_task_id.write().await = Some(task_id.clone());
                self.run_and_record(&mut task, false).await;
                *self.current_task_id.write().await = None;
                continue;
            }

            let sleep_for = self.next_wake_delay().await;
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }
        }
    }

    /// Returns the id of the earliest-due ready task, if any, ordered by
    /// `(next_execution_time, created_at)` per spec §4.9's tie-break rule.
    async fn pick_ready_task(&self) -> Option<String> {
        let store = self.store.read().await;
        let now = Utc::now();
        let mut ready: Vec<&TaskInfo> = store
            .list()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && !t.paused
                    && t.next_execution_time.map(|n| n <= now).unwrap_or(false)
            })
            .collect();
        ready.sort_by(|a, b| {
            a.next_execution_time
                .cmp(&b.next_execution_time)
                .then(a.created_at.cmp(&b.created_at))
        });
        ready.first().map(|t| t.task_id.clone())
    }

    async fn next_wake_delay(&self) -> Duration {
        let store = self.store.read().await;
        let now = Utc::now();
        let earliest = store
            .list()
            .filter(|t| t.status == TaskStatus::Pending && !t.paused)
            .filter_map(|t| t.next_execution_time)
            .min();
        match earliest {
            Some(next) if next > now => {
                let secs = (next - now).num_seconds().max(0) as u64;
                Duration::from_secs(secs.min(self.max_sleep_secs))
            }
            _ => Duration::from_secs(self.max_sleep_secs),
        }
    }

    /// Runs one cycle and applies the resulting status transition + persistence.
    /// Shared by the main loop and `execute_task_immediately`.
    async fn run_and_record(&self, task: &mut TaskInfo, skip_window_check: bool) {
        let mut store = self.store.write().await;
        if let Some(stored) = store.get_mut(&task.task_id) {
            stored.update_status(TaskStatus::Running, Utc::now());
        }
        store.persist().ok();
        drop(store);

        let outcome = self.runner.run_once(task, skip_window_check).await;
        let now = Utc::now();

        let mut store = self.store.write().await;
        let Some(stored) = store.get_mut(&task.task_id) else {
            return;
        };
        stored.login_status = outcome.login_status;
        if outcome.login_status.is_some() {
            stored.login_status_checked_at = Some(now);
        }
        stored.update_execution_time(now);

        if !outcome.should_continue {
            stored.update_status(TaskStatus::Completed, now);
            stored.next_execution_time = None;
            info!(task_id = %task.task_id, "task reached its end date, marking completed");
        } else {
            let next = compute_next_execution_time(stored, now, now);
            stored.update_next_execution_time(Some(next), now);
            stored.update_status(TaskStatus::Pending, now);
        }

        if let Err(e) = store.persist() {
            warn!(task_id = %task.task_id, error = %e, "failed to persist dispatcher store after run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Timelike};
    use shared::config::SidecarConfig as SidecarCfg;
    use shared::model::{TaskCreationSpec as Spec, TaskMode};
    use tempfile::TempDir;

    fn spec(account_id: &str) -> Spec {
        Spec {
            sys_type: "mac_intel".to_string(),
            task_type: Some(TaskType::Xhs),
            xhs_account_id: account_id.to_string(),
            xhs_account_name: "acct".to_string(),
            user_query: None,
            user_topic: None,
            user_style: None,
            user_target_audience: None,
            task_end_time: Some(NaiveDate::from_ymd_opt(2099, 1, 1).unwrap()),
            interval: Some(900),
            valid_time_range: None,
            mode: Some(TaskMode::Standard),
            interaction_note_count: Some(3),
            extra: Default::default(),
        }
    }

    fn make_scheduler(dir: &TempDir) -> Scheduler {
        let runner = Arc::new(TaskRunner::new(
            Arc::new(crate::sidecar::SidecarManager::new(SidecarCfg {
                host: "127.0.0.1".to_string(),
                port: 1,
                ready_timeout_secs: 1,
                home_dir: dir.path().to_path_buf(),
                binaries: Default::default(),
            })),
            Arc::new(crate::log_collector::LogCollector::new(dir.path().join("logs"), 1000)),
            dir.path().join("accounts"),
            dir.path().join("task_context"),
            Box::new(|_| {
                struct NoopClient;
                #[async_trait::async_trait]
                impl crate::task_runner::SidecarClient for NoopClient {
                    async fn ensure_connected(&self) -> shared::Result<()> {
                        Err(OrchestratorError::SidecarUnavailable("noop".to_string()).into())
                    }
                    async fn check_login_status(&self) -> shared::Result<bool> {
                        Ok(false)
                    }
                    async fn run_mode(&self, _m: shared::model::TaskMode, _c: u8) -> shared::Result<()> {
                        Ok(())
                    }
                }
                Arc::new(NoopClient)
            }),
        ));
        Scheduler::new(DispatcherStore::new(dir.path().join("store.json")), runner, 5)
    }

    #[tokio::test]
    async fn add_task_rejects_duplicate_account() {
        let dir = TempDir::new().unwrap();
        let scheduler = make_scheduler(&dir);
        scheduler.add_task(spec("acct-dup")).await.unwrap();
        let second = scheduler.add_task(spec("acct-dup")).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn pause_then_resume_round_trip() {
        let dir = TempDir::new().unwrap();
        let scheduler = make_scheduler(&dir);
        let task = scheduler.add_task(spec("acct-pr")).await.unwrap();
        scheduler.pause_task(&task.task_id).await.unwrap();
        let paused = scheduler.get_task(&task.task_id).await.unwrap();
        assert!(paused.paused);
        assert_eq!(paused.next_execution_time, None);
        scheduler.resume_task(&task.task_id).await.unwrap();
        let resumed = scheduler.get_task(&task.task_id).await.unwrap();
        assert!(!resumed.paused);
        assert!(resumed.next_execution_time.is_some());
    }

    #[test]
    fn next_execution_time_snaps_into_window() {
        let now = chrono::Utc.with_ymd_and_hms(2026, 7, 31, 17, 0, 0).unwrap();
        let mut task = sample_task();
        task.valid_time_range = Some((9, 18));
        task.interval_seconds = 7200;
        let next = compute_next_execution_time(&task, now, now);
        // 17:00 + 2h = 19:00, outside [9,18), snaps to tomorrow 09:00.
        assert_eq!(next.time().hour(), 9);
    }

    fn sample_task() -> TaskInfo {
        let now = Utc::now();
        TaskInfo {
            task_id: "t".to_string(),
            account_id: "a".to_string(),
            account_name: "a".to_string(),
            task_type: TaskType::Xhs,
            status: TaskStatus::Pending,
            interval_seconds: 900,
            valid_time_range: None,
            task_end_time: NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
            mode: shared::model::TaskMode::Standard,
            interaction_note_count: 3,
            last_execution_time: None,
            next_execution_time: None,
            created_at: now,
            updated_at: now,
            login_status: None,
            login_status_checked_at: None,
            kwargs: spec("a"),
            sys_type: "mac_intel".to_string(),
            paused: false,
        }
    }
}
