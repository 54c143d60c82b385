//! Task runner (C8): the scheduler's opaque callable.
//!
//! Grounded on `task_manager.py`'s `TaskManager.run_once`: probe the sidecar,
//! swap cookies in, check/cache login status, perform the mode-selected work, and
//! always run the cookie courier's close-task teardown — synchronously and
//! idempotently regardless of whether the work succeeded (design notes: make
//! teardown synchronous and idempotent, never swallow it into a cancellation).
//!
//! The scheduler only ever calls `run_once`; everything else here is the runner's
//! own business. Content generation, the poster renderer and the LLM client are
//! external collaborators (spec §1 Non-goals) represented here by the `SidecarClient`
//! trait boundary, which a production build would implement against the real
//! sidecar's HTTP surface.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use shared::context::TaskContextStore;
use shared::logentry::{LogBindType, LogLevel};
use shared::model::{TaskInfo, TaskMode};
use std::path::PathBuf;
use std::sync::Arc;

use crate::cookie_courier;
use crate::log_collector::LogCollector;
use crate::sidecar::SidecarManager;

/// What `run_once` reports back to the scheduler loop.
pub struct RunOutcome {
    /// `false` only when the local date has reached `task_end_time`; every other
    /// outcome (including action failures) is `true` (spec §4.8).
    pub should_continue: bool,
    /// Observed login verdict, if the runner managed to check it this cycle.
    pub login_status: Option<bool>,
}

/// The sidecar's business surface the runner delegates to. A production
/// implementation backs this with HTTP calls into the sidecar process; this
/// trait boundary is what spec §1 calls out as "external collaborators" (the
/// browser-automation protocol and content-generation prompts are non-goals).
#[async_trait]
pub trait SidecarClient: Send + Sync {
    async fn ensure_connected(&self) -> shared::Result<()>;
    async fn check_login_status(&self) -> shared::Result<bool>;
    async fn run_mode(&self, mode: TaskMode, interaction_note_count: u8) -> shared::Result<()>;
}

pub struct TaskRunner {
    sidecar: Arc<SidecarManager>,
    log_collector: Arc<LogCollector>,
    client_factory: Box<dyn Fn(&TaskInfo) -> Arc<dyn SidecarClient> + Send + Sync>,
    account_cookies_root: PathBuf,
    context_store_root: PathBuf,
}

impl TaskRunner {
    pub fn new(
        sidecar: Arc<SidecarManager>,
        log_collector: Arc<LogCollector>,
        account_cookies_root: PathBuf,
        context_store_root: PathBuf,
        client_factory: Box<dyn Fn(&TaskInfo) -> Arc<dyn SidecarClient> + Send + Sync>,
    ) -> Self {
        TaskRunner {
            sidecar,
            log_collector,
            client_factory,
            account_cookies_root,
            context_store_root,
        }
    }

    async fn log(&self, task_id: &str, level: LogLevel, message: impl Into<String>) {
        self.log_collector
            .add_log(task_id, LogBindType::TaskLog, level, message, "task_runner", "run_once")
            .await;
    }

    fn context_store_path(&self, task_id: &str) -> PathBuf {
        self.context_store_root.join(format!("mate_{task_id}.json"))
    }

    /// Opens (or creates) the task's context document for this run cycle and
    /// advances it to a fresh step. Best-effort: a context-store failure is
    /// logged and the run proceeds without one, the same way a cookie-courier
    /// or sidecar-probe failure doesn't abort the cycle.
    fn open_context(&self, task: &TaskInfo) -> Option<TaskContextStore> {
        let path = self.context_store_path(&task.task_id);
        let mut meta = Map::new();
        meta.insert("task_id".to_string(), Value::String(task.task_id.clone()));
        meta.insert("account_id".to_string(), Value::String(task.account_id.clone()));
        meta.insert("step".to_string(), Value::Array(Vec::new()));
        let mut store = match TaskContextStore::create_new(&task.task_id, path, meta) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "failed to open task context store");
                return None;
            }
        };
        if let Err(e) = store.next_step() {
            tracing::warn!(task_id = %task.task_id, error = %e, "failed to advance task context step");
        }
        Some(store)
    }

    fn record_step(store: &mut Option<TaskContextStore>, task_id: &str, fields: Map<String, Value>) {
        if let Some(store) = store {
            if let Err(e) = store.save(fields, None) {
                tracing::warn!(task_id, error = %e, "failed to persist task context step");
            }
        }
    }

    /// Performs one execution cycle. The scheduler has already checked `paused`
    /// and (unless `skip_window_check`) the time window before calling this; the
    /// runner re-checks `paused` at the top per spec §4.8, since the flag can flip
    /// between the scheduler's selection and the mutex acquisition.
    pub async fn run_once(&self, task: &mut TaskInfo, skip_window_check: bool) -> RunOutcome {
        let today = Utc::now().date_naive();
        if today >= task.task_end_time {
            return RunOutcome {
                should_continue: false,
                login_status: task.login_status,
            };
        }

        if task.paused {
            self.log(&task.task_id, LogLevel::Debug, "task paused, skipping run").await;
            return RunOutcome {
                should_continue: true,
                login_status: task.login_status,
            };
        }

        if !skip_window_check {
            if !shared::clock::in_window(Utc::now(), task.valid_time_range) {
                self.log(&task.task_id, LogLevel::Debug, "outside valid time range, skipping run")
                    .await;
                return RunOutcome {
                    should_continue: true,
                    login_status: task.login_status,
                };
            }
        }

        self.log(
            &task.task_id,
            LogLevel::Info,
            format!("task {} starting execution cycle", task.task_id),
        )
        .await;

        let mut context = self.open_context(task);
        Self::record_step(
            &mut context,
            &task.task_id,
            Map::from_iter([("phase".to_string(), Value::String("started".to_string()))]),
        );

        if let Err(e) = self.sidecar.ensure_running(&task.sys_type, true).await {
            self.log(&task.task_id, LogLevel::Error, format!("sidecar unavailable: {e}")).await;
            Self::record_step(
                &mut context,
                &task.task_id,
                Map::from_iter([
                    ("phase".to_string(), Value::String("sidecar_unavailable".to_string())),
                    ("error".to_string(), Value::String(e.to_string())),
                ]),
            );
            return RunOutcome {
                should_continue: true,
                login_status: task.login_status,
            };
        }

        let account_cookies_dir = self.account_cookies_root.join(&task.account_id);
        let _ = std::fs::create_dir_all(&account_cookies_dir);
        let source_cookie_file = account_cookies_dir.join("cookies.json");
        let sidecar_work_dir = self.sidecar.home_dir();

        if cookie_courier::dispatch(&source_cookie_file, &sidecar_work_dir).is_err() {
            self.log(
                &task.task_id,
                LogLevel::Warning,
                "no cookie reservation found for account, clearing sidecar cookies for fresh login",
            )
            .await;
            cookie_courier::clear(&sidecar_work_dir);
        }

        let client = (self.client_factory)(task);
        let mut login_status = task.login_status;
        if client.ensure_connected().await.is_ok() {
            match client.check_login_status().await {
                Ok(logged_in) => {
                    login_status = Some(logged_in);
                    self.log(
                        &task.task_id,
                        LogLevel::Info,
                        format!("login status check complete: logged_in={logged_in}"),
                    )
                    .await;
                    Self::record_step(
                        &mut context,
                        &task.task_id,
                        Map::from_iter([
                            ("phase".to_string(), Value::String("login_checked".to_string())),
                            ("logged_in".to_string(), Value::Bool(logged_in)),
                        ]),
                    );
                }
                Err(e) => {
                    self.log(&task.task_id, LogLevel::Warning, format!("login status check failed: {e}"))
                        .await;
                }
            }
        }

        let action_result = client.run_mode(task.mode, task.interaction_note_count).await;
        if let Err(e) = &action_result {
            self.log(&task.task_id, LogLevel::Warning, format!("runner action failed: {e}")).await;
        }
        Self::record_step(
            &mut context,
            &task.task_id,
            Map::from_iter([
                ("phase".to_string(), Value::String("action_complete".to_string())),
                ("ok".to_string(), Value::Bool(action_result.is_ok())),
            ]),
        );

        // Teardown is synchronous and idempotent regardless of the outcome above.
        cookie_courier::close_task(&account_cookies_dir, &sidecar_work_dir);

        self.log(
            &task.task_id,
            LogLevel::Info,
            format!("task {} execution cycle complete", task.task_id),
        )
        .await;

        RunOutcome {
            should_continue: true,
            login_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use shared::config::SidecarConfig;
    use shared::model::{TaskCreationSpec, TaskStatus, TaskType};
    use tempfile::TempDir;

    struct StubClient {
        logged_in: bool,
    }

    #[async_trait]
    impl SidecarClient for StubClient {
        async fn ensure_connected(&self) -> shared::Result<()> {
            Ok(())
        }
        async fn check_login_status(&self) -> shared::Result<bool> {
            Ok(self.logged_in)
        }
        async fn run_mode(&self, _mode: TaskMode, _count: u8) -> shared::Result<()> {
            Ok(())
        }
    }

    fn make_task(account_id: &str, end_in_future: bool) -> TaskInfo {
        let now = Utc::now();
        TaskInfo {
            task_id: "t1".to_string(),
            account_id: account_id.to_string(),
            account_name: "acct".to_string(),
            task_type: TaskType::Xhs,
            status: TaskStatus::Pending,
            interval_seconds: 900,
            valid_time_range: None,
            task_end_time: if end_in_future {
                NaiveDate::from_ymd_opt(2099, 1, 1).unwrap()
            } else {
                NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
            },
            mode: TaskMode::Standard,
            interaction_note_count: 3,
            last_execution_time: None,
            next_execution_time: None,
            created_at: now,
            updated_at: now,
            login_status: None,
            login_status_checked_at: None,
            kwargs: TaskCreationSpec {
                sys_type: "mac_intel".to_string(),
                task_type: Some(TaskType::Xhs),
                xhs_account_id: account_id.to_string(),
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

    #[tokio::test]
    async fn past_end_date_stops_scheduling() {
        let dir = TempDir::new().unwrap();
        let runner = TaskRunner::new(
            Arc::new(SidecarManager::new(SidecarConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ready_timeout_secs: 1,
                home_dir: dir.path().to_path_buf(),
                binaries: Default::default(),
            })),
            Arc::new(LogCollector::new(dir.path().join("logs"), 1000)),
            dir.path().join("accounts"),
            dir.path().join("task_context"),
            Box::new(|_| Arc::new(StubClient { logged_in: true })),
        );
        let mut task = make_task("acct-1", false);
        let outcome = runner.run_once(&mut task, true).await;
        assert!(!outcome.should_continue);
    }

    #[tokio::test]
    async fn paused_task_is_skipped_but_continues() {
        let dir = TempDir::new().unwrap();
        let runner = TaskRunner::new(
            Arc::new(SidecarManager::new(SidecarConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                ready_timeout_secs: 1,
                home_dir: dir.path().to_path_buf(),
                binaries: Default::default(),
            })),
            Arc::new(LogCollector::new(dir.path().join("logs"), 1000)),
            dir.path().join("accounts"),
            dir.path().join("task_context"),
            Box::new(|_| Arc::new(StubClient { logged_in: true })),
        );
        let mut task = make_task("acct-2", true);
        task.paused = true;
        let outcome = runner.run_once(&mut task, true).await;
        assert!(outcome.should_continue);
        assert_eq!(outcome.login_status, None);
    }
}
