//! Control-plane HTTP API (C10): a thin translator over the scheduler, license
//! gate and log collector.
//!
//! Grounded on `server/src/api.rs`'s router/handler/state shape: one `AppState`
//! struct cloned into every handler via axum's `State` extractor, one `ApiError`
//! enum owning the status-code mapping (`crate::error::ApiError`), handlers doing
//! "validate, delegate, translate" and nothing else.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use shared::config::AppConfig;
use shared::logentry::{LogBindType, LogLevel};
use shared::model::{TaskCreationSpec, TaskInfo, TaskMode, TaskStatus};
use shared::utils::sanitize_file_path;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::license_gate::LicenseGate;
use crate::log_collector::LogCollector;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub scheduler: Arc<Scheduler>,
    pub license_gate: Arc<LicenseGate>,
    pub log_collector: Arc<LogCollector>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/dispatcher/status", get(dispatcher_status))
        .route("/api/v1/dispatcher/start", post(dispatcher_start))
        .route("/api/v1/dispatcher/stop", post(dispatcher_stop))
        .route("/api/v1/tasks", post(create_task).get(list_tasks))
        .route(
            "/api/v1/tasks/{id}",
            get(get_task).delete(delete_task).patch(update_task),
        )
        .route("/api/v1/tasks/{id}/pause", post(pause_task))
        .route("/api/v1/tasks/{id}/resume", post(resume_task))
        .route("/api/v1/tasks/{id}/reorder", post(reorder_task))
        .route("/api/v1/tasks/{id}/execute", post(execute_task))
        .route("/api/v1/tasks/{id}/logs", get(task_logs))
        .route(
            "/api/v1/tasks/{id}/resources/source",
            get(get_source).put(put_source),
        )
        .route("/api/v1/tasks/{id}/resources/images", get(list_images))
        .route("/api/v1/tasks/{id}/resources/images/{filename}", get(get_image))
        .route(
            "/api/v1/tasks/{id}/resources/source/upload",
            post(upload_source),
        )
        .route(
            "/api/v1/tasks/{id}/resources/source/download",
            get(download_source),
        )
        .route("/api/v1/tasks/{id}/login/qrcode", get(login_qrcode))
        .route("/api/v1/tasks/{id}/login/status", get(login_status))
        .route("/api/v1/tasks/{id}/login/confirm", post(login_confirm))
        .route("/api/v1/license/status", get(license_status))
        .route("/api/v1/license/activate", post(license_activate))
        .with_state(state)
}

fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "data": data }))
}

async fn health() -> impl IntoResponse {
    ok(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn dispatcher_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.scheduler.status().await;
    ok(serde_json::json!({
        "running": status.running,
        "current_task_id": status.current_task_id,
        "pending_count": status.pending_count,
        "paused_count": status.paused_count,
        "loop_enabled": status.loop_enabled,
    }))
}

async fn dispatcher_start(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.start_loop().await;
    ok(serde_json::json!({ "started": true }))
}

async fn dispatcher_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.stop_loop().await;
    ok(serde_json::json!({ "stopped": true }))
}

fn validate_creation_spec(
    spec: &TaskCreationSpec,
    check_license_bounds: bool,
    interval_floor: u32,
    interval_ceiling: u32,
) -> Result<(), ApiError> {
    if let Some(interval) = spec.interval {
        let absolute_floor = shared::defaults::default_absolute_interval_floor();
        if interval < absolute_floor {
            return Err(ApiError::Validation(format!(
                "interval must be at least {absolute_floor} seconds"
            )));
        }
        if check_license_bounds && (interval < interval_floor || interval > interval_ceiling) {
            return Err(ApiError::Validation(format!(
                "interval must be between {interval_floor} and {interval_ceiling} seconds"
            )));
        }
    }
    if let Some((a, b)) = spec.valid_time_range {
        if a >= b || b > 23 {
            return Err(ApiError::Validation(
                "valid_time_range must satisfy 0 <= a < b <= 23".to_string(),
            ));
        }
    }
    if let Some(count) = spec.interaction_note_count {
        if !(1..=5).contains(&count) {
            return Err(ApiError::Validation(
                "interaction_note_count must be between 1 and 5".to_string(),
            ));
        }
    }
    if let Some(end) = spec.task_end_time {
        if end <= chrono::Utc::now().date_naive() {
            return Err(ApiError::Validation(
                "task_end_time must be in the future".to_string(),
            ));
        }
    }
    Ok(())
}

async fn create_task(
    State(state): State<AppState>,
    Json(mut spec): Json<TaskCreationSpec>,
) -> Result<impl IntoResponse, ApiError> {
    let license_active = state.license_gate.is_activated().await && !state.license_gate.is_expired().await;
    let (floor, ceiling) = state.license_gate.interval_bounds();
    validate_creation_spec(&spec, license_active, floor, ceiling)?;

    let current_count = state.scheduler.list_tasks().await.len() as u32;
    let max_tasks = state.license_gate.get_max_tasks().await;
    if current_count >= max_tasks {
        return Err(if state.license_gate.is_activated().await {
            ApiError::TaskLimitReached
        } else {
            ApiError::LicenseNotActivated
        });
    }

    // Free/expired mode coerces the interval to the fixed free-tier value
    // unconditionally, regardless of what the caller requested or what the
    // license-bound check above would have allowed.
    if !license_active {
        if let Some(limit) = state.license_gate.get_interval_limit().await {
            spec.interval = Some(limit);
        }
    }

    let task = state.scheduler.add_task(spec).await?;
    info!(task_id = %task.task_id, "task created via API");
    Ok((StatusCode::CREATED, ok(task)))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    account_id: Option<String>,
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let mut tasks = state.scheduler.list_tasks().await;
    if let Some(account_id) = &query.account_id {
        tasks.retain(|t| &t.account_id == account_id);
    }
    if let Some(status) = &query.status {
        tasks.retain(|t| status_matches(t.status, status));
    }
    tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(tasks.len());
    let page: Vec<TaskInfo> = tasks.into_iter().skip(offset).take(limit).collect();
    ok(page)
}

fn status_matches(status: TaskStatus, filter: &str) -> bool {
    match filter.to_ascii_lowercase().as_str() {
        "pending" => status == TaskStatus::Pending,
        "running" => status == TaskStatus::Running,
        "paused" => status == TaskStatus::Paused,
        "completed" => status == TaskStatus::Completed,
        "error" => status == TaskStatus::Error,
        _ => false,
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .scheduler
        .get_task(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("task '{id}' not found")))?;
    Ok(ok(task))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.remove_task(&id).await?;
    state.log_collector.remove_task_logs(&id).await;
    Ok(ok(serde_json::json!({ "removed": id })))
}

#[derive(Debug, Deserialize)]
struct UpdateTaskBody {
    user_query: Option<String>,
    user_topic: Option<String>,
    user_style: Option<String>,
    user_target_audience: Option<String>,
    interval: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_nullable_range")]
    valid_time_range: Option<Option<(u8, u8)>>,
    task_end_time: Option<NaiveDate>,
    mode: Option<TaskMode>,
    interaction_note_count: Option<u8>,
}

fn deserialize_nullable_range<'de, D>(
    deserializer: D,
) -> Result<Option<Option<(u8, u8)>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<(u8, u8)> = Option::deserialize(deserializer)?;
    Ok(Some(value))
}

async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTaskBody>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(count) = body.interaction_note_count {
        if !(1..=5).contains(&count) {
            return Err(ApiError::Validation(
                "interaction_note_count must be between 1 and 5".to_string(),
            ));
        }
    }
    if let Some(Some((a, b))) = body.valid_time_range {
        if a >= b || b > 23 {
            return Err(ApiError::Validation(
                "valid_time_range must satisfy 0 <= a < b <= 23".to_string(),
            ));
        }
    }

    let content = crate::scheduler::ContentEdits {
        user_query: body.user_query,
        user_topic: body.user_topic,
        user_style: body.user_style,
        user_target_audience: body.user_target_audience,
    };

    let task = state
        .scheduler
        .update_task(
            &id,
            body.interval,
            body.valid_time_range,
            body.task_end_time,
            body.mode,
            body.interaction_note_count,
            content,
        )
        .await?;
    Ok(ok(task))
}

async fn pause_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.pause_task(&id).await?;
    Ok(ok(serde_json::json!({ "paused": id })))
}

async fn resume_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.resume_task(&id).await?;
    Ok(ok(serde_json::json!({ "resumed": id })))
}

#[derive(Debug, Deserialize)]
struct ReorderBody {
    #[serde(default)]
    priority_offset: i64,
}

async fn reorder_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReorderBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.reorder_task(&id, body.priority_offset).await?;
    Ok(ok(serde_json::json!({ "reordered": id })))
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    #[allow(dead_code)]
    update_next_execution_time: bool,
}

async fn execute_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(_body): Json<ExecuteBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.license_gate.can_execute_immediately().await {
        return Err(ApiError::LicenseNotActivated);
    }
    state.scheduler.execute_task_immediately(&id).await?;
    Ok(ok(serde_json::json!({ "executed": id })))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    since: Option<chrono::DateTime<chrono::Utc>>,
    level: Option<String>,
    limit: Option<usize>,
}

async fn task_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let level_filter = query.level.as_deref().and_then(parse_level).map(|l| vec![l]);
    let logs = state
        .log_collector
        .get_logs(
            &id,
            LogBindType::TaskLog,
            query.since,
            level_filter.as_deref(),
            query.limit,
        )
        .await;
    ok(logs)
}

fn parse_level(s: &str) -> Option<LogLevel> {
    match s.to_ascii_uppercase().as_str() {
        "DEBUG" => Some(LogLevel::Debug),
        "INFO" => Some(LogLevel::Info),
        "WARNING" => Some(LogLevel::Warning),
        "ERROR" => Some(LogLevel::Error),
        "CRITICAL" => Some(LogLevel::Critical),
        _ => None,
    }
}

fn source_path(state: &AppState, account_id: &str) -> std::path::PathBuf {
    state.config.account_data_dir(account_id).join("sources").join("source.txt")
}

fn images_dir(state: &AppState, account_id: &str) -> std::path::PathBuf {
    state.config.account_data_dir(account_id).join("images")
}

async fn task_account_id(state: &AppState, task_id: &str) -> Result<String, ApiError> {
    state
        .scheduler
        .get_task(task_id)
        .await
        .map(|t| t.account_id)
        .ok_or_else(|| ApiError::NotFound(format!("task '{task_id}' not found")))
}

async fn get_source(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let account_id = task_account_id(&state, &id).await?;
    let path = source_path(&state, &account_id);
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    Ok(ok(serde_json::json!({ "content": content })))
}

#[derive(Debug, Deserialize)]
struct SourceBody {
    content: String,
}

async fn put_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SourceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = task_account_id(&state, &id).await?;
    let path = source_path(&state, &account_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ApiError::Internal(format!("failed to create resources dir: {e}")))?;
    }
    std::fs::write(&path, body.content)
        .map_err(|e| ApiError::Internal(format!("failed to write source file: {e}")))?;
    Ok(ok(serde_json::json!({ "saved": true })))
}

async fn upload_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = task_account_id(&state, &id).await?;
    let path = source_path(&state, &account_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ApiError::Internal(format!("failed to create resources dir: {e}")))?;
    }
    std::fs::write(&path, &body)
        .map_err(|e| ApiError::Internal(format!("failed to write source file: {e}")))?;
    Ok(ok(serde_json::json!({ "uploaded": true, "bytes": body.len() })))
}

async fn download_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let account_id = task_account_id(&state, &id).await?;
    let path = source_path(&state, &account_id);
    let bytes = std::fs::read(&path).map_err(|_| ApiError::NotFound("no source file uploaded yet".to_string()))?;
    Ok(bytes)
}

async fn list_images(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let account_id = task_account_id(&state, &id).await?;
    let dir = images_dir(&state, &account_id);
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(ok(names))
}

async fn get_image(
    State(state): State<AppState>,
    Path((id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let safe_name = sanitize_file_path(&filename).map_err(|_| ApiError::Validation("invalid filename".to_string()))?;
    let account_id = task_account_id(&state, &id).await?;
    let path = images_dir(&state, &account_id).join(safe_name);
    let bytes = std::fs::read(&path).map_err(|_| ApiError::NotFound(format!("image '{filename}' not found")))?;
    Ok(bytes)
}

async fn login_qrcode(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    task_account_id(&state, &id).await?;
    Ok(ok(serde_json::json!({
        "task_id": id,
        "qrcode_available": false,
        "message": "no sidecar login session in progress",
    })))
}

async fn login_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .scheduler
        .get_task(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("task '{id}' not found")))?;
    Ok(ok(serde_json::json!({
        "logged_in": task.login_status,
        "checked_at": task.login_status_checked_at,
    })))
}

async fn login_confirm(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    task_account_id(&state, &id).await?;
    Ok(ok(serde_json::json!({ "task_id": id, "confirmed": true })))
}

async fn license_status(State(state): State<AppState>) -> impl IntoResponse {
    ok(serde_json::json!({
        "activated": state.license_gate.is_activated().await,
        "expired": state.license_gate.is_expired().await,
        "max_tasks": state.license_gate.get_max_tasks().await,
        "interval_limit": state.license_gate.get_interval_limit().await,
        "can_execute_immediately": state.license_gate.can_execute_immediately().await,
    }))
}

#[derive(Debug, Deserialize)]
struct ActivateBody {
    license_code: String,
}

async fn license_activate(
    State(state): State<AppState>,
    Json(body): Json<ActivateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state
        .license_gate
        .activate(&body.license_code)
        .await
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    Ok(ok(config))
}
