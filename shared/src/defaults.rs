//! Default values for configuration parameters, centralised the way the teacher's
//! `shared::defaults` does: one function per default, used by `serde(default = ...)`
//! on the configuration structs in [`crate::config`].

/// Default scheduler tick interval cap (spec §4.9: "never more than 60 s").
pub fn default_max_sleep_secs() -> u64 {
    60
}

/// Default minimum task execution interval accepted by the API in free mode
/// and as the API guard floor in activated mode (spec §4.10: `interval in [900, 10800]`).
pub fn default_interval_floor() -> u32 {
    900
}

pub fn default_interval_ceiling() -> u32 {
    10_800
}

/// API-guard absolute floor regardless of license state (spec §3: `interval_seconds >= 60`).
pub fn default_absolute_interval_floor() -> u32 {
    60
}

/// Free-mode task ceiling (license gate, spec §4.4).
pub fn default_free_max_tasks() -> u32 {
    1
}

/// Free-mode / expired-license fixed interval (spec §4.4: 2h).
pub fn default_free_interval_limit() -> u32 {
    7200
}

/// Default per-task-per-bindtype log retention (spec §4.5: N=1000, rolling).
pub fn default_max_logs_per_file() -> usize {
    1000
}

/// How long `stop()` waits for the loop to drain before giving up (spec §5: 30s).
pub fn default_graceful_shutdown_timeout_secs() -> u64 {
    30
}

/// Best-effort wait for an in-flight run before a `remove_task` purge (spec §4.9).
pub fn default_remove_task_wait_secs() -> u64 {
    1
}

/// Back-off after an unexpected (programmer) error in the scheduler loop (spec §7).
pub fn default_loop_error_backoff_secs() -> u64 {
    5
}

/// Sidecar readiness poll budget after a cold start (spec §4.6: "up to 3s").
pub fn default_sidecar_ready_timeout_secs() -> u64 {
    3
}

/// Upstream HTTP timeout the control plane should tolerate for `execute`
/// (spec §5: "30 min observed in practice").
pub fn default_execute_timeout_secs() -> u64 {
    1800
}

pub fn default_app_data_dir() -> String {
    "./data".to_string()
}

pub fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

pub fn default_license_verify_url() -> String {
    "https://license.internal.invalid/api/licenses/verify".to_string()
}

pub fn default_product_id() -> u32 {
    1
}

pub fn default_min_interaction_note_count() -> u8 {
    1
}

pub fn default_max_interaction_note_count() -> u8 {
    5
}
