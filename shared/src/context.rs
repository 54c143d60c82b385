//! TaskContext store (C2): a per-task durable key-value document with an ordered
//! `step[]` log, atomically written on every mutation.
//!
//! Grounded on `app/manager/task_context.py`'s `Task_Manager_Context`: the meta
//! dict + `step` list shape, `create_new`'s refuse-to-overwrite behaviour, and the
//! dotted/`step.<n>.<key>` path syntax of `get`.

use crate::utils::atomic_write;
use crate::OrchestratorError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OnDisk {
    meta: Map<String, Value>,
    step_id: i64,
    task_id: String,
    saved_at: chrono::DateTime<Utc>,
}

/// Per-task context document. One instance is constructed per task and lives for
/// as long as the task is being scheduled or run; it is safe to reconstruct at any
/// time from disk (the scheduler does exactly this after a restart).
pub struct TaskContextStore {
    task_id: String,
    path: PathBuf,
    step_id: i64,
    meta: Map<String, Value>,
}

impl TaskContextStore {
    pub fn path_for(base_path: &Path) -> PathBuf {
        base_path.to_path_buf()
    }

    /// Create a fresh document seeded from `meta`. If a document already exists at
    /// `path` this refuses to overwrite it: it logs and loads the existing one
    /// instead (matching the source's `create_new_meta`).
    pub fn create_new(
        task_id: &str,
        path: PathBuf,
        meta: Map<String, Value>,
    ) -> crate::Result<Self> {
        if path.exists() {
            info!(%task_id, path = %path.display(), "task context already exists, loading instead of creating");
            return Self::load(task_id, path);
        }
        let store = TaskContextStore {
            task_id: task_id.to_string(),
            path,
            step_id: 1,
            meta,
        };
        store.persist()?;
        Ok(store)
    }

    pub fn load(task_id: &str, path: PathBuf) -> crate::Result<Self> {
        let bytes = std::fs::read(&path).map_err(|e| {
            OrchestratorError::Storage(format!(
                "failed to read task context {}: {e}",
                path.display()
            ))
        })?;
        let on_disk: OnDisk = serde_json::from_slice(&bytes).map_err(|e| {
            OrchestratorError::CorruptState(format!(
                "task context {} is not valid JSON: {e}",
                path.display()
            ))
        })?;
        let mut meta = on_disk.meta;
        if !meta.contains_key("step") {
            warn!(%task_id, "task context meta.step missing, initialising empty");
            meta.insert("step".to_string(), Value::Array(Vec::new()));
        }
        let step_list_len = meta
            .get("step")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let step_id = if on_disk.step_id == 0 && step_list_len > 0 {
            step_list_len as i64
        } else if on_disk.step_id == 0 {
            1
        } else {
            on_disk.step_id
        };
        Ok(TaskContextStore {
            task_id: task_id.to_string(),
            path,
            step_id,
            meta,
        })
    }

    fn persist(&self) -> crate::Result<()> {
        let mut meta = self.meta.clone();
        meta.insert(
            "last_updated".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        let on_disk = OnDisk {
            meta,
            step_id: self.step_id,
            task_id: self.task_id.clone(),
            saved_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&on_disk)?;
        atomic_write(&self.path, &bytes)
    }

    /// Save `data` into the step record identified by `step_id` (defaulting to the
    /// current step), creating it if absent. Always persists immediately.
    pub fn save(&mut self, data: Map<String, Value>, step_id: Option<i64>) -> crate::Result<()> {
        let step_id = step_id.unwrap_or(self.step_id);
        let steps = self
            .meta
            .entry("step")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| OrchestratorError::CorruptState("meta.step is not an array".into()))?;

        let now = Utc::now();
        if let Some(existing) = steps.iter_mut().find_map(|s| {
            let is_match = s.get("step_id").and_then(|v| v.as_i64()) == Some(step_id);
            is_match.then_some(s)
        }) {
            if let Value::Object(map) = existing {
                for (k, v) in data {
                    map.insert(k, v);
                }
                map.insert("updated_at".to_string(), Value::String(now.to_rfc3339()));
            }
        } else {
            let mut record = data;
            record.insert("step_id".to_string(), Value::from(step_id));
            record.insert("created_at".to_string(), Value::String(now.to_rfc3339()));
            record.insert("updated_at".to_string(), Value::String(now.to_rfc3339()));
            steps.push(Value::Object(record));
        }
        self.persist()
    }

    /// Update top-level meta fields; `None` values are skipped (matches the
    /// source's `update_meta(**kwargs)`, which only updates non-`None` args).
    pub fn update_meta(&mut self, fields: Map<String, Value>) -> crate::Result<Vec<String>> {
        let mut updated = Vec::new();
        for (k, v) in fields {
            if v.is_null() {
                continue;
            }
            self.meta.insert(k.clone(), v);
            updated.push(k);
        }
        if !updated.is_empty() {
            self.persist()?;
        }
        Ok(updated)
    }

    /// Dotted-path lookup, with the `step.<n>.<key>` special case.
    pub fn get(&self, key: &str, step_id: Option<i64>) -> Option<Value> {
        if let Some(rest) = key.strip_prefix("step.") {
            let mut parts = rest.splitn(2, '.');
            let (resolved_step_id, sub_key) = match parts.next().unwrap_or("").parse::<i64>() {
                Ok(n) => (n, parts.next()),
                Err(_) => (step_id.unwrap_or(self.step_id), Some(rest)),
            };
            let steps = self.meta.get("step")?.as_array()?;
            let step = steps
                .iter()
                .find(|s| s.get("step_id").and_then(|v| v.as_i64()) == Some(resolved_step_id))?;
            match sub_key {
                None | Some("") => Some(step.clone()),
                Some(sub) => get_nested(step, sub),
            }
        } else {
            get_nested(&Value::Object(self.meta.clone()), key)
        }
    }

    pub fn set_step_id(&mut self, step_id: i64) -> crate::Result<()> {
        self.step_id = step_id;
        self.persist()
    }

    pub fn next_step(&mut self) -> crate::Result<i64> {
        self.step_id += 1;
        self.persist()?;
        Ok(self.step_id)
    }

    pub fn step_id(&self) -> i64 {
        self.step_id
    }

    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }
}

fn get_nested(root: &Value, key: &str) -> Option<Value> {
    let mut current = root;
    for part in key.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta_with(pairs: &[(&str, Value)]) -> Map<String, Value> {
        let mut m = Map::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.clone());
        }
        m.insert("step".to_string(), Value::Array(Vec::new()));
        m
    }

    #[test]
    fn create_new_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mate_t1.json");
        let mut store =
            TaskContextStore::create_new("t1", path.clone(), meta_with(&[("a", Value::from(1))]))
                .unwrap();
        store
            .update_meta(Map::from_iter([("a".to_string(), Value::from(2))]))
            .unwrap();

        let reloaded =
            TaskContextStore::create_new("t1", path, meta_with(&[("a", Value::from(999))]))
                .unwrap();
        assert_eq!(reloaded.get("a", None), Some(Value::from(2)));
    }

    #[test]
    fn save_updates_existing_step_and_appends_new() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mate_t2.json");
        let mut store = TaskContextStore::create_new("t2", path, meta_with(&[])).unwrap();

        store
            .save(Map::from_iter([("x".to_string(), Value::from(1))]), Some(1))
            .unwrap();
        store
            .save(Map::from_iter([("x".to_string(), Value::from(2))]), Some(1))
            .unwrap();
        store
            .save(Map::from_iter([("x".to_string(), Value::from(3))]), Some(2))
            .unwrap();

        assert_eq!(store.get("step.1.x", None), Some(Value::from(2)));
        assert_eq!(store.get("step.2.x", None), Some(Value::from(3)));
    }

    #[test]
    fn next_step_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mate_t3.json");
        let mut store = TaskContextStore::create_new("t3", path.clone(), meta_with(&[])).unwrap();
        store.next_step().unwrap();
        store.next_step().unwrap();
        assert_eq!(store.step_id(), 3);

        let reloaded = TaskContextStore::load("t3", path).unwrap();
        assert_eq!(reloaded.step_id(), 3);
    }
}
