//! Cookie courier (C7): swaps an account's cookie file into and out of the
//! sidecar's working directory around a run.
//!
//! Grounded on `task_manager.py`'s `_dispatch_cookies`/`_clear_cookies`/`_close_task`.

use shared::OrchestratorError;
use std::path::Path;
use tracing::{error, info, warn};

const COOKIE_FILE_NAME: &str = "cookies.json";

/// Copies `source_file` to `dest_dir/cookies.json`, preserving metadata. Validates
/// that `source_file` exists and is non-empty and `dest_dir` is a directory, then
/// verifies the copy landed and is non-empty.
pub fn dispatch(source_file: &Path, dest_dir: &Path) -> shared::Result<()> {
    if !source_file.is_file() {
        return Err(OrchestratorError::Validation(format!(
            "source cookies file does not exist: {}",
            source_file.display()
        ))
        .into());
    }
    if source_file.metadata()?.len() == 0 {
        return Err(OrchestratorError::Validation(format!(
            "source cookies file is empty: {}",
            source_file.display()
        ))
        .into());
    }
    if !dest_dir.is_dir() {
        return Err(OrchestratorError::Validation(format!(
            "destination is not a directory: {}",
            dest_dir.display()
        ))
        .into());
    }

    let target = dest_dir.join(COOKIE_FILE_NAME);
    std::fs::copy(source_file, &target)?;

    let size = target.metadata()?.len();
    if size == 0 {
        return Err(OrchestratorError::Storage(format!(
            "copied cookies file is empty: {}",
            target.display()
        ))
        .into());
    }
    info!(source = %source_file.display(), target = %target.display(), size, "cookies dispatched");
    Ok(())
}

/// Removes `dest_dir/cookies.json` if present. Returns `false` (not an error) if
/// there was nothing to remove.
pub fn clear(dest_dir: &Path) -> bool {
    let target = dest_dir.join(COOKIE_FILE_NAME);
    if !target.is_file() {
        warn!(path = %target.display(), "no cookie file to clear");
        return false;
    }
    match std::fs::remove_file(&target) {
        Ok(()) => {
            info!(path = %target.display(), "cookie file cleared");
            true
        }
        Err(e) => {
            error!(path = %target.display(), error = %e, "failed to clear cookie file");
            false
        }
    }
}

/// Copies `dest_dir/cookies.json` back to the account's private cookies
/// directory (creating it if absent), then deletes the sidecar-side copy.
/// Best-effort: every failure is logged, never raised (spec §4.7).
pub fn close_task(account_cookies_dir: &Path, dest_dir: &Path) {
    let sidecar_copy = dest_dir.join(COOKIE_FILE_NAME);
    if !sidecar_copy.is_file() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(account_cookies_dir) {
        error!(dir = %account_cookies_dir.display(), error = %e, "failed to create account cookies dir");
        return;
    }
    let account_copy = account_cookies_dir.join(COOKIE_FILE_NAME);
    if let Err(e) = std::fs::copy(&sidecar_copy, &account_copy) {
        error!(error = %e, "cookies reverse-copy failed");
        return;
    }
    info!(target = %account_copy.display(), "cookies copied back to account directory");

    if let Err(e) = std::fs::remove_file(&sidecar_copy) {
        warn!(path = %sidecar_copy.display(), error = %e, "failed to remove sidecar cookies copy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dispatch_and_close_task_round_trip() {
        let source_dir = TempDir::new().unwrap();
        let dest_dir = TempDir::new().unwrap();
        let account_dir = TempDir::new().unwrap();

        let source_file = source_dir.path().join("cookies.json");
        std::fs::write(&source_file, b"{\"session\":\"abc\"}").unwrap();

        dispatch(&source_file, dest_dir.path()).unwrap();
        assert!(dest_dir.path().join("cookies.json").is_file());

        close_task(account_dir.path(), dest_dir.path());
        assert!(account_dir.path().join("cookies.json").is_file());
        assert!(!dest_dir.path().join("cookies.json").exists());
    }

    #[test]
    fn dispatch_rejects_missing_source() {
        let dest_dir = TempDir::new().unwrap();
        let result = dispatch(Path::new("/nonexistent/cookies.json"), dest_dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn clear_is_a_noop_when_nothing_present() {
        let dest_dir = TempDir::new().unwrap();
        assert!(!clear(dest_dir.path()));
    }
}
