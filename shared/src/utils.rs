//! Small utilities shared by more than one orchestrator component: checksums,
//! validation, atomic file writes. Grounded on the teacher's `shared::utils`
//! (trimmed to what a document-store orchestrator actually needs).

use crate::OrchestratorError;
use base64::{engine::general_purpose::STANDARD as B64_STANDARD, Engine as _};
use blake3::Hasher;
use std::fs;
use std::path::Path;

/// BLAKE3 hex digest of a string. Used by the license gate to derive a keystream
/// from the license key (see [`crate::license`]).
pub fn calculate_string_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn calculate_file_checksum<P: AsRef<Path>>(file_path: P) -> crate::Result<String> {
    let content = fs::read(file_path)?;
    let mut hasher = Hasher::new();
    hasher.update(&content);
    Ok(hasher.finalize().to_hex().to_string())
}

/// Account IDs must be non-empty, <=64 chars, and alphanumeric/hyphen/underscore
/// only. Mirrors the teacher's `validate_agent_id`.
pub fn validate_account_id(account_id: &str) -> crate::Result<()> {
    if account_id.is_empty() {
        return Err(OrchestratorError::Validation("account_id cannot be empty".to_string()).into());
    }
    if account_id.len() > 64 {
        return Err(OrchestratorError::Validation(
            "account_id cannot be longer than 64 characters".to_string(),
        )
        .into());
    }
    if !account_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(OrchestratorError::Validation(
            "account_id can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        )
        .into());
    }
    Ok(())
}

pub fn encode_base64(content: &[u8]) -> String {
    B64_STANDARD.encode(content)
}

pub fn decode_base64(encoded: &str) -> crate::Result<Vec<u8>> {
    B64_STANDARD
        .decode(encoded)
        .map_err(|e| OrchestratorError::Validation(format!("invalid base64 sequence: {e}")).into())
}

/// Prevents a `filename` path segment (e.g. `resources/images/{filename}`) from
/// escaping its parent directory.
pub fn sanitize_file_path(path: &str) -> crate::Result<String> {
    if path.contains("..") || path.starts_with('/') || path.contains('\\') {
        return Err(OrchestratorError::Validation(
            "invalid file path: directory traversal not allowed".to_string(),
        )
        .into());
    }
    Ok(path.to_string())
}

pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}

/// Write `contents` to `path` atomically: write to a sibling temp file, then
/// rename over the destination. Used by every durable-document store (C2, C3, C4)
/// so a crash never leaves a half-written document on disk.
pub fn atomic_write(path: &Path, contents: &[u8]) -> crate::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn account_id_rejects_bad_characters() {
        assert!(validate_account_id("abc-123_ok").is_ok());
        assert!(validate_account_id("").is_err());
        assert!(validate_account_id("has space").is_err());
        assert!(validate_account_id(&"x".repeat(65)).is_err());
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize_file_path("../etc/passwd").is_err());
        assert!(sanitize_file_path("/etc/passwd").is_err());
        assert!(sanitize_file_path("image.png").is_ok());
    }

    #[test]
    fn atomic_write_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn base64_round_trips() {
        let encoded = encode_base64(b"hello");
        assert_eq!(decode_base64(&encoded).unwrap(), b"hello");
    }
}
