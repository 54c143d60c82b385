//! License document (C4 data + encrypted storage).
//!
//! Grounded on `backend/app/core/license_manager.py`'s `LicenseConfig` dataclass
//! and `LicenseManager.load_config`/`save_config`. The HTTP activation call itself
//! lives in `orchestrator::license_gate` (this crate has no HTTP client); this
//! module owns the document shape, expiry/limit logic, and at-rest encryption.
//!
//! The source encrypts with a Fernet-style symmetric key from `app.utils.encryption`
//! (not part of the distilled corpus). We derive an XOF keystream from the license
//! key with BLAKE3's keyed-hash mode plus a BLAKE3 keyed MAC for integrity, since
//! BLAKE3 is already the workspace's cryptographic-hash dependency and this avoids
//! pulling in an AEAD crate the rest of the pack never reaches for.

use crate::utils::atomic_write;
use crate::OrchestratorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseDocument {
    pub product_id: u32,
    pub license_code: String,
    pub activated_at: DateTime<Utc>,
    pub config: LicenseDocumentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseDocumentConfig {
    pub task_num: Option<u32>,
    pub end_time: Option<DateTime<Utc>>,
    pub interval_limit: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LicenseDocument {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.config.end_time {
            Some(end) => now >= end,
            None => false,
        }
    }
}

const KEY_LEN: usize = 32;
const MAC_LEN: usize = 32;

/// Generate a fresh random 32-byte key, suitable for persisting to the license
/// key sibling file on first use.
pub fn generate_key() -> [u8; KEY_LEN] {
    use rand::RngCore;
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

fn keystream(key: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    blake3::Hasher::new_keyed(&expand_key(key))
        .finalize_xof()
        .fill(&mut out);
    out
}

fn expand_key(key: &[u8]) -> [u8; 32] {
    let hash = blake3::hash(key);
    *hash.as_bytes()
}

fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let keyed = blake3::keyed_hash(&expand_key(key), data);
    *keyed.as_bytes()
}

/// Encrypt `plaintext` for at-rest storage: `mac(32) || ciphertext`, where
/// ciphertext is plaintext XORed with a key-derived keystream.
fn encrypt(key: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let ks = keystream(key, plaintext.len());
    let ciphertext: Vec<u8> = plaintext.iter().zip(ks.iter()).map(|(p, k)| p ^ k).collect();
    let tag = mac(key, &ciphertext);
    let mut out = Vec::with_capacity(MAC_LEN + ciphertext.len());
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    out
}

fn decrypt(key: &[u8], blob: &[u8]) -> crate::Result<Vec<u8>> {
    if blob.len() < MAC_LEN {
        return Err(OrchestratorError::CorruptState("license blob truncated".into()).into());
    }
    let (tag, ciphertext) = blob.split_at(MAC_LEN);
    let expected = mac(key, ciphertext);
    if expected != tag {
        return Err(
            OrchestratorError::CorruptState("license blob failed integrity check".into()).into(),
        );
    }
    let ks = keystream(key, ciphertext.len());
    Ok(ciphertext.iter().zip(ks.iter()).map(|(c, k)| c ^ k).collect())
}

/// Read the key from `key_path`, generating and persisting one (mode 0600 on
/// unix) if it doesn't exist yet. `ORCHESTRATOR_LICENSE_KEY`, if set, takes
/// priority over the on-disk key entirely (a deployment operator injecting a
/// key via the environment rather than trusting the local filesystem).
pub fn load_or_create_key(key_path: &Path) -> crate::Result<Vec<u8>> {
    if let Ok(v) = std::env::var("ORCHESTRATOR_LICENSE_KEY") {
        return crate::utils::decode_base64(v.trim());
    }
    if key_path.exists() {
        let encoded = std::fs::read_to_string(key_path)?;
        return crate::utils::decode_base64(encoded.trim());
    }
    let key = generate_key();
    let encoded = crate::utils::encode_base64(&key);
    atomic_write(key_path, encoded.as_bytes())?;
    set_owner_only_permissions(key_path);
    Ok(key.to_vec())
}

pub fn save_encrypted(doc: &LicenseDocument, key: &[u8], path: &Path) -> crate::Result<()> {
    let plaintext = serde_json::to_vec(doc)?;
    let blob = encrypt(key, &plaintext);
    atomic_write(path, &blob)?;
    set_owner_only_permissions(path);
    Ok(())
}

pub fn load_encrypted(key: &[u8], path: &Path) -> crate::Result<LicenseDocument> {
    let blob = std::fs::read(path)?;
    let plaintext = decrypt(key, &blob)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| OrchestratorError::CorruptState(format!("license document: {e}")).into())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_doc(end_time: Option<DateTime<Utc>>) -> LicenseDocument {
        LicenseDocument {
            product_id: 1,
            license_code: "ABC-123".to_string(),
            activated_at: Utc::now(),
            config: LicenseDocumentConfig {
                task_num: Some(3),
                end_time,
                interval_limit: None,
                extra: Default::default(),
            },
        }
    }

    #[test]
    fn encrypted_round_trip() {
        let dir = TempDir::new().unwrap();
        let key = generate_key();
        let path = dir.path().join("license_config.encrypted");
        let doc = sample_doc(None);
        save_encrypted(&doc, &key, &path).unwrap();

        let loaded = load_encrypted(&key, &path).unwrap();
        assert_eq!(loaded.license_code, "ABC-123");
    }

    #[test]
    fn wrong_key_fails_integrity_check() {
        let dir = TempDir::new().unwrap();
        let key = generate_key();
        let other_key = generate_key();
        let path = dir.path().join("license_config.encrypted");
        save_encrypted(&sample_doc(None), &key, &path).unwrap();

        assert!(load_encrypted(&other_key, &path).is_err());
    }

    #[test]
    fn expiry_uses_utc_comparison() {
        let past = sample_doc(Some(Utc::now() - chrono::Duration::hours(1)));
        let future = sample_doc(Some(Utc::now() + chrono::Duration::hours(1)));
        assert!(past.is_expired(Utc::now()));
        assert!(!future.is_expired(Utc::now()));
    }

    #[test]
    fn key_is_generated_once_and_reused() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("license.key");
        let k1 = load_or_create_key(&key_path).unwrap();
        let k2 = load_or_create_key(&key_path).unwrap();
        assert_eq!(k1, k2);
    }
}
