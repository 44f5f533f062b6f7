//! Credential encryption for stored Arr API keys.
//!
//! Mirrors the original's file-backed master key: a 256-bit key is generated
//! on first use and persisted beside the database with `0600` permissions.
//! Ciphertext is authenticated AES-256-GCM instead of Fernet, since this is
//! a fresh Rust implementation rather than a byte-for-byte port of the wire
//! format.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Loads the master key from `db_dir/seekarr.masterkey`, generating and
    /// persisting a new one (mode `0600`) if it doesn't exist yet.
    pub fn load_or_create(db_dir: &Path) -> Result<Self, StoreError> {
        let key_path = key_path(db_dir);
        let key_bytes = if key_path.exists() {
            let encoded = std::fs::read_to_string(&key_path)?;
            STANDARD
                .decode(encoded.trim())
                .ok()
                .filter(|b| b.len() == KEY_LEN)
                .unwrap_or_else(|| generate_key())
        } else {
            let key = generate_key();
            std::fs::write(&key_path, STANDARD.encode(&key))?;
            set_owner_only_permissions(&key_path);
            key
        };

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .expect("generated/loaded key is always 32 bytes");
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption does not fail for well-formed input");
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        STANDARD.encode(out)
    }

    /// Decrypts a token produced by [`encrypt`]. Returns `None` on any
    /// malformed or tampered input rather than raising, mirroring the
    /// original's `InvalidToken`/`ValueError` -> `None` behavior.
    pub fn decrypt(&self, token: &str) -> Option<String> {
        let raw = STANDARD.decode(token.trim()).ok()?;
        if raw.len() < NONCE_LEN {
            return None;
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self.cipher.decrypt(nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }
}

fn generate_key() -> Vec<u8> {
    let mut key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn key_path(db_dir: &Path) -> PathBuf {
    db_dir.join("seekarr.masterkey")
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = CredentialCipher::load_or_create(dir.path()).unwrap();
        let token = cipher.encrypt("super-secret-api-key");
        assert_eq!(cipher.decrypt(&token).as_deref(), Some("super-secret-api-key"));
    }

    #[test]
    fn reuses_persisted_key_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let first = CredentialCipher::load_or_create(dir.path()).unwrap();
        let token = first.encrypt("abc123");
        let second = CredentialCipher::load_or_create(dir.path()).unwrap();
        assert_eq!(second.decrypt(&token).as_deref(), Some("abc123"));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = CredentialCipher::load_or_create(dir.path()).unwrap();
        let mut token = cipher.encrypt("abc123").into_bytes();
        let last = token.len() - 1;
        token[last] ^= 0xFF;
        let tampered = String::from_utf8(token).unwrap();
        assert_eq!(cipher.decrypt(&tampered), None);
    }
}
