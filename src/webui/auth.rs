//! Web UI password hashing and the Basic/header auth gate.
//!
//! The hash format (`pbkdf2_sha256$<iterations>$<salt>$<hash>`, all three
//! fields base64url without padding) is load-bearing: it has to stay
//! byte-compatible with hashes written by earlier versions, so don't change
//! the separator or encoding without a migration.

use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

const ALGO_TAG: &str = "pbkdf2_sha256";
const ITERATIONS: u32 = 200_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

fn b64_no_pad(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn b64_decode(text: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(text).ok()
}

/// Hashes a freshly chosen password into the stored `pbkdf2_sha256$...` form.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut derived = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, ITERATIONS, &mut derived);
    format!("{ALGO_TAG}${ITERATIONS}${}${}", b64_no_pad(&salt), b64_no_pad(&derived))
}

/// Verifies `password` against a stored hash, constant-time on the digest
/// comparison. Any malformed hash (wrong field count, bad base64, wrong
/// algorithm tag) is treated as a verification failure, never a panic.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let mut parts = password_hash.splitn(4, '$');
    let (Some(algo), Some(iterations_s), Some(salt_s), Some(hash_s)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if algo != ALGO_TAG {
        return false;
    }
    let Ok(iterations) = iterations_s.parse::<u32>() else {
        return false;
    };
    let Some(salt) = b64_decode(salt_s) else {
        return false;
    };
    let Some(expected) = b64_decode(hash_s) else {
        return false;
    };

    let mut got = vec![0u8; expected.len()];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut got);
    got.ct_eq(&expected).into()
}

/// Extracts a candidate Web UI password from either the standard HTTP Basic
/// `Authorization` header or the `X-Seekarr-Password` header. Basic auth's
/// username is ignored; only the password half is checked.
pub fn extract_password(authorization: Option<&str>, x_seekarr_password: Option<&str>) -> String {
    if let Some(auth) = authorization {
        if let Some(encoded) = auth.strip_prefix("Basic ") {
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(encoded) {
                if let Ok(decoded) = String::from_utf8(bytes) {
                    return decoded.split_once(':').map(|(_, pw)| pw.to_string()).unwrap_or_default();
                }
            }
            return String::new();
        }
    }
    x_seekarr_password.unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_round_trips() {
        let hash = hash_password("hunter2-but-longer");
        assert!(verify_password("hunter2-but-longer", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn verify_rejects_malformed_hash() {
        assert!(!verify_password("anything", "not-a-valid-hash"));
        assert!(!verify_password("anything", "pbkdf2_sha256$not-a-number$abc$def"));
        assert!(!verify_password("anything", "scrypt$1$abc$def"));
    }

    #[test]
    fn extract_password_prefers_basic_auth_over_custom_header() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("ignored:secret-pw");
        let header = format!("Basic {encoded}");
        assert_eq!(extract_password(Some(&header), Some("other")), "secret-pw");
    }

    #[test]
    fn extract_password_falls_back_to_custom_header() {
        assert_eq!(extract_password(None, Some("secret-pw")), "secret-pw");
        assert_eq!(extract_password(None, None), "");
    }
}
