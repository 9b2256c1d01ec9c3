//! Auth factor secrets: hashing and one-time codes

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::LedgerError;

type HmacSha256 = Hmac<Sha256>;

/// One-time codes are valid for one 30s step either side of now.
const CODE_STEP_SECS: i64 = 30;

/// Hash a password-equivalent secret (or biometric template) with Argon2id.
pub fn hash_secret(secret: &str) -> Result<String, LedgerError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| LedgerError::InvalidEnrollment(format!("hashing failed: {}", e)))
}

pub fn verify_secret(secret: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Generate a fresh shared secret for one-time codes (hex, 20 bytes).
pub fn generate_factor_secret() -> String {
    let mut bytes = [0u8; 20];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compute the 6-digit code for a secret at a given time step.
fn code_at(secret: &[u8], step: i64) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(&step.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    // Dynamic truncation as in RFC 4226
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let bin = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    Some(format!("{:06}", bin % 1_000_000))
}

/// Current code for a hex-encoded shared secret.
pub fn current_code(secret_hex: &str, now: i64) -> Option<String> {
    let secret = hex::decode(secret_hex).ok()?;
    code_at(&secret, now / CODE_STEP_SECS)
}

/// Verify a presented one-time code, accepting adjacent steps for clock skew.
pub fn verify_code(secret_hex: &str, code: &str, now: i64) -> bool {
    let secret = match hex::decode(secret_hex) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let step = now / CODE_STEP_SECS;
    for s in [step - 1, step, step + 1] {
        if code_at(&secret, s).as_deref() == Some(code) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_hashing() {
        let hash = hash_secret("hunter2_but_longer").unwrap();
        assert!(verify_secret("hunter2_but_longer", &hash));
        assert!(!verify_secret("wrong", &hash));
    }

    #[test]
    fn test_code_verification() {
        let secret = generate_factor_secret();
        let now = 1_700_000_000;
        let code = current_code(&secret, now).unwrap();
        assert_eq!(code.len(), 6);
        assert!(verify_code(&secret, &code, now));
        // Adjacent step still accepted
        assert!(verify_code(&secret, &code, now + CODE_STEP_SECS));
        // Far step rejected
        assert!(!verify_code(&secret, &code, now + 10 * CODE_STEP_SECS));
        assert!(!verify_code(&secret, "000000", now) || code == "000000");
    }
}
