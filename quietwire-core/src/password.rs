//! Credential hashing, strength gating, and temporary password
//! generation.
//!
//! Hashes are Argon2id in PHC string form; parameters travel inside the
//! string, so they can be tuned later without invalidating old hashes.

use std::sync::OnceLock;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::{Error, Result};

/// Minimum length for any user-chosen password.
pub const MIN_PASSWORD_LEN: usize = 10;

/// Exact-match and substring deny list, checked case-insensitively.
const DENY_LIST: &[&str] = &[
    "password",
    "passw0rd",
    "qwerty",
    "letmein",
    "12345678",
    "87654321",
    "iloveyou",
    "admin123",
    "welcome1",
];

/// Temporary password alphabet. Ambiguous glyphs (0/O, 1/l/I) are
/// excluded because these are read out loud or retyped from a note.
const TEMP_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub fn hash_password(plain: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|_| Error::InvalidInput("Password hashing failed".to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC string. A malformed stored
/// hash verifies as false rather than erroring; callers fold every
/// failure into the same `InvalidCredentials`.
pub fn verify_password(plain: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok()
}

static DUMMY_HASH: OnceLock<String> = OnceLock::new();

/// Burn roughly the cost of a real verification when no account matched,
/// so the unknown-account path is not observably faster than the
/// wrong-password path.
pub fn dummy_verify(plain: &str) {
    let stored = DUMMY_HASH
        .get_or_init(|| hash_password("quietwire.dummy.verification").unwrap_or_default());
    let _ = verify_password(plain, stored);
}

/// Reject passwords below the acceptance bar: length, character-class
/// mix, and the deny list.
pub fn check_strength(candidate: &str) -> Result<()> {
    if candidate.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::WeakPassword(format!(
            "use at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let lowered = candidate.to_lowercase();
    if DENY_LIST.iter().any(|entry| lowered.contains(entry)) {
        return Err(Error::WeakPassword(
            "contains a commonly used password".to_string(),
        ));
    }

    let mut classes = 0;
    if candidate.chars().any(|c| c.is_ascii_lowercase()) {
        classes += 1;
    }
    if candidate.chars().any(|c| c.is_ascii_uppercase()) {
        classes += 1;
    }
    if candidate.chars().any(|c| c.is_ascii_digit()) {
        classes += 1;
    }
    if candidate.chars().any(|c| !c.is_ascii_alphanumeric()) {
        classes += 1;
    }
    if classes < 3 {
        return Err(Error::WeakPassword(
            "mix at least three of: lowercase, uppercase, digits, symbols".to_string(),
        ));
    }

    Ok(())
}

/// Estimated strength for client-side meters. Charset-times-length
/// entropy; honest enough for a gauge, not a guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrengthReport {
    /// 0 (very weak) through 4 (strong).
    pub score: u8,
    pub entropy_bits: f64,
    pub label: &'static str,
}

pub fn estimate_strength(candidate: &str) -> StrengthReport {
    let mut pool = 0usize;
    if candidate.chars().any(|c| c.is_ascii_lowercase()) {
        pool += 26;
    }
    if candidate.chars().any(|c| c.is_ascii_uppercase()) {
        pool += 26;
    }
    if candidate.chars().any(|c| c.is_ascii_digit()) {
        pool += 10;
    }
    if candidate.chars().any(|c| !c.is_ascii_alphanumeric()) {
        pool += 33;
    }

    let entropy_bits = if pool == 0 {
        0.0
    } else {
        candidate.chars().count() as f64 * (pool as f64).log2()
    };

    let (score, label) = match entropy_bits {
        bits if bits < 28.0 => (0, "very weak"),
        bits if bits < 36.0 => (1, "weak"),
        bits if bits < 60.0 => (2, "fair"),
        bits if bits < 80.0 => (3, "good"),
        _ => (4, "strong"),
    };

    StrengthReport {
        score,
        entropy_bits,
        label,
    }
}

/// Generate a temporary password for administrator-created accounts.
/// These are single-use by construction: the account stays `pending`
/// until the holder replaces it with a real password.
pub fn generate_temp_password(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length.max(12))
        .map(|_| *TEMP_ALPHABET.choose(&mut rng).unwrap() as char)
        .collect()
}
