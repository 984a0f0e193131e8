//! RFC 6238 time-based one-time codes for the login second factor.
//!
//! Fixed profile: HMAC-SHA1, 6 digits, 30-second period. That is what
//! every mainstream authenticator app provisions by default, and the
//! verify window tolerates one period of clock skew either side.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

pub const DIGITS: u32 = 6;
pub const PERIOD_SECS: u64 = 30;
const SECRET_BYTES: usize = 20;

/// Generate a fresh base32 secret for provisioning.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

fn decode_secret(secret_base32: &str) -> Result<Vec<u8>> {
    let normalized = secret_base32
        .trim()
        .trim_end_matches('=')
        .to_ascii_uppercase();
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| Error::InvalidInput("Invalid TOTP secret".to_string()))
}

/// The code a correctly provisioned authenticator shows at `timestamp`.
pub fn code_at(secret_base32: &str, timestamp: i64) -> Result<String> {
    let secret = decode_secret(secret_base32)?;
    hotp(&secret, (timestamp.max(0) as u64) / PERIOD_SECS)
}

fn hotp(secret: &[u8], counter: u64) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|_| Error::InvalidInput("Invalid TOTP secret".to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 section 5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    Ok(format!("{:06}", binary % 10u32.pow(DIGITS)))
}

/// Check a submitted code against the window `[now - skew, now + skew]`
/// periods. Anything that is not exactly six digits is rejected before
/// any computation.
pub fn verify(secret_base32: &str, submitted: &str, timestamp: i64, skew_steps: u32) -> Result<bool> {
    let submitted = submitted.trim();
    if submitted.len() != DIGITS as usize || !submitted.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }

    let secret = decode_secret(secret_base32)?;
    let counter = (timestamp.max(0) as u64) / PERIOD_SECS;
    let skew = skew_steps as u64;
    for candidate in counter.saturating_sub(skew)..=counter.saturating_add(skew) {
        if hotp(&secret, candidate)? == submitted {
            return Ok(true);
        }
    }
    Ok(false)
}

/// otpauth URI for provisioning QR codes.
pub fn provisioning_uri(secret_base32: &str, account: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        issuer, account, secret_base32, issuer, DIGITS, PERIOD_SECS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B test secret: ASCII "12345678901234567890".
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn matches_rfc_6238_vectors() {
        assert_eq!(code_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(code_at(RFC_SECRET, 1_111_111_109).unwrap(), "081804");
        assert_eq!(code_at(RFC_SECRET, 1_234_567_890).unwrap(), "005924");
        assert_eq!(code_at(RFC_SECRET, 2_000_000_000).unwrap(), "279037");
    }

    #[test]
    fn verify_accepts_current_code() {
        assert!(verify(RFC_SECRET, "287082", 59, 1).unwrap());
    }

    #[test]
    fn verify_accepts_one_period_of_skew() {
        // Code from t=59 (counter 1) submitted one period later.
        assert!(verify(RFC_SECRET, "287082", 89, 1).unwrap());
        // And one period early.
        assert!(verify(RFC_SECRET, "287082", 29, 1).unwrap());
    }

    #[test]
    fn verify_rejects_outside_the_window() {
        assert!(!verify(RFC_SECRET, "287082", 149, 1).unwrap());
    }

    #[test]
    fn verify_rejects_malformed_codes() {
        assert!(!verify(RFC_SECRET, "28708", 59, 1).unwrap());
        assert!(!verify(RFC_SECRET, "2870822", 59, 1).unwrap());
        assert!(!verify(RFC_SECRET, "28708a", 59, 1).unwrap());
        assert!(!verify(RFC_SECRET, "", 59, 1).unwrap());
    }

    #[test]
    fn verify_trims_whitespace() {
        assert!(verify(RFC_SECRET, " 287082 ", 59, 1).unwrap());
    }

    #[test]
    fn generated_secrets_decode() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 32);
        assert_eq!(decode_secret(&secret).unwrap().len(), SECRET_BYTES);
    }

    #[test]
    fn padded_and_lowercase_secrets_are_accepted() {
        let code = code_at(RFC_SECRET, 59).unwrap();
        assert_eq!(code_at(&RFC_SECRET.to_lowercase(), 59).unwrap(), code);
        assert_eq!(code_at(&format!("{}==", RFC_SECRET), 59).unwrap(), code);
    }

    #[test]
    fn garbage_secret_is_an_error() {
        assert!(code_at("not base32 at all!!", 59).is_err());
    }

    #[test]
    fn provisioning_uri_carries_the_profile() {
        let uri = provisioning_uri(RFC_SECRET, "user@example.com", "Quietwire");
        assert!(uri.starts_with("otpauth://totp/Quietwire:user@example.com?"));
        assert!(uri.contains("secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ"));
        assert!(uri.contains("digits=6"));
        assert!(uri.contains("period=30"));
    }
}
