//! The login state machine and the forgot-password side entry.
//!
//! `evaluate` is the single transition out of credential submission; the
//! stage functions close the forced-activation and second-factor stages.
//! Each reachable state is an explicit outcome variant, so a state the
//! machine does not name cannot be expressed, let alone skipped to.

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::{User, UserStatus};
use crate::password;
use crate::token::TokenService;
use crate::totp;
use crate::{Error, Result};

/// The access/refresh pair minted when authentication fully completes.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access: String,
    pub refresh: String,
}

/// Where a credential submission landed.
#[derive(Debug)]
pub enum LoginOutcome {
    /// Unknown account or wrong password; indistinguishable by design.
    Rejected,
    /// Deactivated account with correct credentials. Distinct message,
    /// no token of any kind.
    NotActive,
    /// First login: the account must replace its temporary password.
    /// The token reaches only the initial-password endpoint.
    PendingActivation { token: String },
    /// Password accepted, second factor outstanding. The token reaches
    /// only the second-factor verify endpoint.
    TwoFactorRequired { token: String },
    /// Fully signed in.
    Authenticated(IssuedTokens),
}

/// Evaluate a credential submission. The caller looks the account up and
/// passes whatever it found; the password check runs either way so the
/// missing-account path costs the same as the wrong-password path.
pub fn evaluate(
    user: Option<&User>,
    submitted_password: &str,
    session_id: Uuid,
    tokens: &TokenService,
) -> Result<LoginOutcome> {
    let Some(user) = user else {
        password::dummy_verify(submitted_password);
        return Ok(LoginOutcome::Rejected);
    };

    if !password::verify_password(submitted_password, &user.password_hash) {
        return Ok(LoginOutcome::Rejected);
    }

    match user.status {
        UserStatus::Deactivated => Ok(LoginOutcome::NotActive),
        UserStatus::Pending => Ok(LoginOutcome::PendingActivation {
            token: tokens.issue_password_setup(user)?,
        }),
        UserStatus::Active if user.totp_secret.is_some() => Ok(LoginOutcome::TwoFactorRequired {
            token: tokens.issue_two_factor(user)?,
        }),
        UserStatus::Active => Ok(LoginOutcome::Authenticated(issue_pair(
            user, session_id, tokens,
        )?)),
    }
}

/// Close the second-factor stage. The caller has already validated the
/// stage token and re-fetched the account.
pub fn complete_two_factor(
    user: &User,
    code: &str,
    skew_steps: u32,
    session_id: Uuid,
    tokens: &TokenService,
) -> Result<IssuedTokens> {
    match user.status {
        UserStatus::Deactivated => {
            return Err(Error::AccountNotActive("Account is deactivated".to_string()))
        }
        UserStatus::Pending => return Err(Error::InvalidToken),
        UserStatus::Active => {}
    }

    let Some(secret) = user.totp_secret.as_deref() else {
        // The stage token outlived a state it was minted against.
        return Err(Error::InvalidToken);
    };
    if !totp::verify(secret, code, Utc::now().timestamp(), skew_steps)? {
        return Err(Error::InvalidSecondFactor);
    }

    issue_pair(user, session_id, tokens)
}

/// Close the forced-activation stage: gate the chosen password, hash it,
/// and sign the user in. Returns the new hash for the caller to persist
/// alongside the `active` status flip.
pub fn activate_with_password(
    user: &User,
    new_password: &str,
    session_id: Uuid,
    tokens: &TokenService,
) -> Result<(String, IssuedTokens)> {
    match user.status {
        UserStatus::Deactivated => {
            return Err(Error::AccountNotActive("Account is deactivated".to_string()))
        }
        UserStatus::Active => return Err(Error::InvalidToken),
        UserStatus::Pending => {}
    }

    password::check_strength(new_password)?;
    let hash = password::hash_password(new_password)?;
    let issued = issue_pair(user, session_id, tokens)?;
    Ok((hash, issued))
}

fn issue_pair(user: &User, session_id: Uuid, tokens: &TokenService) -> Result<IssuedTokens> {
    Ok(IssuedTokens {
        access: tokens.issue_access(user, session_id)?,
        refresh: tokens.issue_refresh(user, session_id)?,
    })
}

/// Forgot-password side entry: single-use, time-limited reset tokens.
/// Only the SHA-256 digest of the raw token is ever stored; the raw
/// value leaves through the out-of-band delivery channel and nothing
/// else.
pub mod reset {
    use super::*;

    pub const TOKEN_TTL_SECS: i64 = 30 * 60;

    pub struct ResetToken {
        /// Delivered out of band. Never logged, never stored.
        pub raw: String,
        /// What the store keeps.
        pub digest: String,
        pub expires_at: i64,
    }

    pub fn issue() -> ResetToken {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw = hex::encode(bytes);
        ResetToken {
            digest: digest(&raw),
            raw,
            expires_at: Utc::now().timestamp() + TOKEN_TTL_SECS,
        }
    }

    pub fn digest(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }
}
