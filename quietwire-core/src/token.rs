//! Bearer token service: HS256-signed access, refresh, and stage-scoped
//! tokens with jti-based revocation.
//!
//! Every token carries a scope naming the one endpoint class it is good
//! for, and a `jti` that the revocation set can blacklist until the
//! token would have expired on its own.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::User;
use crate::{Error, Result};

/// What a token is allowed to do. Stage tokens (`SetInitialPassword`,
/// `TwoFactor`) are accepted by exactly one endpoint each and by nothing
/// else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    Access,
    Refresh,
    SetInitialPassword,
    TwoFactor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: Uuid,
    /// Role name at issue time. Refreshing re-reads the current role.
    pub role: String,
    /// Unique token id; the key the revocation set stores.
    pub jti: String,
    pub scope: TokenScope,
    /// Session the token was minted for. Stage tokens carry none: no
    /// session exists until authentication completes.
    pub sid: Option<Uuid>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    /// Reject a token presented outside the endpoint class its scope
    /// names.
    pub fn require_scope(&self, expected: TokenScope) -> Result<()> {
        if self.scope == expected {
            Ok(())
        } else {
            Err(Error::WrongTokenScope)
        }
    }
}

/// The persistence pair for revoking a token: store the jti until the
/// token's own expiry, after which the entry is purgeable.
pub fn revocation_entry(claims: &Claims) -> (String, i64) {
    (claims.jti.clone(), claims.exp)
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl_secs: i64,
    scoped_ttl_secs: i64,
    refresh_ttl_secs: i64,
}

impl TokenService {
    pub fn new(
        secret: &[u8],
        access_ttl_secs: i64,
        scoped_ttl_secs: i64,
        refresh_ttl_secs: i64,
    ) -> Self {
        TokenService {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::default(),
            access_ttl_secs,
            scoped_ttl_secs,
            refresh_ttl_secs,
        }
    }

    /// Short-lived token accepted by every protected endpoint.
    pub fn issue_access(&self, user: &User, session_id: Uuid) -> Result<String> {
        self.issue(user, TokenScope::Access, Some(session_id), self.access_ttl_secs)
    }

    /// Long-lived token held in the HTTP-only cookie; only the refresh
    /// endpoint accepts it.
    pub fn issue_refresh(&self, user: &User, session_id: Uuid) -> Result<String> {
        self.issue(user, TokenScope::Refresh, Some(session_id), self.refresh_ttl_secs)
    }

    /// Stage token for the forced initial password change.
    pub fn issue_password_setup(&self, user: &User) -> Result<String> {
        self.issue(user, TokenScope::SetInitialPassword, None, self.scoped_ttl_secs)
    }

    /// Stage token for the pending second-factor check.
    pub fn issue_two_factor(&self, user: &User) -> Result<String> {
        self.issue(user, TokenScope::TwoFactor, None, self.scoped_ttl_secs)
    }

    fn issue(
        &self,
        user: &User,
        scope: TokenScope,
        sid: Option<Uuid>,
        ttl_secs: i64,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.id,
            role: user.role.clone(),
            jti: Uuid::new_v4().to_string(),
            scope,
            sid,
            iat: now,
            exp: now + ttl_secs,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| Error::InvalidToken)
    }

    /// Decode and check signature and expiry, then probe the revocation
    /// set. The set lives with the caller's storage; `is_revoked` is its
    /// membership test.
    pub fn validate(&self, token: &str, is_revoked: &dyn Fn(&str) -> bool) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|_| Error::InvalidToken)?;
        if is_revoked(&data.claims.jti) {
            return Err(Error::RevokedToken);
        }
        Ok(data.claims)
    }

    /// Exchange a validated refresh token for a new access token bound
    /// to the same session. The presented value must equal the single
    /// stored refresh token for the account; the refresh token itself is
    /// not rotated. Any failure reads as a generic invalid token.
    pub fn refresh_access(
        &self,
        claims: &Claims,
        presented: &str,
        stored: Option<&str>,
        user: &User,
    ) -> Result<String> {
        if claims.scope != TokenScope::Refresh {
            return Err(Error::InvalidToken);
        }
        if stored != Some(presented) {
            return Err(Error::InvalidToken);
        }
        let session_id = claims.sid.ok_or(Error::InvalidToken)?;
        self.issue_access(user, session_id)
    }
}
