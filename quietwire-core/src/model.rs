//! Shared record types: users, sessions, messages, device fingerprints.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Account lifecycle state. `Pending` accounts must set a first password
/// before anything else; `Deactivated` accounts cannot sign in at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Active,
    Deactivated,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Active => "active",
            UserStatus::Deactivated => "deactivated",
        }
    }
}

impl FromStr for UserStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UserStatus::Pending),
            "active" => Ok(UserStatus::Active),
            "deactivated" => Ok(UserStatus::Deactivated),
            other => Err(Error::InvalidInput(format!("Unknown user status '{}'", other))),
        }
    }
}

/// A user account as the credential store holds it.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// Argon2id PHC string. Never a plaintext, never reversible.
    pub password_hash: String,
    pub role: String,
    pub status: UserStatus,
    /// Base32 TOTP secret, present once the second factor is enabled.
    pub totp_secret: Option<String>,
    /// Candidate TOTP secret awaiting the enable confirmation code.
    pub totp_pending: Option<String>,
    /// Published X25519 public key, base64. The matching secret key
    /// never reaches the server.
    pub public_key: Option<String>,
    /// Fingerprint of the device seen at the last successful login.
    pub last_fingerprint: Option<DeviceFingerprint>,
    /// The single valid refresh token for this account, if any.
    pub refresh_token: Option<String>,
    pub created_at: i64,
}

/// One entry in the session registry: a device that holds (or held) a
/// refresh token for the account.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    pub device: String,
    pub ip: String,
    pub location: String,
    pub active: bool,
    pub created_at: i64,
    pub last_activity: i64,
}

/// A relayed message row. The payload is opaque to the relay: ciphertext
/// for direct messages, whatever the sender submitted for broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    /// Empty for broadcasts.
    pub recipient_id: Option<Uuid>,
    /// Empty for broadcasts.
    pub conversation_id: Option<String>,
    pub payload: String,
    pub is_broadcast: bool,
    /// Milliseconds since the epoch; finer than the second-level stamps
    /// elsewhere so ordering within a conversation is stable.
    pub created_at: i64,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
}

/// Deterministic conversation key for a user pair: both orderings
/// resolve to the same identity.
pub fn conversation_id(a: Uuid, b: Uuid) -> String {
    let (a, b) = (a.to_string(), b.to_string());
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// Coarse device fingerprint: enough to notice a new device, not enough
/// to track one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub ip: String,
    pub browser: String,
    pub os: String,
    pub device_class: String,
}

impl DeviceFingerprint {
    /// Derive a fingerprint from a client address and User-Agent string.
    /// Family-level only; versions are ignored so routine upgrades do not
    /// register as device changes.
    pub fn parse(ip: &str, user_agent: &str) -> Self {
        let browser = if user_agent.contains("Firefox") {
            "Firefox"
        } else if user_agent.contains("Edg") {
            "Edge"
        } else if user_agent.contains("OPR") || user_agent.contains("Opera") {
            "Opera"
        } else if user_agent.contains("Chrome") {
            "Chrome"
        } else if user_agent.contains("Safari") {
            "Safari"
        } else if user_agent.is_empty() {
            "Unknown"
        } else {
            "Other"
        };

        // Android UAs also contain "Linux", so check it first.
        let os = if user_agent.contains("Android") {
            "Android"
        } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
            "iOS"
        } else if user_agent.contains("Windows") {
            "Windows"
        } else if user_agent.contains("Mac OS X") || user_agent.contains("Macintosh") {
            "macOS"
        } else if user_agent.contains("Linux") {
            "Linux"
        } else {
            "Unknown"
        };

        let device_class = if user_agent.contains("iPad") || user_agent.contains("Tablet") {
            "tablet"
        } else if user_agent.contains("Mobi") {
            "mobile"
        } else if os == "Unknown" {
            "unknown"
        } else {
            "desktop"
        };

        DeviceFingerprint {
            ip: ip.to_string(),
            browser: browser.to_string(),
            os: os.to_string(),
            device_class: device_class.to_string(),
        }
    }

    /// Human-readable label for session listings and alerts.
    pub fn label(&self) -> String {
        format!("{} on {} ({})", self.browser, self.os, self.device_class)
    }

    /// A mismatch is flagged, never blocking. Device class is excluded:
    /// it is derived from the same UA fields as browser and os.
    pub fn matches(&self, other: &DeviceFingerprint) -> bool {
        self.ip == other.ip && self.browser == other.browser && self.os == other.os
    }
}
