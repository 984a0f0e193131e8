//! Security event taxonomy.
//!
//! The core names the events and their severities; recording, timestamps
//! and enrichment (actor, source address) live with the relay's audit
//! sink.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Security-relevant events emitted on the identity and relay paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityEvent {
    LoginSucceeded,
    LoginFailed,
    LoginRejectedInactive,
    TwoFactorFailed,
    TwoFactorEnabled,
    PasswordChanged,
    PasswordResetRequested,
    PasswordResetCompleted,
    DeviceFingerprintChanged { previous: String, current: String },
    SessionTerminated { session_id: Uuid },
    SessionsTerminatedBulk { count: usize },
    TokenRevoked,
    BroadcastSent { message_id: Uuid },
    UserCreated { user_id: Uuid },
    UserDeactivated { user_id: Uuid },
    RoleChanged { user_id: Uuid, role: String },
    ConnectionRejected,
}

impl SecurityEvent {
    /// Stable identifier for log lines and the audit table.
    pub fn name(&self) -> &'static str {
        match self {
            SecurityEvent::LoginSucceeded => "login_succeeded",
            SecurityEvent::LoginFailed => "login_failed",
            SecurityEvent::LoginRejectedInactive => "login_rejected_inactive",
            SecurityEvent::TwoFactorFailed => "two_factor_failed",
            SecurityEvent::TwoFactorEnabled => "two_factor_enabled",
            SecurityEvent::PasswordChanged => "password_changed",
            SecurityEvent::PasswordResetRequested => "password_reset_requested",
            SecurityEvent::PasswordResetCompleted => "password_reset_completed",
            SecurityEvent::DeviceFingerprintChanged { .. } => "device_fingerprint_changed",
            SecurityEvent::SessionTerminated { .. } => "session_terminated",
            SecurityEvent::SessionsTerminatedBulk { .. } => "sessions_terminated_bulk",
            SecurityEvent::TokenRevoked => "token_revoked",
            SecurityEvent::BroadcastSent { .. } => "broadcast_sent",
            SecurityEvent::UserCreated { .. } => "user_created",
            SecurityEvent::UserDeactivated { .. } => "user_deactivated",
            SecurityEvent::RoleChanged { .. } => "role_changed",
            SecurityEvent::ConnectionRejected => "connection_rejected",
        }
    }

    /// 0 through 5; 4 and up is worth an operator's attention.
    pub fn severity(&self) -> u8 {
        match self {
            SecurityEvent::LoginSucceeded => 1,
            SecurityEvent::LoginFailed => 3,
            SecurityEvent::LoginRejectedInactive => 3,
            SecurityEvent::TwoFactorFailed => 4,
            SecurityEvent::TwoFactorEnabled => 1,
            SecurityEvent::PasswordChanged => 2,
            SecurityEvent::PasswordResetRequested => 2,
            SecurityEvent::PasswordResetCompleted => 3,
            SecurityEvent::DeviceFingerprintChanged { .. } => 4,
            SecurityEvent::SessionTerminated { .. } => 2,
            SecurityEvent::SessionsTerminatedBulk { .. } => 3,
            SecurityEvent::TokenRevoked => 2,
            SecurityEvent::BroadcastSent { .. } => 2,
            SecurityEvent::UserCreated { .. } => 2,
            SecurityEvent::UserDeactivated { .. } => 4,
            SecurityEvent::RoleChanged { .. } => 4,
            SecurityEvent::ConnectionRejected => 3,
        }
    }
}
