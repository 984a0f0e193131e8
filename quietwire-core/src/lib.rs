//! Quietwire core library
//!
//! Domain logic shared by the relay server and client tooling:
//! - Token service (HS256 access, refresh, and stage-scoped tokens)
//! - Login state machine (password, forced activation, second factor)
//! - TOTP second factor (RFC 6238)
//! - Password hashing and strength gating (Argon2id)
//! - Role and permission model
//! - End-to-end encryption contract (X25519 + XSalsa20-Poly1305)
//! - Security event taxonomy
//!
//! Everything here is pure domain logic: no HTTP, no database, no
//! sockets. The relay crate wires these pieces to the outside world.

pub mod authz;
pub mod e2ee;
pub mod event;
pub mod login;
pub mod model;
pub mod password;
pub mod token;
pub mod totp;

pub use authz::{authorize, Permission, Role};
pub use e2ee::KeyPair;
pub use event::SecurityEvent;
pub use login::{IssuedTokens, LoginOutcome};
pub use model::{conversation_id, DeviceFingerprint, SessionRecord, StoredMessage, User, UserStatus};
pub use token::{Claims, TokenScope, TokenService};

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error taxonomy for identity and relay operations.
///
/// Messages are deliberately flat: `InvalidCredentials` reads the same
/// for an unknown account and a wrong password, and no variant carries
/// internal detail a caller could probe.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Account is not active: {0}")]
    AccountNotActive(String),

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Token has been revoked")]
    RevokedToken,

    #[error("Token not valid for this endpoint")]
    WrongTokenScope,

    #[error("Invalid second-factor code")]
    InvalidSecondFactor,

    #[error("Forbidden")]
    Forbidden,

    #[error("Cannot terminate the current session; use logout instead")]
    CannotTerminateCurrentSession,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Connection is not authenticated")]
    ConnectionUnauthenticated,

    #[error("Password too weak: {0}")]
    WeakPassword(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
