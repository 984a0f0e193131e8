//! HTTP request handlers, grouped by surface.

pub mod admin;
pub mod auth;
pub mod messages;
pub mod sessions;

use quietwire_core::authz::{authorize, Permission};
use quietwire_core::Error as CoreError;

use crate::error::ApiError;
use crate::state::AppState;

/// Permission gate against the caller's role as stored right now, not
/// as it was when the token was minted.
pub(crate) fn require_permission(
    state: &AppState,
    role_name: &str,
    permission: Permission,
) -> Result<(), ApiError> {
    let role = state.store.role(role_name)?.ok_or(CoreError::Forbidden)?;
    authorize(&role, permission)?;
    Ok(())
}
