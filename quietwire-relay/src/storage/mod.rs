//! SQLite persistence: users, sessions, messages, revocations, roles,
//! reset tokens, and the audit trail.
//!
//! All SQL lives here. Handlers speak in domain types and get
//! `ApiError` back; the connection is a single `Arc<Mutex<_>>` shared
//! across the process, which SQLite's own serialization is fine with at
//! this scale.

pub mod models;

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use quietwire_core::authz::{Permission, Role};
use quietwire_core::model::{DeviceFingerprint, SessionRecord, StoredMessage, User, UserStatus};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::ApiError;
use models::AuditRow;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> anyhow::Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("storage mutex poisoned"))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS roles (
                name TEXT PRIMARY KEY,
                permissions TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL DEFAULT '',
                role TEXT NOT NULL REFERENCES roles(name),
                status TEXT NOT NULL DEFAULT 'pending',
                totp_secret TEXT,
                totp_pending TEXT,
                public_key TEXT,
                last_ip TEXT,
                last_user_agent TEXT,
                refresh_token TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(user_id),
                refresh_token TEXT NOT NULL,
                device TEXT NOT NULL,
                ip TEXT NOT NULL,
                location TEXT NOT NULL DEFAULT 'unknown',
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                recipient_id TEXT,
                conversation_id TEXT,
                payload TEXT NOT NULL,
                is_broadcast INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                delivered_at INTEGER,
                read_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS broadcast_reads (
                message_id TEXT NOT NULL,
                reader_id TEXT NOT NULL,
                read_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, reader_id)
            );

            CREATE TABLE IF NOT EXISTS revoked_tokens (
                jti TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reset_tokens (
                digest TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                event TEXT NOT NULL,
                severity INTEGER NOT NULL,
                actor_id TEXT,
                ip TEXT,
                detail TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_recipient_unread
                ON messages(recipient_id, read_at);
            CREATE INDEX IF NOT EXISTS idx_sessions_user
                ON sessions(user_id, active);
            CREATE INDEX IF NOT EXISTS idx_revoked_expiry
                ON revoked_tokens(expires_at);
            CREATE INDEX IF NOT EXISTS idx_reset_expiry
                ON reset_tokens(expires_at);
            CREATE INDEX IF NOT EXISTS idx_audit_created
                ON audit_log(created_at);
            "#,
        )?;

        // Built-in roles exist from the first boot; custom roles are
        // added through the admin surface.
        for role in [Role::administrator(), Role::member()] {
            conn.execute(
                "INSERT OR IGNORE INTO roles (name, permissions) VALUES (?1, ?2)",
                params![role.name, permissions_to_string(&role)],
            )?;
        }

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.conn
            .lock()
            .map_err(|_| ApiError::Internal("Storage mutex poisoned".to_string()))
    }

    // ---- users ----

    pub fn create_user(&self, user: &User) -> Result<(), ApiError> {
        let conn = self.conn()?;
        let result = conn.execute(
            "INSERT INTO users (user_id, email, password_hash, role, status,
                                totp_secret, totp_pending, public_key,
                                last_ip, last_user_agent, refresh_token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                user.id.to_string(),
                user.email,
                user.password_hash,
                user.role,
                user.status.as_str(),
                user.totp_secret,
                user.totp_pending,
                user.public_key,
                Option::<String>::None,
                Option::<String>::None,
                user.refresh_token,
                user.created_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ApiError::Conflict("Email already registered".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn user_by_email(&self, email: &str) -> Result<Option<User>, ApiError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
                [email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn user_by_id(&self, id: Uuid) -> Result<Option<User>, ApiError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS),
                [id.to_string()],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users ORDER BY created_at ASC, email ASC",
            USER_COLUMNS
        ))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<rusqlite::Result<Vec<User>>>()?;
        Ok(users)
    }

    pub fn count_users(&self) -> Result<i64, ApiError> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn update_password(
        &self,
        user_id: Uuid,
        password_hash: &str,
        status: UserStatus,
    ) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET password_hash = ?2, status = ?3 WHERE user_id = ?1",
            params![user_id.to_string(), password_hash, status.as_str()],
        )?;
        Ok(())
    }

    /// Install or clear the single stored refresh token for the account.
    pub fn set_refresh_token(&self, user_id: Uuid, token: Option<&str>) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET refresh_token = ?2 WHERE user_id = ?1",
            params![user_id.to_string(), token],
        )?;
        Ok(())
    }

    pub fn set_totp_pending(&self, user_id: Uuid, secret: &str) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET totp_pending = ?2 WHERE user_id = ?1",
            params![user_id.to_string(), secret],
        )?;
        Ok(())
    }

    /// Promote the pending TOTP secret once its first code verified.
    /// Returns false when nothing was pending.
    pub fn enable_totp(&self, user_id: Uuid) -> Result<bool, ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET totp_secret = totp_pending, totp_pending = NULL
             WHERE user_id = ?1 AND totp_pending IS NOT NULL",
            [user_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_public_key(&self, user_id: Uuid, public_key: &str) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET public_key = ?2 WHERE user_id = ?1",
            params![user_id.to_string(), public_key],
        )?;
        Ok(())
    }

    pub fn set_last_fingerprint(
        &self,
        user_id: Uuid,
        ip: &str,
        user_agent: &str,
    ) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET last_ip = ?2, last_user_agent = ?3 WHERE user_id = ?1",
            params![user_id.to_string(), ip, user_agent],
        )?;
        Ok(())
    }

    pub fn set_status(&self, user_id: Uuid, status: UserStatus) -> Result<bool, ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET status = ?2 WHERE user_id = ?1",
            params![user_id.to_string(), status.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_role(&self, user_id: Uuid, role: &str) -> Result<bool, ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET role = ?2 WHERE user_id = ?1",
            params![user_id.to_string(), role],
        )?;
        Ok(changed > 0)
    }

    // ---- sessions ----

    pub fn create_session(&self, session: &SessionRecord) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (session_id, user_id, refresh_token, device, ip,
                                   location, active, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id.to_string(),
                session.user_id.to_string(),
                session.refresh_token,
                session.device,
                session.ip,
                session.location,
                session.active,
                session.created_at,
                session.last_activity,
            ],
        )?;
        Ok(())
    }

    pub fn sessions_for_user(&self, user_id: Uuid) -> Result<Vec<SessionRecord>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions
             WHERE user_id = ?1 AND active = 1
             ORDER BY created_at ASC, rowid ASC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([user_id.to_string()], session_from_row)?
            .collect::<rusqlite::Result<Vec<SessionRecord>>>()?;
        Ok(sessions)
    }

    pub fn session_by_id(&self, session_id: Uuid) -> Result<Option<SessionRecord>, ApiError> {
        let conn = self.conn()?;
        let session = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE session_id = ?1", SESSION_COLUMNS),
                [session_id.to_string()],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub fn terminate_session(&self, session_id: Uuid) -> Result<bool, ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET active = 0 WHERE session_id = ?1 AND active = 1",
            [session_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn terminate_sessions_for_user(&self, user_id: Uuid) -> Result<usize, ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET active = 0 WHERE user_id = ?1 AND active = 1",
            [user_id.to_string()],
        )?;
        Ok(changed)
    }

    /// Retire every active session except the one holding
    /// `current_refresh`.
    pub fn terminate_other_sessions(
        &self,
        user_id: Uuid,
        current_refresh: &str,
    ) -> Result<usize, ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET active = 0
             WHERE user_id = ?1 AND active = 1 AND refresh_token != ?2",
            params![user_id.to_string(), current_refresh],
        )?;
        Ok(changed)
    }

    pub fn touch_session(&self, session_id: Uuid) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET last_activity = ?2 WHERE session_id = ?1",
            params![session_id.to_string(), chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Drop terminated sessions whose last activity predates the cutoff.
    pub fn purge_stale_sessions(&self, cutoff: i64) -> Result<usize, ApiError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM sessions WHERE active = 0 AND last_activity < ?1",
            [cutoff],
        )?;
        Ok(removed)
    }

    // ---- messages ----

    pub fn insert_message(&self, message: &StoredMessage) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (message_id, sender_id, recipient_id, conversation_id,
                                   payload, is_broadcast, created_at, delivered_at, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.to_string(),
                message.sender_id.to_string(),
                message.recipient_id.map(|id| id.to_string()),
                message.conversation_id,
                message.payload,
                message.is_broadcast,
                message.created_at,
                message.delivered_at,
                message.read_at,
            ],
        )?;
        Ok(())
    }

    pub fn message_by_id(&self, message_id: Uuid) -> Result<Option<StoredMessage>, ApiError> {
        let conn = self.conn()?;
        let message = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE message_id = ?1", MESSAGE_COLUMNS),
                [message_id.to_string()],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Newest-last page of one conversation. `before` excludes rows at
    /// or after that timestamp; the extra fetched row only signals that
    /// older history remains.
    pub fn conversation_page(
        &self,
        conversation_id: &str,
        before: Option<i64>,
        limit: i64,
    ) -> Result<(Vec<StoredMessage>, bool), ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at < ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3",
            MESSAGE_COLUMNS
        ))?;
        let mut messages = stmt
            .query_map(params![conversation_id, before, limit + 1], message_from_row)?
            .collect::<rusqlite::Result<Vec<StoredMessage>>>()?;

        let has_more = messages.len() as i64 > limit;
        messages.truncate(limit.max(0) as usize);
        messages.reverse();
        Ok((messages, has_more))
    }

    pub fn broadcast_page(
        &self,
        before: Option<i64>,
        limit: i64,
    ) -> Result<(Vec<StoredMessage>, bool), ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE is_broadcast = 1 AND (?1 IS NULL OR created_at < ?1)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
            MESSAGE_COLUMNS
        ))?;
        let mut messages = stmt
            .query_map(params![before, limit + 1], message_from_row)?
            .collect::<rusqlite::Result<Vec<StoredMessage>>>()?;

        let has_more = messages.len() as i64 > limit;
        messages.truncate(limit.max(0) as usize);
        messages.reverse();
        Ok((messages, has_more))
    }

    /// First delivery ack wins; later acks read back the original stamp.
    /// Returns `(delivered_at, newly_set)`; `delivered_at` is `None`
    /// only when the message does not exist.
    pub fn mark_delivered(
        &self,
        message_id: Uuid,
        at: i64,
    ) -> Result<(Option<i64>, bool), ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE messages SET delivered_at = ?2
             WHERE message_id = ?1 AND delivered_at IS NULL AND is_broadcast = 0",
            params![message_id.to_string(), at],
        )?;
        let current: Option<Option<i64>> = conn
            .query_row(
                "SELECT delivered_at FROM messages WHERE message_id = ?1",
                [message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok((current.flatten(), changed > 0))
    }

    /// Same first-ack-wins contract for direct-message read stamps.
    pub fn mark_read_direct(
        &self,
        message_id: Uuid,
        at: i64,
    ) -> Result<(Option<i64>, bool), ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE messages SET read_at = ?2,
                    delivered_at = COALESCE(delivered_at, ?2)
             WHERE message_id = ?1 AND read_at IS NULL AND is_broadcast = 0",
            params![message_id.to_string(), at],
        )?;
        let current: Option<Option<i64>> = conn
            .query_row(
                "SELECT read_at FROM messages WHERE message_id = ?1",
                [message_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok((current.flatten(), changed > 0))
    }

    /// Broadcast reads accumulate one row per reader; repeats keep the
    /// first stamp.
    pub fn mark_read_broadcast(
        &self,
        message_id: Uuid,
        reader_id: Uuid,
        at: i64,
    ) -> Result<(i64, bool), ApiError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO broadcast_reads (message_id, reader_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![message_id.to_string(), reader_id.to_string(), at],
        )?;
        let stamp: i64 = conn.query_row(
            "SELECT read_at FROM broadcast_reads WHERE message_id = ?1 AND reader_id = ?2",
            params![message_id.to_string(), reader_id.to_string()],
            |row| row.get(0),
        )?;
        Ok((stamp, inserted > 0))
    }

    pub fn broadcast_readers(&self, message_id: Uuid) -> Result<Vec<(Uuid, i64)>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reader_id, read_at FROM broadcast_reads
             WHERE message_id = ?1 ORDER BY read_at ASC, reader_id ASC",
        )?;
        let rows = stmt.query_map([message_id.to_string()], |row| {
            let reader: String = row.get(0)?;
            let read_at: i64 = row.get(1)?;
            Ok((reader, read_at))
        })?;

        let mut readers = Vec::new();
        for row in rows {
            let (reader, read_at) = row?;
            readers.push((parse_uuid_value(&reader)?, read_at));
        }
        Ok(readers)
    }

    pub fn unread_direct_counts(&self, user_id: Uuid) -> Result<Vec<(String, i64)>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id, COUNT(*) FROM messages
             WHERE recipient_id = ?1 AND read_at IS NULL AND is_broadcast = 0
             GROUP BY conversation_id",
        )?;
        let counts = stmt
            .query_map([user_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<(String, i64)>>>()?;
        Ok(counts)
    }

    pub fn unread_broadcast_count(&self, user_id: Uuid) -> Result<i64, ApiError> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.is_broadcast = 1
               AND NOT EXISTS (SELECT 1 FROM broadcast_reads r
                               WHERE r.message_id = m.message_id AND r.reader_id = ?1)",
            [user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ---- token revocation ----

    pub fn revoke_token(&self, jti: &str, expires_at: i64) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO revoked_tokens (jti, expires_at) VALUES (?1, ?2)",
            params![jti, expires_at],
        )?;
        Ok(())
    }

    pub fn is_token_revoked(&self, jti: &str) -> Result<bool, ApiError> {
        let conn = self.conn()?;
        let revoked = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM revoked_tokens WHERE jti = ?1)",
            [jti],
            |row| row.get(0),
        )?;
        Ok(revoked)
    }

    /// Entries past the token's own expiry no longer gate anything.
    pub fn purge_expired_revocations(&self, now: i64) -> Result<usize, ApiError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM revoked_tokens WHERE expires_at < ?1", [now])?;
        Ok(removed)
    }

    // ---- roles ----

    pub fn upsert_role(&self, role: &Role) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO roles (name, permissions) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET permissions = excluded.permissions",
            params![role.name, permissions_to_string(role)],
        )?;
        Ok(())
    }

    pub fn role(&self, name: &str) -> Result<Option<Role>, ApiError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT permissions FROM roles WHERE name = ?1", [name], |row| {
                row.get(0)
            })
            .optional()?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(Role {
                name: name.to_string(),
                permissions: parse_permissions(&raw)?,
            })),
        }
    }

    pub fn list_roles(&self) -> Result<Vec<Role>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name, permissions FROM roles ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut roles = Vec::new();
        for row in rows {
            let (name, raw) = row?;
            roles.push(Role {
                name,
                permissions: parse_permissions(&raw)?,
            });
        }
        Ok(roles)
    }

    /// A role disappears only when nothing references it.
    pub fn delete_role(&self, name: &str) -> Result<(), ApiError> {
        let conn = self.conn()?;
        let referencing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role = ?1",
            [name],
            |row| row.get(0),
        )?;
        if referencing > 0 {
            return Err(ApiError::Conflict(format!(
                "Role '{}' is still assigned to {} user(s)",
                name, referencing
            )));
        }
        let removed = conn.execute("DELETE FROM roles WHERE name = ?1", [name])?;
        if removed == 0 {
            return Err(ApiError::NotFound(format!("Role '{}' does not exist", name)));
        }
        Ok(())
    }

    // ---- password reset tokens ----

    pub fn store_reset_token(
        &self,
        digest: &str,
        user_id: Uuid,
        expires_at: i64,
    ) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO reset_tokens (digest, user_id, expires_at, used, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                digest,
                user_id.to_string(),
                expires_at,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Atomically burn a reset token. Returns the owner only on the
    /// first use of an unexpired token.
    pub fn consume_reset_token(&self, digest: &str, now: i64) -> Result<Option<Uuid>, ApiError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE reset_tokens SET used = 1
             WHERE digest = ?1 AND used = 0 AND expires_at > ?2",
            params![digest, now],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let owner: String = conn.query_row(
            "SELECT user_id FROM reset_tokens WHERE digest = ?1",
            [digest],
            |row| row.get(0),
        )?;
        Ok(Some(parse_uuid_value(&owner)?))
    }

    pub fn purge_reset_tokens(&self, now: i64) -> Result<usize, ApiError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM reset_tokens WHERE expires_at < ?1 OR used = 1",
            [now],
        )?;
        Ok(removed)
    }

    // ---- audit trail ----

    #[allow(clippy::too_many_arguments)]
    pub fn append_audit(
        &self,
        created_at: i64,
        event: &str,
        severity: u8,
        actor_id: Option<Uuid>,
        ip: Option<&str>,
        detail: &str,
    ) -> Result<(), ApiError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (created_at, event, severity, actor_id, ip, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                created_at,
                event,
                severity,
                actor_id.map(|id| id.to_string()),
                ip,
                detail
            ],
        )?;
        Ok(())
    }

    /// Newest-first audit page, keyed by row id for stable paging.
    pub fn audit_page(
        &self,
        limit: i64,
        before_id: Option<i64>,
    ) -> Result<Vec<AuditRow>, ApiError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, event, severity, actor_id, ip, detail
             FROM audit_log
             WHERE (?1 IS NULL OR id < ?1)
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![before_id, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u8>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, created_at, event, severity, actor, ip, detail) = row?;
            let actor_id = match actor {
                Some(raw) => Some(parse_uuid_value(&raw)?),
                None => None,
            };
            entries.push(AuditRow {
                id,
                created_at,
                event,
                severity,
                actor_id,
                ip,
                detail,
            });
        }
        Ok(entries)
    }
}

const USER_COLUMNS: &str = "user_id, email, password_hash, role, status, totp_secret, \
                            totp_pending, public_key, last_ip, last_user_agent, \
                            refresh_token, created_at";

const SESSION_COLUMNS: &str = "session_id, user_id, refresh_token, device, ip, location, \
                               active, created_at, last_activity";

const MESSAGE_COLUMNS: &str = "message_id, sender_id, recipient_id, conversation_id, payload, \
                               is_broadcast, created_at, delivered_at, read_at";

fn permissions_to_string(role: &Role) -> String {
    role.permissions
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_permissions(raw: &str) -> Result<BTreeSet<Permission>, ApiError> {
    raw.split(',')
        .filter(|atom| !atom.is_empty())
        .map(|atom| {
            Permission::from_str(atom).map_err(|_| {
                ApiError::Internal(format!("Unknown permission atom '{}' in role table", atom))
            })
        })
        .collect()
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let status: String = row.get(4)?;
    let last_ip: Option<String> = row.get(8)?;
    let last_user_agent: Option<String> = row.get(9)?;

    Ok(User {
        id: parse_uuid_column(&id, 0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        role: row.get(3)?,
        status: UserStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
        totp_secret: row.get(5)?,
        totp_pending: row.get(6)?,
        public_key: row.get(7)?,
        last_fingerprint: match (last_ip, last_user_agent) {
            (Some(ip), Some(agent)) => Some(DeviceFingerprint::parse(&ip, &agent)),
            _ => None,
        },
        refresh_token: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    Ok(SessionRecord {
        id: parse_uuid_column(&id, 0)?,
        user_id: parse_uuid_column(&user_id, 1)?,
        refresh_token: row.get(2)?,
        device: row.get(3)?,
        ip: row.get(4)?,
        location: row.get(5)?,
        active: row.get(6)?,
        created_at: row.get(7)?,
        last_activity: row.get(8)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let recipient: Option<String> = row.get(2)?;
    Ok(StoredMessage {
        id: parse_uuid_column(&id, 0)?,
        sender_id: parse_uuid_column(&sender, 1)?,
        recipient_id: match recipient {
            Some(raw) => Some(parse_uuid_column(&raw, 2)?),
            None => None,
        },
        conversation_id: row.get(3)?,
        payload: row.get(4)?,
        is_broadcast: row.get(5)?,
        created_at: row.get(6)?,
        delivered_at: row.get(7)?,
        read_at: row.get(8)?,
    })
}

fn parse_uuid_column(raw: &str, index: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_uuid_value(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::Internal(format!("Malformed uuid '{}' in store", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quietwire_core::model::conversation_id;

    fn store() -> Store {
        Store::in_memory().unwrap()
    }

    fn sample_user(email: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: "$argon2id$stub".to_string(),
            role: "member".to_string(),
            status: UserStatus::Active,
            totp_secret: None,
            totp_pending: None,
            public_key: None,
            last_fingerprint: None,
            refresh_token: None,
            created_at: 1_700_000_000,
        }
    }

    fn sample_session(user_id: Uuid, refresh: &str, created_at: i64) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            user_id,
            refresh_token: refresh.to_string(),
            device: "Chrome on Linux (desktop)".to_string(),
            ip: "203.0.113.9".to_string(),
            location: "unknown".to_string(),
            active: true,
            created_at,
            last_activity: created_at,
        }
    }

    fn direct_message(sender: Uuid, recipient: Uuid, created_at: i64) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            sender_id: sender,
            recipient_id: Some(recipient),
            conversation_id: Some(conversation_id(sender, recipient)),
            payload: "b64:opaque".to_string(),
            is_broadcast: false,
            created_at,
            delivered_at: None,
            read_at: None,
        }
    }

    #[test]
    fn users_round_trip() {
        let store = store();
        let user = sample_user("a@example.com");
        store.create_user(&user).unwrap();

        let by_email = store.user_by_email("a@example.com").unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
        assert_eq!(by_email.status, UserStatus::Active);

        let by_id = store.user_by_id(user.id).unwrap().unwrap();
        assert_eq!(by_id.email, "a@example.com");

        assert!(store.user_by_email("missing@example.com").unwrap().is_none());
        assert_eq!(store.count_users().unwrap(), 1);
    }

    #[test]
    fn duplicate_email_is_a_conflict() {
        let store = store();
        store.create_user(&sample_user("dup@example.com")).unwrap();
        let result = store.create_user(&sample_user("dup@example.com"));
        assert!(matches!(result, Err(ApiError::Conflict(_))));
    }

    #[test]
    fn unknown_role_violates_the_foreign_key() {
        let store = store();
        let mut user = sample_user("fk@example.com");
        user.role = "no-such-role".to_string();
        assert!(store.create_user(&user).is_err());
    }

    #[test]
    fn totp_pending_promotes_once() {
        let store = store();
        let user = sample_user("totp@example.com");
        store.create_user(&user).unwrap();

        assert!(!store.enable_totp(user.id).unwrap());

        store.set_totp_pending(user.id, "SECRETBASE32").unwrap();
        assert!(store.enable_totp(user.id).unwrap());

        let reloaded = store.user_by_id(user.id).unwrap().unwrap();
        assert_eq!(reloaded.totp_secret.as_deref(), Some("SECRETBASE32"));
        assert!(reloaded.totp_pending.is_none());

        // Nothing pending anymore.
        assert!(!store.enable_totp(user.id).unwrap());
    }

    #[test]
    fn sessions_terminate_individually_and_in_bulk() {
        let store = store();
        let user = sample_user("s@example.com");
        store.create_user(&user).unwrap();

        let current = sample_session(user.id, "refresh-current", 100);
        let other_a = sample_session(user.id, "refresh-a", 200);
        let other_b = sample_session(user.id, "refresh-b", 300);
        for session in [&current, &other_a, &other_b] {
            store.create_session(session).unwrap();
        }

        assert_eq!(store.sessions_for_user(user.id).unwrap().len(), 3);

        assert!(store.terminate_session(other_a.id).unwrap());
        // Already terminated: no-op.
        assert!(!store.terminate_session(other_a.id).unwrap());
        assert_eq!(store.sessions_for_user(user.id).unwrap().len(), 2);

        let bulk = store
            .terminate_other_sessions(user.id, "refresh-current")
            .unwrap();
        assert_eq!(bulk, 1);

        let remaining = store.sessions_for_user(user.id).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, current.id);
    }

    #[test]
    fn stale_terminated_sessions_are_purged() {
        let store = store();
        let user = sample_user("purge@example.com");
        store.create_user(&user).unwrap();

        let old = sample_session(user.id, "r1", 100);
        let active = sample_session(user.id, "r2", 100);
        store.create_session(&old).unwrap();
        store.create_session(&active).unwrap();
        store.terminate_session(old.id).unwrap();

        // Terminated and stale: goes. Active: stays regardless of age.
        let removed = store.purge_stale_sessions(1_000_000).unwrap();
        assert_eq!(removed, 1);
        assert!(store.session_by_id(old.id).unwrap().is_none());
        assert!(store.session_by_id(active.id).unwrap().is_some());
    }

    #[test]
    fn conversation_pages_walk_backwards() {
        let store = store();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        for t in 1..=5 {
            store
                .insert_message(&direct_message(alice, bob, t * 1000))
                .unwrap();
        }
        let conversation = conversation_id(alice, bob);

        let (page, has_more) = store.conversation_page(&conversation, None, 2).unwrap();
        assert!(has_more);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].created_at, 4000);
        assert_eq!(page[1].created_at, 5000);

        let (older, has_more) = store
            .conversation_page(&conversation, Some(4000), 2)
            .unwrap();
        assert!(has_more);
        assert_eq!(older[0].created_at, 2000);
        assert_eq!(older[1].created_at, 3000);

        let (oldest, has_more) = store
            .conversation_page(&conversation, Some(2000), 2)
            .unwrap();
        assert!(!has_more);
        assert_eq!(oldest.len(), 1);
        assert_eq!(oldest[0].created_at, 1000);
    }

    #[test]
    fn delivery_ack_is_idempotent() {
        let store = store();
        let message = direct_message(Uuid::new_v4(), Uuid::new_v4(), 1000);
        store.insert_message(&message).unwrap();

        let (first, newly) = store.mark_delivered(message.id, 2000).unwrap();
        assert_eq!(first, Some(2000));
        assert!(newly);

        let (second, newly) = store.mark_delivered(message.id, 9999).unwrap();
        assert_eq!(second, Some(2000));
        assert!(!newly);

        let (missing, newly) = store.mark_delivered(Uuid::new_v4(), 2000).unwrap();
        assert_eq!(missing, None);
        assert!(!newly);
    }

    #[test]
    fn read_ack_backfills_delivery() {
        let store = store();
        let message = direct_message(Uuid::new_v4(), Uuid::new_v4(), 1000);
        store.insert_message(&message).unwrap();

        let (read_at, newly) = store.mark_read_direct(message.id, 3000).unwrap();
        assert_eq!(read_at, Some(3000));
        assert!(newly);

        let reloaded = store.message_by_id(message.id).unwrap().unwrap();
        assert_eq!(reloaded.delivered_at, Some(3000));

        let (again, newly) = store.mark_read_direct(message.id, 5000).unwrap();
        assert_eq!(again, Some(3000));
        assert!(!newly);
    }

    #[test]
    fn broadcast_readers_accumulate() {
        let store = store();
        let admin = Uuid::new_v4();
        let broadcast = StoredMessage {
            id: Uuid::new_v4(),
            sender_id: admin,
            recipient_id: None,
            conversation_id: None,
            payload: "maintenance at noon".to_string(),
            is_broadcast: true,
            created_at: 1000,
            delivered_at: None,
            read_at: None,
        };
        store.insert_message(&broadcast).unwrap();

        let (reader_a, reader_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (stamp, newly) = store.mark_read_broadcast(broadcast.id, reader_a, 2000).unwrap();
        assert_eq!(stamp, 2000);
        assert!(newly);

        let (stamp, newly) = store.mark_read_broadcast(broadcast.id, reader_a, 8000).unwrap();
        assert_eq!(stamp, 2000);
        assert!(!newly);

        store.mark_read_broadcast(broadcast.id, reader_b, 3000).unwrap();
        let readers = store.broadcast_readers(broadcast.id).unwrap();
        assert_eq!(readers, vec![(reader_a, 2000), (reader_b, 3000)]);
    }

    #[test]
    fn unread_counts_track_reads() {
        let store = store();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let m1 = direct_message(alice, bob, 1000);
        let m2 = direct_message(alice, bob, 2000);
        let m3 = direct_message(carol, bob, 3000);
        for m in [&m1, &m2, &m3] {
            store.insert_message(m).unwrap();
        }

        let counts = store.unread_direct_counts(bob).unwrap();
        assert_eq!(counts.len(), 2);
        let from_alice = counts
            .iter()
            .find(|(c, _)| *c == conversation_id(alice, bob))
            .unwrap();
        assert_eq!(from_alice.1, 2);

        store.mark_read_direct(m1.id, 5000).unwrap();
        let counts = store.unread_direct_counts(bob).unwrap();
        let from_alice = counts
            .iter()
            .find(|(c, _)| *c == conversation_id(alice, bob))
            .unwrap();
        assert_eq!(from_alice.1, 1);

        // Broadcasts count separately until this reader acks them.
        let broadcast = StoredMessage {
            id: Uuid::new_v4(),
            sender_id: alice,
            recipient_id: None,
            conversation_id: None,
            payload: "all hands".to_string(),
            is_broadcast: true,
            created_at: 4000,
            delivered_at: None,
            read_at: None,
        };
        store.insert_message(&broadcast).unwrap();
        assert_eq!(store.unread_broadcast_count(bob).unwrap(), 1);
        store.mark_read_broadcast(broadcast.id, bob, 5000).unwrap();
        assert_eq!(store.unread_broadcast_count(bob).unwrap(), 0);
    }

    #[test]
    fn revocations_gate_until_expiry() {
        let store = store();
        assert!(!store.is_token_revoked("jti-1").unwrap());

        store.revoke_token("jti-1", 5000).unwrap();
        store.revoke_token("jti-2", 9000).unwrap();
        assert!(store.is_token_revoked("jti-1").unwrap());

        let removed = store.purge_expired_revocations(6000).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.is_token_revoked("jti-1").unwrap());
        assert!(store.is_token_revoked("jti-2").unwrap());
    }

    #[test]
    fn builtin_roles_are_seeded() {
        let store = store();
        let admin = store.role("administrator").unwrap().unwrap();
        assert_eq!(admin.permissions.len(), Permission::ALL.len());

        let member = store.role("member").unwrap().unwrap();
        assert!(member.permissions.is_empty());
    }

    #[test]
    fn custom_roles_round_trip() {
        let store = store();
        let moderator = Role {
            name: "moderator".to_string(),
            permissions: [Permission::Broadcast, Permission::ViewLogs]
                .into_iter()
                .collect(),
        };
        store.upsert_role(&moderator).unwrap();

        let reloaded = store.role("moderator").unwrap().unwrap();
        assert_eq!(reloaded, moderator);
        assert_eq!(store.list_roles().unwrap().len(), 3);
    }

    #[test]
    fn role_deletion_requires_no_references() {
        let store = store();
        let moderator = Role {
            name: "moderator".to_string(),
            permissions: BTreeSet::new(),
        };
        store.upsert_role(&moderator).unwrap();

        let mut user = sample_user("mod@example.com");
        user.role = "moderator".to_string();
        store.create_user(&user).unwrap();

        assert!(matches!(
            store.delete_role("moderator"),
            Err(ApiError::Conflict(_))
        ));

        store.set_role(user.id, "member").unwrap();
        store.delete_role("moderator").unwrap();
        assert!(store.role("moderator").unwrap().is_none());
        assert!(matches!(
            store.delete_role("moderator"),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn reset_tokens_are_single_use_and_expiring() {
        let store = store();
        let user = sample_user("reset@example.com");
        store.create_user(&user).unwrap();

        store.store_reset_token("digest-live", user.id, 10_000).unwrap();
        store.store_reset_token("digest-old", user.id, 1_000).unwrap();

        assert_eq!(store.consume_reset_token("digest-old", 5_000).unwrap(), None);
        assert_eq!(
            store.consume_reset_token("digest-live", 5_000).unwrap(),
            Some(user.id)
        );
        // Burned.
        assert_eq!(store.consume_reset_token("digest-live", 5_000).unwrap(), None);

        let removed = store.purge_reset_tokens(5_000).unwrap();
        assert_eq!(removed, 2);
    }

    #[test]
    fn audit_pages_newest_first() {
        let store = store();
        for i in 0..5 {
            store
                .append_audit(1000 + i, "login_failed", 3, None, Some("203.0.113.9"), "{}")
                .unwrap();
        }

        let page = store.audit_page(3, None).unwrap();
        assert_eq!(page.len(), 3);
        assert!(page[0].id > page[1].id);

        let older = store.audit_page(10, Some(page[2].id)).unwrap();
        assert_eq!(older.len(), 2);
    }
}
