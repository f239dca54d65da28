//! Admin users: human identities with password auth and lockout.
//!
//! Five failed logins inside a fifteen-minute window lock the account for
//! fifteen minutes; a correct password during the lock is still rejected.
//! Password changes are checked against the last five bcrypt hashes, each
//! via a full verify so the comparison cost is uniform.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};

/// bcrypt cost for password hashes.
pub const BCRYPT_COST: u32 = 12;

/// Failures tolerated inside the window before locking.
pub const LOCKOUT_THRESHOLD: u32 = 5;

/// Width of the failure window and length of the lock.
pub const LOCKOUT_WINDOW_MINUTES: i64 = 15;

/// Prior password hashes a new password is checked against.
pub const PASSWORD_HISTORY_DEPTH: usize = 5;

/// Admin roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    SuperAdmin,
    Admin,
    Readonly,
}

impl AdminRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminRole::SuperAdmin => "super_admin",
            AdminRole::Admin => "admin",
            AdminRole::Readonly => "readonly",
        }
    }
}

impl std::str::FromStr for AdminRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(AdminRole::SuperAdmin),
            "admin" => Ok(AdminRole::Admin),
            "readonly" => Ok(AdminRole::Readonly),
            other => Err(format!("unknown admin role: {other}")),
        }
    }
}

/// An admin user row.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub id: Uuid,
    /// Stored lowercase; lookups are case-insensitive.
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: AdminRole,
    pub enabled: bool,
    pub failed_login_count: i32,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub password_history: Vec<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

impl AdminUser {
    /// Whether a login attempt may proceed to the password check.
    pub fn can_login(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.locked_until.map(|until| now > until).unwrap_or(true)
    }

    /// Failure count that applies to a new failure at `now`: resets when
    /// the previous failure fell outside the window.
    pub fn window_failures(&self, now: DateTime<Utc>) -> i32 {
        match self.last_failed_at {
            Some(at) if now - at <= Duration::minutes(LOCKOUT_WINDOW_MINUTES) => {
                self.failed_login_count
            }
            _ => 0,
        }
    }
}

/// Bounded password history push, newest first.
pub fn push_history(history: &mut Vec<String>, hash: String) {
    history.insert(0, hash);
    history.truncate(PASSWORD_HISTORY_DEPTH);
}

/// True when the candidate matches the current hash or any in history.
pub fn password_reused(current_hash: &str, history: &[String], candidate: &str) -> bool {
    let mut reused = bcrypt::verify(candidate, current_hash).unwrap_or(false);
    for hash in history {
        // Verify against every entry unconditionally; the work done does
        // not depend on which entry matched.
        if bcrypt::verify(candidate, hash).unwrap_or(false) {
            reused = true;
        }
    }
    reused
}

/// Outcome of a login attempt.
#[derive(Debug)]
pub enum LoginOutcome {
    Success(AdminUser),
    InvalidCredentials,
    Locked { until: DateTime<Utc> },
    Disabled,
}

/// Store over the `admin_users` table.
#[derive(Clone)]
pub struct AdminUserStore {
    pool: PgPool,
}

impl AdminUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS admin_users (
                id UUID PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                enabled BOOL NOT NULL DEFAULT true,
                failed_login_count INT NOT NULL DEFAULT 0,
                last_failed_at TIMESTAMPTZ,
                locked_until TIMESTAMPTZ,
                last_login_at TIMESTAMPTZ,
                password_history JSONB NOT NULL DEFAULT '[]'::jsonb,
                is_system BOOL NOT NULL DEFAULT false,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: AdminRole,
        is_system: bool,
    ) -> EngineResult<AdminUser> {
        let username = username.to_lowercase();
        if username.is_empty() || password.len() < 12 {
            return Err(EngineError::Validation(
                "username required, password must be at least 12 chars".into(),
            ));
        }
        let hash = bcrypt::hash(password, BCRYPT_COST)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;
        let user = AdminUser {
            id: Uuid::new_v4(),
            username,
            email: email.to_string(),
            password_hash: hash,
            role,
            enabled: true,
            failed_login_count: 0,
            last_failed_at: None,
            locked_until: None,
            last_login_at: None,
            password_history: Vec::new(),
            is_system,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO admin_users
                   (id, username, email, password_hash, role, is_system)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .bind(user.is_system)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn find_by_username(&self, username: &str) -> EngineResult<Option<AdminUser>> {
        let row = sqlx::query("SELECT * FROM admin_users WHERE username = $1")
            .bind(username.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_user).transpose()
    }

    pub async fn find_by_id(&self, id: Uuid) -> EngineResult<Option<AdminUser>> {
        let row = sqlx::query("SELECT * FROM admin_users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_user).transpose()
    }

    pub async fn list(&self) -> EngineResult<Vec<AdminUser>> {
        let rows = sqlx::query("SELECT * FROM admin_users ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_user).collect()
    }

    /// Password login with lockout bookkeeping.
    pub async fn login(&self, username: &str, password: &str) -> EngineResult<LoginOutcome> {
        let Some(user) = self.find_by_username(username).await? else {
            // Burn a hash anyway so unknown and known usernames cost the
            // same.
            let _ = bcrypt::verify(password, "$2b$12$C6UzMDM.H6dfI/f/IKcEeO7leyDKmB8VZzV7U5vF3q8m8u9a6o5hK");
            return Ok(LoginOutcome::InvalidCredentials);
        };

        let now = Utc::now();
        if !user.enabled {
            return Ok(LoginOutcome::Disabled);
        }
        if let Some(until) = user.locked_until {
            if now <= until {
                return Ok(LoginOutcome::Locked { until });
            }
        }

        let ok = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;

        if ok {
            sqlx::query(
                r#"UPDATE admin_users
                   SET failed_login_count = 0, last_failed_at = NULL,
                       locked_until = NULL, last_login_at = $1, updated_at = now()
                   WHERE id = $2"#,
            )
            .bind(now)
            .bind(user.id)
            .execute(&self.pool)
            .await?;
            return Ok(LoginOutcome::Success(user));
        }

        let failures = user.window_failures(now) + 1;
        let locked_until = if failures >= LOCKOUT_THRESHOLD as i32 {
            Some(now + Duration::minutes(LOCKOUT_WINDOW_MINUTES))
        } else {
            None
        };
        sqlx::query(
            r#"UPDATE admin_users
               SET failed_login_count = $1, last_failed_at = $2,
                   locked_until = $3, updated_at = now()
               WHERE id = $4"#,
        )
        .bind(failures)
        .bind(now)
        .bind(locked_until)
        .bind(user.id)
        .execute(&self.pool)
        .await?;

        match locked_until {
            Some(until) => Ok(LoginOutcome::Locked { until }),
            None => Ok(LoginOutcome::InvalidCredentials),
        }
    }

    /// Change a password, enforcing the history rule.
    pub async fn change_password(
        &self,
        id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> EngineResult<()> {
        let mut user = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let ok = bcrypt::verify(current_password, &user.password_hash)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;
        if !ok {
            return Err(EngineError::Forbidden("current password incorrect".into()));
        }
        if new_password.len() < 12 {
            return Err(EngineError::Validation(
                "password must be at least 12 chars".into(),
            ));
        }
        if password_reused(&user.password_hash, &user.password_history, new_password) {
            return Err(EngineError::Validation(
                "password matches one of the last five".into(),
            ));
        }

        push_history(&mut user.password_history, user.password_hash.clone());
        let new_hash = bcrypt::hash(new_password, BCRYPT_COST)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;
        sqlx::query(
            r#"UPDATE admin_users
               SET password_hash = $1, password_history = $2, updated_at = now()
               WHERE id = $3"#,
        )
        .bind(&new_hash)
        .bind(serde_json::to_value(&user.password_history)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Administrative password reset (no current-password check); clears
    /// the lockout so the user can log in immediately.
    pub async fn reset_password(&self, id: Uuid, new_password: &str) -> EngineResult<()> {
        let user = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if new_password.len() < 12 {
            return Err(EngineError::Validation(
                "password must be at least 12 chars".into(),
            ));
        }
        let mut history = user.password_history.clone();
        push_history(&mut history, user.password_hash.clone());
        let new_hash = bcrypt::hash(new_password, BCRYPT_COST)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;
        sqlx::query(
            r#"UPDATE admin_users
               SET password_hash = $1, password_history = $2,
                   failed_login_count = 0, locked_until = NULL, updated_at = now()
               WHERE id = $3"#,
        )
        .bind(&new_hash)
        .bind(serde_json::to_value(&history)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Role change. System accounts must stay super_admin.
    pub async fn set_role(&self, id: Uuid, role: AdminRole) -> EngineResult<()> {
        let user = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if user.is_system && role != AdminRole::SuperAdmin {
            return Err(EngineError::Forbidden(
                "system account role cannot be lowered".into(),
            ));
        }
        sqlx::query("UPDATE admin_users SET role = $1, updated_at = now() WHERE id = $2")
            .bind(role.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> EngineResult<()> {
        sqlx::query("UPDATE admin_users SET enabled = $1, updated_at = now() WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hard delete; system accounts are protected.
    pub async fn delete(&self, id: Uuid) -> EngineResult<()> {
        let user = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if user.is_system {
            return Err(EngineError::Forbidden(
                "system accounts cannot be deleted".into(),
            ));
        }
        sqlx::query("DELETE FROM admin_users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn row_to_user(row: sqlx::postgres::PgRow) -> EngineResult<AdminUser> {
        let role: String = row.get("role");
        let history: serde_json::Value = row.get("password_history");
        Ok(AdminUser {
            id: row.get("id"),
            username: row.get("username"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            role: role.parse().map_err(EngineError::Internal)?,
            enabled: row.get("enabled"),
            failed_login_count: row.get("failed_login_count"),
            last_failed_at: row.get("last_failed_at"),
            locked_until: row.get("locked_until"),
            last_login_at: row.get("last_login_at"),
            password_history: serde_json::from_value(history)?,
            is_system: row.get("is_system"),
            created_at: row.get("created_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AdminUser {
        AdminUser {
            id: Uuid::new_v4(),
            username: "admin".into(),
            email: "admin@example.com".into(),
            password_hash: bcrypt::hash("correct-horse-battery", 4).unwrap(),
            role: AdminRole::Admin,
            enabled: true,
            failed_login_count: 0,
            last_failed_at: None,
            locked_until: None,
            last_login_at: None,
            password_history: Vec::new(),
            is_system: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_can_login_honors_lock() {
        let now = Utc::now();
        let mut u = user();
        assert!(u.can_login(now));

        u.locked_until = Some(now + Duration::minutes(10));
        assert!(!u.can_login(now));

        // Past the lock the account opens again.
        u.locked_until = Some(now - Duration::minutes(1));
        assert!(u.can_login(now));

        u.locked_until = None;
        u.enabled = false;
        assert!(!u.can_login(now));
    }

    #[test]
    fn test_window_failures_reset_outside_window() {
        let now = Utc::now();
        let mut u = user();
        u.failed_login_count = 4;
        u.last_failed_at = Some(now - Duration::minutes(5));
        assert_eq!(u.window_failures(now), 4);

        u.last_failed_at = Some(now - Duration::minutes(20));
        assert_eq!(u.window_failures(now), 0);

        u.last_failed_at = None;
        assert_eq!(u.window_failures(now), 0);
    }

    #[test]
    fn test_password_reuse_detection() {
        let old = bcrypt::hash("old-password-one", 4).unwrap();
        let older = bcrypt::hash("old-password-two", 4).unwrap();
        let current = bcrypt::hash("current-password", 4).unwrap();
        let history = vec![old, older];

        assert!(password_reused(&current, &history, "current-password"));
        assert!(password_reused(&current, &history, "old-password-one"));
        assert!(password_reused(&current, &history, "old-password-two"));
        assert!(!password_reused(&current, &history, "brand-new-password"));
    }

    #[test]
    fn test_history_depth() {
        let mut history = Vec::new();
        for i in 0..10 {
            push_history(&mut history, format!("h{i}"));
        }
        assert_eq!(history.len(), PASSWORD_HISTORY_DEPTH);
        assert_eq!(history[0], "h9");
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(
            "super_admin".parse::<AdminRole>().unwrap(),
            AdminRole::SuperAdmin
        );
        assert!("root".parse::<AdminRole>().is_err());
    }
}
