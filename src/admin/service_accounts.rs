//! Service accounts: machine identities for the OAuth2 client-credentials
//! flow.
//!
//! Secrets are bcrypt-hashed and expire after 90 days; rotation re-arms an
//! expired account. There is no lockout for service accounts (rate
//! limiting absorbs brute force); the status machine is
//! ACTIVE/SUSPENDED/EXPIRED/DELETED with soft deletes and `is_system`
//! protection.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};

/// bcrypt cost for secret hashes.
pub const BCRYPT_COST: u32 = 12;

/// Secret lifetime before the account expires.
pub const SECRET_LIFETIME_DAYS: i64 = 90;

/// How many prior secret hashes a new secret is checked against.
pub const SECRET_HISTORY_DEPTH: usize = 5;

/// Role assigned to a service account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SaRole {
    Admin,
    User,
    Auditor,
    Readonly,
}

impl SaRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaRole::Admin => "ADMIN",
            SaRole::User => "USER",
            SaRole::Auditor => "AUDITOR",
            SaRole::Readonly => "READONLY",
        }
    }
}

impl std::str::FromStr for SaRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADMIN" => Ok(SaRole::Admin),
            "USER" => Ok(SaRole::User),
            "AUDITOR" => Ok(SaRole::Auditor),
            "READONLY" => Ok(SaRole::Readonly),
            other => Err(format!("unknown service account role: {other}")),
        }
    }
}

/// Account lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SaStatus {
    Active,
    Suspended,
    Expired,
    Deleted,
}

impl SaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaStatus::Active => "ACTIVE",
            SaStatus::Suspended => "SUSPENDED",
            SaStatus::Expired => "EXPIRED",
            SaStatus::Deleted => "DELETED",
        }
    }
}

impl std::str::FromStr for SaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(SaStatus::Active),
            "SUSPENDED" => Ok(SaStatus::Suspended),
            "EXPIRED" => Ok(SaStatus::Expired),
            "DELETED" => Ok(SaStatus::Deleted),
            other => Err(format!("unknown service account status: {other}")),
        }
    }
}

/// A service account row.
#[derive(Debug, Clone)]
pub struct ServiceAccount {
    pub id: Uuid,
    pub name: String,
    pub client_id: String,
    pub client_secret_hash: String,
    pub role: SaRole,
    pub status: SaStatus,
    pub rate_limit: i32,
    pub secret_expires_at: DateTime<Utc>,
    pub secret_changed_at: DateTime<Utc>,
    pub secret_history: Vec<String>,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

impl ServiceAccount {
    /// Whether tokens may be issued right now. Monotonic within a state:
    /// once the secret expires this stays false until a rotation.
    pub fn can_authenticate(&self, now: DateTime<Utc>) -> bool {
        self.status == SaStatus::Active && now < self.secret_expires_at
    }

    /// Effective status with lazy expiry applied.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SaStatus {
        if self.status == SaStatus::Active && now >= self.secret_expires_at {
            SaStatus::Expired
        } else {
            self.status
        }
    }
}

/// Generate a client id: `sa_<env>_<name>_<rand>`.
pub fn generate_client_id(environment: &str, name: &str) -> String {
    let rand: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("sa_{environment}_{name}_{rand}")
}

/// Generate a client secret with enough entropy that history collisions
/// cannot occur in practice.
pub fn generate_client_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect()
}

/// Push a hash onto a bounded history, oldest out first.
pub fn push_history(history: &mut Vec<String>, hash: String) {
    history.insert(0, hash);
    history.truncate(SECRET_HISTORY_DEPTH);
}

/// Reject a candidate secret that matches any hash in the history.
pub fn secret_in_history(history: &[String], candidate: &str) -> bool {
    history
        .iter()
        .any(|hash| bcrypt::verify(candidate, hash).unwrap_or(false))
}

/// Store over the `service_accounts` table.
#[derive(Clone)]
pub struct ServiceAccountStore {
    pool: PgPool,
}

impl ServiceAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS service_accounts (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                client_id TEXT NOT NULL UNIQUE,
                client_secret_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                rate_limit INT NOT NULL DEFAULT 100,
                secret_expires_at TIMESTAMPTZ NOT NULL,
                secret_changed_at TIMESTAMPTZ NOT NULL,
                secret_history JSONB NOT NULL DEFAULT '[]'::jsonb,
                is_system BOOL NOT NULL DEFAULT false,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                deleted_at TIMESTAMPTZ
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create an account; returns the record plus the plaintext secret,
    /// shown exactly once. A provided secret (bootstrap seeding) is used
    /// as-is; otherwise one is generated.
    pub async fn create(
        &self,
        environment: &str,
        name: &str,
        role: SaRole,
        rate_limit: i32,
        is_system: bool,
        secret: Option<&str>,
    ) -> EngineResult<(ServiceAccount, String)> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(EngineError::Validation(
                "service account name must be alphanumeric/dashes".into(),
            ));
        }
        let secret = match secret {
            Some(s) if s.len() >= 16 => s.to_string(),
            Some(_) => {
                return Err(EngineError::Validation(
                    "client secret must be at least 16 chars".into(),
                ))
            }
            None => generate_client_secret(),
        };
        let hash = bcrypt::hash(&secret, BCRYPT_COST)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;
        let now = Utc::now();
        let account = ServiceAccount {
            id: Uuid::new_v4(),
            name: name.to_string(),
            client_id: generate_client_id(environment, name),
            client_secret_hash: hash,
            role,
            status: SaStatus::Active,
            rate_limit,
            secret_expires_at: now + Duration::days(SECRET_LIFETIME_DAYS),
            secret_changed_at: now,
            secret_history: Vec::new(),
            is_system,
            created_at: now,
        };

        sqlx::query(
            r#"INSERT INTO service_accounts
                   (id, name, client_id, client_secret_hash, role, status,
                    rate_limit, secret_expires_at, secret_changed_at,
                    secret_history, is_system)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(&account.client_id)
        .bind(&account.client_secret_hash)
        .bind(account.role.as_str())
        .bind(account.status.as_str())
        .bind(account.rate_limit)
        .bind(account.secret_expires_at)
        .bind(account.secret_changed_at)
        .bind(serde_json::json!([]))
        .bind(account.is_system)
        .execute(&self.pool)
        .await?;

        Ok((account, secret))
    }

    pub async fn find_by_client_id(&self, client_id: &str) -> EngineResult<Option<ServiceAccount>> {
        let row = sqlx::query(
            "SELECT * FROM service_accounts WHERE client_id = $1 AND deleted_at IS NULL",
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_account).transpose()
    }

    pub async fn find_by_id(&self, id: Uuid) -> EngineResult<Option<ServiceAccount>> {
        let row =
            sqlx::query("SELECT * FROM service_accounts WHERE id = $1 AND deleted_at IS NULL")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Self::row_to_account).transpose()
    }

    pub async fn list(&self) -> EngineResult<Vec<ServiceAccount>> {
        let rows = sqlx::query(
            "SELECT * FROM service_accounts WHERE deleted_at IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_account).collect()
    }

    /// OAuth2 client-credentials check. Applies lazy expiry before the
    /// secret comparison so an expired account fails with the right error
    /// even when the secret matches.
    pub async fn authenticate(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> EngineResult<ServiceAccount> {
        let account = self
            .find_by_client_id(client_id)
            .await?
            .ok_or_else(|| EngineError::TokenInvalid("unknown client_id".into()))?;

        let now = Utc::now();
        match account.effective_status(now) {
            SaStatus::Active => {}
            SaStatus::Suspended => {
                return Err(EngineError::Forbidden("service account suspended".into()))
            }
            SaStatus::Expired => {
                // Persist the lazy transition on first observation.
                self.set_status(account.id, SaStatus::Expired).await?;
                return Err(EngineError::Forbidden("client secret expired".into()));
            }
            SaStatus::Deleted => {
                return Err(EngineError::TokenInvalid("unknown client_id".into()))
            }
        }

        let ok = bcrypt::verify(client_secret, &account.client_secret_hash)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;
        if !ok {
            return Err(EngineError::TokenInvalid("invalid client secret".into()));
        }
        Ok(account)
    }

    /// Rotate the secret; re-arms an expired account. The new secret must
    /// not match any of the previous five.
    pub async fn rotate_secret(&self, id: Uuid) -> EngineResult<(ServiceAccount, String)> {
        let mut account = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if account.status == SaStatus::Suspended {
            return Err(EngineError::Forbidden(
                "cannot rotate a suspended account".into(),
            ));
        }

        let mut secret = generate_client_secret();
        let mut guard = 0;
        while secret_in_history(&account.secret_history, &secret)
            || bcrypt::verify(&secret, &account.client_secret_hash).unwrap_or(false)
        {
            secret = generate_client_secret();
            guard += 1;
            if guard > 8 {
                return Err(EngineError::Internal("secret generation loop".into()));
            }
        }
        let new_hash = bcrypt::hash(&secret, BCRYPT_COST)
            .map_err(|e| EngineError::Internal(format!("bcrypt: {e}")))?;

        push_history(
            &mut account.secret_history,
            account.client_secret_hash.clone(),
        );
        let now = Utc::now();
        account.client_secret_hash = new_hash;
        account.secret_changed_at = now;
        account.secret_expires_at = now + Duration::days(SECRET_LIFETIME_DAYS);
        account.status = SaStatus::Active;

        sqlx::query(
            r#"UPDATE service_accounts
               SET client_secret_hash = $1, secret_changed_at = $2,
                   secret_expires_at = $3, secret_history = $4,
                   status = 'ACTIVE', updated_at = now()
               WHERE id = $5"#,
        )
        .bind(&account.client_secret_hash)
        .bind(account.secret_changed_at)
        .bind(account.secret_expires_at)
        .bind(serde_json::to_value(&account.secret_history)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok((account, secret))
    }

    pub async fn set_status(&self, id: Uuid, status: SaStatus) -> EngineResult<()> {
        sqlx::query("UPDATE service_accounts SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft delete. System accounts are protected.
    pub async fn delete(&self, id: Uuid) -> EngineResult<()> {
        let account = self
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if account.is_system {
            return Err(EngineError::Forbidden(
                "system service accounts cannot be deleted".into(),
            ));
        }
        sqlx::query(
            "UPDATE service_accounts SET status = 'DELETED', deleted_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_account(row: sqlx::postgres::PgRow) -> EngineResult<ServiceAccount> {
        let role: String = row.get("role");
        let status: String = row.get("status");
        let history: serde_json::Value = row.get("secret_history");
        Ok(ServiceAccount {
            id: row.get("id"),
            name: row.get("name"),
            client_id: row.get("client_id"),
            client_secret_hash: row.get("client_secret_hash"),
            role: role.parse().map_err(EngineError::Internal)?,
            status: status.parse().map_err(EngineError::Internal)?,
            rate_limit: row.get("rate_limit"),
            secret_expires_at: row.get("secret_expires_at"),
            secret_changed_at: row.get("secret_changed_at"),
            secret_history: serde_json::from_value(history)?,
            is_system: row.get("is_system"),
            created_at: row.get("created_at"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(status: SaStatus, expires_in_days: i64) -> ServiceAccount {
        ServiceAccount {
            id: Uuid::new_v4(),
            name: "ingester".into(),
            client_id: "sa_prod_ingester_a1b2c3d4".into(),
            client_secret_hash: "$2b$12$x".into(),
            role: SaRole::User,
            status,
            rate_limit: 100,
            secret_expires_at: Utc::now() + Duration::days(expires_in_days),
            secret_changed_at: Utc::now(),
            secret_history: Vec::new(),
            is_system: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_client_id_shape() {
        let id = generate_client_id("prod", "ingester");
        assert!(id.starts_with("sa_prod_ingester_"));
        let rand = id.rsplit('_').next().unwrap();
        assert_eq!(rand.len(), 8);
    }

    #[test]
    fn test_can_authenticate_requires_active_and_fresh_secret() {
        let now = Utc::now();
        assert!(account(SaStatus::Active, 10).can_authenticate(now));
        assert!(!account(SaStatus::Active, -1).can_authenticate(now));
        assert!(!account(SaStatus::Suspended, 10).can_authenticate(now));
        assert!(!account(SaStatus::Expired, 10).can_authenticate(now));
        assert!(!account(SaStatus::Deleted, 10).can_authenticate(now));
    }

    #[test]
    fn test_expiry_is_monotonic_until_rotation() {
        let sa = account(SaStatus::Active, -1);
        let now = Utc::now();
        assert_eq!(sa.effective_status(now), SaStatus::Expired);
        // Later checks stay expired.
        assert_eq!(
            sa.effective_status(now + Duration::days(5)),
            SaStatus::Expired
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = Vec::new();
        for i in 0..8 {
            push_history(&mut history, format!("hash-{i}"));
        }
        assert_eq!(history.len(), SECRET_HISTORY_DEPTH);
        // Newest first, oldest dropped.
        assert_eq!(history[0], "hash-7");
        assert!(!history.contains(&"hash-0".to_string()));
    }

    #[test]
    fn test_secret_history_match() {
        let secret = "super-secret-value";
        let hash = bcrypt::hash(secret, 4).unwrap(); // low cost for test speed
        let history = vec![hash];
        assert!(secret_in_history(&history, secret));
        assert!(!secret_in_history(&history, "different"));
    }

    #[test]
    fn test_generated_secret_entropy() {
        let a = generate_client_secret();
        let b = generate_client_secret();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_round_trip() {
        for role in [SaRole::Admin, SaRole::User, SaRole::Auditor, SaRole::Readonly] {
            assert_eq!(role.as_str().parse::<SaRole>().unwrap(), role);
        }
    }
}
