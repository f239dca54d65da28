//! Token issuance and validation.
//!
//! Tokens are RS256 JWTs signed by the current primary key, with the key
//! version in the `kid` header. Validation walks the key set newest first,
//! so tokens from the pre-rotation key verify until that key expires.
//! Algorithm confusion is rejected up front: anything but RS256 in the
//! header fails before a signature check is attempted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admin::keys::KeySet;
use crate::core::error::{EngineError, EngineResult};

/// Principal class carried in the `type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    ServiceAccount,
    AdminUser,
}

/// Claims for both access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,
    /// "access" or "refresh".
    pub token_use: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<i32>,
}

/// Issued token pair in the OAuth2 response shape.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// Subject material for issuance.
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub sub: String,
    pub principal_type: PrincipalType,
    pub role: String,
    pub client_id: Option<String>,
    pub name: Option<String>,
    pub rate_limit: Option<i32>,
}

/// Token service: issuance and validation against the shared key set.
pub struct TokenService {
    keys: Arc<KeySet>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock_skew: Duration,
    /// Refresh jtis already exchanged; rotation makes reuse fail.
    consumed_refresh: DashMap<String, i64>,
}

impl TokenService {
    pub fn new(
        keys: Arc<KeySet>,
        access_ttl: Duration,
        refresh_ttl: Duration,
        clock_skew: Duration,
    ) -> Self {
        Self {
            keys,
            access_ttl,
            refresh_ttl,
            clock_skew,
            consumed_refresh: DashMap::new(),
        }
    }

    /// Issue an access + refresh pair for a subject.
    pub fn issue_pair(&self, subject: &TokenSubject) -> EngineResult<TokenPair> {
        let access = self.issue(subject, "access", self.access_ttl)?;
        let refresh = self.issue(subject, "refresh", self.refresh_ttl)?;
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            token_type: "Bearer".into(),
            expires_in: self.access_ttl.as_secs(),
        })
    }

    fn issue(&self, subject: &TokenSubject, token_use: &str, ttl: Duration) -> EngineResult<String> {
        let key = self.keys.primary()?;
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: subject.sub.clone(),
            exp: now + ttl.as_secs() as i64,
            iat: now,
            nbf: now,
            jti: Uuid::new_v4().to_string(),
            principal_type: subject.principal_type,
            token_use: token_use.to_string(),
            role: subject.role.clone(),
            client_id: subject.client_id.clone(),
            name: subject.name.clone(),
            rate_limit: subject.rate_limit,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.version.to_string());

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key_pem.as_bytes())
            .map_err(|e| EngineError::Internal(format!("signing key unusable: {e}")))?;
        encode(&header, &claims, &encoding_key)
            .map_err(|e| EngineError::Internal(format!("token encode: {e}")))
    }

    /// Validate a token against the active key set.
    pub fn validate(&self, token: &str) -> EngineResult<TokenClaims> {
        let header =
            decode_header(token).map_err(|e| EngineError::TokenInvalid(e.to_string()))?;
        if header.alg != Algorithm::RS256 {
            return Err(EngineError::TokenInvalid(format!(
                "algorithm {:?} not accepted",
                header.alg
            )));
        }

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_nbf = true;
        validation.required_spec_claims.insert("exp".to_string());

        let candidates = self.keys.validation_keys(self.clock_skew);
        if candidates.is_empty() {
            return Err(EngineError::TokenInvalid("no validation keys".into()));
        }

        // Prefer the key named by `kid`, then fall back to the rest,
        // newest first.
        let kid: Option<Uuid> = header.kid.as_deref().and_then(|k| k.parse().ok());
        let ordered = candidates.iter().filter(|k| Some(k.version) == kid).chain(
            candidates.iter().filter(|k| Some(k.version) != kid),
        );

        let mut last_err = EngineError::TokenInvalid("signature did not verify".into());
        for key in ordered {
            let decoding_key = match DecodingKey::from_rsa_pem(key.public_key_pem.as_bytes()) {
                Ok(k) => k,
                Err(_) => continue,
            };
            match decode::<TokenClaims>(token, &decoding_key, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => {
                    use jsonwebtoken::errors::ErrorKind as JwtKind;
                    match e.kind() {
                        JwtKind::ExpiredSignature => return Err(EngineError::TokenExpired),
                        JwtKind::InvalidSignature => {
                            last_err =
                                EngineError::TokenInvalid("signature did not verify".into());
                        }
                        other => {
                            last_err = EngineError::TokenInvalid(format!("{other:?}"));
                        }
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Validate an access token specifically.
    pub fn validate_access(&self, token: &str) -> EngineResult<TokenClaims> {
        let claims = self.validate(token)?;
        if claims.token_use != "access" {
            return Err(EngineError::TokenInvalid("not an access token".into()));
        }
        Ok(claims)
    }

    /// Exchange a refresh token for a new pair. The old refresh token's
    /// jti is consumed; presenting it again fails.
    pub fn refresh(&self, refresh_token: &str) -> EngineResult<(TokenClaims, TokenPair)> {
        let claims = self.validate(refresh_token)?;
        if claims.token_use != "refresh" {
            return Err(EngineError::TokenInvalid("not a refresh token".into()));
        }
        if self.consumed_refresh.contains_key(&claims.jti) {
            return Err(EngineError::TokenInvalid("refresh token already used".into()));
        }
        self.consumed_refresh.insert(claims.jti.clone(), claims.exp);

        let pair = self.issue_pair(&TokenSubject {
            sub: claims.sub.clone(),
            principal_type: claims.principal_type,
            role: claims.role.clone(),
            client_id: claims.client_id.clone(),
            name: claims.name.clone(),
            rate_limit: claims.rate_limit,
        })?;
        Ok((claims, pair))
    }

    /// Drop consumed-jti records whose tokens have expired anyway.
    pub fn prune_consumed(&self) {
        let now = Utc::now().timestamp();
        self.consumed_refresh.retain(|_, exp| *exp > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::keys::JwtKey;

    async fn service_with_key() -> TokenService {
        let keys = Arc::new(KeySet::default());
        let key = JwtKey::generate(Duration::from_secs(48 * 3600)).await.unwrap();
        keys.replace(vec![key]);
        TokenService::new(
            keys,
            Duration::from_secs(1800),
            Duration::from_secs(7 * 86400),
            Duration::from_secs(300),
        )
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            sub: "sa-1".into(),
            principal_type: PrincipalType::ServiceAccount,
            role: "ADMIN".into(),
            client_id: Some("sa_prod_ingester_a1b2c3".into()),
            name: Some("ingester".into()),
            rate_limit: Some(100),
        }
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let service = service_with_key().await;
        let pair = service.issue_pair(&subject()).unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 1800);

        let claims = service.validate_access(&pair.access_token).unwrap();
        assert_eq!(claims.sub, "sa-1");
        assert_eq!(claims.principal_type, PrincipalType::ServiceAccount);
        assert_eq!(claims.role, "ADMIN");
        assert_eq!(claims.rate_limit, Some(100));
    }

    #[tokio::test]
    async fn test_refresh_token_rejected_as_access() {
        let service = service_with_key().await;
        let pair = service.issue_pair(&subject()).unwrap();
        assert!(service.validate_access(&pair.refresh_token).is_err());
    }

    #[tokio::test]
    async fn test_refresh_rotation_consumes_jti() {
        let service = service_with_key().await;
        let pair = service.issue_pair(&subject()).unwrap();

        let (_, new_pair) = service.refresh(&pair.refresh_token).unwrap();
        assert_ne!(new_pair.access_token, pair.access_token);

        // Replaying the old refresh token fails.
        assert!(service.refresh(&pair.refresh_token).is_err());
        // The new one still works.
        assert!(service.refresh(&new_pair.refresh_token).is_ok());
    }

    #[tokio::test]
    async fn test_validates_with_previous_key_after_rotation() {
        let keys = Arc::new(KeySet::default());
        let old_key = JwtKey::generate(Duration::from_secs(48 * 3600)).await.unwrap();
        keys.replace(vec![old_key.clone()]);
        let service = TokenService::new(
            keys.clone(),
            Duration::from_secs(1800),
            Duration::from_secs(7 * 86400),
            Duration::from_secs(300),
        );

        let pair = service.issue_pair(&subject()).unwrap();

        // Rotate: old key demoted but unexpired, new key primary.
        let mut demoted = old_key;
        demoted.is_active = false;
        let new_key = JwtKey::generate(Duration::from_secs(48 * 3600)).await.unwrap();
        keys.replace(vec![demoted, new_key]);

        // Token signed with the previous key still validates (grace).
        let claims = service.validate_access(&pair.access_token).unwrap();
        assert_eq!(claims.sub, "sa-1");
    }

    #[tokio::test]
    async fn test_garbage_token_rejected() {
        let service = service_with_key().await;
        assert!(service.validate("not.a.jwt").is_err());
        assert!(matches!(
            service.validate("not.a.jwt").unwrap_err(),
            EngineError::TokenInvalid(_)
        ));
    }
}
