use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use skywrite_model::{RevokeReason, SessionId, UserId};

use crate::auth::dpop::DpopKey;
use crate::crypto::{Secret, TokenCipher};
use crate::error::{Error, Result};
use crate::store::audit::{AuditEvent, record_tx};

/// Material for a brand-new session row. Tokens arrive in plaintext and are
/// encrypted independently before the insert.
pub struct NewSession {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    pub dpop_key: DpopKey,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub source_ip: Option<String>,
}

impl std::fmt::Debug for NewSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewSession")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// A usable session with its token material decrypted in memory.
pub struct ActiveSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub access_token: Secret,
    pub refresh_token: Secret,
    pub dpop_key: DpopKey,
    pub dpop_thumbprint: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSession")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("access_expires_at", &self.access_expires_at)
            .finish_non_exhaustive()
    }
}

/// Session metadata without any decrypted material, for request
/// authentication and listings.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: SessionId,
    pub user_id: UserId,
    pub is_active: bool,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    access_token_enc: String,
    refresh_token_enc: String,
    dpop_private_jwk_enc: String,
    dpop_key_thumbprint: String,
    access_expires_at: DateTime<Utc>,
    refresh_expires_at: DateTime<Utc>,
    is_active: bool,
    last_used_at: DateTime<Utc>,
}

const SESSION_COLUMNS: &str = "id, user_id, access_token_enc, refresh_token_enc, \
     dpop_private_jwk_enc, dpop_key_thumbprint, access_expires_at, \
     refresh_expires_at, is_active, last_used_at";

/// Encrypted persistence of OAuth and DPoP material with atomic rotation.
///
/// The store is the sole writer of session rows. Decrypted values never
/// cross back over the persistence boundary; a ciphertext that fails
/// authentication deactivates its session rather than being retried.
#[derive(Clone)]
pub struct TokenStore {
    pool: PgPool,
    cipher: TokenCipher,
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

impl TokenStore {
    pub fn new(pool: PgPool, cipher: TokenCipher) -> Self {
        Self { pool, cipher }
    }

    /// Encrypt and insert a new session row. Returns the new session id.
    pub async fn put(&self, new: NewSession) -> Result<SessionId> {
        if new.access_expires_at > new.refresh_expires_at {
            return Err(Error::Internal(
                "access expiry exceeds refresh expiry".to_string(),
            ));
        }

        let access_enc = self.cipher.encrypt(&new.access_token)?;
        let refresh_enc = self.cipher.encrypt(&new.refresh_token)?;
        let private_jwk = new.dpop_key.private_jwk();
        let private_enc = self.cipher.encrypt(&private_jwk)?;
        let public_jwk = serde_json::to_string(&new.dpop_key.public_jwk())
            .map_err(|e| Error::Internal(format!("public JWK serialization: {e}")))?;

        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO auth_sessions (
                id, user_id, access_token_enc, refresh_token_enc,
                dpop_private_jwk_enc, dpop_public_jwk, dpop_key_thumbprint,
                access_expires_at, refresh_expires_at,
                is_active, last_used_at, user_agent, source_ip, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, TRUE, NOW(), $10, $11, NOW())
            "#,
        )
        .bind(id)
        .bind(new.user_id.to_uuid())
        .bind(&access_enc)
        .bind(&refresh_enc)
        .bind(&private_enc)
        .bind(&public_jwk)
        .bind(new.dpop_key.thumbprint())
        .bind(new.access_expires_at)
        .bind(new.refresh_expires_at)
        .bind(&new.user_agent)
        .bind(&new.source_ip)
        .execute(&mut *tx)
        .await?;
        record_tx(
            &mut *tx,
            AuditEvent::SessionCreated,
            Some(new.user_id.to_uuid()),
            Some(id),
            "oauth authorization completed",
        )
        .await?;
        tx.commit().await?;

        Ok(SessionId(id))
    }

    /// Replace the token material of a session in one transaction. When a
    /// new DPoP key accompanies the rotation, the public key and thumbprint
    /// move with it. Prior ciphertexts are overwritten; no history is kept.
    pub async fn rotate(
        &self,
        session_id: SessionId,
        new_access: &str,
        new_refresh: &str,
        access_expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
        new_dpop_key: Option<&DpopKey>,
    ) -> Result<()> {
        let access_enc = self.cipher.encrypt(new_access)?;
        let refresh_enc = self.cipher.encrypt(new_refresh)?;

        let mut tx = self.pool.begin().await?;
        let result = match new_dpop_key {
            Some(key) => {
                let private_jwk = key.private_jwk();
                let private_enc = self.cipher.encrypt(&private_jwk)?;
                let public_jwk = serde_json::to_string(&key.public_jwk())
                    .map_err(|e| Error::Internal(format!("public JWK serialization: {e}")))?;
                sqlx::query(
                    r#"
                    UPDATE auth_sessions
                    SET access_token_enc = $2,
                        refresh_token_enc = $3,
                        access_expires_at = $4,
                        refresh_expires_at = $5,
                        dpop_private_jwk_enc = $6,
                        dpop_public_jwk = $7,
                        dpop_key_thumbprint = $8,
                        last_used_at = NOW()
                    WHERE id = $1 AND is_active = TRUE
                    "#,
                )
                .bind(session_id.to_uuid())
                .bind(&access_enc)
                .bind(&refresh_enc)
                .bind(access_expires_at)
                .bind(refresh_expires_at)
                .bind(&private_enc)
                .bind(&public_jwk)
                .bind(key.thumbprint())
                .execute(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE auth_sessions
                    SET access_token_enc = $2,
                        refresh_token_enc = $3,
                        access_expires_at = $4,
                        refresh_expires_at = $5,
                        last_used_at = NOW()
                    WHERE id = $1 AND is_active = TRUE
                    "#,
                )
                .bind(session_id.to_uuid())
                .bind(&access_enc)
                .bind(&refresh_enc)
                .bind(access_expires_at)
                .bind(refresh_expires_at)
                .execute(&mut *tx)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(Error::SessionExpired);
        }

        record_tx(
            &mut *tx,
            AuditEvent::TokensRotated,
            None,
            Some(session_id.to_uuid()),
            if new_dpop_key.is_some() {
                "tokens rotated with new DPoP key"
            } else {
                "tokens rotated"
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Load and decrypt a session by id.
    pub async fn get(&self, session_id: SessionId) -> Result<ActiveSession> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM auth_sessions WHERE id = $1"
        ))
        .bind(session_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        self.open(row).await
    }

    /// Load and decrypt the user's most recently used active session.
    pub async fn get_most_recent_active(&self, user_id: UserId) -> Result<ActiveSession> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM auth_sessions
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY last_used_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(Error::SessionExpired)?;

        self.open(row).await
    }

    /// Session metadata without decryption, for request authentication.
    pub async fn peek(&self, session_id: SessionId) -> Result<SessionMeta> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM auth_sessions WHERE id = $1"
        ))
        .bind(session_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        Ok(SessionMeta {
            id: SessionId(row.id),
            user_id: UserId(row.user_id),
            is_active: row.is_active,
            access_expires_at: row.access_expires_at,
            refresh_expires_at: row.refresh_expires_at,
            last_used_at: row.last_used_at,
        })
    }

    /// Deactivate a session. Idempotent: revoking an already-revoked
    /// session keeps the original timestamp and reason.
    pub async fn revoke(&self, session_id: SessionId, reason: RevokeReason) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET is_active = FALSE,
                revoked_at = COALESCE(revoked_at, NOW()),
                revoke_reason = COALESCE(revoke_reason, $2)
            WHERE id = $1 AND is_active = TRUE
            "#,
        )
        .bind(session_id.to_uuid())
        .bind(reason.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() > 0 {
            record_tx(
                &mut *tx,
                AuditEvent::SessionRevoked,
                None,
                Some(session_id.to_uuid()),
                reason.as_str(),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Stamp `last_used_at`. Used by the network client on every call.
    pub async fn touch(&self, session_id: SessionId) -> Result<()> {
        sqlx::query("UPDATE auth_sessions SET last_used_at = NOW() WHERE id = $1")
            .bind(session_id.to_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bulk-deactivate sessions whose refresh window has closed. Returns
    /// how many rows were touched.
    pub async fn purge_expired(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET is_active = FALSE,
                revoked_at = COALESCE(revoked_at, NOW()),
                revoke_reason = COALESCE(revoke_reason, $1)
            WHERE refresh_expires_at < NOW() AND is_active = TRUE
            "#,
        )
        .bind(RevokeReason::Expired.as_str())
        .execute(&mut *tx)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            record_tx(
                &mut *tx,
                AuditEvent::SessionsPurged,
                None,
                None,
                &format!("{purged} expired sessions deactivated"),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(purged)
    }

    /// Decrypt a row into a usable session, rejecting unusable rows and
    /// deactivating the session on ciphertext failure.
    async fn open(&self, row: SessionRow) -> Result<ActiveSession> {
        let id = SessionId(row.id);
        if !row.is_active || row.refresh_expires_at <= Utc::now() {
            return Err(Error::SessionExpired);
        }

        let opened = self.decrypt_row(&row);
        match opened {
            Ok(session) => Ok(session),
            Err(err @ Error::CryptoFailure(_)) => {
                // Never silently retried: the session is taken out of
                // rotation and the caller sees an authentication error.
                self.revoke(id, RevokeReason::CryptoFailure).await?;
                Err(err)
            }
            Err(other) => Err(other),
        }
    }

    fn decrypt_row(&self, row: &SessionRow) -> Result<ActiveSession> {
        let access_token = self.cipher.decrypt(&row.access_token_enc)?;
        let refresh_token = self.cipher.decrypt(&row.refresh_token_enc)?;
        let private_jwk = self.cipher.decrypt(&row.dpop_private_jwk_enc)?;
        let dpop_key = DpopKey::from_private_jwk(&private_jwk)?;

        Ok(ActiveSession {
            id: SessionId(row.id),
            user_id: UserId(row.user_id),
            access_token,
            refresh_token,
            dpop_key,
            dpop_thumbprint: row.dpop_key_thumbprint.clone(),
            access_expires_at: row.access_expires_at,
            refresh_expires_at: row.refresh_expires_at,
        })
    }
}
