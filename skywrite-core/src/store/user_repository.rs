use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use skywrite_model::{User, UserId};

use crate::error::{Error, Result};

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    did: String,
    handle: String,
    display_name: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: UserId(row.id),
            did: row.did,
            handle: row.handle,
            display_name: row.display_name,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// User rows keyed by the network's decentralized identifier.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a user on successful authorization. The DID is the
    /// stable key; the handle is mutable and follows the network.
    pub async fn upsert_by_did(
        &self,
        did: &str,
        handle: &str,
        display_name: Option<&str>,
    ) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, did, handle, display_name, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, TRUE, NOW(), NOW())
            ON CONFLICT (did) DO UPDATE
            SET handle = EXCLUDED.handle,
                display_name = COALESCE(EXCLUDED.display_name, users.display_name),
                is_active = TRUE,
                updated_at = NOW()
            RETURNING id, did, handle, display_name, is_active, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(did)
        .bind(handle)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    pub async fn get(&self, user_id: UserId) -> Result<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, did, handle, display_name, is_active, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {user_id}")))?;

        Ok(row.into())
    }
}
