use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::error::Result;

/// Auth and maintenance lifecycle events worth an audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    SessionCreated,
    TokensRotated,
    SessionRevoked,
    SessionsPurged,
    PostsArchived,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::SessionCreated => "session_created",
            AuditEvent::TokensRotated => "tokens_rotated",
            AuditEvent::SessionRevoked => "session_revoked",
            AuditEvent::SessionsPurged => "sessions_purged",
            AuditEvent::PostsArchived => "posts_archived",
        }
    }
}

/// Append-only audit log. Writes that accompany a session mutation run on
/// the mutation's transaction.
#[derive(Debug, Clone)]
pub struct AuditRepository {
    pool: PgPool,
}

impl AuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        event: AuditEvent,
        user_id: Option<Uuid>,
        session_id: Option<Uuid>,
        detail: &str,
    ) -> Result<()> {
        record_tx(&self.pool, event, user_id, session_id, detail).await
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditRow>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, user_id, session_id, event_type, detail, created_at
            FROM audit_log
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub event_type: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Insert an audit row on any executor, so session mutations can attach the
/// write to their own transaction.
pub(crate) async fn record_tx<'e, E>(
    executor: E,
    event: AuditEvent,
    user_id: Option<Uuid>,
    session_id: Option<Uuid>,
    detail: &str,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_log (id, user_id, session_id, event_type, detail, created_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(session_id)
    .bind(event.as_str())
    .bind(detail)
    .execute(executor)
    .await?;
    Ok(())
}
