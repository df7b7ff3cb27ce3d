use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use skywrite_model::{
    FailureRecord, NewPost, PostId, PostStatus, ScheduledPost, UserId,
};

use crate::error::{Error, Result};

#[derive(Debug, sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    user_id: Uuid,
    content: String,
    scheduled_at: DateTime<Utc>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    executed_at: Option<DateTime<Utc>>,
    error_msg: Option<String>,
    retry_count: i32,
    not_before: Option<DateTime<Utc>>,
    bluesky_uri: Option<String>,
    bluesky_cid: Option<String>,
    bluesky_rkey: Option<String>,
    parent_post_id: Option<Uuid>,
    thread_root_id: Option<Uuid>,
    thread_index: i32,
    is_thread_root: bool,
    can_execute: bool,
    is_deleted: bool,
}

impl TryFrom<PostRow> for ScheduledPost {
    type Error = Error;

    fn try_from(row: PostRow) -> Result<Self> {
        let status = PostStatus::parse(&row.status)
            .map_err(|e| Error::Internal(format!("post {}: {e}", row.id)))?;
        Ok(ScheduledPost {
            id: PostId(row.id),
            user_id: UserId(row.user_id),
            content: row.content,
            scheduled_at: row.scheduled_at,
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            executed_at: row.executed_at,
            error_msg: row.error_msg,
            retry_count: row.retry_count,
            not_before: row.not_before,
            bluesky_uri: row.bluesky_uri,
            bluesky_cid: row.bluesky_cid,
            bluesky_rkey: row.bluesky_rkey,
            parent_post_id: row.parent_post_id.map(PostId),
            thread_root_id: row.thread_root_id.map(PostId),
            thread_index: row.thread_index,
            is_thread_root: row.is_thread_root,
            can_execute: row.can_execute,
            is_deleted: row.is_deleted,
        })
    }
}

const POST_COLUMNS: &str = "id, user_id, content, scheduled_at, status, created_at, \
     updated_at, executed_at, error_msg, retry_count, not_before, bluesky_uri, \
     bluesky_cid, bluesky_rkey, parent_post_id, thread_root_id, thread_index, \
     is_thread_root, can_execute, is_deleted";

/// A page of posts plus the unpaged total, for listings.
#[derive(Debug, Clone)]
pub struct PostPage {
    pub posts: Vec<ScheduledPost>,
    pub total: i64,
}

/// Fields an owner may change while a post is still pending.
#[derive(Debug, Clone, Default)]
pub struct PostUpdate {
    pub content: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Scheduled-post rows. The dispatcher and post service are the only
/// writers of execution state; the HTTP layer writes only creation-time and
/// pending-edit fields.
#[derive(Debug, Clone)]
pub struct PostRepository {
    pool: PgPool,
}

impl PostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, new: &NewPost) -> Result<ScheduledPost> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            r#"
            INSERT INTO scheduled_posts (
                id, user_id, content, scheduled_at, status, created_at, updated_at,
                retry_count, parent_post_id, thread_root_id, thread_index,
                is_thread_root, can_execute, is_deleted
            )
            VALUES ($1, $2, $3, $4, 'PENDING', NOW(), NOW(), 0, $5, $6, $7, $8, $9, FALSE)
            RETURNING {POST_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id.to_uuid())
        .bind(&new.content)
        .bind(new.scheduled_at)
        .bind(new.parent_post_id.map(|id| id.to_uuid()))
        .bind(new.thread_root_id.map(|id| id.to_uuid()))
        .bind(new.thread_index)
        .bind(new.is_thread_root)
        .bind(new.can_execute)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    pub async fn get(&self, post_id: PostId) -> Result<Option<ScheduledPost>> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {POST_COLUMNS} FROM scheduled_posts WHERE id = $1 AND is_deleted = FALSE"
        ))
        .bind(post_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_for_user(
        &self,
        user_id: UserId,
        status: Option<PostStatus>,
        page: i64,
        limit: i64,
    ) -> Result<PostPage> {
        let offset = (page.max(1) - 1) * limit;
        let status_filter = status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM scheduled_posts
            WHERE user_id = $1
              AND is_deleted = FALSE
              AND ($2::text IS NULL OR status = $2)
            "#,
        )
        .bind(user_id.to_uuid())
        .bind(status_filter)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, PostRow>(&format!(
            r#"
            SELECT {POST_COLUMNS} FROM scheduled_posts
            WHERE user_id = $1
              AND is_deleted = FALSE
              AND ($2::text IS NULL OR status = $2)
            ORDER BY scheduled_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(user_id.to_uuid())
        .bind(status_filter)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let posts = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>>>()?;
        Ok(PostPage { posts, total })
    }

    /// Edit a pending post. Rejected with `InvalidOperation` once the post
    /// has left PENDING.
    pub async fn update_pending(
        &self,
        post_id: PostId,
        user_id: UserId,
        update: &PostUpdate,
    ) -> Result<ScheduledPost> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            r#"
            UPDATE scheduled_posts
            SET content = COALESCE($3, content),
                scheduled_at = COALESCE($4, scheduled_at),
                updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status = 'PENDING' AND is_deleted = FALSE
            RETURNING {POST_COLUMNS}
            "#
        ))
        .bind(post_id.to_uuid())
        .bind(user_id.to_uuid())
        .bind(&update.content)
        .bind(update.scheduled_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.classify_miss(post_id, user_id).await?),
        }
    }

    /// Cancel a pending post. Same CAS discipline as claiming: only a
    /// PENDING row moves.
    pub async fn cancel_pending(&self, post_id: PostId, user_id: UserId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'CANCELLED', updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND status = 'PENDING' AND is_deleted = FALSE
            "#,
        )
        .bind(post_id.to_uuid())
        .bind(user_id.to_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.classify_miss(post_id, user_id).await?);
        }
        Ok(())
    }

    /// Posts ready for execution, oldest first.
    pub async fn due_batch(&self, limit: i64) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            r#"
            SELECT {POST_COLUMNS} FROM scheduled_posts
            WHERE status = 'PENDING'
              AND scheduled_at <= NOW()
              AND can_execute = TRUE
              AND is_deleted = FALSE
              AND (not_before IS NULL OR not_before <= NOW())
            ORDER BY scheduled_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Compare-and-set claim: PENDING -> EXECUTING. A `false` return means
    /// another worker claimed the row or the post was cancelled meanwhile.
    pub async fn claim(&self, post_id: PostId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'EXECUTING', updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(post_id.to_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Release a claim without consuming retry budget, for executions
    /// cancelled before the network write began.
    pub async fn release_claim(&self, post_id: PostId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'PENDING', updated_at = NOW()
            WHERE id = $1 AND status = 'EXECUTING'
            "#,
        )
        .bind(post_id.to_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        post_id: PostId,
        uri: &str,
        cid: &str,
        rkey: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'COMPLETED',
                executed_at = NOW(),
                updated_at = NOW(),
                error_msg = NULL,
                bluesky_uri = $2,
                bluesky_cid = $3,
                bluesky_rkey = $4
            WHERE id = $1 AND status = 'EXECUTING'
            "#,
        )
        .bind(post_id.to_uuid())
        .bind(uri)
        .bind(cid)
        .bind(rkey)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put a transiently failed post back in the queue with its bumped
    /// retry count and earliest-retry instant. The row becomes directly
    /// executable so the scan can retry a thread member on its own.
    pub async fn mark_retry(
        &self,
        post_id: PostId,
        retry_count: i32,
        error_msg: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'PENDING',
                retry_count = $2,
                error_msg = $3,
                not_before = $4,
                can_execute = TRUE,
                updated_at = NOW()
            WHERE id = $1 AND status = 'EXECUTING'
            "#,
        )
        .bind(post_id.to_uuid())
        .bind(retry_count)
        .bind(error_msg)
        .bind(not_before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal failure: the status update and the failure record land in
    /// one transaction. `retry_count` is stamped when the failing attempt
    /// consumed the last of the retry budget.
    pub async fn mark_failed(
        &self,
        post_id: PostId,
        error_msg: &str,
        retry_count: Option<i32>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'FAILED',
                error_msg = $2,
                retry_count = COALESCE($3, retry_count),
                updated_at = NOW()
            WHERE id = $1 AND status IN ('EXECUTING', 'PENDING')
            "#,
        )
        .bind(post_id.to_uuid())
        .bind(error_msg)
        .bind(retry_count)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO failure_records (id, post_id, error, created_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(post_id.to_uuid())
        .bind(error_msg)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Cancel the not-yet-published members of a thread after an earlier
    /// member failed. Completed members are left alone.
    pub async fn cancel_thread_remainder(
        &self,
        thread_root_id: PostId,
        after_index: i32,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'CANCELLED', error_msg = $3, updated_at = NOW()
            WHERE thread_root_id = $1
              AND thread_index > $2
              AND status IN ('PENDING', 'EXECUTING')
            "#,
        )
        .bind(thread_root_id.to_uuid())
        .bind(after_index)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Make the next pending member of a thread individually executable,
    /// so a chain interrupted by a retried member resumes once that member
    /// lands.
    pub async fn enable_next_in_thread(
        &self,
        thread_root_id: PostId,
        after_index: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET can_execute = TRUE, updated_at = NOW()
            WHERE id = (
                SELECT id FROM scheduled_posts
                WHERE thread_root_id = $1
                  AND thread_index > $2
                  AND status = 'PENDING'
                  AND is_deleted = FALSE
                ORDER BY thread_index ASC, created_at ASC
                LIMIT 1
            )
            "#,
        )
        .bind(thread_root_id.to_uuid())
        .bind(after_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All members of a thread in publication order.
    pub async fn thread_members(&self, thread_root_id: PostId) -> Result<Vec<ScheduledPost>> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            r#"
            SELECT {POST_COLUMNS} FROM scheduled_posts
            WHERE thread_root_id = $1 AND is_deleted = FALSE
            ORDER BY thread_index ASC, created_at ASC
            "#
        ))
        .bind(thread_root_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Watchdog: posts stuck in EXECUTING past the deadline go back to
    /// PENDING with their retry count unchanged.
    pub async fn reclaim_stalled(&self, stuck_for: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - stuck_for;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET status = 'PENDING', updated_at = NOW()
            WHERE status = 'EXECUTING' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Maintenance: logically delete terminal posts past their retention
    /// window. Returns how many rows were archived.
    pub async fn archive_terminal_before(
        &self,
        status: PostStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET is_deleted = TRUE, updated_at = NOW()
            WHERE status = $1 AND updated_at < $2 AND is_deleted = FALSE
            "#,
        )
        .bind(status.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Maintenance: drop failure records past retention.
    pub async fn purge_failure_records_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM failure_records WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn failure_records_for(&self, post_id: PostId) -> Result<Vec<FailureRecord>> {
        #[derive(sqlx::FromRow)]
        struct FailureRow {
            id: Uuid,
            post_id: Uuid,
            error: String,
            created_at: DateTime<Utc>,
        }

        let rows = sqlx::query_as::<_, FailureRow>(
            r#"
            SELECT id, post_id, error, created_at
            FROM failure_records
            WHERE post_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(post_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FailureRecord {
                id: row.id,
                post_id: PostId(row.post_id),
                error: row.error,
                created_at: row.created_at,
            })
            .collect())
    }

    /// Distinguish "not yours" from "not there" from "not editable" for a
    /// zero-row mutation.
    async fn classify_miss(&self, post_id: PostId, user_id: UserId) -> Result<Error> {
        match self.get(post_id).await? {
            None => Ok(Error::NotFound(format!("post {post_id}"))),
            Some(post) if post.user_id != user_id => {
                Ok(Error::Forbidden("post belongs to another user".to_string()))
            }
            Some(post) => Ok(Error::InvalidOperation(format!(
                "post is {} and can no longer be modified",
                post.status
            ))),
        }
    }
}
