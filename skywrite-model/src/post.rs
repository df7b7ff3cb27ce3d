use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::ids::{PostId, UserId};

/// Maximum length of a post body, in Unicode code points.
pub const MAX_CONTENT_CODEPOINTS: usize = 300;

/// Retry budget for a single post. The fourth failure is terminal.
pub const MAX_RETRY: i32 = 3;

/// Minimum lead time between creation and the scheduled instant for
/// user-submitted posts.
pub const MIN_SCHEDULE_LEAD: Duration = Duration::from_secs(5 * 60);

/// Lifecycle state of a scheduled post.
///
/// `Retrying` is accepted on read for rows written by earlier revisions of
/// the schema; this implementation reschedules transient failures as
/// `Pending` so the retry counter stays user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum PostStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Pending => "PENDING",
            PostStatus::Executing => "EXECUTING",
            PostStatus::Completed => "COMPLETED",
            PostStatus::Failed => "FAILED",
            PostStatus::Cancelled => "CANCELLED",
            PostStatus::Retrying => "RETRYING",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(PostStatus::Pending),
            "EXECUTING" => Ok(PostStatus::Executing),
            "COMPLETED" => Ok(PostStatus::Completed),
            "FAILED" => Ok(PostStatus::Failed),
            "CANCELLED" => Ok(PostStatus::Cancelled),
            "RETRYING" => Ok(PostStatus::Retrying),
            other => Err(ModelError::UnknownStatus(other.to_string())),
        }
    }

    /// Statuses a post in this status may move to.
    ///
    /// `Completed`, `Failed`, and `Cancelled` are terminal.
    pub fn allowed_next(&self) -> &'static [PostStatus] {
        match self {
            PostStatus::Pending => &[PostStatus::Executing, PostStatus::Cancelled],
            PostStatus::Executing => &[
                PostStatus::Completed,
                PostStatus::Pending,
                PostStatus::Failed,
                PostStatus::Cancelled,
            ],
            PostStatus::Retrying => &[PostStatus::Executing, PostStatus::Cancelled],
            PostStatus::Completed | PostStatus::Failed | PostStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: PostStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn check_transition(&self, next: PostStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ModelError::InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_next().is_empty()
    }
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A post queued for future publication.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScheduledPost {
    pub id: PostId,
    pub user_id: UserId,
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub error_msg: Option<String>,
    pub retry_count: i32,
    /// Earliest instant a rescheduled retry may run.
    pub not_before: Option<DateTime<Utc>>,
    pub bluesky_uri: Option<String>,
    pub bluesky_cid: Option<String>,
    pub bluesky_rkey: Option<String>,
    pub parent_post_id: Option<PostId>,
    pub thread_root_id: Option<PostId>,
    pub thread_index: i32,
    pub is_thread_root: bool,
    pub can_execute: bool,
    pub is_deleted: bool,
}

impl ScheduledPost {
    /// COMPLETED iff the network record landed.
    pub fn invariants_hold(&self) -> bool {
        let completed_shape =
            self.executed_at.is_some() && self.bluesky_uri.is_some();
        match self.status {
            PostStatus::Completed => completed_shape && self.retry_count <= MAX_RETRY,
            _ => !completed_shape || self.retry_count <= MAX_RETRY,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.status == PostStatus::Pending && !self.is_deleted
    }
}

/// Creation payload for a scheduled post, validated before persistence.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub user_id: UserId,
    pub content: String,
    pub scheduled_at: DateTime<Utc>,
    pub parent_post_id: Option<PostId>,
    pub thread_root_id: Option<PostId>,
    pub thread_index: i32,
    pub is_thread_root: bool,
    /// Thread children are published by the root's walk, not the scan.
    pub can_execute: bool,
}

impl NewPost {
    pub fn standalone(
        user_id: UserId,
        content: String,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            content,
            scheduled_at,
            parent_post_id: None,
            thread_root_id: None,
            thread_index: 0,
            is_thread_root: false,
            can_execute: true,
        }
    }

    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        validate_content(&self.content)?;
        validate_schedule_time(self.scheduled_at, now)
    }
}

/// Reject empty bodies and bodies over the network's code-point cap.
pub fn validate_content(content: &str) -> Result<()> {
    let codepoints = content.chars().count();
    if codepoints == 0 {
        return Err(ModelError::InvalidContent("content is empty".to_string()));
    }
    if codepoints > MAX_CONTENT_CODEPOINTS {
        return Err(ModelError::InvalidContent(format!(
            "content is {codepoints} code points, maximum is {MAX_CONTENT_CODEPOINTS}"
        )));
    }
    Ok(())
}

/// User-submitted posts must be scheduled at least five minutes out.
pub fn validate_schedule_time(
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    let lead = chrono::Duration::from_std(MIN_SCHEDULE_LEAD)
        .expect("lead time fits in chrono::Duration");
    if scheduled_at <= now + lead {
        return Err(ModelError::InvalidScheduleTime(format!(
            "scheduledAt must be more than {} minutes in the future",
            MIN_SCHEDULE_LEAD.as_secs() / 60
        )));
    }
    Ok(())
}

/// Backoff before retry `n` (1-based): 30 s, 2 min, 8 min.
pub fn retry_backoff(retry_count: i32) -> Duration {
    let exponent = retry_count.clamp(1, MAX_RETRY) - 1;
    Duration::from_secs(30 * 4u64.pow(exponent as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_successors() {
        for status in [
            PostStatus::Completed,
            PostStatus::Failed,
            PostStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(PostStatus::Executing));
        }
    }

    #[test]
    fn pending_can_only_execute_or_cancel() {
        assert!(PostStatus::Pending.can_transition_to(PostStatus::Executing));
        assert!(PostStatus::Pending.can_transition_to(PostStatus::Cancelled));
        assert!(!PostStatus::Pending.can_transition_to(PostStatus::Completed));
        assert!(!PostStatus::Pending.can_transition_to(PostStatus::Failed));
    }

    #[test]
    fn executing_failure_reschedules_as_pending() {
        assert!(PostStatus::Executing.can_transition_to(PostStatus::Pending));
        assert!(PostStatus::Executing.can_transition_to(PostStatus::Failed));
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            PostStatus::Pending,
            PostStatus::Executing,
            PostStatus::Completed,
            PostStatus::Failed,
            PostStatus::Cancelled,
            PostStatus::Retrying,
        ] {
            assert_eq!(PostStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(PostStatus::parse("SCHEDULED").is_err());
    }

    #[test]
    fn content_bounds() {
        assert!(validate_content("").is_err());
        assert!(validate_content("hello").is_ok());
        // 300 multi-byte code points are fine; 301 are not.
        let exactly: String = "\u{00e9}".repeat(MAX_CONTENT_CODEPOINTS);
        assert!(validate_content(&exactly).is_ok());
        let over: String = "\u{00e9}".repeat(MAX_CONTENT_CODEPOINTS + 1);
        assert!(validate_content(&over).is_err());
    }

    #[test]
    fn schedule_lead_time_enforced() {
        let now = Utc::now();
        assert!(validate_schedule_time(now, now).is_err());
        assert!(
            validate_schedule_time(now + chrono::Duration::minutes(5), now).is_err()
        );
        assert!(
            validate_schedule_time(now + chrono::Duration::minutes(6), now).is_ok()
        );
    }

    #[test]
    fn backoff_schedule_is_base_four() {
        assert_eq!(retry_backoff(1), Duration::from_secs(30));
        assert_eq!(retry_backoff(2), Duration::from_secs(120));
        assert_eq!(retry_backoff(3), Duration::from_secs(480));
        // Clamped past the budget.
        assert_eq!(retry_backoff(10), Duration::from_secs(480));
    }
}
