//! Per-post execution: claim, publish, record the outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skywrite_model::{
    MAX_RETRY, PostId, PostStatus, ScheduledPost, UserId, retry_backoff,
};

use crate::client::network::{PostRecord, RecordPublisher, RecordRef, ReplyRef};
use crate::error::{Error, Result};
use crate::store::PostRepository;

/// Reason stamped on thread members cancelled after an earlier member
/// failed.
pub const PARENT_FAILED: &str = "PARENT_FAILED";

/// Persistence capability the post service drives. Concrete over the
/// Postgres repository in production, mocked in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostStore: Send + Sync {
    async fn claim(&self, post_id: PostId) -> Result<bool>;
    async fn release_claim(&self, post_id: PostId) -> Result<()>;
    async fn mark_completed(
        &self,
        post_id: PostId,
        uri: &str,
        cid: &str,
        rkey: &str,
    ) -> Result<()>;
    async fn mark_retry(
        &self,
        post_id: PostId,
        retry_count: i32,
        error_msg: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()>;
    async fn mark_failed(
        &self,
        post_id: PostId,
        error_msg: &str,
        retry_count: Option<i32>,
    ) -> Result<()>;
    async fn cancel_thread_remainder(
        &self,
        thread_root_id: PostId,
        after_index: i32,
        reason: &str,
    ) -> Result<u64>;
    async fn thread_members(&self, thread_root_id: PostId) -> Result<Vec<ScheduledPost>>;
    async fn get(&self, post_id: PostId) -> Result<Option<ScheduledPost>>;
    async fn enable_next_in_thread(
        &self,
        thread_root_id: PostId,
        after_index: i32,
    ) -> Result<()>;
}

#[async_trait]
impl PostStore for PostRepository {
    async fn claim(&self, post_id: PostId) -> Result<bool> {
        PostRepository::claim(self, post_id).await
    }

    async fn release_claim(&self, post_id: PostId) -> Result<()> {
        PostRepository::release_claim(self, post_id).await
    }

    async fn mark_completed(
        &self,
        post_id: PostId,
        uri: &str,
        cid: &str,
        rkey: &str,
    ) -> Result<()> {
        PostRepository::mark_completed(self, post_id, uri, cid, rkey).await
    }

    async fn mark_retry(
        &self,
        post_id: PostId,
        retry_count: i32,
        error_msg: &str,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        PostRepository::mark_retry(self, post_id, retry_count, error_msg, not_before).await
    }

    async fn mark_failed(
        &self,
        post_id: PostId,
        error_msg: &str,
        retry_count: Option<i32>,
    ) -> Result<()> {
        PostRepository::mark_failed(self, post_id, error_msg, retry_count).await
    }

    async fn cancel_thread_remainder(
        &self,
        thread_root_id: PostId,
        after_index: i32,
        reason: &str,
    ) -> Result<u64> {
        PostRepository::cancel_thread_remainder(self, thread_root_id, after_index, reason)
            .await
    }

    async fn thread_members(&self, thread_root_id: PostId) -> Result<Vec<ScheduledPost>> {
        PostRepository::thread_members(self, thread_root_id).await
    }

    async fn get(&self, post_id: PostId) -> Result<Option<ScheduledPost>> {
        PostRepository::get(self, post_id).await
    }

    async fn enable_next_in_thread(
        &self,
        thread_root_id: PostId,
        after_index: i32,
    ) -> Result<()> {
        PostRepository::enable_next_in_thread(self, thread_root_id, after_index).await
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The record landed; the post is terminal.
    Completed,
    /// Transient failure inside the retry budget; the post went back to
    /// PENDING with an earliest-retry instant.
    Rescheduled,
    /// Terminal failure.
    Failed,
    /// The compare-and-set lost: another worker owns the post, or it was
    /// cancelled between the scan and the claim.
    AlreadyClaimed,
    /// Cancelled before the network write began; the claim was released.
    Cancelled,
    /// A thread walk: how many members were published this pass and how
    /// many were cancelled after a failure.
    Thread { published: usize, cancelled: u64 },
}

/// Translates a scheduled post into a single attempted publication.
pub struct PostService {
    store: Arc<dyn PostStore>,
    publisher: Arc<dyn RecordPublisher>,
    langs: Vec<String>,
}

impl std::fmt::Debug for PostService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostService").finish_non_exhaustive()
    }
}

impl PostService {
    pub fn new(
        store: Arc<dyn PostStore>,
        publisher: Arc<dyn RecordPublisher>,
        langs: Vec<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            langs,
        }
    }

    /// Execute a due post on behalf of `acting_user`.
    ///
    /// An acting user other than the post's owner is a fatal authorization
    /// error, never a retry.
    pub async fn execute(
        &self,
        post: &ScheduledPost,
        acting_user: UserId,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome> {
        if acting_user != post.user_id {
            return Err(Error::Forbidden(
                "acting user does not own this post".to_string(),
            ));
        }

        if post.is_thread_root {
            let root_id = post.thread_root_id.unwrap_or(post.id);
            let members = self.store.thread_members(root_id).await?;
            if members.len() > 1 {
                return self.execute_thread(root_id, members, cancel).await;
            }
        }

        let reply = match self.resolve_reply(post).await {
            Ok(reply) => reply,
            Err(err) => {
                // A missing or unpublished parent fails the child; there is
                // nothing to retry against.
                if !self.store.claim(post.id).await? {
                    return Ok(ExecuteOutcome::AlreadyClaimed);
                }
                self.store
                    .mark_failed(post.id, &err.to_string(), None)
                    .await?;
                return Ok(ExecuteOutcome::Failed);
            }
        };

        let (outcome, _) = self.execute_claimed(post, reply, cancel).await?;
        Ok(outcome)
    }

    /// Publish the members of a thread strictly in `(thread_index,
    /// created_at)` order, chaining each member's reply pointer to the
    /// record just created.
    async fn execute_thread(
        &self,
        root_id: PostId,
        members: Vec<ScheduledPost>,
        cancel: &CancellationToken,
    ) -> Result<ExecuteOutcome> {
        let mut published = 0usize;
        let mut root_ref: Option<RecordRef> = None;
        let mut parent_ref: Option<RecordRef> = None;

        for member in &members {
            match member.status {
                PostStatus::Completed => {
                    // Resuming a partially published thread.
                    if let Some(r) = record_ref_of(member) {
                        if root_ref.is_none() {
                            root_ref = Some(r.clone());
                        }
                        parent_ref = Some(r);
                    }
                    continue;
                }
                PostStatus::Failed | PostStatus::Cancelled => {
                    let cancelled = self
                        .store
                        .cancel_thread_remainder(root_id, member.thread_index, PARENT_FAILED)
                        .await?;
                    return Ok(ExecuteOutcome::Thread {
                        published,
                        cancelled,
                    });
                }
                PostStatus::Executing => break,
                PostStatus::Pending | PostStatus::Retrying => {}
            }

            // A member waiting out its retry backoff stops the walk; the
            // chain resumes when that member lands on its own.
            if member.not_before.is_some_and(|nb| nb > Utc::now()) {
                break;
            }

            let reply = parent_ref.as_ref().map(|parent| ReplyRef {
                root: root_ref.clone().unwrap_or_else(|| parent.clone()),
                parent: parent.clone(),
            });

            let (outcome, new_ref) = self.execute_claimed(member, reply, cancel).await?;
            match outcome {
                ExecuteOutcome::Completed => {
                    published += 1;
                    if root_ref.is_none() {
                        root_ref = new_ref.clone();
                    }
                    parent_ref = new_ref;
                }
                ExecuteOutcome::Failed => {
                    let cancelled = self
                        .store
                        .cancel_thread_remainder(root_id, member.thread_index, PARENT_FAILED)
                        .await?;
                    return Ok(ExecuteOutcome::Thread {
                        published,
                        cancelled,
                    });
                }
                // Retries apply to the member alone; later members wait.
                ExecuteOutcome::Rescheduled
                | ExecuteOutcome::AlreadyClaimed
                | ExecuteOutcome::Cancelled => break,
                ExecuteOutcome::Thread { .. } => unreachable!("nested thread walk"),
            }
        }

        Ok(ExecuteOutcome::Thread {
            published,
            cancelled: 0,
        })
    }

    /// Claim the post, publish it, and persist the outcome. Returns the
    /// published record reference for thread chaining.
    async fn execute_claimed(
        &self,
        post: &ScheduledPost,
        reply: Option<ReplyRef>,
        cancel: &CancellationToken,
    ) -> Result<(ExecuteOutcome, Option<RecordRef>)> {
        if !self.store.claim(post.id).await? {
            debug!(post = %post.id, "claim lost, skipping");
            return Ok((ExecuteOutcome::AlreadyClaimed, None));
        }

        if cancel.is_cancelled() {
            self.store.release_claim(post.id).await?;
            return Ok((ExecuteOutcome::Cancelled, None));
        }

        let record = PostRecord::new(post.content.clone(), self.langs.clone(), reply);
        match self.publisher.publish(post.user_id, record, cancel).await {
            Ok(published) => {
                self.store
                    .mark_completed(post.id, &published.uri, &published.cid, &published.rkey)
                    .await?;
                if let Some(root_id) = post.thread_root_id {
                    self.store
                        .enable_next_in_thread(root_id, post.thread_index)
                        .await?;
                }
                info!(post = %post.id, uri = %published.uri, "post published");
                Ok((
                    ExecuteOutcome::Completed,
                    Some(RecordRef {
                        uri: published.uri,
                        cid: published.cid,
                    }),
                ))
            }
            Err(Error::Cancelled) => {
                // Nothing went over the wire; hand the claim back so the
                // next scan re-attempts without spending retry budget.
                self.store.release_claim(post.id).await?;
                Ok((ExecuteOutcome::Cancelled, None))
            }
            Err(err) if err.is_retryable() => {
                let next_count = post.retry_count + 1;
                if next_count < MAX_RETRY {
                    let mut backoff = retry_backoff(next_count);
                    if let Error::RateLimited { retry_after } = &err {
                        backoff = backoff.max(*retry_after);
                    }
                    let not_before = Utc::now()
                        + chrono::Duration::from_std(backoff)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    self.store
                        .mark_retry(post.id, next_count, &err.to_string(), not_before)
                        .await?;
                    warn!(post = %post.id, retry = next_count, "transient failure, rescheduled");
                    Ok((ExecuteOutcome::Rescheduled, None))
                } else {
                    self.store
                        .mark_failed(post.id, &err.to_string(), Some(MAX_RETRY))
                        .await?;
                    warn!(post = %post.id, "retry budget exhausted");
                    Ok((ExecuteOutcome::Failed, None))
                }
            }
            Err(err) => {
                self.store
                    .mark_failed(post.id, &err.to_string(), None)
                    .await?;
                warn!(post = %post.id, error = %err, "permanent failure");
                Ok((ExecuteOutcome::Failed, None))
            }
        }
    }

    /// Build the reply pointers for an individually executed child post
    /// from its persisted parent and thread root.
    async fn resolve_reply(&self, post: &ScheduledPost) -> Result<Option<ReplyRef>> {
        let Some(parent_id) = post.parent_post_id else {
            return Ok(None);
        };

        let parent = self
            .store
            .get(parent_id)
            .await?
            .ok_or_else(|| Error::Permanent("parent post is missing".to_string()))?;
        if parent.user_id != post.user_id {
            return Err(Error::Permanent(
                "parent post belongs to another user".to_string(),
            ));
        }
        let parent_ref = record_ref_of(&parent).ok_or_else(|| {
            Error::Permanent("parent post has not been published".to_string())
        })?;

        let root_ref = match post.thread_root_id {
            Some(root_id) if root_id != parent.id => {
                let root = self
                    .store
                    .get(root_id)
                    .await?
                    .ok_or_else(|| Error::Permanent("thread root is missing".to_string()))?;
                record_ref_of(&root).ok_or_else(|| {
                    Error::Permanent("thread root has not been published".to_string())
                })?
            }
            _ => parent_ref.clone(),
        };

        Ok(Some(ReplyRef {
            root: root_ref,
            parent: parent_ref,
        }))
    }
}

fn record_ref_of(post: &ScheduledPost) -> Option<RecordRef> {
    match (&post.bluesky_uri, &post.bluesky_cid) {
        (Some(uri), Some(cid)) => Some(RecordRef {
            uri: uri.clone(),
            cid: cid.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::network::{MockRecordPublisher, PublishedRecord};
    use mockall::predicate::{always, eq};
    use std::time::Duration;

    fn pending_post(user: UserId) -> ScheduledPost {
        let now = Utc::now();
        ScheduledPost {
            id: PostId::new(),
            user_id: user,
            content: "hello".to_string(),
            scheduled_at: now - chrono::Duration::seconds(1),
            status: PostStatus::Pending,
            created_at: now - chrono::Duration::minutes(10),
            updated_at: now - chrono::Duration::minutes(10),
            executed_at: None,
            error_msg: None,
            retry_count: 0,
            not_before: None,
            bluesky_uri: None,
            bluesky_cid: None,
            bluesky_rkey: None,
            parent_post_id: None,
            thread_root_id: None,
            thread_index: 0,
            is_thread_root: false,
            can_execute: true,
            is_deleted: false,
        }
    }

    fn published(rkey: &str) -> PublishedRecord {
        PublishedRecord {
            uri: format!("at://did:plc:alice/app.bsky.feed.post/{rkey}"),
            cid: format!("cid-{rkey}"),
            rkey: rkey.to_string(),
        }
    }

    fn service(
        store: MockPostStore,
        publisher: MockRecordPublisher,
    ) -> PostService {
        PostService::new(
            Arc::new(store),
            Arc::new(publisher),
            vec!["en".to_string()],
        )
    }

    #[tokio::test]
    async fn successful_publish_completes_the_post() {
        let user = UserId::new();
        let post = pending_post(user);
        let post_id = post.id;

        let mut store = MockPostStore::new();
        store
            .expect_claim()
            .with(eq(post_id))
            .once()
            .returning(|_| Ok(true));
        store
            .expect_mark_completed()
            .withf(move |id, uri, cid, rkey| {
                *id == post_id
                    && uri.ends_with("/rkey1")
                    && cid == "cid-rkey1"
                    && rkey == "rkey1"
            })
            .once()
            .returning(|_, _, _, _| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        publisher
            .expect_publish()
            .once()
            .returning(|_, _, _| Ok(published("rkey1")));

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::Completed);
    }

    #[tokio::test]
    async fn lost_claim_skips_without_publishing() {
        let user = UserId::new();
        let post = pending_post(user);

        let mut store = MockPostStore::new();
        store.expect_claim().once().returning(|_| Ok(false));
        let mut publisher = MockRecordPublisher::new();
        publisher.expect_publish().never();

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn wrong_owner_is_fatal_before_any_claim() {
        let post = pending_post(UserId::new());
        let mut store = MockPostStore::new();
        store.expect_claim().never();
        let publisher = MockRecordPublisher::new();

        let err = service(store, publisher)
            .execute(&post, UserId::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn transient_failure_reschedules_with_backoff() {
        let user = UserId::new();
        let post = pending_post(user);
        let post_id = post.id;

        let mut store = MockPostStore::new();
        store.expect_claim().once().returning(|_| Ok(true));
        store
            .expect_mark_retry()
            .withf(move |id, count, msg, not_before| {
                *id == post_id
                    && *count == 1
                    && msg.contains("503")
                    && *not_before > Utc::now() + chrono::Duration::seconds(25)
            })
            .once()
            .returning(|_, _, _, _| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        publisher
            .expect_publish()
            .once()
            .returning(|_, _, _| Err(Error::Transient("503 Service Unavailable".into())));

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::Rescheduled);
    }

    #[tokio::test]
    async fn rate_limit_retry_after_extends_backoff() {
        let user = UserId::new();
        let post = pending_post(user);

        let mut store = MockPostStore::new();
        store.expect_claim().once().returning(|_| Ok(true));
        store
            .expect_mark_retry()
            .withf(|_, _, _, not_before| {
                // Retry-After of ten minutes beats the 30 s schedule.
                *not_before > Utc::now() + chrono::Duration::minutes(9)
            })
            .once()
            .returning(|_, _, _, _| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        publisher.expect_publish().once().returning(|_, _, _| {
            Err(Error::RateLimited {
                retry_after: Duration::from_secs(600),
            })
        });

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::Rescheduled);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_fails_terminally() {
        let user = UserId::new();
        let mut post = pending_post(user);
        post.retry_count = 2;

        let mut store = MockPostStore::new();
        store.expect_claim().once().returning(|_| Ok(true));
        store
            .expect_mark_failed()
            .withf(|_, msg, count| msg.contains("503") && *count == Some(MAX_RETRY))
            .once()
            .returning(|_, _, _| Ok(()));
        store.expect_mark_retry().never();

        let mut publisher = MockRecordPublisher::new();
        publisher
            .expect_publish()
            .once()
            .returning(|_, _, _| Err(Error::Transient("503".into())));

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::Failed);
    }

    #[tokio::test]
    async fn permanent_failure_does_not_touch_retry_budget() {
        let user = UserId::new();
        let post = pending_post(user);

        let mut store = MockPostStore::new();
        store.expect_claim().once().returning(|_| Ok(true));
        store
            .expect_mark_failed()
            .withf(|_, _, count| count.is_none())
            .once()
            .returning(|_, _, _| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        publisher
            .expect_publish()
            .once()
            .returning(|_, _, _| Err(Error::Permanent("400 InvalidRequest".into())));

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::Failed);
    }

    #[tokio::test]
    async fn cancellation_before_send_releases_the_claim() {
        let user = UserId::new();
        let post = pending_post(user);
        let post_id = post.id;

        let mut store = MockPostStore::new();
        store.expect_claim().once().returning(|_| Ok(true));
        store
            .expect_release_claim()
            .with(eq(post_id))
            .once()
            .returning(|_| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        publisher
            .expect_publish()
            .once()
            .returning(|_, _, _| Err(Error::Cancelled));

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::Cancelled);
    }

    #[tokio::test]
    async fn missing_parent_fails_the_child() {
        let user = UserId::new();
        let mut post = pending_post(user);
        let parent_id = PostId::new();
        post.parent_post_id = Some(parent_id);

        let mut store = MockPostStore::new();
        store
            .expect_get()
            .with(eq(parent_id))
            .once()
            .returning(|_| Ok(None));
        store.expect_claim().once().returning(|_| Ok(true));
        store
            .expect_mark_failed()
            .withf(|_, msg, _| msg.contains("parent"))
            .once()
            .returning(|_, _, _| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        publisher.expect_publish().never();

        let outcome = service(store, publisher)
            .execute(&post, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ExecuteOutcome::Failed);
    }

    fn thread_member(
        user: UserId,
        root_id: PostId,
        index: i32,
        is_root: bool,
    ) -> ScheduledPost {
        let mut post = pending_post(user);
        if is_root {
            post.id = root_id;
        }
        post.thread_root_id = Some(root_id);
        post.thread_index = index;
        post.is_thread_root = is_root;
        post.can_execute = is_root;
        post.content = format!("thread part {index}");
        post
    }

    #[tokio::test]
    async fn thread_publishes_in_order_and_chains_reply_refs() {
        let user = UserId::new();
        let root_id = PostId::new();
        let root = thread_member(user, root_id, 0, true);
        let child1 = thread_member(user, root_id, 1, false);
        let child2 = thread_member(user, root_id, 2, false);
        let members = vec![root.clone(), child1.clone(), child2.clone()];

        let mut store = MockPostStore::new();
        store
            .expect_thread_members()
            .with(eq(root_id))
            .once()
            .returning(move |_| Ok(members.clone()));
        store.expect_claim().times(3).returning(|_| Ok(true));
        store
            .expect_mark_completed()
            .times(3)
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_enable_next_in_thread()
            .times(3)
            .returning(|_, _| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        let mut call = 0;
        publisher
            .expect_publish()
            .times(3)
            .with(eq(user), always(), always())
            .returning(move |_, record, _| {
                call += 1;
                match call {
                    1 => {
                        assert!(record.reply.is_none());
                        Ok(published("r0"))
                    }
                    2 => {
                        let reply = record.reply.expect("child carries reply");
                        assert!(reply.parent.uri.ends_with("/r0"));
                        assert!(reply.root.uri.ends_with("/r0"));
                        Ok(published("r1"))
                    }
                    _ => {
                        let reply = record.reply.expect("child carries reply");
                        assert!(reply.parent.uri.ends_with("/r1"));
                        assert!(reply.root.uri.ends_with("/r0"));
                        Ok(published("r2"))
                    }
                }
            });

        let outcome = service(store, publisher)
            .execute(&root, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecuteOutcome::Thread {
                published: 3,
                cancelled: 0
            }
        );
    }

    #[tokio::test]
    async fn thread_failure_cancels_later_members() {
        let user = UserId::new();
        let root_id = PostId::new();
        let root = thread_member(user, root_id, 0, true);
        let child1 = thread_member(user, root_id, 1, false);
        let child2 = thread_member(user, root_id, 2, false);
        let members = vec![root.clone(), child1, child2];

        let mut store = MockPostStore::new();
        store
            .expect_thread_members()
            .once()
            .returning(move |_| Ok(members.clone()));
        store.expect_claim().times(2).returning(|_| Ok(true));
        store
            .expect_mark_completed()
            .once()
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_enable_next_in_thread()
            .once()
            .returning(|_, _| Ok(()));
        store
            .expect_mark_failed()
            .once()
            .returning(|_, _, _| Ok(()));
        store
            .expect_cancel_thread_remainder()
            .with(eq(root_id), eq(1), eq(PARENT_FAILED))
            .once()
            .returning(|_, _, _| Ok(1));

        let mut publisher = MockRecordPublisher::new();
        let mut call = 0;
        publisher.expect_publish().times(2).returning(move |_, _, _| {
            call += 1;
            if call == 1 {
                Ok(published("r0"))
            } else {
                Err(Error::Permanent("400 InvalidRequest".into()))
            }
        });

        let outcome = service(store, publisher)
            .execute(&root, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecuteOutcome::Thread {
                published: 1,
                cancelled: 1
            }
        );
    }

    #[tokio::test]
    async fn thread_resumes_past_completed_members() {
        let user = UserId::new();
        let root_id = PostId::new();
        let mut root = thread_member(user, root_id, 0, true);
        root.status = PostStatus::Completed;
        root.bluesky_uri = Some("at://did:plc:alice/app.bsky.feed.post/r0".into());
        root.bluesky_cid = Some("cid-r0".into());
        root.executed_at = Some(Utc::now());
        let child = thread_member(user, root_id, 1, false);
        let members = vec![root.clone(), child.clone()];

        let mut store = MockPostStore::new();
        store
            .expect_thread_members()
            .once()
            .returning(move |_| Ok(members.clone()));
        store.expect_claim().once().returning(|_| Ok(true));
        store
            .expect_mark_completed()
            .once()
            .returning(|_, _, _, _| Ok(()));
        store
            .expect_enable_next_in_thread()
            .once()
            .returning(|_, _| Ok(()));

        let mut publisher = MockRecordPublisher::new();
        publisher.expect_publish().once().returning(|_, record, _| {
            let reply = record.reply.expect("resumed child replies to root");
            assert!(reply.parent.uri.ends_with("/r0"));
            Ok(published("r1"))
        });

        let outcome = service(store, publisher)
            .execute(&root, user, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExecuteOutcome::Thread {
                published: 1,
                cancelled: 0
            }
        );
    }
}
