//! Periodic discovery and execution of due posts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skywrite_model::PostStatus;

use crate::auth::state::AuthStateStore;
use crate::error::Result;
use crate::scheduler::post_service::PostService;
use crate::store::{AuditEvent, AuditRepository, PostRepository, TokenStore};

/// Dispatcher tuning. Defaults follow the published operating profile:
/// a 60 s scan, batches of 100 split into concurrent sub-batches of 10,
/// and a 10 minute watchdog for stuck executions.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub interval: Duration,
    pub batch_size: i64,
    pub sub_batch_size: usize,
    pub inter_batch_pause: Duration,
    pub stalled_after: chrono::Duration,
    pub health_check_interval: Duration,
    pub maintenance_hour: u32,
    pub shutdown_deadline: Duration,
    pub completed_retention: chrono::Duration,
    pub failed_retention: chrono::Duration,
    pub failure_record_retention: chrono::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
            sub_batch_size: 10,
            inter_batch_pause: Duration::from_secs(1),
            stalled_after: chrono::Duration::minutes(10),
            health_check_interval: Duration::from_secs(30 * 60),
            maintenance_hour: 3,
            shutdown_deadline: Duration::from_secs(30),
            completed_retention: chrono::Duration::days(30),
            failed_retention: chrono::Duration::days(7),
            failure_record_retention: chrono::Duration::days(90),
        }
    }
}

/// Liveness snapshot for the health endpoint.
#[derive(Debug, Clone)]
pub struct DispatcherHealth {
    pub tick_task_alive: bool,
    pub tick_in_progress: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
}

/// Single-process scheduler driving the post service.
///
/// Intended to run as one logical instance. When several instances run
/// anyway, the claim CAS in the post service keeps publication at-most-once
/// at the cost of wasted scans.
pub struct Dispatcher {
    posts: Arc<PostRepository>,
    service: Arc<PostService>,
    tokens: Arc<TokenStore>,
    states: Arc<AuthStateStore>,
    audit: AuditRepository,
    config: DispatcherConfig,
    cancel: CancellationToken,
    is_running: AtomicBool,
    last_tick_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    tick_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("interval", &self.config.interval)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        posts: Arc<PostRepository>,
        service: Arc<PostService>,
        tokens: Arc<TokenStore>,
        states: Arc<AuthStateStore>,
        audit: AuditRepository,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            posts,
            service,
            tokens,
            states,
            audit,
            config,
            cancel: CancellationToken::new(),
            is_running: AtomicBool::new(false),
            last_tick_at: std::sync::Mutex::new(None),
            tick_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the tick loop plus its health watchdog and the daily
    /// maintenance task.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.tick_task.lock().await;
        if guard.is_some() {
            warn!("dispatcher already started");
            return;
        }
        *guard = Some(self.clone().spawn_tick_loop());
        drop(guard);

        let health = self.clone();
        tokio::spawn(async move { health.run_health_loop().await });

        let maintenance = self.clone();
        tokio::spawn(async move { maintenance.run_maintenance_loop().await });

        info!(interval = ?self.config.interval, "dispatcher started");
    }

    fn spawn_tick_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let sleeper = sleep(self.config.interval);
            tokio::pin!(sleeper);

            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = &mut sleeper => {
                        self.tick().await;
                        sleeper.as_mut().reset(Instant::now() + self.config.interval);
                    }
                }
            }
            info!("dispatcher tick loop stopped");
        })
    }

    /// One scan: reclaim stalled work, find due posts, execute them in
    /// concurrent sub-batches with a pause between batches to smooth rate
    /// pressure. Per-post errors never abort the batch.
    pub async fn tick(&self) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("previous tick still running, skipping");
            return;
        }
        let started = Instant::now();
        *self.last_tick_at.lock().expect("tick clock poisoned") = Some(Utc::now());

        if let Err(err) = self.tick_inner().await {
            error!(error = %err, "tick failed");
        }

        let elapsed = started.elapsed();
        let soft_deadline = self
            .config
            .interval
            .saturating_sub(Duration::from_secs(5));
        if elapsed > soft_deadline {
            warn!(?elapsed, "tick overran its soft deadline");
        }
        self.is_running.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) -> Result<()> {
        let reclaimed = self.posts.reclaim_stalled(self.config.stalled_after).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "reverted stalled executions to pending");
        }

        let due = self.posts.due_batch(self.config.batch_size).await?;
        if due.is_empty() {
            debug!("no due posts");
            return Ok(());
        }
        info!(count = due.len(), "executing due posts");

        let mut chunks = due.chunks(self.config.sub_batch_size).peekable();
        while let Some(chunk) = chunks.next() {
            if self.cancel.is_cancelled() {
                break;
            }

            let executions = chunk.iter().map(|post| {
                let service = self.service.clone();
                let cancel = self.cancel.clone();
                async move {
                    match service.execute(post, post.user_id, &cancel).await {
                        Ok(outcome) => {
                            debug!(post = %post.id, ?outcome, "post executed");
                        }
                        Err(err) => {
                            // Already recorded against the post; isolation
                            // only.
                            error!(post = %post.id, error = %err, "post execution errored");
                        }
                    }
                }
            });
            futures::future::join_all(executions).await;

            if chunks.peek().is_some() {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    () = sleep(self.config.inter_batch_pause) => {}
                }
            }
        }
        Ok(())
    }

    /// Watchdog: every half hour, make sure the tick task is still
    /// scheduled; restart it if it died.
    async fn run_health_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = sleep(self.config.health_check_interval) => {}
            }

            let mut guard = self.tick_task.lock().await;
            let alive = guard.as_ref().is_some_and(|task| !task.is_finished());
            if !alive && !self.cancel.is_cancelled() {
                error!("tick task died, restarting");
                *guard = Some(self.clone().spawn_tick_loop());
            }
        }
    }

    /// Daily maintenance: purge expired sessions, archive old terminal
    /// posts, trim failure records, and sweep the OAuth state map.
    async fn run_maintenance_loop(self: Arc<Self>) {
        loop {
            let wait = until_next_daily(self.config.maintenance_hour);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = sleep(wait) => {}
            }
            if let Err(err) = self.run_maintenance().await {
                error!(error = %err, "maintenance failed");
            }
        }
    }

    pub async fn run_maintenance(&self) -> Result<()> {
        let now = Utc::now();

        let purged = self.tokens.purge_expired().await?;
        let completed = self
            .posts
            .archive_terminal_before(
                PostStatus::Completed,
                now - self.config.completed_retention,
            )
            .await?;
        let failed = self
            .posts
            .archive_terminal_before(PostStatus::Failed, now - self.config.failed_retention)
            .await?;
        let failures = self
            .posts
            .purge_failure_records_before(now - self.config.failure_record_retention)
            .await?;
        let swept = self.states.sweep_expired();

        if completed + failed > 0 {
            self.audit
                .record(
                    AuditEvent::PostsArchived,
                    None,
                    None,
                    &format!("{completed} completed and {failed} failed posts archived"),
                )
                .await?;
        }

        info!(
            purged_sessions = purged,
            archived_completed = completed,
            archived_failed = failed,
            purged_failure_records = failures,
            swept_states = swept,
            "maintenance complete"
        );
        Ok(())
    }

    pub fn health(&self) -> DispatcherHealth {
        DispatcherHealth {
            tick_task_alive: self
                .tick_task
                .try_lock()
                .map(|guard| guard.as_ref().is_some_and(|task| !task.is_finished()))
                .unwrap_or(true),
            tick_in_progress: self.is_running.load(Ordering::SeqCst),
            last_tick_at: *self.last_tick_at.lock().expect("tick clock poisoned"),
        }
    }

    /// Stop the tick loop, wait for an in-flight tick to drain within the
    /// shutdown deadline, then abort whatever remains.
    pub async fn shutdown(&self) {
        info!("dispatcher shutting down");
        self.cancel.cancel();

        let task = self.tick_task.lock().await.take();
        if let Some(task) = task {
            match tokio::time::timeout(self.config.shutdown_deadline, task).await {
                Ok(_) => info!("dispatcher drained"),
                Err(_) => warn!("shutdown deadline passed with a tick in flight"),
            }
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Time until the next local occurrence of `hour`:00.
fn until_next_daily(hour: u32) -> Duration {
    let now = chrono::Local::now();
    let target_today = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("valid maintenance hour");
    let target = if now.naive_local() < target_today {
        target_today
    } else {
        target_today + chrono::Duration::days(1)
    };
    (target - now.naive_local())
        .to_std()
        .unwrap_or(Duration::from_secs(60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_daily_run_is_within_a_day() {
        let wait = until_next_daily(3);
        assert!(wait <= Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn default_profile_matches_operating_contract() {
        let config = DispatcherConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.sub_batch_size, 10);
        assert_eq!(config.stalled_after, chrono::Duration::minutes(10));
        assert_eq!(config.shutdown_deadline, Duration::from_secs(30));
    }
}
