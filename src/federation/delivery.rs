//! Activity delivery
//!
//! Durable per-recipient delivery queue. Every outbound activity becomes one
//! `delivery_tasks` row per recipient inbox; the scheduler signs and POSTs
//! due tasks in parallel, classifies the response and either finishes the
//! task or reschedules it with exponential backoff.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{JoinError, JoinSet};

use super::activity::Activity;
use super::actor::ActorDirectory;
use super::signature::sign_request;
use super::transport::Transport;
use crate::config::DeliveryConfig;
use crate::data::{Database, DeliveryAudience, DeliveryStats, DeliveryStatus, DeliveryTask};
use crate::error::AppError;
use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_DURATION_SECONDS, DELIVERY_QUEUE_DEPTH};

/// Where one copy of an activity goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecipient {
    /// Recipient actor IRI (absent for bare inbox targets)
    pub actor: Option<String>,
    pub inbox: String,
    pub audience: DeliveryAudience,
}

/// How one attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// Remote refused for good (4xx other than 429)
    Rejected,
    /// Worth retrying (429, 5xx, network error)
    Retryable,
}

impl AttemptOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Rejected => "rejected",
            Self::Retryable => "retryable",
        }
    }
}

/// Classify a response status; `None` means the request never completed.
pub fn classify(status: Option<u16>) -> AttemptOutcome {
    match status {
        Some(200..=299) => AttemptOutcome::Delivered,
        Some(429) => AttemptOutcome::Retryable,
        Some(400..=499) => AttemptOutcome::Rejected,
        Some(_) | None => AttemptOutcome::Retryable,
    }
}

/// Delay before the next attempt after `attempts` failures:
/// `min(base * 2^(attempts-1), max)`, without jitter.
pub fn backoff(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(30);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Add up to 10% random jitter
fn with_jitter(delay: Duration) -> Duration {
    let cap_ms = (delay.as_millis() / 10) as u64;
    let jitter_ms = rand::thread_rng().gen_range(0..=cap_ms);
    delay + Duration::from_millis(jitter_ms)
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
pub fn unique_inbox_targets(recipients: Vec<DeliveryRecipient>) -> Vec<DeliveryRecipient> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|recipient| seen.insert(recipient.inbox.clone()))
        .collect()
}

/// One pending task per unique recipient inbox
pub fn build_tasks(
    activity: &Activity,
    sender_handle: &str,
    recipients: Vec<DeliveryRecipient>,
) -> Vec<DeliveryTask> {
    let payload = activity.serialize();
    unique_inbox_targets(recipients)
        .into_iter()
        .map(|recipient| {
            DeliveryTask::new(
                &activity.id,
                sender_handle,
                recipient.actor.as_deref(),
                &recipient.inbox,
                recipient.audience,
                &payload,
            )
        })
        .collect()
}

/// Delivery engine
///
/// Cheap to clone; clones share the queue wakeup.
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    wakeup: Arc<Notify>,
    /// Concurrent inbox POSTs across every pass
    permits: Arc<Semaphore>,
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            db,
            directory,
            transport,
            config,
            wakeup: Arc::new(Notify::new()),
            permits,
        }
    }

    /// Queue an activity for every recipient inbox
    ///
    /// Returns how many new tasks were created; re-enqueueing the same
    /// activity for the same inbox is a no-op.
    pub async fn enqueue(
        &self,
        activity: &Activity,
        sender_handle: &str,
        recipients: Vec<DeliveryRecipient>,
    ) -> Result<usize, AppError> {
        let mut created = 0;
        for task in build_tasks(activity, sender_handle, recipients) {
            if self.db.insert_delivery_task(&task).await? {
                created += 1;
            }
        }

        if created > 0 {
            tracing::debug!(activity_id = %activity.id, tasks = created, "Queued delivery");
            self.wake();
        }
        Ok(created)
    }

    /// Signal the scheduler that new tasks are due
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    pub async fn stats(&self) -> Result<DeliveryStats, AppError> {
        self.db.delivery_stats().await
    }

    /// Scheduler loop; returns once `shutdown` flips to true
    ///
    /// Workers are reaped one at a time, so a slow inbox only holds its own
    /// permit while other due tasks keep being claimed. On shutdown no new
    /// tasks are claimed and in-flight attempts finish and record.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "Delivery scheduler started"
        );

        let mut workers = Workers::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(error) = self.dispatch_due(&mut workers).await {
                tracing::error!(error = %error, "Delivery pass failed");
            }

            // Busy workers wake us through `join_next`
            let busy = !workers.is_empty();
            let wait = if busy {
                self.config.poll_interval()
            } else {
                self.next_wait().await
            };

            tokio::select! {
                Some(joined) = workers.set.join_next(), if busy => {
                    workers.reap(joined);
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if !workers.is_empty() {
            tracing::info!(in_flight = workers.ids.len(), "Waiting for in-flight deliveries");
        }
        workers.drain().await;

        tracing::info!("Delivery scheduler stopped");
    }

    async fn next_wait(&self) -> Duration {
        let poll = self.config.poll_interval();
        match self.db.next_delivery_due().await {
            Ok(Some(due)) => due
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll),
            Ok(None) => poll,
            Err(error) => {
                tracing::warn!(error = %error, "Failed to read next delivery time");
                poll
            }
        }
    }

    /// One full pass: prune orphans, attempt every due task, record outcomes.
    ///
    /// Returns the number of tasks attempted once all of them have finished.
    pub async fn process_due(&self) -> Result<usize, AppError> {
        let mut workers = Workers::default();
        let attempted = self.dispatch_due(&mut workers).await?;
        workers.drain().await;

        let stats = self.db.delivery_stats().await?;
        DELIVERY_QUEUE_DEPTH.set(stats.pending);

        Ok(attempted)
    }

    /// Claim due tasks not already in flight and spawn a worker for each
    ///
    /// Pruning only runs while nothing is in flight, so a task being
    /// attempted is never deleted under its worker.
    async fn dispatch_due(&self, workers: &mut Workers) -> Result<usize, AppError> {
        if workers.is_empty() {
            let pruned = self
                .db
                .prune_orphaned_delivery_tasks(&self.directory.actor_iri_prefix())
                .await?;
            if pruned > 0 {
                tracing::info!(pruned, "Pruned orphaned delivery tasks");
            }
        }

        let batch = self.config.batch_size as usize;
        let room = batch.saturating_sub(workers.ids.len());
        if room == 0 {
            return Ok(0);
        }

        // In-flight tasks are still pending and due, so over-fetch by that many
        let tasks = self
            .db
            .due_delivery_tasks(Utc::now(), (room + workers.ids.len()) as i64)
            .await?;

        let mut spawned = 0;
        for task in tasks {
            if spawned == room {
                break;
            }
            if !workers.ids.insert(task.id.clone()) {
                continue;
            }

            let engine = self.clone();
            workers.set.spawn(async move {
                let task_id = task.id.clone();
                let permit = match engine.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(error) => {
                        tracing::error!(task_id = %task_id, error = %error, "Delivery semaphore closed");
                        return task_id;
                    }
                };

                match AssertUnwindSafe(engine.attempt(task)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::error!(task_id = %task_id, error = %error, "Failed to record delivery attempt")
                    }
                    Err(_) => tracing::error!(task_id = %task_id, "Delivery worker panicked"),
                }
                drop(permit);
                task_id
            });
            spawned += 1;
        }

        if spawned > 0 {
            let stats = self.db.delivery_stats().await?;
            DELIVERY_QUEUE_DEPTH.set(stats.pending);
        }

        Ok(spawned)
    }

    /// Sign and send one task, then record what happened
    async fn attempt(&self, task: DeliveryTask) -> Result<(), AppError> {
        let attempts = task.attempts + 1;
        let now = Utc::now();

        let sender = match self.db.get_local_actor(&task.sender_handle).await? {
            Some(sender) if sender.deleted_at.is_none() => sender,
            _ => {
                tracing::info!(task_id = %task.id, sender = %task.sender_handle, "Sender gone, abandoning delivery");
                return self
                    .db
                    .record_delivery_attempt(
                        &task.id,
                        task.attempts,
                        DeliveryStatus::Abandoned,
                        now,
                        None,
                        Some("sender no longer exists"),
                    )
                    .await;
            }
        };

        let body = task.payload.as_bytes().to_vec();
        let signed = match sign_request(
            "POST",
            &task.recipient_inbox,
            Some(&body),
            &sender.private_key_pem,
            &self.directory.key_id(&sender.handle),
        ) {
            Ok(signed) => signed,
            Err(error) => {
                tracing::error!(task_id = %task.id, error = %error, "Failed to sign delivery");
                return self
                    .db
                    .record_delivery_attempt(
                        &task.id,
                        attempts,
                        DeliveryStatus::Abandoned,
                        now,
                        None,
                        Some(&error.to_string()),
                    )
                    .await;
            }
        };

        let mut headers = signed.into_pairs();
        headers.push((
            "Content-Type".to_string(),
            "application/activity+json".to_string(),
        ));

        let started = Instant::now();
        let result = self
            .transport
            .post(&task.recipient_inbox, headers, body)
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        let (status_code, error) = match &result {
            Ok(response) => (Some(response.status), None),
            Err(error) => (None, Some(error.to_string())),
        };
        let outcome = classify(status_code);

        DELIVERY_ATTEMPTS_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[outcome.as_str()])
            .observe(elapsed);

        let (status, next_attempt_at) = match outcome {
            AttemptOutcome::Delivered => (DeliveryStatus::Delivered, now),
            AttemptOutcome::Rejected => (DeliveryStatus::Abandoned, now),
            AttemptOutcome::Retryable if attempts >= self.config.max_attempts as i64 => {
                (DeliveryStatus::Abandoned, now)
            }
            AttemptOutcome::Retryable => {
                let delay = with_jitter(backoff(
                    attempts as u32,
                    self.config.base_backoff(),
                    self.config.max_backoff(),
                ));
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                (DeliveryStatus::Pending, now + delay)
            }
        };

        match status {
            DeliveryStatus::Delivered => tracing::info!(
                activity_id = %task.activity_id,
                inbox = %task.recipient_inbox,
                attempts,
                "Delivered activity"
            ),
            DeliveryStatus::Abandoned => tracing::warn!(
                activity_id = %task.activity_id,
                inbox = %task.recipient_inbox,
                attempts,
                status = ?status_code,
                error = ?error,
                "Abandoned delivery"
            ),
            DeliveryStatus::Pending => tracing::info!(
                activity_id = %task.activity_id,
                inbox = %task.recipient_inbox,
                attempts,
                status = ?status_code,
                error = ?error,
                next_attempt_at = %next_attempt_at,
                "Delivery failed, will retry"
            ),
        }

        self.db
            .record_delivery_attempt(
                &task.id,
                attempts,
                status,
                next_attempt_at,
                status_code.map(i64::from),
                error.as_deref(),
            )
            .await
    }
}

/// Delivery attempts currently running, by task id
#[derive(Default)]
struct Workers {
    set: JoinSet<String>,
    ids: HashSet<String>,
}

impl Workers {
    fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    fn reap(&mut self, joined: Result<String, JoinError>) {
        match joined {
            Ok(task_id) => {
                self.ids.remove(&task_id);
            }
            // Workers are never aborted and catch their own panics
            Err(error) => tracing::error!(error = %error, "Delivery worker failed to join"),
        }
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.set.join_next().await {
            self.reap(joined);
        }
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalActorConfig;
    use crate::federation::activity::{ActivityBody, PUBLIC_COLLECTION};
    use crate::federation::key_cache::PublicKeyCache;
    use crate::federation::transport::{MockTransport, TransportResponse};
    use crate::test_support::{test_config, test_database};

    fn recipient(inbox: &str) -> DeliveryRecipient {
        DeliveryRecipient {
            actor: None,
            inbox: inbox.to_string(),
            audience: DeliveryAudience::Direct,
        }
    }

    fn follow_activity(id: &str) -> Activity {
        Activity {
            id: id.to_string(),
            actor: "https://a.example/users/alice".to_string(),
            published: Some(Utc::now()),
            to: vec![PUBLIC_COLLECTION.to_string()],
            cc: Vec::new(),
            body: ActivityBody::Follow {
                object: "https://b.example/users/bob".to_string(),
            },
        }
    }

    async fn engine(
        transport: MockTransport,
        max_attempts: u32,
    ) -> (tempfile::TempDir, Arc<Database>, DeliveryEngine) {
        engine_over(Arc::new(transport), max_attempts).await
    }

    async fn engine_over(
        transport: Arc<dyn Transport>,
        max_attempts: u32,
    ) -> (tempfile::TempDir, Arc<Database>, DeliveryEngine) {
        let (temp_dir, db) = test_database().await;
        let mut config = test_config("a.example");
        config.delivery.max_attempts = max_attempts;
        config.delivery.base_backoff_seconds = 0;

        let directory = Arc::new(ActorDirectory::new(
            &config,
            db.clone(),
            transport.clone(),
            Arc::new(PublicKeyCache::new(None)),
        ));
        directory
            .provision_local_actor(
                &LocalActorConfig {
                    handle: "alice".to_string(),
                    display_name: "Alice".to_string(),
                    bio: None,
                    avatar_url: None,
                },
                1024,
            )
            .await
            .unwrap();

        let engine = DeliveryEngine::new(db.clone(), directory, transport, config.delivery);
        (temp_dir, db, engine)
    }

    #[test]
    fn classify_follows_status_families() {
        assert_eq!(classify(Some(200)), AttemptOutcome::Delivered);
        assert_eq!(classify(Some(202)), AttemptOutcome::Delivered);
        assert_eq!(classify(Some(404)), AttemptOutcome::Rejected);
        assert_eq!(classify(Some(410)), AttemptOutcome::Rejected);
        assert_eq!(classify(Some(429)), AttemptOutcome::Retryable);
        assert_eq!(classify(Some(500)), AttemptOutcome::Retryable);
        assert_eq!(classify(Some(503)), AttemptOutcome::Retryable);
        assert_eq!(classify(None), AttemptOutcome::Retryable);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        assert_eq!(backoff(1, base, max), Duration::from_secs(30));
        assert_eq!(backoff(2, base, max), Duration::from_secs(60));
        assert_eq!(backoff(3, base, max), Duration::from_secs(120));
        assert_eq!(backoff(5, base, max), max);
        assert_eq!(backoff(64, base, max), max);

        let jittered = with_jitter(Duration::from_secs(100));
        assert!(jittered >= Duration::from_secs(100));
        assert!(jittered <= Duration::from_secs(110));
    }

    #[test]
    fn build_tasks_deduplicates_inboxes() {
        let tasks = build_tasks(
            &follow_activity("https://a.example/activities/1"),
            "alice",
            vec![
                recipient("https://b.example/inbox"),
                recipient("https://b.example/inbox"),
                recipient("https://c.example/users/cy/inbox"),
            ],
        );

        let inboxes: Vec<&str> = tasks.iter().map(|t| t.recipient_inbox.as_str()).collect();
        assert_eq!(
            inboxes,
            vec!["https://b.example/inbox", "https://c.example/users/cy/inbox"]
        );
        assert!(tasks.iter().all(|t| t.status == DeliveryStatus::Pending));
    }

    #[tokio::test]
    async fn one_failing_inbox_does_not_block_the_others() {
        let mut transport = MockTransport::new();
        transport.expect_post().returning(|url, headers, _| {
            assert!(headers.iter().any(|(name, _)| name == "Signature"));
            let status = if url.starts_with("https://down.example") { 500 } else { 202 };
            Ok(TransportResponse {
                status,
                body: Vec::new(),
            })
        });

        let (_temp_dir, db, engine) = engine(transport, 3).await;
        let activity = follow_activity("https://a.example/activities/independent");
        let created = engine
            .enqueue(
                &activity,
                "alice",
                vec![
                    recipient("https://b.example/users/bob/inbox"),
                    recipient("https://c.example/users/cy/inbox"),
                    recipient("https://down.example/users/dee/inbox"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(created, 3);

        for _ in 0..3 {
            engine.process_due().await.unwrap();
        }

        let tasks = db.delivery_tasks_for_activity(&activity.id).await.unwrap();
        for task in &tasks {
            if task.recipient_inbox.starts_with("https://down.example") {
                assert_eq!(task.status, DeliveryStatus::Abandoned);
                assert_eq!(task.attempts, 3);
                assert_eq!(task.last_status_code, Some(500));
            } else {
                assert_eq!(task.status, DeliveryStatus::Delivered);
                assert_eq!(task.attempts, 1);
            }
        }

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let mut transport = MockTransport::new();
        transport.expect_post().times(1).returning(|_, _, _| {
            Ok(TransportResponse {
                status: 403,
                body: Vec::new(),
            })
        });

        let (_temp_dir, db, engine) = engine(transport, 5).await;
        let activity = follow_activity("https://a.example/activities/rejected");
        engine
            .enqueue(&activity, "alice", vec![recipient("https://b.example/inbox")])
            .await
            .unwrap();

        engine.process_due().await.unwrap();
        engine.process_due().await.unwrap();

        let tasks = db.delivery_tasks_for_activity(&activity.id).await.unwrap();
        assert_eq!(tasks[0].status, DeliveryStatus::Abandoned);
        assert_eq!(tasks[0].attempts, 1);
    }

    #[tokio::test]
    async fn network_errors_are_retried_with_error_recorded() {
        let mut transport = MockTransport::new();
        transport
            .expect_post()
            .returning(|_, _, _| Err(AppError::Fetch("connection reset".to_string())));

        let (_temp_dir, db, engine) = engine(transport, 4).await;
        let activity = follow_activity("https://a.example/activities/flaky");
        engine
            .enqueue(&activity, "alice", vec![recipient("https://b.example/inbox")])
            .await
            .unwrap();

        engine.process_due().await.unwrap();

        let tasks = db.delivery_tasks_for_activity(&activity.id).await.unwrap();
        assert_eq!(tasks[0].status, DeliveryStatus::Pending);
        assert_eq!(tasks[0].attempts, 1);
        assert!(tasks[0].last_error.as_deref().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn tasks_of_deleted_sender_are_pruned() {
        let (_temp_dir, db, engine) = engine(MockTransport::new(), 3).await;
        let activity = follow_activity("https://a.example/activities/orphan");
        engine
            .enqueue(&activity, "alice", vec![recipient("https://b.example/inbox")])
            .await
            .unwrap();

        db.tombstone_local_actor("alice").await.unwrap();
        assert_eq!(engine.process_due().await.unwrap(), 0);
        assert!(db.delivery_tasks_for_activity(&activity.id).await.unwrap().is_empty());
    }

    /// Holds POSTs to `stalled.example` until released
    struct StallingTransport {
        release: Semaphore,
        posted: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Transport for StallingTransport {
        async fn get(&self, _url: &str, _accept: &str) -> Result<TransportResponse, AppError> {
            Ok(TransportResponse {
                status: 404,
                body: Vec::new(),
            })
        }

        async fn post(
            &self,
            url: &str,
            _headers: Vec<(String, String)>,
            _body: Vec<u8>,
        ) -> Result<TransportResponse, AppError> {
            self.posted.lock().unwrap().push(url.to_string());
            if url.starts_with("https://stalled.example") {
                let _ = self.release.acquire().await;
            }
            Ok(TransportResponse {
                status: 202,
                body: Vec::new(),
            })
        }
    }

    async fn wait_for_status(db: &Database, activity_id: &str, status: DeliveryStatus) -> bool {
        for _ in 0..100 {
            let tasks = db.delivery_tasks_for_activity(activity_id).await.unwrap();
            if !tasks.is_empty() && tasks.iter().all(|t| t.status == status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn stalled_inbox_does_not_hold_up_later_tasks() {
        let transport = Arc::new(StallingTransport {
            release: Semaphore::new(0),
            posted: std::sync::Mutex::new(Vec::new()),
        });
        let (_temp_dir, db, engine) = engine_over(transport.clone(), 3).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = tokio::spawn(engine.clone().run(shutdown_rx));

        let slow = follow_activity("https://a.example/activities/slow");
        engine
            .enqueue(&slow, "alice", vec![recipient("https://stalled.example/inbox")])
            .await
            .unwrap();
        for _ in 0..100 {
            if !transport.posted.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Queued while the first POST is still hanging
        let quick = follow_activity("https://a.example/activities/quick");
        engine
            .enqueue(&quick, "alice", vec![recipient("https://b.example/inbox")])
            .await
            .unwrap();
        assert!(wait_for_status(&db, &quick.id, DeliveryStatus::Delivered).await);
        assert_eq!(
            db.delivery_tasks_for_activity(&slow.id).await.unwrap()[0].status,
            DeliveryStatus::Pending
        );

        // Shutdown lets the in-flight attempt finish and record
        shutdown_tx.send(true).unwrap();
        transport.release.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), scheduler)
            .await
            .expect("scheduler should stop")
            .unwrap();
        assert_eq!(
            db.delivery_tasks_for_activity(&slow.id).await.unwrap()[0].status,
            DeliveryStatus::Delivered
        );
        assert_eq!(transport.posted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (_temp_dir, _db, engine) = engine(MockTransport::new(), 3).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(engine.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();
    }
}
