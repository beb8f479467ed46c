//! Lock release notifications.
//!
//! Waiters blocked on a held lock subscribe to the resource they want and are
//! woken when its holder publishes a release. Every process keeps one wait queue
//! per resource id, so a release only wakes the waiters of that resource.
//!
//! [`LocalNotifier`] delivers releases inside one process. [`PgNotifier`] carries
//! them across processes over PostgreSQL `LISTEN/NOTIFY` and fans each payload
//! out to the matching local queue.

use crate::error::{MetadataError, MetadataResult};
use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// PostgreSQL channel carrying released resource ids as payloads.
pub const LOCK_RELEASE_CHANNEL: &str = "ferry_lock_release";

/// Delay before retrying after the listener connection errors out.
const LISTENER_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Publishes and delivers lock release notifications.
#[async_trait]
pub trait LockNotifier: Send + Sync + 'static {
    /// Register interest in releases of `resource_id`.
    ///
    /// Releases published after this call are never missed by the returned
    /// subscription, so subscribe *before* checking whether the lock is free.
    fn subscribe(&self, resource_id: &str) -> LockSubscription;

    /// Announce that `resource_id` was released.
    async fn publish(&self, resource_id: &str) -> MetadataResult<()>;

    /// Name used in logs.
    fn notifier_name(&self) -> &'static str;
}

struct QueueEntry {
    generation: watch::Sender<u64>,
    subscribers: usize,
}

/// Per-resource wait queues shared by the notifiers of one process.
#[derive(Default)]
pub struct WaitQueues {
    queues: Mutex<HashMap<String, QueueEntry>>,
}

impl WaitQueues {
    /// Create an empty set of wait queues.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn subscribe(self: &Arc<Self>, resource_id: &str) -> LockSubscription {
        let mut queues = self.lock_queues();
        let entry = queues
            .entry(resource_id.to_string())
            .or_insert_with(|| QueueEntry {
                generation: watch::channel(0).0,
                subscribers: 0,
            });
        entry.subscribers += 1;
        LockSubscription {
            queues: Arc::clone(self),
            resource_id: resource_id.to_string(),
            receiver: entry.generation.subscribe(),
        }
    }

    /// Wake every waiter of `resource_id`. Returns `false` if nobody was waiting.
    pub fn wake(&self, resource_id: &str) -> bool {
        let queues = self.lock_queues();
        match queues.get(resource_id) {
            Some(entry) => {
                entry.generation.send_modify(|g| *g = g.wrapping_add(1));
                true
            }
            None => false,
        }
    }

    /// Wake every waiter of every resource, e.g. after notifications may have been lost.
    pub fn wake_all(&self) {
        let queues = self.lock_queues();
        for entry in queues.values() {
            entry.generation.send_modify(|g| *g = g.wrapping_add(1));
        }
    }

    /// Number of resources with at least one subscriber.
    pub fn waiting_resources(&self) -> usize {
        self.lock_queues().len()
    }

    fn unsubscribe(&self, resource_id: &str) {
        let mut queues = self.lock_queues();
        if let Some(entry) = queues.get_mut(resource_id) {
            entry.subscribers -= 1;
            if entry.subscribers == 0 {
                queues.remove(resource_id);
            }
        }
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueEntry>> {
        // The map is never left half-updated, so a poisoned guard is still usable.
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Interest in the release of one resource. Unregisters itself on drop.
pub struct LockSubscription {
    queues: Arc<WaitQueues>,
    resource_id: String,
    receiver: watch::Receiver<u64>,
}

impl LockSubscription {
    /// Wait for the next release published since the subscription was created
    /// or since the previous `released()` returned.
    pub async fn released(&mut self) {
        // The sender lives in the queue entry, which this subscription keeps alive.
        let _ = self.receiver.changed().await;
    }

    /// Resource this subscription waits on.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }
}

impl std::fmt::Debug for LockSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSubscription")
            .field("resource_id", &self.resource_id)
            .finish_non_exhaustive()
    }
}

impl Drop for LockSubscription {
    fn drop(&mut self) {
        self.queues.unsubscribe(&self.resource_id);
    }
}

/// In-process notifier. Correct only when every contender runs in this process.
#[derive(Clone, Default)]
pub struct LocalNotifier {
    queues: Arc<WaitQueues>,
}

impl LocalNotifier {
    /// Create a notifier with its own wait queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Access the underlying wait queues.
    pub fn queues(&self) -> &Arc<WaitQueues> {
        &self.queues
    }
}

#[async_trait]
impl LockNotifier for LocalNotifier {
    fn subscribe(&self, resource_id: &str) -> LockSubscription {
        self.queues.subscribe(resource_id)
    }

    async fn publish(&self, resource_id: &str) -> MetadataResult<()> {
        self.queues.wake(resource_id);
        Ok(())
    }

    fn notifier_name(&self) -> &'static str {
        "local"
    }
}

/// Cross-process notifier built on PostgreSQL `LISTEN/NOTIFY`.
pub struct PgNotifier {
    pool: Pool<Postgres>,
    queues: Arc<WaitQueues>,
    listener_task: JoinHandle<()>,
}

impl PgNotifier {
    /// Start listening on [`LOCK_RELEASE_CHANNEL`] and dispatching to local wait queues.
    pub async fn start(pool: Pool<Postgres>) -> MetadataResult<Self> {
        let mut listener = PgListener::connect_with(&pool).await?;
        listener
            .listen(LOCK_RELEASE_CHANNEL)
            .await
            .map_err(|e| MetadataError::Notify(format!("failed to LISTEN: {e}")))?;

        let queues = WaitQueues::new();
        let dispatch = Arc::clone(&queues);
        let listener_task = tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        dispatch.wake(notification.payload());
                    }
                    Ok(None) => {
                        // Releases sent while disconnected are gone; let every waiter re-check.
                        tracing::warn!("Lock notification connection lost, waking all waiters");
                        dispatch.wake_all();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Lock notification listener error");
                        dispatch.wake_all();
                        tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                    }
                }
            }
        });

        tracing::info!(
            channel = LOCK_RELEASE_CHANNEL,
            "Listening for lock release notifications"
        );

        Ok(Self {
            pool,
            queues,
            listener_task,
        })
    }
}

#[async_trait]
impl LockNotifier for PgNotifier {
    fn subscribe(&self, resource_id: &str) -> LockSubscription {
        self.queues.subscribe(resource_id)
    }

    async fn publish(&self, resource_id: &str) -> MetadataResult<()> {
        // Local waiters do not need the round trip through the server.
        self.queues.wake(resource_id);

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(LOCK_RELEASE_CHANNEL)
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn notifier_name(&self) -> &'static str {
        "postgres"
    }
}

impl Drop for PgNotifier {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_wakes_subscriber() {
        let notifier = LocalNotifier::new();
        let mut sub = notifier.subscribe("upload-a");

        notifier.publish("upload-a").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), sub.released())
            .await
            .expect("subscriber should be woken");
    }

    #[tokio::test]
    async fn test_release_before_wait_is_not_lost() {
        let notifier = LocalNotifier::new();
        let mut sub = notifier.subscribe("upload-a");

        // Published between subscribe and wait: must still be observed.
        notifier.publish("upload-a").await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::timeout(Duration::from_millis(100), sub.released())
            .await
            .expect("release published before waiting should not be lost");
    }

    #[tokio::test]
    async fn test_publish_only_wakes_matching_resource() {
        let notifier = LocalNotifier::new();
        let mut other = notifier.subscribe("upload-b");

        notifier.publish("upload-a").await.unwrap();

        let woke = tokio::time::timeout(Duration::from_millis(50), other.released()).await;
        assert!(woke.is_err(), "waiter on another resource must stay asleep");
    }

    #[tokio::test]
    async fn test_queue_removed_when_last_subscriber_drops() {
        let notifier = LocalNotifier::new();
        let a = notifier.subscribe("upload-a");
        let b = notifier.subscribe("upload-a");
        assert_eq!(notifier.queues().waiting_resources(), 1);

        drop(a);
        assert_eq!(notifier.queues().waiting_resources(), 1);
        drop(b);
        assert_eq!(notifier.queues().waiting_resources(), 0);
        assert!(!notifier.queues().wake("upload-a"));
    }

    #[tokio::test]
    async fn test_wake_all_reaches_every_queue() {
        let queues = WaitQueues::new();
        let mut a = queues.subscribe("upload-a");
        let mut b = queues.subscribe("upload-b");

        queues.wake_all();

        tokio::time::timeout(Duration::from_secs(1), async {
            a.released().await;
            b.released().await;
        })
        .await
        .expect("all waiters should be woken");
    }
}
