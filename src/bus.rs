//! In-process coordination bus.
//!
//! Plays the role the deployment's shared key-value store plays between the
//! subsystems: a list queue with blocking pop (order hand-off to the
//! execution pool), pattern-subscribed topics (outcome and payment pushes),
//! set-if-absent keys with TTL (webhook dedup) and a sorted set (leaderboard
//! score accumulation).

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

/// Message delivered to a topic subscriber.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: String,
}

struct QueueState {
    items: VecDeque<String>,
    expires_at: Option<Instant>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            expires_at: None,
            notify: Arc::new(Notify::new()),
        }
    }

    fn prune(&mut self) {
        if let Some(deadline) = self.expires_at {
            if Instant::now() >= deadline {
                self.items.clear();
                self.expires_at = None;
            }
        }
    }
}

struct TopicSubscription {
    id: u64,
    pattern: String,
    tx: mpsc::UnboundedSender<TopicMessage>,
}

#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    queues: Mutex<HashMap<String, QueueState>>,
    subs: RwLock<Vec<TopicSubscription>>,
    dedup: Mutex<HashMap<String, Instant>>,
    zsets: Mutex<HashMap<String, HashMap<String, f64>>>,
    next_sub_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                queues: Mutex::new(HashMap::new()),
                subs: RwLock::new(Vec::new()),
                dedup: Mutex::new(HashMap::new()),
                zsets: Mutex::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
            }),
        }
    }

    /// Right-push a payload onto a list queue.
    pub fn rpush(&self, queue: &str, payload: String) {
        let mut queues = self.inner.queues.lock();
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new);
        state.prune();
        state.items.push_back(payload);
        state.notify.notify_one();
    }

    /// Arm (or refresh) a queue TTL. Guards against unbounded growth if the
    /// consumer dies and the queue is abandoned.
    pub fn expire_queue(&self, queue: &str, ttl: Duration) {
        let mut queues = self.inner.queues.lock();
        let state = queues
            .entry(queue.to_string())
            .or_insert_with(QueueState::new);
        state.expires_at = Some(Instant::now() + ttl);
    }

    /// Blocking left-pop. Suspends until an item is available; cancel-safe,
    /// so callers may race it against a shutdown signal in `select!`.
    pub async fn blocking_pop(&self, queue: &str) -> String {
        loop {
            let notify = {
                let mut queues = self.inner.queues.lock();
                let state = queues
                    .entry(queue.to_string())
                    .or_insert_with(QueueState::new);
                state.prune();
                if let Some(item) = state.items.pop_front() {
                    return item;
                }
                state.notify.clone()
            };
            notify.notified().await;
        }
    }

    /// Subscribe to every topic matching `pattern`. A trailing `*` matches
    /// any suffix; without one the match is exact. Delivery stops when the
    /// returned guard is dropped.
    pub fn psubscribe(
        &self,
        pattern: &str,
    ) -> (mpsc::UnboundedReceiver<TopicMessage>, SubscriptionGuard) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().push(TopicSubscription {
            id,
            pattern: pattern.to_string(),
            tx,
        });
        (
            rx,
            SubscriptionGuard {
                id,
                inner: self.inner.clone(),
            },
        )
    }

    /// Publish a payload on a topic. Fan-out is best-effort; a dropped
    /// receiver is cleaned up lazily on the next publish.
    pub fn publish(&self, topic: &str, payload: String) {
        let subs = self.inner.subs.read();
        let mut dead = false;
        for sub in subs.iter() {
            if pattern_matches(&sub.pattern, topic) {
                let delivered = sub
                    .tx
                    .send(TopicMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                    })
                    .is_ok();
                dead |= !delivered;
            }
        }
        drop(subs);
        if dead {
            self.inner.subs.write().retain(|s| !s.tx.is_closed());
        }
    }

    /// Set a key only if absent, with a TTL. Returns true when this caller
    /// won the key — the sole synchronization primitive for webhook dedup.
    pub fn set_nx(&self, key: &str, ttl: Duration) -> bool {
        let mut dedup = self.inner.dedup.lock();
        let now = Instant::now();
        dedup.retain(|_, expires| *expires > now);
        if dedup.contains_key(key) {
            return false;
        }
        dedup.insert(key.to_string(), now + ttl);
        true
    }

    /// Increment a member of a sorted set.
    pub fn zincr_by(&self, key: &str, member: &str, delta: f64) {
        let mut zsets = self.inner.zsets.lock();
        *zsets
            .entry(key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0.0) += delta;
    }

    pub fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        self.inner
            .zsets
            .lock()
            .get(key)
            .and_then(|set| set.get(member))
            .copied()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes its subscription from the bus when dropped.
pub struct SubscriptionGuard {
    id: u64,
    inner: Arc<BusInner>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.inner.subs.write().retain(|s| s.id != self.id);
    }
}

fn pattern_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let bus = Bus::new();
        bus.rpush("q", "a".into());
        bus.rpush("q", "b".into());
        assert_eq!(bus.blocking_pop("q").await, "a");
        assert_eq!(bus.blocking_pop("q").await, "b");
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let bus = Bus::new();
        let popper = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.blocking_pop("q").await })
        };
        tokio::task::yield_now().await;
        bus.rpush("q", "item".into());
        let got = timeout(Duration::from_secs(1), popper).await.unwrap().unwrap();
        assert_eq!(got, "item");
    }

    #[tokio::test]
    async fn test_expired_queue_drops_items() {
        let bus = Bus::new();
        bus.rpush("q", "stale".into());
        bus.expire_queue("q", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.rpush("q", "fresh".into());
        assert_eq!(bus.blocking_pop("q").await, "fresh");
    }

    #[tokio::test]
    async fn test_set_nx_dedups_until_expiry() {
        let bus = Bus::new();
        assert!(bus.set_nx("idempotency:test:r1", Duration::from_millis(20)));
        assert!(!bus.set_nx("idempotency:test:r1", Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(bus.set_nx("idempotency:test:r1", Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_pattern_subscription_receives_matching_topics() {
        let bus = Bus::new();
        let (mut rx, _guard) = bus.psubscribe("game:outcome:*");

        bus.publish("game:outcome:s1", "one".into());
        bus.publish("payment:user:u1", "ignored".into());
        bus.publish("game:outcome:s2", "two".into());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, "game:outcome:s1");
        assert_eq!(first.payload, "one");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, "game:outcome:s2");
    }

    #[tokio::test]
    async fn test_dropped_guard_stops_delivery() {
        let bus = Bus::new();
        let (mut rx, guard) = bus.psubscribe("payment:user:u1");
        drop(guard);
        bus.publish("payment:user:u1", "late".into());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_zincr_accumulates() {
        let bus = Bus::new();
        bus.zincr_by("leaderboard:global", "u1", 9.0);
        bus.zincr_by("leaderboard:global", "u1", 1.5);
        assert_eq!(bus.zscore("leaderboard:global", "u1"), Some(10.5));
        assert_eq!(bus.zscore("leaderboard:global", "u2"), None);
    }
}
