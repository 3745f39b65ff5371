//! In-process cache implementations backed by `dashmap`.
//!
//! Entries expire after a fixed TTL. Expired entries read as absent, and are
//! swept out every [`SWEEP_EVERY`] writes instead of by a background task.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::Mutex;
use tracing::debug;

use crate::base::types::{AiMode, ChatMessage};

use super::{DedupCache, GenericDedupCache, GenericSessionCache, SessionCache, SessionGuard};

/// Number of writes between two sweeps of expired entries.
const SWEEP_EVERY: u64 = 256;

// Extra methods on the cache wrappers applied by the memory implementation.

impl DedupCache {
    pub fn memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryDedupCache::new(ttl)))
    }
}

impl SessionCache {
    pub fn memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemorySessionCache::new(ttl)))
    }
}

// Dedup.

/// In-memory dedup cache.
pub struct MemoryDedupCache {
    ttl: Duration,
    entries: DashMap<String, Instant>,
    writes: AtomicU64,
}

impl MemoryDedupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    fn sweep_if_needed(&self, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != SWEEP_EVERY - 1 {
            return;
        }

        let before = self.entries.len();
        self.entries.retain(|_, marked_at| now.duration_since(*marked_at) < self.ttl);
        debug!("Swept {} expired dedup entries.", before.saturating_sub(self.entries.len()));
    }
}

#[async_trait]
impl GenericDedupCache for MemoryDedupCache {
    async fn is_processed(&self, message_id: &str) -> bool {
        self.entries
            .get(message_id)
            .is_some_and(|marked_at| marked_at.elapsed() < self.ttl)
    }

    async fn mark_processed(&self, message_id: &str) {
        let now = Instant::now();
        self.entries.insert(message_id.to_string(), now);
        self.sweep_if_needed(now);
    }

    async fn try_mark_processed(&self, message_id: &str) -> bool {
        let now = Instant::now();

        // The entry holds the shard lock, so check and mark happen as one step.
        let fresh = match self.entries.entry(message_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) >= self.ttl {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        };

        if fresh {
            self.sweep_if_needed(now);
        }

        fresh
    }
}

// Sessions.

struct SessionEntry {
    history: Vec<ChatMessage>,
    mode: AiMode,
    touched_at: Instant,
}

impl SessionEntry {
    fn new(now: Instant) -> Self {
        Self {
            history: Vec::new(),
            mode: AiMode::default(),
            touched_at: now,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(self.touched_at) >= ttl
    }
}

/// In-memory session cache.
pub struct MemorySessionCache {
    ttl: Duration,
    sessions: DashMap<String, SessionEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    writes: AtomicU64,
}

impl MemorySessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: DashMap::new(),
            locks: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Apply `f` to the live entry for the session, creating (or resetting an expired) one first.
    fn update(&self, session_id: &str, f: impl FnOnce(&mut SessionEntry)) {
        let now = Instant::now();

        {
            let mut entry = self.sessions.entry(session_id.to_string()).or_insert_with(|| SessionEntry::new(now));
            if entry.is_expired(now, self.ttl) {
                *entry = SessionEntry::new(now);
            }
            f(&mut entry);
            entry.touched_at = now;
        }

        self.sweep_if_needed(now);
    }

    fn read<T>(&self, session_id: &str, f: impl FnOnce(&SessionEntry) -> T) -> Option<T> {
        let now = Instant::now();

        self.sessions
            .get(session_id)
            .filter(|entry| !entry.is_expired(now, self.ttl))
            .map(|entry| f(&entry))
    }

    fn sweep_if_needed(&self, now: Instant) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != SWEEP_EVERY - 1 {
            return;
        }

        self.sessions.retain(|_, entry| !entry.is_expired(now, self.ttl));

        // Only the map holds these, so no task is waiting on them.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[async_trait]
impl GenericSessionCache for MemorySessionCache {
    async fn lock(&self, session_id: &str) -> SessionGuard {
        let lock = self.locks.entry(session_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();

        lock.lock_owned().await
    }

    async fn get_history(&self, session_id: &str) -> Vec<ChatMessage> {
        self.read(session_id, |entry| entry.history.clone()).unwrap_or_default()
    }

    async fn set_history(&self, session_id: &str, history: Vec<ChatMessage>) {
        self.update(session_id, |entry| entry.history = history);
    }

    async fn clear(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    async fn get_mode(&self, session_id: &str) -> AiMode {
        self.read(session_id, |entry| entry.mode).unwrap_or_default()
    }

    async fn set_mode(&self, session_id: &str, mode: AiMode) {
        self.update(session_id, |entry| entry.mode = mode);
    }
}

// Tests.

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn test_try_mark_processed_only_once() {
        let cache = MemoryDedupCache::new(Duration::from_secs(60));

        assert!(!cache.is_processed("m1").await);
        assert!(cache.try_mark_processed("m1").await);
        assert!(!cache.try_mark_processed("m1").await);
        assert!(cache.is_processed("m1").await);
        assert!(cache.try_mark_processed("m2").await);
    }

    #[tokio::test]
    async fn test_dedup_entries_expire() {
        let cache = MemoryDedupCache::new(Duration::from_millis(20));

        cache.mark_processed("m1").await;
        assert!(cache.is_processed("m1").await);

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!cache.is_processed("m1").await);
        assert!(cache.try_mark_processed("m1").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_mark_has_one_winner() {
        let cache = Arc::new(MemoryDedupCache::new(Duration::from_secs(60)));
        let winners = Arc::new(AtomicUsize::new(0));

        let tasks = (0..64)
            .map(|_| {
                let cache = cache.clone();
                let winners = winners.clone();
                tokio::spawn(async move {
                    if cache.try_mark_processed("same").await {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_history_and_mode() {
        let cache = MemorySessionCache::new(Duration::from_secs(60));

        assert!(cache.get_history("s1").await.is_empty());
        assert_eq!(cache.get_mode("s1").await, AiMode::Balanced);

        cache.set_history("s1", vec![ChatMessage::user("hi")]).await;
        cache.set_mode("s1", AiMode::Creative).await;

        assert_eq!(cache.get_history("s1").await, vec![ChatMessage::user("hi")]);
        assert_eq!(cache.get_mode("s1").await, AiMode::Creative);
        assert!(cache.get_history("s2").await.is_empty());

        cache.clear("s1").await;

        assert!(cache.get_history("s1").await.is_empty());
        assert_eq!(cache.get_mode("s1").await, AiMode::Balanced);
    }

    #[tokio::test]
    async fn test_expired_session_resets_mode() {
        let cache = MemorySessionCache::new(Duration::from_millis(20));

        cache.set_mode("s1", AiMode::Precise).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get_mode("s1").await, AiMode::Balanced);

        cache.set_history("s1", vec![ChatMessage::user("again")]).await;

        assert_eq!(cache.get_mode("s1").await, AiMode::Balanced);
        assert_eq!(cache.get_history("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_lock_serializes_same_session() {
        let cache = Arc::new(MemorySessionCache::new(Duration::from_secs(60)));

        let tasks = (0..16)
            .map(|i| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let _guard = cache.lock("s1").await;
                    let mut history = cache.get_history("s1").await;
                    tokio::task::yield_now().await;
                    history.push(ChatMessage::user(format!("{i}")));
                    cache.set_history("s1", history).await;
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.get_history("s1").await.len(), 16);
    }

    #[tokio::test]
    async fn test_session_locks_are_independent() {
        let cache = MemorySessionCache::new(Duration::from_secs(60));

        let _first = cache.lock("s1").await;
        let second = tokio::time::timeout(Duration::from_millis(100), cache.lock("s2")).await;

        assert!(second.is_ok());
    }
}
