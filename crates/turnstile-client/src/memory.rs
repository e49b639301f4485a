//! In-process store implementation
//!
//! Implements the same contract as the HTTP store against process-local
//! state: a global modify index, per-mutation wakeups for blocking reads,
//! and session TTL bookkeeping with the release/delete expiry behaviors.
//! Used by the integration tests and by embedders who want the coordination
//! primitives without a server.
//!
//! Session TTLs are enforced lazily: expired sessions are reaped at the
//! start of every operation rather than on a timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tokio::time::Instant;
use turnstile_api::{
    KvPair, QueryMeta, QueryOptions, SESSION_BEHAVIOR_DELETE, SESSION_BEHAVIOR_RELEASE,
    SessionEntry, parse_duration,
};

use crate::store::{KvStore, SessionStore};

/// Fallback TTL when a session is created with an unparseable or empty TTL.
const FALLBACK_SESSION_TTL: Duration = Duration::from_secs(15);

/// Cap on how long a blocking read may be held when the caller gives no
/// wait time.
const DEFAULT_BLOCKING_WAIT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct StoredSession {
    entry: SessionEntry,
    ttl: Duration,
    last_renewed: Instant,
}

impl StoredSession {
    fn is_expired(&self) -> bool {
        self.last_renewed.elapsed() > self.ttl
    }
}

/// In-memory store with blocking-read support
pub struct MemoryStore {
    store: DashMap<String, KvPair>,
    sessions: DashMap<String, StoredSession>,
    /// Global consistency index; starts at 1 so a caller can always block on
    /// the index it was served.
    index: AtomicU64,
    changed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
            sessions: DashMap::new(),
            index: AtomicU64::new(1),
            changed: Notify::new(),
        }
    }

    fn version(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    /// Allocate the next modify index
    fn next_index(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn wake_readers(&self) {
        self.changed.notify_waiters();
    }

    /// Block until the global index passes `seen` or `timeout` elapses.
    async fn wait_for_change(&self, seen: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if self.version() > seen {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }

    async fn block_if_requested(&self, opts: &QueryOptions) {
        if opts.wait_index > 0 && self.version() <= opts.wait_index {
            let wait = opts.wait_time.unwrap_or(DEFAULT_BLOCKING_WAIT);
            self.wait_for_change(opts.wait_index, wait).await;
        }
    }

    fn meta(&self) -> QueryMeta {
        QueryMeta {
            last_index: self.version(),
        }
    }

    /// Drop expired sessions and apply their expiry behavior to bound keys.
    fn reap_expired_sessions(&self) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        for id in expired {
            if let Some((_, stored)) = self.sessions.remove(&id) {
                self.invalidate_session(&id, &stored.entry.behavior);
            }
        }
    }

    /// Apply a dead session's expiry behavior to the keys it holds.
    fn invalidate_session(&self, id: &str, behavior: &str) {
        if behavior == SESSION_BEHAVIOR_DELETE {
            let bound: Vec<String> = self
                .store
                .iter()
                .filter(|entry| entry.value().session.as_deref() == Some(id))
                .map(|entry| entry.key().clone())
                .collect();
            for key in bound {
                self.store.remove(&key);
            }
        } else {
            for mut entry in self.store.iter_mut() {
                if entry.value().session.as_deref() == Some(id) {
                    let index = self.next_index();
                    let pair = entry.value_mut();
                    pair.session = None;
                    pair.modify_index = index;
                }
            }
        }

        // Liveness changed even if no key was bound; blocked readers must
        // get a chance to re-run their pruning.
        self.next_index();
        self.wake_readers();
    }

    fn read_key(&self, key: &str) -> Option<KvPair> {
        self.store.get(key).map(|entry| entry.value().clone())
    }

    fn read_prefix(&self, prefix: &str) -> Vec<KvPair> {
        let mut pairs: Vec<KvPair> = self
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        pairs
    }

    fn session_is_live(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map(|stored| !stored.value().is_expired())
            .unwrap_or(false)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> anyhow::Result<(Option<KvPair>, QueryMeta)> {
        self.reap_expired_sessions();
        self.block_if_requested(opts).await;
        Ok((self.read_key(key), self.meta()))
    }

    async fn list(
        &self,
        prefix: &str,
        opts: &QueryOptions,
    ) -> anyhow::Result<(Vec<KvPair>, QueryMeta)> {
        self.reap_expired_sessions();
        self.block_if_requested(opts).await;
        Ok((self.read_prefix(prefix), self.meta()))
    }

    async fn put(&self, pair: &KvPair) -> anyhow::Result<bool> {
        self.reap_expired_sessions();
        let index = self.next_index();
        match self.store.entry(pair.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.value = pair.value.clone();
                existing.flags = pair.flags;
                existing.modify_index = index;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(KvPair {
                    key: pair.key.clone(),
                    create_index: index,
                    modify_index: index,
                    lock_index: 0,
                    flags: pair.flags,
                    value: pair.value.clone(),
                    session: None,
                });
            }
        }
        self.wake_readers();
        Ok(true)
    }

    async fn acquire(&self, pair: &KvPair) -> anyhow::Result<bool> {
        self.reap_expired_sessions();
        let session = pair
            .session
            .as_deref()
            .ok_or_else(|| anyhow!("acquire requires a session"))?;
        if !self.session_is_live(session) {
            return Err(anyhow!("invalid session '{}'", session));
        }

        match self.store.entry(pair.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                match existing.session.as_deref() {
                    Some(bound) if bound != session => return Ok(false),
                    Some(_) => {}
                    None => existing.lock_index += 1,
                }
                existing.session = Some(session.to_string());
                existing.value = pair.value.clone();
                existing.flags = pair.flags;
                existing.modify_index = self.next_index();
            }
            Entry::Vacant(vacant) => {
                let index = self.next_index();
                vacant.insert(KvPair {
                    key: pair.key.clone(),
                    create_index: index,
                    modify_index: index,
                    lock_index: 1,
                    flags: pair.flags,
                    value: pair.value.clone(),
                    session: Some(session.to_string()),
                });
            }
        }
        self.wake_readers();
        Ok(true)
    }

    async fn release(&self, pair: &KvPair) -> anyhow::Result<bool> {
        self.reap_expired_sessions();
        let session = pair
            .session
            .as_deref()
            .ok_or_else(|| anyhow!("release requires a session"))?;

        let released = match self.store.get_mut(&pair.key) {
            Some(mut entry) if entry.value().session.as_deref() == Some(session) => {
                let index = self.next_index();
                let existing = entry.value_mut();
                existing.session = None;
                existing.value = pair.value.clone();
                existing.modify_index = index;
                true
            }
            _ => false,
        };

        if released {
            self.wake_readers();
        }
        Ok(released)
    }

    async fn cas(&self, pair: &KvPair) -> anyhow::Result<bool> {
        self.reap_expired_sessions();
        let swapped = match self.store.entry(pair.key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().modify_index == pair.modify_index {
                    let index = self.next_index();
                    let existing = occupied.get_mut();
                    existing.value = pair.value.clone();
                    existing.flags = pair.flags;
                    existing.modify_index = index;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                // An expected index of 0 means create-only-if-absent
                if pair.modify_index == 0 {
                    let index = self.next_index();
                    vacant.insert(KvPair {
                        key: pair.key.clone(),
                        create_index: index,
                        modify_index: index,
                        lock_index: 0,
                        flags: pair.flags,
                        value: pair.value.clone(),
                        session: None,
                    });
                    true
                } else {
                    false
                }
            }
        };

        if swapped {
            self.wake_readers();
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        self.reap_expired_sessions();
        let removed = self.store.remove(key).is_some();
        if removed {
            self.next_index();
            self.wake_readers();
        }
        Ok(removed)
    }

    async fn delete_cas(&self, pair: &KvPair) -> anyhow::Result<bool> {
        self.reap_expired_sessions();
        let removed = match self.store.entry(pair.key.clone()) {
            Entry::Occupied(occupied) => {
                if occupied.get().modify_index == pair.modify_index {
                    occupied.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        };

        if removed {
            self.next_index();
            self.wake_readers();
        }
        Ok(removed)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, entry: &SessionEntry) -> anyhow::Result<String> {
        self.reap_expired_sessions();
        let id = uuid::Uuid::new_v4().to_string();
        let ttl = parse_duration(&entry.ttl).unwrap_or(FALLBACK_SESSION_TTL);

        let mut entry = entry.clone();
        entry.id = id.clone();
        if entry.behavior.is_empty() {
            entry.behavior = SESSION_BEHAVIOR_RELEASE.to_string();
        }

        self.sessions.insert(
            id.clone(),
            StoredSession {
                entry,
                ttl,
                last_renewed: Instant::now(),
            },
        );
        Ok(id)
    }

    async fn renew(&self, id: &str) -> anyhow::Result<Option<SessionEntry>> {
        self.reap_expired_sessions();
        match self.sessions.get_mut(id) {
            Some(mut stored) => {
                stored.value_mut().last_renewed = Instant::now();
                Ok(Some(stored.value().entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn destroy(&self, id: &str) -> anyhow::Result<bool> {
        self.reap_expired_sessions();
        match self.sessions.remove(id) {
            Some((_, stored)) => {
                self.invalidate_session(id, &stored.entry.behavior);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
