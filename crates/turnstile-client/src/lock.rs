//! Distributed single-holder lock
//!
//! A [`Lock`] grants exactly one live holder exclusive ownership of a KV
//! key. Ownership is leased through a session: the returned ownership
//! channel can flip to `false` at any time if the session is invalidated or
//! the key is rebound, and the application must stop relying on the lock
//! when it does. A handle whose ownership lapsed can simply call
//! [`Lock::acquire`] again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, warn};
use turnstile_api::{KvPair, QueryOptions, SESSION_BEHAVIOR_RELEASE, parse_duration};

use crate::constants::{
    DEFAULT_LOCK_SESSION_NAME, DEFAULT_LOCK_WAIT_TIME, DEFAULT_MONITOR_RETRIES,
    DEFAULT_MONITOR_RETRY_TIME, DEFAULT_RETRY_TIME, DEFAULT_SESSION_TTL, LOCK_FLAG_VALUE,
};
use crate::error::Error;
use crate::session::{self, stop_fired, stop_requested};
use crate::store::{KvStore, Store};

/// Options for a [`Lock`].
#[derive(Clone, Debug)]
pub struct LockOptions {
    /// Key to lock. Must be set.
    pub key: String,
    /// Optional bytes stored with the lock key.
    pub value: Option<Vec<u8>>,
    /// Caller-supplied session. When absent the handle creates its own and
    /// keeps it renewed; the caller is responsible for renewing a supplied
    /// one.
    pub session: Option<String>,
    /// Name for a self-owned session.
    pub session_name: String,
    /// TTL for a self-owned session.
    pub session_ttl: String,
    /// Transient read errors the ownership monitor rides out before
    /// declaring the lock lost.
    pub monitor_retries: u32,
    pub monitor_retry_time: Duration,
    /// Blocking-read window per acquisition attempt.
    pub lock_wait_time: Duration,
    /// Give up once the first wait window has elapsed instead of retrying
    /// indefinitely.
    pub lock_try_once: bool,
}

impl LockOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            session: None,
            session_name: DEFAULT_LOCK_SESSION_NAME.to_string(),
            session_ttl: DEFAULT_SESSION_TTL.to_string(),
            monitor_retries: DEFAULT_MONITOR_RETRIES,
            monitor_retry_time: DEFAULT_MONITOR_RETRY_TIME,
            lock_wait_time: DEFAULT_LOCK_WAIT_TIME,
            lock_try_once: false,
        }
    }
}

#[derive(Default)]
struct LockState {
    is_held: bool,
    lock_session: Option<String>,
    renew_stop: Option<oneshot::Sender<()>>,
}

struct LockInner {
    store: Arc<dyn Store>,
    opts: LockOptions,
    state: Mutex<LockState>,
}

/// Distributed mutual exclusion over one KV key.
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    /// Create a handle. Fails on an empty key or an unparseable session TTL.
    pub fn new(store: Arc<dyn Store>, opts: LockOptions) -> Result<Self, Error> {
        if opts.key.is_empty() {
            return Err(Error::InvalidOptions("missing key".to_string()));
        }
        if parse_duration(&opts.session_ttl).is_none() {
            return Err(Error::InvalidOptions(format!(
                "invalid session TTL '{}'",
                opts.session_ttl
            )));
        }
        Ok(Self {
            inner: Arc::new(LockInner {
                store,
                opts,
                state: Mutex::new(LockState::default()),
            }),
        })
    }

    /// Attempt to acquire the lock, blocking until success, `stop` fires
    /// (returns `Ok(None)`), or an error occurs.
    ///
    /// On success the returned channel reads `true` while the lock is held
    /// and flips to `false` as soon as ownership is lost — session
    /// invalidation, operator intervention, a rebind. Cancellation is
    /// observed between blocking reads, so it can lag `stop` by up to
    /// `lock_wait_time`.
    pub async fn acquire(
        &self,
        stop: Option<watch::Receiver<bool>>,
    ) -> Result<Option<watch::Receiver<bool>>, Error> {
        let mut state = self.inner.state.lock().await;
        if state.is_held {
            return Err(Error::Held);
        }

        let (session_id, owns_session) = match &self.inner.opts.session {
            Some(id) => (id.clone(), false),
            None => {
                let id = session::create_managed_session(
                    &self.inner.store,
                    &self.inner.opts.session_name,
                    &self.inner.opts.session_ttl,
                    SESSION_BEHAVIOR_RELEASE,
                )
                .await?;
                (id, true)
            }
        };
        let renew_stop = owns_session.then(|| {
            session::spawn_renewal(
                self.inner.store.clone(),
                self.inner.opts.session_ttl.clone(),
                session_id.clone(),
            )
        });

        match self.inner.try_claim(&session_id, stop).await {
            Ok(true) => {
                state.is_held = true;
                state.lock_session = Some(session_id.clone());
                state.renew_stop = renew_stop;

                let (held_tx, held_rx) = watch::channel(true);
                let inner = self.inner.clone();
                tokio::spawn(async move { monitor_lock(inner, session_id, held_tx).await });
                Ok(Some(held_rx))
            }
            Ok(false) => {
                // Abandoned before a claim succeeded. Cancelling the renewal
                // destroys a self-owned session.
                if let Some(tx) = renew_stop {
                    let _ = tx.send(());
                }
                Ok(None)
            }
            Err(e) => {
                if let Some(tx) = renew_stop {
                    let _ = tx.send(());
                }
                Err(e)
            }
        }
    }

    /// Voluntarily give up the lock. Releases the key's session binding;
    /// the key itself stays until [`Lock::destroy`].
    pub async fn unlock(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        if !state.is_held {
            return Err(Error::NotHeld);
        }
        state.is_held = false;
        let session = state.lock_session.take();
        let renew_stop = state.renew_stop.take();
        drop(state);

        let result = match session {
            Some(session) => {
                let entry = self.inner.lock_entry(&session);
                // A concurrent external change is not an error
                match self.inner.store.release(&entry).await {
                    Ok(_) => Ok(()),
                    Err(e) => Err(Error::Store(e)),
                }
            }
            None => Ok(()),
        };

        if let Some(tx) = renew_stop {
            let _ = tx.send(());
        }
        result
    }

    /// Delete the lock key. Fails while the lock is held by this handle or
    /// bound to any live session. Destroying an absent key succeeds.
    pub async fn destroy(&self) -> Result<(), Error> {
        let state = self.inner.state.lock().await;
        if state.is_held {
            return Err(Error::Held);
        }

        let (pair, _) = self
            .inner
            .store
            .get(&self.inner.opts.key, &QueryOptions::default())
            .await?;
        let Some(pair) = pair else {
            return Ok(());
        };
        if pair.flags != LOCK_FLAG_VALUE {
            return Err(Error::FlagConflict);
        }
        if pair.session.is_some() {
            return Err(Error::InUse);
        }
        if !self.inner.store.delete_cas(&pair).await? {
            return Err(Error::InUse);
        }
        Ok(())
    }
}

impl LockInner {
    /// Claim loop: look at the current holder (blocking once we have an
    /// index to wait past), then attempt a session-bound acquisition.
    async fn try_claim(
        &self,
        session: &str,
        mut stop: Option<watch::Receiver<bool>>,
    ) -> Result<bool, Error> {
        let mut qopts = QueryOptions {
            wait_time: Some(self.opts.lock_wait_time),
            ..Default::default()
        };
        let start = tokio::time::Instant::now();
        let mut attempts = 0u32;

        loop {
            if stop_requested(&stop) {
                return Ok(false);
            }

            // One-shot mode: stop once the wait window is spent
            if self.opts.lock_try_once && attempts > 0 {
                let elapsed = start.elapsed();
                if elapsed > self.opts.lock_wait_time {
                    return Ok(false);
                }
                qopts.wait_time = Some(self.opts.lock_wait_time - elapsed);
            }
            attempts += 1;

            let (pair, meta) = self.store.get(&self.opts.key, &qopts).await?;
            if let Some(pair) = &pair {
                if pair.flags != LOCK_FLAG_VALUE {
                    return Err(Error::FlagConflict);
                }
                if pair.session.as_deref() == Some(session) {
                    // Already bound to us
                    return Ok(true);
                }
                if pair.session.is_some() {
                    qopts.wait_index = meta.last_index;
                    continue;
                }
            }

            // Key is unbound; try to take it
            if self.store.acquire(&self.lock_entry(session)).await? {
                return Ok(true);
            }

            // Refused. A bound holder means we can long-poll for the next
            // change; an unbound key means the store is enforcing a
            // post-release delay and only a timed wait helps.
            qopts.wait_index = 0;
            let (pair, meta) = self.store.get(&self.opts.key, &qopts).await?;
            if pair.as_ref().is_some_and(|p| p.session.is_some()) {
                qopts.wait_index = meta.last_index;
                continue;
            }
            debug!("lock delay in effect on {}, retrying", self.opts.key);
            tokio::select! {
                _ = tokio::time::sleep(DEFAULT_RETRY_TIME) => {}
                _ = stop_fired(&mut stop) => return Ok(false),
            }
        }
    }

    fn lock_entry(&self, session: &str) -> KvPair {
        KvPair {
            key: self.opts.key.clone(),
            value: self.opts.value.clone(),
            flags: LOCK_FLAG_VALUE,
            session: Some(session.to_string()),
            ..Default::default()
        }
    }
}

/// Watches the key with consistent blocking reads; as soon as the binding no
/// longer points at `session`, marks the handle not-held and flips the
/// ownership channel, then exits.
async fn monitor_lock(inner: Arc<LockInner>, session: String, held_tx: watch::Sender<bool>) {
    let mut qopts = QueryOptions {
        require_consistent: true,
        wait_time: Some(inner.opts.lock_wait_time),
        ..Default::default()
    };

    'watch: loop {
        let mut retries = inner.opts.monitor_retries;
        loop {
            match inner.store.get(&inner.opts.key, &qopts).await {
                Ok((pair, meta)) => {
                    if pair.as_ref().and_then(|p| p.session.as_deref()) == Some(session.as_str()) {
                        qopts.wait_index = meta.last_index;
                        continue 'watch;
                    }
                    break 'watch;
                }
                Err(e) => {
                    if retries == 0 {
                        warn!("lock monitor giving up after read failure: {}", e);
                        break 'watch;
                    }
                    debug!("lock monitor read failed, retrying: {}", e);
                    retries -= 1;
                    qopts.wait_index = 0;
                    tokio::time::sleep(inner.opts.monitor_retry_time).await;
                }
            }
        }
    }

    // The session guard keeps a stale monitor from a previous acquisition
    // away from a handle that has since reclaimed with a new session.
    let mut state = inner.state.lock().await;
    if state.lock_session.as_deref() == Some(session.as_str()) {
        state.is_held = false;
        state.lock_session = None;
        if let Some(tx) = state.renew_stop.take() {
            let _ = tx.send(());
        }
    }
    drop(state);
    let _ = held_tx.send(false);
}
