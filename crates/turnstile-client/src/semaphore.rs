//! Distributed counting semaphore
//!
//! A [`Semaphore`] bounds the number of concurrent live holders sharing a KV
//! prefix. Every contender registers a session-bound entry under the prefix
//! and competes for a slot in a shared record stored at `<prefix>/.lock`.
//! All mutations to the record go through CAS; a contender that loses a race
//! re-reads and retries. Slots whose sessions have disappeared are pruned by
//! whichever participant next looks at the record, so capacity held by a
//! crashed process comes back without its cooperation.
//!
//! As with the lock, a slot is leased: the ownership channel can flip to
//! `false` at any time and the application must be able to handle that.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, warn};
use turnstile_api::{KvPair, QueryOptions, SESSION_BEHAVIOR_DELETE, parse_duration};

use crate::constants::{
    DEFAULT_MONITOR_RETRIES, DEFAULT_MONITOR_RETRY_TIME, DEFAULT_SEMAPHORE_SESSION_NAME,
    DEFAULT_SEMAPHORE_WAIT_TIME, DEFAULT_SESSION_TTL, DEFAULT_WATCH_WAIT_TIME,
    SEMAPHORE_FLAG_VALUE, SEMAPHORE_RECORD_KEY,
};
use crate::error::Error;
use crate::session::{self, stop_requested};
use crate::store::{KvStore, Store};

/// Options for a [`Semaphore`].
#[derive(Clone, Debug)]
pub struct SemaphoreOptions {
    /// Prefix all contenders share. Must be set.
    pub prefix: String,
    /// Slot limit. Must be positive and agreed upon by every contender on
    /// the prefix.
    pub limit: usize,
    /// Optional bytes stored with this contender's entry; surfaced to
    /// [`Semaphore::watch`] observers.
    pub value: Option<Vec<u8>>,
    /// Caller-supplied session. When absent the handle creates its own and
    /// keeps it renewed.
    pub session: Option<String>,
    /// Name for a self-owned session.
    pub session_name: String,
    /// TTL for a self-owned session.
    pub session_ttl: String,
    /// Transient read errors the ownership monitor rides out before
    /// declaring the slot lost.
    pub monitor_retries: u32,
    pub monitor_retry_time: Duration,
    /// Blocking-read window per acquisition attempt.
    pub semaphore_wait_time: Duration,
}

impl SemaphoreOptions {
    pub fn new(prefix: impl Into<String>, limit: usize) -> Self {
        Self {
            prefix: prefix.into(),
            limit,
            value: None,
            session: None,
            session_name: DEFAULT_SEMAPHORE_SESSION_NAME.to_string(),
            session_ttl: DEFAULT_SESSION_TTL.to_string(),
            monitor_retries: DEFAULT_MONITOR_RETRIES,
            monitor_retry_time: DEFAULT_MONITOR_RETRY_TIME,
            semaphore_wait_time: DEFAULT_SEMAPHORE_WAIT_TIME,
        }
    }
}

/// Shared record coordinating all contenders, stored under
/// [`SEMAPHORE_RECORD_KEY`] inside the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SlotRecord {
    /// Agreed holder limit; used to verify all contenders match.
    #[serde(rename = "Limit")]
    limit: usize,
    /// Always `limit` entries. A session id marks a held slot, an empty
    /// string a free one.
    #[serde(rename = "Holders")]
    holders: Vec<String>,
}

impl SlotRecord {
    fn empty(limit: usize) -> Self {
        Self {
            limit,
            holders: vec![String::new(); limit],
        }
    }

    fn first_free_slot(&self) -> Option<usize> {
        self.holders.iter().position(|h| h.is_empty())
    }

    fn slot_of(&self, session: &str) -> Option<usize> {
        self.holders.iter().position(|h| h == session)
    }
}

#[derive(Default)]
struct SlotState {
    is_held: bool,
    held_session: Option<String>,
    renew_stop: Option<oneshot::Sender<()>>,
}

struct SemaphoreInner {
    store: Arc<dyn Store>,
    opts: SemaphoreOptions,
    state: Mutex<SlotState>,
}

/// Distributed counting mutual exclusion: at most `limit` concurrent live
/// holders share one KV prefix.
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// Create a handle. Fails on an empty prefix, a zero limit, or an
    /// unparseable session TTL.
    pub fn new(store: Arc<dyn Store>, opts: SemaphoreOptions) -> Result<Self, Error> {
        if opts.prefix.is_empty() {
            return Err(Error::InvalidOptions("missing prefix".to_string()));
        }
        if opts.limit == 0 {
            return Err(Error::InvalidOptions(
                "semaphore limit must be positive".to_string(),
            ));
        }
        if parse_duration(&opts.session_ttl).is_none() {
            return Err(Error::InvalidOptions(format!(
                "invalid session TTL '{}'",
                opts.session_ttl
            )));
        }
        Ok(Self {
            inner: Arc::new(SemaphoreInner {
                store,
                opts,
                state: Mutex::new(SlotState::default()),
            }),
        })
    }

    /// Attempt to reserve a slot, blocking until success, `stop` fires
    /// (returns `Ok(None)`), or an error occurs. No fairness is guaranteed
    /// among waiters. The returned channel behaves like the lock's: `true`
    /// while the slot is held, flipped to `false` on loss.
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
                    SESSION_BEHAVIOR_DELETE,
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

        // Register our candidacy before competing for a slot
        match self
            .inner
            .store
            .acquire(&self.inner.contender_entry(&session_id))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                if let Some(tx) = renew_stop {
                    let _ = tx.send(());
                }
                return Err(Error::Store(anyhow::anyhow!(
                    "failed to make contender entry for session '{}'",
                    session_id
                )));
            }
            Err(e) => {
                if let Some(tx) = renew_stop {
                    let _ = tx.send(());
                }
                return Err(Error::Store(e.context("failed to make contender entry")));
            }
        }

        match self.inner.claim_slot(&session_id, stop).await {
            Ok(true) => {
                state.is_held = true;
                state.held_session = Some(session_id.clone());
                state.renew_stop = renew_stop;

                let (held_tx, held_rx) = watch::channel(true);
                let inner = self.inner.clone();
                tokio::spawn(async move { monitor_slot(inner, session_id, held_tx).await });
                Ok(Some(held_rx))
            }
            Ok(false) => {
                // Abandoned: withdraw our candidacy so nobody has to prune it
                self.inner.remove_contender(&session_id).await;
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

    /// Voluntarily give up our slot. It is an error to call this without
    /// holding one.
    pub async fn release(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock().await;
        if !state.is_held {
            return Err(Error::NotHeld);
        }
        state.is_held = false;
        let session = state.held_session.take();
        let renew_stop = state.renew_stop.take();
        drop(state);

        let result = match session {
            Some(session) => self.inner.remove_holder(&session).await,
            None => Ok(()),
        };

        if let Some(tx) = renew_stop {
            let _ = tx.send(());
        }
        result
    }

    /// Delete the slot record. Fails while this handle holds a slot or any
    /// live holder remains. Destroying an absent record succeeds.
    pub async fn destroy(&self) -> Result<(), Error> {
        let state = self.inner.state.lock().await;
        if state.is_held {
            return Err(Error::Held);
        }

        let (pairs, _) = self
            .inner
            .store
            .list(&self.inner.opts.prefix, &QueryOptions::default())
            .await?;
        let Some(record_pair) = find_record(&pairs, &self.inner.record_key()) else {
            return Ok(());
        };
        if record_pair.flags != SEMAPHORE_FLAG_VALUE {
            return Err(Error::FlagConflict);
        }

        let mut record = self.inner.decode_record(Some(record_pair))?;
        prune_dead_holders(&mut record, &pairs);
        if record.holders.iter().any(|h| !h.is_empty()) {
            return Err(Error::InUse);
        }

        if !self.inner.store.delete_cas(record_pair).await? {
            return Err(Error::InUse);
        }
        Ok(())
    }

    /// Observe the semaphore without contending. Each emission is a vector
    /// of `limit` entries: the value registered by the slot's holder, or
    /// `None` for a free slot. Consecutive identical holder sets are not
    /// re-emitted. Both channels close when `stop` fires or on the first
    /// failure, which is delivered once on the error channel.
    pub async fn watch(
        &self,
        stop: Option<watch::Receiver<bool>>,
    ) -> (
        mpsc::Receiver<Vec<Option<Vec<u8>>>>,
        mpsc::Receiver<Error>,
    ) {
        // Serialize with the other handle operations before observing
        let _state = self.inner.state.lock().await;
        let (result_tx, result_rx) = mpsc::channel(8);
        let (error_tx, error_rx) = mpsc::channel(1);
        let inner = self.inner.clone();
        tokio::spawn(async move { watch_holders(inner, stop, result_tx, error_tx).await });
        (result_rx, error_rx)
    }
}

impl SemaphoreInner {
    fn record_key(&self) -> String {
        join_key(&self.opts.prefix, SEMAPHORE_RECORD_KEY)
    }

    fn contender_key(&self, session: &str) -> String {
        join_key(&self.opts.prefix, session)
    }

    fn contender_entry(&self, session: &str) -> KvPair {
        KvPair {
            key: self.contender_key(session),
            value: self.opts.value.clone(),
            flags: SEMAPHORE_FLAG_VALUE,
            session: Some(session.to_string()),
            ..Default::default()
        }
    }

    fn decode_record(&self, pair: Option<&KvPair>) -> Result<SlotRecord, Error> {
        match pair.and_then(|p| p.value.as_ref()) {
            Some(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| Error::Store(anyhow::anyhow!("slot record decoding failed: {}", e))),
            None => Ok(SlotRecord::empty(self.opts.limit)),
        }
    }

    fn encode_record(&self, record: &SlotRecord, modify_index: u64) -> Result<KvPair, Error> {
        let value = serde_json::to_vec(record)
            .map_err(|e| Error::Store(anyhow::anyhow!("slot record encoding failed: {}", e)))?;
        Ok(KvPair {
            key: self.record_key(),
            value: Some(value),
            flags: SEMAPHORE_FLAG_VALUE,
            modify_index,
            ..Default::default()
        })
    }

    /// Claim loop: read the record (blocking once every slot is taken),
    /// validate it, prune the dead, and CAS ourselves into the first free
    /// slot; a lost race re-reads and retries.
    async fn claim_slot(
        &self,
        session: &str,
        stop: Option<watch::Receiver<bool>>,
    ) -> Result<bool, Error> {
        let mut qopts = QueryOptions {
            wait_time: Some(self.opts.semaphore_wait_time),
            ..Default::default()
        };

        loop {
            if stop_requested(&stop) {
                return Ok(false);
            }

            let (pairs, meta) = self.store.list(&self.opts.prefix, &qopts).await?;

            let record_pair = find_record(&pairs, &self.record_key());
            if let Some(pair) = record_pair {
                if pair.flags != SEMAPHORE_FLAG_VALUE {
                    return Err(Error::FlagConflict);
                }
            }
            let mut record = self.decode_record(record_pair)?;
            if record.limit != self.opts.limit {
                return Err(Error::LimitMismatch {
                    stored: record.limit,
                    local: self.opts.limit,
                });
            }

            prune_dead_holders(&mut record, &pairs);

            let Some(slot) = record.first_free_slot() else {
                // Every slot is taken; wait for the record to move
                qopts.wait_index = meta.last_index;
                continue;
            };

            record.holders[slot] = session.to_string();
            let modify_index = record_pair.map(|p| p.modify_index).unwrap_or(0);
            let updated = self.encode_record(&record, modify_index)?;
            if self.store.cas(&updated).await? {
                return Ok(true);
            }
            // Lost a race with another contender; re-read and retry
        }
    }

    /// Clear our slot via read-modify-CAS, retrying on races, then withdraw
    /// the contender entry.
    async fn remove_holder(&self, session: &str) -> Result<(), Error> {
        loop {
            let (pair, _) = self
                .store
                .get(&self.record_key(), &QueryOptions::default())
                .await?;
            let mut record = self.decode_record(pair.as_ref())?;
            if let Some(slot) = record.slot_of(session) {
                record.holders[slot].clear();
                let modify_index = pair.as_ref().map(|p| p.modify_index).unwrap_or(0);
                let updated = self.encode_record(&record, modify_index)?;
                if !self.store.cas(&updated).await? {
                    continue;
                }
            }
            break;
        }

        self.store.delete(&self.contender_key(session)).await?;
        Ok(())
    }

    /// Best-effort removal of our contender entry.
    async fn remove_contender(&self, session: &str) {
        let key = self.contender_key(session);
        if let Err(e) = self.store.delete(&key).await {
            debug!("failed to remove contender entry {}: {}", key, e);
        }
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

fn find_record<'a>(pairs: &'a [KvPair], record_key: &str) -> Option<&'a KvPair> {
    pairs.iter().find(|p| p.key == record_key)
}

/// Clear every slot whose session has no live contender entry, reclaiming
/// capacity left behind by crashed holders. Any participant may do this.
/// Returns the registered value of each live contender.
fn prune_dead_holders(
    record: &mut SlotRecord,
    pairs: &[KvPair],
) -> HashMap<String, Option<Vec<u8>>> {
    let mut alive = HashMap::with_capacity(pairs.len());
    for pair in pairs {
        if let Some(session) = &pair.session {
            alive.insert(session.clone(), pair.value.clone());
        }
    }

    for holder in record.holders.iter_mut() {
        if !holder.is_empty() && !alive.contains_key(holder.as_str()) {
            holder.clear();
        }
    }
    alive
}

/// Watches the prefix with consistent blocking reads; once our session no
/// longer occupies a slot, marks the handle not-held and flips the
/// ownership channel, then exits.
async fn monitor_slot(inner: Arc<SemaphoreInner>, session: String, held_tx: watch::Sender<bool>) {
    let mut qopts = QueryOptions {
        require_consistent: true,
        wait_time: Some(inner.opts.semaphore_wait_time),
        ..Default::default()
    };

    'watch: loop {
        let mut retries = inner.opts.monitor_retries;
        loop {
            match inner.store.list(&inner.opts.prefix, &qopts).await {
                Ok((pairs, meta)) => {
                    let record_pair = find_record(&pairs, &inner.record_key());
                    let Ok(mut record) = inner.decode_record(record_pair) else {
                        break 'watch;
                    };
                    prune_dead_holders(&mut record, &pairs);
                    if record.slot_of(&session).is_some() {
                        qopts.wait_index = meta.last_index;
                        continue 'watch;
                    }
                    break 'watch;
                }
                Err(e) => {
                    if retries == 0 {
                        warn!("semaphore monitor giving up after read failure: {}", e);
                        break 'watch;
                    }
                    debug!("semaphore monitor read failed, retrying: {}", e);
                    retries -= 1;
                    qopts.wait_index = 0;
                    tokio::time::sleep(inner.opts.monitor_retry_time).await;
                }
            }
        }
    }

    // Session guard: a stale monitor must not clobber a reclaimed handle
    let mut state = inner.state.lock().await;
    if state.held_session.as_deref() == Some(session.as_str()) {
        state.is_held = false;
        state.held_session = None;
        if let Some(tx) = state.renew_stop.take() {
            let _ = tx.send(());
        }
    }
    drop(state);
    let _ = held_tx.send(false);
}

/// Body of [`Semaphore::watch`].
async fn watch_holders(
    inner: Arc<SemaphoreInner>,
    stop: Option<watch::Receiver<bool>>,
    result_tx: mpsc::Sender<Vec<Option<Vec<u8>>>>,
    error_tx: mpsc::Sender<Error>,
) {
    let mut qopts = QueryOptions {
        wait_time: Some(DEFAULT_WATCH_WAIT_TIME),
        ..Default::default()
    };
    let mut last_holders: Option<Vec<String>> = None;

    loop {
        if stop_requested(&stop) {
            return;
        }

        let (pairs, meta) = match inner.store.list(&inner.opts.prefix, &qopts).await {
            Ok(read) => read,
            Err(e) => {
                let _ = error_tx.send(Error::Store(e)).await;
                return;
            }
        };

        // Nothing moved since the last read
        if qopts.wait_index == meta.last_index {
            continue;
        }
        qopts.wait_index = meta.last_index;

        let record_pair = find_record(&pairs, &inner.record_key());
        if let Some(pair) = record_pair {
            if pair.flags != SEMAPHORE_FLAG_VALUE {
                let _ = error_tx.send(Error::FlagConflict).await;
                return;
            }
        }
        let mut record = match inner.decode_record(record_pair) {
            Ok(record) => record,
            Err(e) => {
                let _ = error_tx.send(e).await;
                return;
            }
        };
        let alive = prune_dead_holders(&mut record, &pairs);

        // Emit only when the holder set actually changed
        if last_holders.as_deref() == Some(record.holders.as_slice()) {
            continue;
        }

        let values: Vec<Option<Vec<u8>>> = record
            .holders
            .iter()
            .map(|holder| {
                if holder.is_empty() {
                    None
                } else {
                    alive.get(holder).cloned().flatten()
                }
            })
            .collect();
        last_holders = Some(record.holders);

        if result_tx.send(values).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn memory() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[test]
    fn test_options_validation() {
        assert!(matches!(
            Semaphore::new(memory(), SemaphoreOptions::new("", 2)),
            Err(Error::InvalidOptions(_))
        ));
        assert!(matches!(
            Semaphore::new(memory(), SemaphoreOptions::new("svc/sem", 0)),
            Err(Error::InvalidOptions(_))
        ));

        let mut opts = SemaphoreOptions::new("svc/sem", 2);
        opts.session_ttl = "whenever".to_string();
        assert!(matches!(
            Semaphore::new(memory(), opts),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_record_wire_shape() {
        let record = SlotRecord {
            limit: 3,
            holders: vec!["sess-a".to_string(), String::new(), String::new()],
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"Limit":3,"Holders":["sess-a","",""]}"#);

        let back: SlotRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_record_slots() {
        let mut record = SlotRecord::empty(2);
        assert_eq!(record.first_free_slot(), Some(0));

        record.holders[0] = "a".to_string();
        assert_eq!(record.first_free_slot(), Some(1));
        assert_eq!(record.slot_of("a"), Some(0));

        record.holders[1] = "b".to_string();
        assert_eq!(record.first_free_slot(), None);
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("svc/sem", ".lock"), "svc/sem/.lock");
        assert_eq!(join_key("svc/sem/", ".lock"), "svc/sem/.lock");
    }

    #[test]
    fn test_prune_dead_holders() {
        let mut record = SlotRecord {
            limit: 3,
            holders: vec!["alive".to_string(), "dead".to_string(), String::new()],
        };
        let pairs = vec![KvPair {
            key: "svc/sem/alive".to_string(),
            session: Some("alive".to_string()),
            value: Some(b"v".to_vec()),
            ..Default::default()
        }];

        let alive = prune_dead_holders(&mut record, &pairs);
        assert_eq!(record.holders, vec!["alive", "", ""]);
        assert_eq!(
            alive.get("alive").cloned().flatten().as_deref(),
            Some(b"v".as_slice())
        );
    }

    #[test]
    fn test_find_record_ignores_contenders() {
        let pairs = vec![
            KvPair {
                key: "svc/sem/.lock".to_string(),
                ..Default::default()
            },
            KvPair {
                key: "svc/sem/some-session".to_string(),
                ..Default::default()
            },
        ];
        let found = find_record(&pairs, "svc/sem/.lock").unwrap();
        assert_eq!(found.key, "svc/sem/.lock");
        assert!(find_record(&pairs, "svc/other/.lock").is_none());
    }
}
