//! Lock behavior against the in-process store

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use turnstile_api::{KvPair, QueryOptions, SESSION_BEHAVIOR_RELEASE, SessionEntry};
use turnstile_client::constants::{LOCK_FLAG_VALUE, SEMAPHORE_FLAG_VALUE};
use turnstile_client::{Error, KvStore, Lock, LockOptions, MemoryStore, SessionStore, Store};

fn memory() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

fn fast_opts(key: &str) -> LockOptions {
    let mut opts = LockOptions::new(key);
    opts.lock_wait_time = Duration::from_millis(100);
    opts
}

#[tokio::test]
async fn test_acquire_and_unlock() {
    let store = memory();
    let lock = Lock::new(store.clone(), LockOptions::new("svc/leader")).unwrap();

    let held = lock.acquire(None).await.unwrap().expect("should acquire");
    assert!(*held.borrow());

    // The key is bound to our session and tagged as a lock
    let (pair, _) = store
        .get("svc/leader", &QueryOptions::default())
        .await
        .unwrap();
    let pair = pair.unwrap();
    assert!(pair.session.is_some());
    assert_eq!(pair.flags, LOCK_FLAG_VALUE);

    lock.unlock().await.unwrap();
    let (pair, _) = store
        .get("svc/leader", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(pair.unwrap().session, None);
}

#[tokio::test]
async fn test_double_acquire_is_rejected() {
    let store = memory();
    let lock = Lock::new(store, fast_opts("svc/leader")).unwrap();
    let _held = lock.acquire(None).await.unwrap().expect("first claim");
    assert!(matches!(lock.acquire(None).await, Err(Error::Held)));
}

#[tokio::test]
async fn test_unlock_without_holding() {
    let store = memory();
    let lock = Lock::new(store, fast_opts("svc/leader")).unwrap();
    assert!(matches!(lock.unlock().await, Err(Error::NotHeld)));
}

#[tokio::test]
async fn test_mutual_exclusion() {
    let store = memory();
    let first = Lock::new(store.clone(), fast_opts("svc/leader")).unwrap();
    let second = Lock::new(store.clone(), {
        let mut opts = fast_opts("svc/leader");
        opts.lock_try_once = true;
        opts
    })
    .unwrap();

    let held = first.acquire(None).await.unwrap().expect("first claim");
    assert!(*held.borrow());

    // The one-shot contender gives up once its wait window is spent
    let outcome = second.acquire(None).await.unwrap();
    assert!(outcome.is_none());

    first.unlock().await.unwrap();
    let held = second
        .acquire(None)
        .await
        .unwrap()
        .expect("claim after release");
    assert!(*held.borrow());
}

#[tokio::test]
async fn test_lost_then_reclaim_same_handle() {
    let store = memory();
    let lock = Lock::new(store.clone(), fast_opts("svc/leader")).unwrap();

    let mut held = lock.acquire(None).await.unwrap().expect("claim");

    // Operator intervention: the key disappears outside the handle
    store.delete("svc/leader").await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), held.wait_for(|h| !*h))
        .await
        .expect("monitor should notice the loss")
        .unwrap();

    // Same handle, fresh attempt
    let held = lock.acquire(None).await.unwrap().expect("reclaim");
    assert!(*held.borrow());
    lock.unlock().await.unwrap();
}

#[tokio::test]
async fn test_external_session_destroy_frees_lock() {
    let store = memory();
    let session = store
        .create(&SessionEntry {
            ttl: "15s".to_string(),
            behavior: SESSION_BEHAVIOR_RELEASE.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut opts = fast_opts("svc/leader");
    opts.session = Some(session.clone());
    let lock = Lock::new(store.clone(), opts).unwrap();
    let mut held = lock.acquire(None).await.unwrap().expect("claim");

    // The session dies without an unlock; the binding goes with it
    store.destroy(&session).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), held.wait_for(|h| !*h))
        .await
        .expect("monitor should notice")
        .unwrap();

    // Any other participant can now take the lock
    let other = Lock::new(store.clone(), fast_opts("svc/leader")).unwrap();
    let held = other
        .acquire(None)
        .await
        .unwrap()
        .expect("free after session death");
    assert!(*held.borrow());
}

#[tokio::test]
async fn test_flag_conflict_on_semaphore_tagged_key() {
    let store = memory();
    store
        .put(&KvPair {
            key: "svc/sem/.lock".to_string(),
            flags: SEMAPHORE_FLAG_VALUE,
            value: Some(b"{}".to_vec()),
            ..Default::default()
        })
        .await
        .unwrap();

    let lock = Lock::new(store.clone(), fast_opts("svc/sem/.lock")).unwrap();
    assert!(matches!(lock.acquire(None).await, Err(Error::FlagConflict)));
    assert!(matches!(lock.destroy().await, Err(Error::FlagConflict)));

    // The existing record was left untouched
    let (pair, _) = store
        .get("svc/sem/.lock", &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(pair.unwrap().flags, SEMAPHORE_FLAG_VALUE);
}

#[tokio::test]
async fn test_acquire_stops_on_signal() {
    let store = memory();
    let holder = Lock::new(store.clone(), fast_opts("svc/leader")).unwrap();
    let _held = holder.acquire(None).await.unwrap().expect("claim");

    let contender = Lock::new(store.clone(), fast_opts("svc/leader")).unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);

    let attempt = tokio::spawn(async move { contender.acquire(Some(stop_rx)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop_tx.send(true).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), attempt)
        .await
        .expect("should give up within a wait window")
        .unwrap()
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn test_destroy() {
    let store = memory();
    let lock = Lock::new(store.clone(), fast_opts("svc/leader")).unwrap();

    // Destroying an absent key is a no-op success
    lock.destroy().await.unwrap();

    let _held = lock.acquire(None).await.unwrap().expect("claim");
    assert!(matches!(lock.destroy().await, Err(Error::Held)));

    // While a live session is bound, any other handle sees in-use
    let other = Lock::new(store.clone(), fast_opts("svc/leader")).unwrap();
    assert!(matches!(other.destroy().await, Err(Error::InUse)));

    lock.unlock().await.unwrap();
    lock.destroy().await.unwrap();
    let (pair, _) = store
        .get("svc/leader", &QueryOptions::default())
        .await
        .unwrap();
    assert!(pair.is_none());
}
