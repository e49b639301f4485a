//! Managed-session bookkeeping shared by the lock and semaphore handles

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing::warn;
use turnstile_api::{SessionEntry, parse_duration};

use crate::constants::DEFAULT_SESSION_TTL;
use crate::error::Error;
use crate::store::{SessionStore, Store};

/// Create a session a handle will own and renew itself.
pub(crate) async fn create_managed_session(
    store: &Arc<dyn Store>,
    name: &str,
    ttl: &str,
    behavior: &str,
) -> Result<String, Error> {
    let entry = SessionEntry {
        name: name.to_string(),
        ttl: ttl.to_string(),
        behavior: behavior.to_string(),
        ..Default::default()
    };
    Ok(store.create(&entry).await?)
}

/// Renew session `id` every half TTL until `stop` fires — the session is
/// then destroyed — or the store reports it gone, which surfaces as
/// [`Error::SessionExpired`]. Dropping the stop sender counts as stopping.
pub async fn renew_periodic(
    store: Arc<dyn Store>,
    ttl: &str,
    id: &str,
    mut stop: oneshot::Receiver<()>,
) -> Result<(), Error> {
    let initial = parse_duration(ttl).unwrap_or_else(|| {
        parse_duration(DEFAULT_SESSION_TTL).unwrap_or_default()
    });
    let mut wait = initial / 2;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                match store.renew(id).await {
                    Ok(Some(entry)) => {
                        // Follow a TTL the server pushes back
                        if let Some(ttl) = parse_duration(&entry.ttl) {
                            wait = ttl / 2;
                        }
                    }
                    Ok(None) => return Err(Error::SessionExpired),
                    Err(e) => return Err(Error::Store(e)),
                }
            }
            _ = &mut stop => {
                let _ = store.destroy(id).await;
                return Ok(());
            }
        }
    }
}

/// Spawn the renewal task for a self-owned session; returns the sender that
/// cancels it (and thereby destroys the session).
pub(crate) fn spawn_renewal(store: Arc<dyn Store>, ttl: String, id: String) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if let Err(e) = renew_periodic(store, &ttl, &id, rx).await {
            warn!("session {} renewal ended: {}", id, e);
        }
    });
    tx
}

/// Non-blocking check of an optional stop signal at a loop boundary.
pub(crate) fn stop_requested(stop: &Option<watch::Receiver<bool>>) -> bool {
    stop.as_ref().map(|s| *s.borrow()).unwrap_or(false)
}

/// Resolves once the stop signal fires; pends forever without one.
pub(crate) async fn stop_fired(stop: &mut Option<watch::Receiver<bool>>) {
    match stop {
        Some(rx) => loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without firing; nothing left to wait for
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::SessionStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_renew_periodic_stop_destroys_session() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let id = create_managed_session(&store, "test", "15s", "release")
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let task = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { renew_periodic(store, "15s", &id, rx).await })
        };

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert!(store.renew(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_periodic_reports_expiry() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let id = create_managed_session(&store, "test", "200ms", "release")
            .await
            .unwrap();

        // Destroy behind the renewer's back; the next renewal attempt finds
        // the session gone.
        store.destroy(&id).await.unwrap();

        let (_tx, rx) = oneshot::channel::<()>();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            renew_periodic(store, "200ms", &id, rx),
        )
        .await
        .expect("renewal should notice the lost session quickly");

        assert!(matches!(result, Err(Error::SessionExpired)));
    }

    #[test]
    fn test_stop_requested() {
        assert!(!stop_requested(&None));

        let (tx, rx) = watch::channel(false);
        let stop = Some(rx);
        assert!(!stop_requested(&stop));
        tx.send(true).unwrap();
        assert!(stop_requested(&stop));
    }
}
