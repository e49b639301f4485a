// TurnstileClient - facade tying one store to the coordination primitives

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::Error;
use crate::http::HttpStore;
use crate::lock::{Lock, LockOptions};
use crate::semaphore::{Semaphore, SemaphoreOptions};
use crate::store::Store;

/// Entry point for building coordination handles against one store.
pub struct TurnstileClient {
    store: Arc<dyn Store>,
}

impl TurnstileClient {
    /// Connect to a Consul-compatible server over HTTP
    pub fn connect(config: StoreConfig) -> anyhow::Result<Self> {
        Ok(Self {
            store: Arc::new(HttpStore::new(config)?),
        })
    }

    /// Use an already-built store, e.g. a [`MemoryStore`](crate::MemoryStore)
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The underlying store handle
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Lock handle for `key` with default options
    pub fn lock(&self, key: impl Into<String>) -> Result<Lock, Error> {
        self.lock_opts(LockOptions::new(key))
    }

    pub fn lock_opts(&self, opts: LockOptions) -> Result<Lock, Error> {
        Lock::new(self.store.clone(), opts)
    }

    /// Semaphore handle for `prefix` with `limit` slots and default options.
    /// The limit must be agreed upon by all contenders on the prefix.
    pub fn semaphore(&self, prefix: impl Into<String>, limit: usize) -> Result<Semaphore, Error> {
        self.semaphore_opts(SemaphoreOptions::new(prefix, limit))
    }

    pub fn semaphore_opts(&self, opts: SemaphoreOptions) -> Result<Semaphore, Error> {
        Semaphore::new(self.store.clone(), opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn test_handles_from_memory_store() {
        let client = TurnstileClient::with_store(Arc::new(MemoryStore::new()));
        assert!(client.lock("svc/leader").is_ok());
        assert!(client.semaphore("svc/workers", 3).is_ok());
        assert!(matches!(
            client.semaphore("svc/workers", 0),
            Err(Error::InvalidOptions(_))
        ));
    }
}
