// External store contract consumed by the coordination primitives

use async_trait::async_trait;
use turnstile_api::{KvPair, QueryMeta, QueryOptions, SessionEntry};

/// Ordered key-value store with CAS and session-bound acquisition.
///
/// Every mutation here is conditional or session-scoped; the coordination
/// primitives never overwrite shared state unconditionally.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read one key. Honors `wait_index`/`wait_time` blocking semantics.
    async fn get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> anyhow::Result<(Option<KvPair>, QueryMeta)>;

    /// List all entries under a prefix, ordered by key.
    async fn list(
        &self,
        prefix: &str,
        opts: &QueryOptions,
    ) -> anyhow::Result<(Vec<KvPair>, QueryMeta)>;

    /// Unconditional write of `pair.value`/`pair.flags` to `pair.key`.
    async fn put(&self, pair: &KvPair) -> anyhow::Result<bool>;

    /// Atomically bind `pair.key` to `pair.session`. Returns false if the key
    /// is already bound to a different live session. Errors if the session
    /// itself is unknown or expired.
    async fn acquire(&self, pair: &KvPair) -> anyhow::Result<bool>;

    /// Release `pair.key`'s binding to `pair.session`. Returns false if the
    /// key is not bound to that session.
    async fn release(&self, pair: &KvPair) -> anyhow::Result<bool>;

    /// Conditional write against `pair.modify_index`; an expected index of 0
    /// means create-only-if-absent.
    async fn cas(&self, pair: &KvPair) -> anyhow::Result<bool>;

    /// Unconditional delete. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Conditional delete against `pair.modify_index`.
    async fn delete_cas(&self, pair: &KvPair) -> anyhow::Result<bool>;
}

/// Session lifecycle operations.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session from `entry`; returns its id.
    async fn create(&self, entry: &SessionEntry) -> anyhow::Result<String>;

    /// Renew a session. `Ok(None)` once the session is confirmed gone.
    async fn renew(&self, id: &str) -> anyhow::Result<Option<SessionEntry>>;

    /// Destroy a session, applying its expiry behavior to bound keys.
    async fn destroy(&self, id: &str) -> anyhow::Result<bool>;
}

/// A store offering both halves of the contract. Blanket-implemented; the
/// handles hold the store as `Arc<dyn Store>`.
pub trait Store: KvStore + SessionStore {}

impl<T: KvStore + SessionStore + ?Sized> Store for T {}
