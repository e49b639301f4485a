// Error types for the coordination primitives

/// Errors returned by [`Lock`](crate::Lock) and
/// [`Semaphore`](crate::Semaphore) operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The handle already holds the lock or slot.
    #[error("already held")]
    Held,

    /// Release/unlock called on a handle that holds nothing.
    #[error("not held")]
    NotHeld,

    /// Destroy refused because another live session still holds the resource.
    #[error("in use by another session")]
    InUse,

    /// The key is already tagged for the other coordination primitive.
    #[error("existing key does not match expected use")]
    FlagConflict,

    /// Contenders on one semaphore prefix disagree on the slot limit.
    #[error("semaphore limit conflict (stored: {stored}, local: {local})")]
    LimitMismatch { stored: usize, local: usize },

    /// The session was confirmed gone during renewal.
    #[error("session expired")]
    SessionExpired,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Opaque failure from the external store (connectivity, decoding).
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
