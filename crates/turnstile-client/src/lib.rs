//! Distributed coordination primitives over a Consul-compatible KV store.
//!
//! This crate provides a single-holder [`Lock`] and a counting [`Semaphore`]
//! that let independent processes agree on mutual exclusion or bounded
//! concurrency without talking to each other directly. All coordination goes
//! through an external, linearizable KV store with session-based liveness
//! tracking, consumed through the [`store::KvStore`] / [`store::SessionStore`]
//! traits. Two implementations ship here: [`HttpStore`] speaks the
//! Consul-compatible HTTP API, and [`MemoryStore`] keeps everything
//! in-process (tests, embedded use).
//!
//! Holding a lock or a slot is *advisory and leased*: the returned ownership
//! channel can flip at any time if the backing session is invalidated, and
//! applications must be prepared to observe that and stop relying on the
//! resource.

pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod http;
pub mod lock;
pub mod memory;
pub mod semaphore;
pub mod session;
pub mod store;

pub use client::TurnstileClient;
pub use config::StoreConfig;
pub use error::Error;
pub use http::HttpStore;
pub use lock::{Lock, LockOptions};
pub use memory::MemoryStore;
pub use semaphore::{Semaphore, SemaphoreOptions};
pub use store::{KvStore, SessionStore, Store};
