//! Turnstile API - wire models for a Consul-compatible KV and session store
//!
//! This crate provides:
//! - KV entry and query models shared by every store implementation
//! - Session models and expiry behavior constants
//! - Duration-string parsing for TTL fields

pub mod kv;
pub mod session;

// Re-export commonly used types
pub use kv::*;
pub use session::*;
