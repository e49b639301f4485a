// KV and session API path constants following the Consul HTTP API

pub mod api_path {
    pub const KV: &str = "/v1/kv/";
    pub const SESSION_CREATE: &str = "/v1/session/create";
    pub const SESSION_DESTROY: &str = "/v1/session/destroy/";
    pub const SESSION_RENEW: &str = "/v1/session/renew/";
}

use std::time::Duration;

/// Session name assigned to a lock's self-owned session if none is provided.
pub const DEFAULT_LOCK_SESSION_NAME: &str = "Turnstile lock";

/// Session name assigned to a semaphore's self-owned session if none is provided.
pub const DEFAULT_SEMAPHORE_SESSION_NAME: &str = "Turnstile semaphore";

/// Default TTL for self-owned sessions. Renewal runs at half this interval.
pub const DEFAULT_SESSION_TTL: &str = "15s";

/// How long a single blocking read waits while trying to claim a lock.
/// This bounds the minimum time it takes to cancel an acquisition.
pub const DEFAULT_LOCK_WAIT_TIME: Duration = Duration::from_secs(15);

/// How long a single blocking read waits while trying to claim a slot.
pub const DEFAULT_SEMAPHORE_WAIT_TIME: Duration = Duration::from_secs(15);

/// How long a single blocking read waits while watching a semaphore.
/// This bounds the minimum time it takes to stop watching.
pub const DEFAULT_WATCH_WAIT_TIME: Duration = Duration::from_secs(5);

/// Delay before retrying after a session-bound acquisition is refused while
/// the key shows no live holder: the store may be enforcing a post-release
/// lock delay, and hot-looping through it helps nobody.
pub const DEFAULT_RETRY_TIME: Duration = Duration::from_secs(5);

/// How many transient read errors the ownership monitor rides out before
/// declaring the resource lost.
pub const DEFAULT_MONITOR_RETRIES: u32 = 3;

/// Pause between monitor retry attempts.
pub const DEFAULT_MONITOR_RETRY_TIME: Duration = Duration::from_secs(2);

/// Key under the semaphore prefix holding the shared slot record.
pub const SEMAPHORE_RECORD_KEY: &str = ".lock";

/// Magic flag marking a key as semaphore-owned. Used to detect a collision
/// between a semaphore prefix and a lock key.
pub const SEMAPHORE_FLAG_VALUE: u64 = 0x9642d0084d1d424d;

/// Lock keys carry no special flag; an existing key with any other flag
/// value is not usable as a lock.
pub const LOCK_FLAG_VALUE: u64 = 0;
