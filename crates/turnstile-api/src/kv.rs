// KV wire models
// These models match the Consul KV API specification

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Base64-coded value bytes, as the KV HTTP API transmits them.
/// GET responses carry the value as a base64 string; absent values stay `None`.
pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            None => Ok(None),
            Some(s) => BASE64
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// A single KV entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "CreateIndex", default)]
    pub create_index: u64,

    /// Index of the last write to this key; the expected index for CAS writes.
    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: u64,

    /// Incremented each time a session newly binds the key.
    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,

    /// Opaque caller flags; coordination primitives use these as sentinels.
    #[serde(rename = "Flags", default)]
    pub flags: u64,

    #[serde(
        rename = "Value",
        default,
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Vec<u8>>,

    /// Session the key is bound to, if any. Ownership of this association is
    /// the store's: it is released or deleted with the session.
    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Options controlling a read against the store.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// When non-zero, ask the store to block until its consistency index
    /// passes this value (or `wait_time` elapses) before answering.
    pub wait_index: u64,

    /// Upper bound on how long a blocking read may be held server-side.
    pub wait_time: Option<Duration>,

    /// Request a fully consistent read.
    pub require_consistent: bool,
}

/// Metadata returned alongside every read.
#[derive(Debug, Clone, Default)]
pub struct QueryMeta {
    /// The store's consistency index at answer time; feed back as
    /// `wait_index` to wait for the next change.
    pub last_index: u64,
}
