// Session wire models
// These models match the Consul session API specification

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Expiry behavior: keys bound to the session have their binding released.
pub const SESSION_BEHAVIOR_RELEASE: &str = "release";

/// Expiry behavior: keys bound to the session are deleted with it.
pub const SESSION_BEHAVIOR_DELETE: &str = "delete";

/// A session as created against / returned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "Name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Session TTL as a duration string (e.g. "15s"). The session must be
    /// renewed within this window or the store applies `behavior`.
    #[serde(rename = "TTL", default, skip_serializing_if = "String::is_empty")]
    pub ttl: String,

    /// One of [`SESSION_BEHAVIOR_RELEASE`] or [`SESSION_BEHAVIOR_DELETE`].
    #[serde(rename = "Behavior", default, skip_serializing_if = "String::is_empty")]
    pub behavior: String,

    /// Delay the store may enforce between a release and the next
    /// acquisition of keys this session held.
    #[serde(rename = "LockDelay", default, skip_serializing_if = "Option::is_none")]
    pub lock_delay: Option<String>,
}

/// Parse a duration string ("500ms", "15s", "1m", "1h"). Bare numbers are
/// seconds. Returns `None` for anything unparseable.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (num_str, multiplier) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1u64)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1000u64)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60_000u64)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3_600_000u64)
    } else {
        (s, 1000u64)
    };

    num_str
        .parse::<u64>()
        .ok()
        .map(|n| Duration::from_millis(n * multiplier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
    }

    #[test]
    fn test_session_entry_wire_shape() {
        let entry = SessionEntry {
            name: "my-service".to_string(),
            ttl: "15s".to_string(),
            behavior: SESSION_BEHAVIOR_DELETE.to_string(),
            ..Default::default()
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"Name\":\"my-service\""));
        assert!(json.contains("\"TTL\":\"15s\""));
        assert!(json.contains("\"Behavior\":\"delete\""));
        // Empty id stays off the wire
        assert!(!json.contains("\"ID\""));
    }
}
