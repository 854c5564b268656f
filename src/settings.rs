//! Overlay and Control-Plane Settings
//!
//! Timing and queue tunables. The crate keeps no on-disk state; hosts embed
//! a `Settings` (usually `Settings::default()`) when constructing the
//! overlay and control plane. Tests shorten the intervals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable intervals and queue depths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interval between overlay heartbeat pings from the active side
    pub heartbeat_interval: Duration,
    /// How long a sender waits for the first hello response before
    /// giving up with `PeerUnreachable`
    pub hello_timeout: Duration,
    /// Interval between STUN binding requests (listener, UDP mode)
    pub stun_interval: Duration,
    /// STUN server queried for the reflexive address
    pub stun_server: String,
    /// Interval between keep-alive frames on a streaming map response
    pub keepalive_interval: Duration,
    /// Delay before redialing a lost overlay transport
    pub reconnect_delay: Duration,
    /// TCP connect timeout for relay nodes
    pub connect_timeout: Duration,
    /// Depth of the bounded channels between overlay tasks
    pub queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(10),
            stun_interval: Duration::from_secs(30),
            stun_server: "stun.l.google.com:19302".to_string(),
            keepalive_interval: Duration::from_secs(50),
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            queue_depth: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_cadence() {
        let s = Settings::default();
        assert_eq!(s.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(s.hello_timeout, Duration::from_secs(10));
        assert_eq!(s.keepalive_interval, Duration::from_secs(50));
        assert_eq!(s.queue_depth, 8);
    }

    #[test]
    fn deserializes_partial_overrides() {
        let s: Settings = serde_json::from_str(r#"{"queue_depth": 16}"#).unwrap();
        assert_eq!(s.queue_depth, 16);
        assert_eq!(s.heartbeat_interval, Duration::from_secs(30));
    }
}
