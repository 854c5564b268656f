//! Overlay Module
//!
//! The overlay is the end-to-end encrypted sidechannel peers use for
//! rendezvous: it runs alongside (not through) the tunnel, carrying node
//! descriptors, heartbeats, and connection signaling over a relay or
//! direct UDP. Every message crosses the wire as a sealed box; the JSON
//! cleartext is a discriminated message.

pub mod auth;
pub mod receive;
pub mod send;

pub use auth::AuthKey;
pub use receive::ReceiveOverlay;
pub use send::SendOverlay;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::key::PublicKey;
use crate::netmap::Node;

/// The service prefix all tunnel addresses live under
pub const SERVICE_PREFIX: [u8; 6] = [0xfd, 0x7a, 0x11, 0x5c, 0xa1, 0xe0];

/// The listener's fixed well-known tunnel address: the service prefix
/// with the low bit set
pub fn listener_ip() -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[..6].copy_from_slice(&SERVICE_PREFIX);
    octets[15] = 0x01;
    Ipv6Addr::from(octets)
}

/// A random tunnel address under the service prefix, generated fresh per
/// sender process. Guaranteed to differ from the listener's well-known
/// address.
pub fn random_service_ip() -> Ipv6Addr {
    loop {
        let mut octets = *Uuid::new_v4().as_bytes();
        octets[..6].copy_from_slice(&SERVICE_PREFIX);
        let ip = Ipv6Addr::from(octets);
        if ip != listener_ip() {
            return ip;
        }
    }
}

/// Who a peer says it is, for display only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HostInfo {
    pub username: String,
    pub hostname: String,
}

impl HostInfo {
    /// Identify the local host
    pub fn local() -> Self {
        Self {
            username: whoami::username(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }

    /// `user@host` with unknowns filled in, as rendered in peer events
    pub fn display(&self) -> String {
        let username = if self.username.is_empty() {
            "unknown"
        } else {
            &self.username
        };
        let hostname = if self.hostname.is_empty() {
            "unknown"
        } else {
            &self.hostname
        };
        format!("{username}@{hostname}")
    }
}

/// The overlay sidechannel messages
///
/// `Offer`/`Answer`/`Candidate` relay opaque connection-signaling blobs
/// between hosts that bridge the overlay to another transport; the core
/// only forwards them and surfaces them through [`OverlayEvents`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayMessage {
    /// Heartbeat from the active side
    Ping,
    /// Reply to a ping
    Pong,
    /// A sender introducing itself
    Hello {
        host: HostInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<Node>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer: Option<String>,
    },
    /// The listener's reply to a hello
    HelloResponse {
        host: HostInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<Node>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<String>,
    },
    /// An updated tunnel node descriptor, either direction, any time
    NodeUpdate { node: Node },
    /// Signaling offer from a bridging host
    Offer { sdp: String },
    /// Signaling answer from a bridging host
    Answer { sdp: String },
    /// Signaling candidate from a bridging host
    Candidate { candidate: String },
    /// Forward compatibility: discriminators we don't know are ignored
    #[serde(other)]
    Unknown,
}

/// Cloneable handle for pushing tunnel-node updates into an overlay's
/// out-queue
///
/// The control plane holds one of these instead of a reference to the
/// overlay, so neither side owns the other; the pair of one-way channels
/// is wired up at construction time.
#[derive(Clone)]
pub struct NodeUpdateSink {
    tx: tokio::sync::mpsc::Sender<OverlayMessage>,
}

impl NodeUpdateSink {
    /// Wrap a raw out-queue; normally obtained from an overlay's
    /// `update_sink` instead
    pub fn new(tx: tokio::sync::mpsc::Sender<OverlayMessage>) -> Self {
        Self { tx }
    }

    /// Queue `node` for delivery to the remote side, best effort
    pub async fn send(&self, node: Node) {
        let _ = self.tx.send(OverlayMessage::NodeUpdate { node }).await;
    }
}

/// Host-bound notifications from the overlay
///
/// The core emits events; the host binds them to whatever it has (a log
/// line, a UI, a bridge to another transport). All methods default to
/// doing nothing.
pub trait OverlayEvents: Send + Sync + 'static {
    /// A peer introduced itself over `transport` ("relay" or "UDP")
    fn on_peer(&self, host: &HostInfo, transport: &str) {
        let _ = (host, transport);
    }
    /// A signaling offer arrived from `peer`
    fn on_offer(&self, peer: &PublicKey, sdp: &str) {
        let _ = (peer, sdp);
    }
    /// A signaling answer arrived from `peer`
    fn on_answer(&self, peer: &PublicKey, sdp: &str) {
        let _ = (peer, sdp);
    }
    /// A signaling candidate arrived from `peer`
    fn on_candidate(&self, peer: &PublicKey, candidate: &str) {
        let _ = (peer, candidate);
    }
}

/// Default event binding: log each connection request
pub struct LogEvents;

impl OverlayEvents for LogEvents {
    fn on_peer(&self, host: &HostInfo, transport: &str) {
        info!("received connection request over {} from {}", transport, host.display());
    }
}

pub(crate) fn default_events() -> Arc<dyn OverlayEvents> {
    Arc::new(LogEvents)
}

/// The tunnel addresses a side advertises, CIDR-formatted for node
/// documents
pub(crate) fn cidr_of(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}/32"),
        IpAddr::V6(v6) => format!("{v6}/128"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_ip_is_fixed_low_address() {
        let ip = listener_ip();
        let octets = ip.octets();
        assert_eq!(&octets[..6], &SERVICE_PREFIX);
        assert_eq!(octets[15], 1);
        assert!(octets[6..15].iter().all(|&b| b == 0));
    }

    #[test]
    fn random_ips_stay_in_prefix_and_avoid_listener() {
        for _ in 0..64 {
            let ip = random_service_ip();
            assert_eq!(&ip.octets()[..6], &SERVICE_PREFIX);
            assert_ne!(ip, listener_ip());
        }
    }

    #[test]
    fn message_json_discriminator() {
        let json = serde_json::to_string(&OverlayMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let msg: OverlayMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(msg, OverlayMessage::Pong);
    }

    #[test]
    fn unknown_discriminator_is_tolerated() {
        let msg: OverlayMessage =
            serde_json::from_str(r#"{"type":"hologram","payload":"x"}"#).unwrap();
        assert_eq!(msg, OverlayMessage::Unknown);
    }

    #[test]
    fn hello_roundtrip_with_optional_fields() {
        let msg = OverlayMessage::Hello {
            host: HostInfo {
                username: "alice".into(),
                hostname: "laptop".into(),
            },
            node: None,
            offer: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("node"));
        let back: OverlayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn display_defaults_unknowns() {
        let hi = HostInfo::default();
        assert_eq!(hi.display(), "unknown@unknown");
    }
}
