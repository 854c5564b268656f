//! Burrow - Peer-to-peer tunnels through NAT from one pasteable auth key
//!
//! Burrow connects two hosts that may both sit behind NAT without
//! pre-shared keys, open ports, or a persistent identity service. A
//! listener prints a short Base58 auth key; any sender given that key
//! out-of-band can reach the listener over an encrypted WireGuard tunnel.
//!
//! # Architecture
//!
//! The crate owns the rendezvous and tunnel-establishment core:
//!
//! - an auth-key codec packing the listener's key, the session overlay
//!   key, and reachability hints into one printable credential
//! - an overlay sidechannel of sealed-box messages over a packet relay
//!   or direct UDP, used to exchange tunnel-node descriptors and
//!   heartbeats
//! - an embedded control plane that speaks the tunnel engine's
//!   coordination protocol in-process, synthesizing registrations and
//!   streaming network-map updates driven by overlay events
//! - an in-memory dialer that routes the engine's control client to the
//!   embedded control plane without sockets or TLS
//!
//! The tunnel data plane itself (WireGuard user-space, NAT traversal,
//! relay data transport) is the embedded engine's job; hosts hand it the
//! control-plane dialer and the node streams wired up here.

pub mod control;
pub mod error;
pub mod key;
pub mod netmap;
pub mod overlay;
pub mod relay;
pub mod settings;
pub mod stun;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::control::{ControlServer, MemDialer, NetMapUpdate};
    pub use crate::error::{Error, Result};
    pub use crate::key::{PublicKey, SecretKey};
    pub use crate::netmap::Node;
    pub use crate::overlay::{AuthKey, NodeUpdateSink, ReceiveOverlay, SendOverlay};
    pub use crate::relay::RelayMap;
    pub use crate::settings::Settings;
}
