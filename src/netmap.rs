//! Network-map wire documents
//!
//! The JSON documents exchanged between a tunnel engine and its control
//! server: node descriptors, registration bodies, map requests, and map
//! responses. Field names follow the engine's wire protocol, so every
//! struct carries explicit serde renames.
//!
//! The overlay treats `Node` as an opaque blob; only `key` is inspected,
//! for dedup and routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::PublicKey;
use crate::relay::RelayMap;

/// Capability version at which the engine switches to the upgraded
/// control protocol; older versions are rejected on key exchange.
pub const MIN_CAPABILITY_VERSION: u32 = 39;

/// A node as described to the tunnel engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Node {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "StableID")]
    pub stable_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "User")]
    pub user: i64,
    /// The engine's node key; the identity used for dedup and routing
    #[serde(rename = "Key")]
    pub key: PublicKey,
    #[serde(rename = "Machine")]
    pub machine: PublicKey,
    #[serde(rename = "DiscoKey")]
    pub disco_key: PublicKey,
    /// Tunnel addresses in CIDR form, e.g. `fd7a:115c:a1e0::1/128`
    #[serde(rename = "Addresses")]
    pub addresses: Vec<String>,
    #[serde(rename = "AllowedIPs")]
    pub allowed_ips: Vec<String>,
    #[serde(rename = "Endpoints")]
    pub endpoints: Vec<String>,
    /// Relay home in the engine's legacy `127.3.3.40:<region>` form
    #[serde(rename = "DERP")]
    pub relay_addr: String,
    #[serde(rename = "Hostinfo")]
    pub hostinfo: Hostinfo,
    #[serde(rename = "Online", skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(rename = "LastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(rename = "Cap")]
    pub cap: u32,
    #[serde(rename = "MachineAuthorized")]
    pub machine_authorized: bool,
}

impl Node {
    /// Preferred relay region recorded in the node's host info, 0 if unset
    pub fn preferred_relay(&self) -> u16 {
        self.hostinfo
            .net_info
            .as_ref()
            .map(|ni| ni.preferred_relay)
            .unwrap_or(0)
    }
}

/// Host metadata the engine reports about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Hostinfo {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "OS")]
    pub os: String,
    #[serde(rename = "NetInfo", skip_serializing_if = "Option::is_none")]
    pub net_info: Option<NetInfo>,
    #[serde(rename = "RoutableIPs")]
    pub routable_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetInfo {
    #[serde(rename = "PreferredDERP")]
    pub preferred_relay: u16,
}

/// An incremental change to a known peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PeerChange {
    #[serde(rename = "NodeID")]
    pub node_id: i64,
    #[serde(rename = "Key", skip_serializing_if = "Option::is_none")]
    pub key: Option<PublicKey>,
    #[serde(rename = "DiscoKey", skip_serializing_if = "Option::is_none")]
    pub disco_key: Option<PublicKey>,
    #[serde(rename = "Online", skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(rename = "Endpoints", skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<String>>,
    /// 0 means "no change"
    #[serde(rename = "DERPRegion")]
    pub relay_region: u16,
    #[serde(rename = "LastSeen", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerChange {
    /// True when the change carries nothing observable
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
            && self.disco_key.is_none()
            && self.online.is_none()
            && self.endpoints.is_none()
            && self.relay_region == 0
    }
}

/// Body of the key-exchange endpoint's reply
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeyExchangeResponse {
    #[serde(rename = "PublicKey")]
    pub public_key: PublicKey,
}

/// Registration body sent by the engine over the upgraded channel
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegisterRequest {
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "NodeKey")]
    pub node_key: PublicKey,
    #[serde(rename = "Hostinfo", skip_serializing_if = "Option::is_none")]
    pub hostinfo: Option<Hostinfo>,
    #[serde(rename = "Auth")]
    pub auth: RegisterAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegisterAuth {
    #[serde(rename = "AuthKey")]
    pub auth_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegisterResponse {
    #[serde(rename = "User")]
    pub user: User,
    #[serde(rename = "Login")]
    pub login: Login,
    #[serde(rename = "MachineAuthorized")]
    pub machine_authorized: bool,
    #[serde(rename = "Error", skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct User {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "LoginName")]
    pub login_name: String,
    #[serde(rename = "DisplayName")]
    pub display_name: String,
    #[serde(rename = "Created", skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Login {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "LoginName")]
    pub login_name: String,
    #[serde(rename = "DisplayName")]
    pub display_name: String,
}

/// Map request from the engine: either a long-poll stream subscription or
/// a fire-and-forget endpoint update
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MapRequest {
    #[serde(rename = "Version")]
    pub version: u32,
    /// `"zstd"` requests compressed map responses
    #[serde(rename = "Compress")]
    pub compress: String,
    #[serde(rename = "NodeKey")]
    pub node_key: PublicKey,
    #[serde(rename = "DiscoKey")]
    pub disco_key: PublicKey,
    #[serde(rename = "Endpoints")]
    pub endpoints: Vec<String>,
    #[serde(rename = "Stream")]
    pub stream: bool,
    #[serde(rename = "OmitPeers")]
    pub omit_peers: bool,
    #[serde(rename = "Hostinfo", skip_serializing_if = "Option::is_none")]
    pub hostinfo: Option<Hostinfo>,
}

/// The two request shapes the engine is known to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapRequestKind {
    Streaming,
    EndpointUpdate,
    Unknown,
}

impl MapRequest {
    pub fn kind(&self) -> MapRequestKind {
        if self.stream {
            MapRequestKind::Streaming
        } else if self.omit_peers {
            MapRequestKind::EndpointUpdate
        } else {
            MapRequestKind::Unknown
        }
    }
}

/// One frame of the long-polled map stream
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MapResponse {
    #[serde(rename = "KeepAlive")]
    pub keep_alive: bool,
    #[serde(rename = "ControlTime", skip_serializing_if = "Option::is_none")]
    pub control_time: Option<DateTime<Utc>>,
    #[serde(rename = "Node", skip_serializing_if = "Option::is_none")]
    pub node: Option<Node>,
    #[serde(rename = "DERPMap", skip_serializing_if = "Option::is_none")]
    pub relay_map: Option<RelayMap>,
    #[serde(rename = "Peers", skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<Node>,
    #[serde(rename = "PeersChangedPatch", skip_serializing_if = "Vec::is_empty")]
    pub peers_changed_patch: Vec<PeerChange>,
    #[serde(rename = "PacketFilter", skip_serializing_if = "Vec::is_empty")]
    pub packet_filter: Vec<FilterRule>,
}

/// One packet-filter rule in the network map
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FilterRule {
    #[serde(rename = "SrcIPs")]
    pub src_ips: Vec<String>,
    #[serde(rename = "DstPorts")]
    pub dst_ports: Vec<NetPortRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetPortRange {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Ports")]
    pub ports: PortRange,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PortRange {
    #[serde(rename = "First")]
    pub first: u16,
    #[serde(rename = "Last")]
    pub last: u16,
}

/// The permit-everything packet filter served to both peers
pub fn filter_allow_all() -> Vec<FilterRule> {
    vec![FilterRule {
        src_ips: vec!["*".to_string()],
        dst_ports: vec![NetPortRange {
            ip: "*".to_string(),
            ports: PortRange { first: 0, last: 65535 },
        }],
    }]
}

/// Diff a map request against the stored self node, yielding the peer
/// change to apply. Endpoints are always taken from the request.
pub fn request_change(node: &Node, req: &MapRequest) -> PeerChange {
    let mut change = PeerChange {
        node_id: node.id,
        ..Default::default()
    };

    if node.key != req.node_key {
        change.key = Some(req.node_key);
    }
    if node.disco_key != req.disco_key {
        change.disco_key = Some(req.disco_key);
    }
    if let Some(hi) = &req.hostinfo {
        if let Some(ni) = &hi.net_info {
            if node.preferred_relay() != ni.preferred_relay {
                change.relay_region = ni.preferred_relay;
            }
        }
    }
    if node.endpoints != req.endpoints {
        change.endpoints = Some(req.endpoints.clone());
    }
    change.last_seen = Some(Utc::now());
    change
}

/// Diff two snapshots of the same peer, for patching a remote node into
/// an established stream
pub fn peer_change(old: &Node, new: &Node) -> PeerChange {
    let mut change = PeerChange {
        node_id: old.id,
        ..Default::default()
    };

    if old.key != new.key {
        change.key = Some(new.key);
    }
    if old.disco_key != new.disco_key {
        change.disco_key = Some(new.disco_key);
    }
    if old.online != new.online {
        change.online = new.online;
    }
    if old.endpoints != new.endpoints {
        change.endpoints = Some(new.endpoints.clone());
    }
    if old.preferred_relay() != new.preferred_relay() {
        change.relay_region = new.preferred_relay();
    }
    change
}

/// Apply a change in place
pub fn apply_change(node: &mut Node, change: &PeerChange) {
    if let Some(key) = change.key {
        node.key = key;
    }
    if let Some(disco) = change.disco_key {
        node.disco_key = disco;
    }
    if let Some(online) = change.online {
        node.online = Some(online);
    }
    if let Some(endpoints) = &change.endpoints {
        node.endpoints = endpoints.clone();
    }
    if change.relay_region != 0 {
        match &mut node.hostinfo.net_info {
            Some(ni) => ni.preferred_relay = change.relay_region,
            None => {
                node.hostinfo.net_info = Some(NetInfo {
                    preferred_relay: change.relay_region,
                });
            }
        }
        node.relay_addr = format!("127.3.3.40:{}", change.relay_region);
    }
    if change.last_seen.is_some() {
        node.last_seen = change.last_seen;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;

    fn sample_node() -> Node {
        Node {
            id: 7,
            stable_id: "abc".into(),
            name: "laptop".into(),
            key: SecretKey::generate().public(),
            disco_key: SecretKey::generate().public(),
            endpoints: vec!["192.0.2.1:41641".into()],
            hostinfo: Hostinfo {
                hostname: "laptop".into(),
                net_info: Some(NetInfo { preferred_relay: 1 }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn node_json_uses_wire_names() {
        let node = sample_node();
        let json = serde_json::to_value(&node).unwrap();
        assert!(json.get("ID").is_some());
        assert!(json.get("StableID").is_some());
        assert!(json.get("DiscoKey").is_some());
        assert!(json.get("AllowedIPs").is_some());
    }

    #[test]
    fn map_request_kinds() {
        let mut req = MapRequest {
            stream: true,
            ..Default::default()
        };
        assert_eq!(req.kind(), MapRequestKind::Streaming);

        req.stream = false;
        req.omit_peers = true;
        assert_eq!(req.kind(), MapRequestKind::EndpointUpdate);

        req.omit_peers = false;
        assert_eq!(req.kind(), MapRequestKind::Unknown);
    }

    #[test]
    fn request_change_detects_relay_move() {
        let node = sample_node();
        let req = MapRequest {
            node_key: node.key,
            disco_key: node.disco_key,
            endpoints: node.endpoints.clone(),
            hostinfo: Some(Hostinfo {
                net_info: Some(NetInfo { preferred_relay: 7 }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let change = request_change(&node, &req);
        assert_eq!(change.relay_region, 7);
        assert!(change.key.is_none());
        assert!(change.endpoints.is_none());
    }

    #[test]
    fn unchanged_request_is_empty() {
        let node = sample_node();
        let req = MapRequest {
            node_key: node.key,
            disco_key: node.disco_key,
            endpoints: node.endpoints.clone(),
            hostinfo: Some(node.hostinfo.clone()),
            ..Default::default()
        };

        let change = request_change(&node, &req);
        assert!(change.is_empty());
    }

    #[test]
    fn apply_change_updates_relay_home() {
        let mut node = sample_node();
        let change = PeerChange {
            node_id: node.id,
            relay_region: 9,
            ..Default::default()
        };
        apply_change(&mut node, &change);
        assert_eq!(node.preferred_relay(), 9);
        assert_eq!(node.relay_addr, "127.3.3.40:9");
    }

    #[test]
    fn peer_change_between_snapshots() {
        let old = sample_node();
        let mut new = old.clone();
        new.endpoints = vec!["198.51.100.4:3478".into()];
        new.hostinfo.net_info = Some(NetInfo { preferred_relay: 4 });

        let change = peer_change(&old, &new);
        assert_eq!(change.relay_region, 4);
        assert_eq!(change.endpoints.as_deref(), Some(&new.endpoints[..]));
        assert!(change.key.is_none());

        let identical = peer_change(&old, &old.clone());
        assert!(identical.is_empty());
    }

    #[test]
    fn allow_all_filter_shape() {
        let rules = filter_allow_all();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].src_ips, vec!["*"]);
        assert_eq!(rules[0].dst_ports[0].ports.last, 65535);
    }
}
