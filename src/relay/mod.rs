//! Relay Module
//!
//! The relay map names the publicly hosted packet-relay regions peers can
//! meet on when direct UDP is impossible. The map is fetched once at
//! startup (or supplied as JSON by the caller) and treated as immutable
//! for the session. The same document is handed verbatim to the tunnel
//! engine inside map responses, so its field names follow the provider's
//! wire format.

mod client;
pub mod protocol;
mod server;

pub use client::{probe_region, RelayClient, RelaySender};
pub use server::RelayServer;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Where the provider publishes its default relay map
pub const DEFAULT_RELAY_MAP_URL: &str = "https://controlplane.tailscale.com/derpmap/default";

/// The relay regions available for overlay rendezvous
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RelayMap {
    #[serde(rename = "Regions")]
    pub regions: HashMap<u16, RelayRegion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RelayRegion {
    #[serde(rename = "RegionID")]
    pub region_id: u16,
    #[serde(rename = "RegionName")]
    pub region_name: String,
    #[serde(rename = "Nodes")]
    pub nodes: Vec<RelayNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayNode {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RegionID")]
    pub region_id: u16,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "DERPPort")]
    pub port: u16,
}

impl Default for RelayNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            region_id: 0,
            host_name: String::new(),
            port: 443,
        }
    }
}

impl RelayNode {
    /// host:port string for dialing this node
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host_name, self.port)
    }
}

impl RelayMap {
    /// Fetch the provider's default relay map
    pub async fn fetch_default() -> Result<Self> {
        Self::fetch(DEFAULT_RELAY_MAP_URL).await
    }

    /// Fetch a relay map from `url`
    pub async fn fetch(url: &str) -> Result<Self> {
        let map: RelayMap = reqwest::get(url)
            .await
            .map_err(|e| Error::RelayMapUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::RelayMapUnavailable(e.to_string()))?;

        if map.regions.is_empty() {
            return Err(Error::RelayMapEmpty);
        }
        Ok(map)
    }

    /// Parse a caller-supplied relay map document
    pub fn from_json(raw: &str) -> Result<Self> {
        let map: RelayMap = serde_json::from_str(raw)?;
        if map.regions.is_empty() {
            return Err(Error::RelayMapEmpty);
        }
        Ok(map)
    }

    /// A single-region map; the integration tests point this at an
    /// in-process relay
    pub fn single(region_id: u16, name: &str, host: &str, port: u16) -> Self {
        let mut regions = HashMap::new();
        regions.insert(
            region_id,
            RelayRegion {
                region_id,
                region_name: name.to_string(),
                nodes: vec![RelayNode {
                    name: format!("{name}-1"),
                    region_id,
                    host_name: host.to_string(),
                    port,
                }],
            },
        );
        Self { regions }
    }

    pub fn region(&self, region_id: u16) -> Option<&RelayRegion> {
        self.regions.get(&region_id)
    }

    pub fn region_name(&self, region_id: u16) -> Option<&str> {
        self.region(region_id).map(|r| r.region_name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Probe every region and return the lowest-latency one
    pub async fn lowest_latency_region(&self, connect_timeout: Duration) -> Option<u16> {
        let mut best: Option<(u16, Duration)> = None;
        for &id in self.regions.keys() {
            match probe_region(self, id, connect_timeout).await {
                Ok(rtt) => {
                    debug!("region {} responded in {:?}", id, rtt);
                    if best.map_or(true, |(_, b)| rtt < b) {
                        best = Some((id, rtt));
                    }
                }
                Err(e) => debug!("region {} probe failed: {}", id, e),
            }
        }
        best.map(|(id, _)| id)
    }
}
