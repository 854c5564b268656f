//! Listener Overlay
//!
//! Accepts overlay connections from any number of senders holding this
//! session's auth key. Keeps a return path per peer, picks a relay home,
//! optionally learns a direct UDP address via STUN, and bridges node
//! descriptors between the control plane and the peers.

use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::auth::AuthKey;
use super::{
    default_events, listener_ip, HostInfo, NodeUpdateSink, OverlayEvents, OverlayMessage,
};
use crate::error::{Error, Result};
use crate::key::{PublicKey, SecretKey};
use crate::netmap::Node;
use crate::relay::{RelayClient, RelayMap, RelaySender};
use crate::settings::Settings;
use crate::stun;

/// Start the out-queue fan-out exactly once per overlay
fn ensure_broadcaster(core: &Arc<ReceiveCore>) {
    if core.broadcaster.swap(true, Ordering::SeqCst) {
        return;
    }
    let core = Arc::clone(core);
    tokio::spawn(async move {
        core.run_broadcaster().await;
    });
}

/// How a reply or broadcast reaches a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnPath {
    /// The peer's relay session key
    Relay(PublicKey),
    /// The peer's last-seen UDP source address
    Udp(SocketAddr),
}

/// The listener side of the overlay
pub struct ReceiveOverlay {
    core: Arc<ReceiveCore>,
    nodes_rx: StdMutex<Option<mpsc::Receiver<Node>>>,
}

struct ReceiveCore {
    settings: Settings,
    relay_map: Arc<RelayMap>,
    /// Long-term listener key; its public half goes into the auth key and
    /// peers seal messages to it
    self_key: SecretKey,
    /// Session overlay key shared with every sender via the auth key
    overlay_key: SecretKey,
    home_region: AtomicU16,
    direct_addr: watch::Sender<Option<SocketAddr>>,
    last_node: RwLock<Option<Node>>,
    peers: DashMap<PublicKey, ReturnPath>,
    nodes_tx: mpsc::Sender<Node>,
    out_tx: mpsc::Sender<OverlayMessage>,
    out_rx: Mutex<Option<mpsc::Receiver<OverlayMessage>>>,
    relay_sink: RwLock<Option<RelaySender>>,
    udp_sink: RwLock<Option<Arc<UdpSocket>>>,
    events: Arc<dyn OverlayEvents>,
    broadcaster: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ReceiveOverlay {
    /// Generate fresh listener and overlay keypairs for a new session
    pub fn new(relay_map: Arc<RelayMap>, settings: Settings) -> Self {
        Self::with_events(relay_map, settings, default_events())
    }

    pub fn with_events(
        relay_map: Arc<RelayMap>,
        settings: Settings,
        events: Arc<dyn OverlayEvents>,
    ) -> Self {
        let depth = settings.queue_depth;
        let (nodes_tx, nodes_rx) = mpsc::channel(depth);
        let (out_tx, out_rx) = mpsc::channel(depth);
        let (direct_addr, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        Self {
            core: Arc::new(ReceiveCore {
                settings,
                relay_map,
                self_key: SecretKey::generate(),
                overlay_key: SecretKey::generate(),
                home_region: AtomicU16::new(0),
                direct_addr,
                last_node: RwLock::new(None),
                peers: DashMap::new(),
                nodes_tx,
                out_tx,
                out_rx: Mutex::new(Some(out_rx)),
                relay_sink: RwLock::new(None),
                udp_sink: RwLock::new(None),
                events,
                broadcaster: AtomicBool::new(false),
                shutdown,
            }),
            nodes_rx: StdMutex::new(Some(nodes_rx)),
        }
    }

    /// The public key senders seal overlay messages to
    pub fn public_key(&self) -> PublicKey {
        self.core.self_key.public()
    }

    /// The tunnel addresses this side claims
    pub fn ips(&self) -> Vec<IpAddr> {
        vec![IpAddr::V6(listener_ip())]
    }

    /// Probe the relay map and store the lowest-latency region as home.
    /// Falls back to region 1 when no probe succeeds; errors only on an
    /// empty relay map.
    pub async fn pick_relay_home(&self) -> Result<u16> {
        if self.core.relay_map.is_empty() {
            return Err(Error::RelayMapEmpty);
        }

        let region = match self
            .core
            .relay_map
            .lowest_latency_region(self.core.settings.connect_timeout)
            .await
        {
            Some(region) => {
                info!(
                    "picked relay region {} ({}) as overlay home",
                    region,
                    self.core.relay_map.region_name(region).unwrap_or("?"),
                );
                region
            }
            None => {
                warn!("failed to determine overlay relay region, defaulting to region 1");
                1
            }
        };

        self.core.home_region.store(region, Ordering::Relaxed);
        Ok(region)
    }

    /// The credential to hand to senders out-of-band. Requires at least
    /// one reachability hint: a picked relay home or a learned STUN
    /// address.
    pub fn auth_key(&self) -> Result<AuthKey> {
        let relay_region_id = self.core.home_region.load(Ordering::Relaxed);
        let direct_udp_addr = *self.core.direct_addr.borrow();
        if relay_region_id == 0 && direct_udp_addr.is_none() {
            return Err(Error::BadCredential(
                "not reachable yet: pick a relay home or wait for a STUN address".into(),
            ));
        }
        Ok(AuthKey {
            listener_public_key: self.core.self_key.public(),
            overlay_private_key: self.core.overlay_key.clone(),
            relay_region_id,
            direct_udp_addr,
        })
    }

    /// Nodes received from peers, in per-peer arrival order. Yields `None`
    /// after `stop`. Returns the stream on the first call only.
    pub fn take_node_stream(&self) -> Option<mpsc::Receiver<Node>> {
        self.nodes_rx.lock().ok().and_then(|mut g| g.take())
    }

    /// Cloneable handle the control plane uses to broadcast this side's
    /// tunnel node
    pub fn update_sink(&self) -> NodeUpdateSink {
        NodeUpdateSink::new(self.core.out_tx.clone())
    }

    /// Broadcast our current tunnel node to every known peer, best effort
    pub async fn send_tunnel_node_update(&self, node: Node) {
        if self
            .core
            .out_tx
            .send(OverlayMessage::NodeUpdate { node })
            .await
            .is_err()
        {
            warn!("overlay out-queue closed; dropping node update");
        }
    }

    /// Queue an arbitrary signaling message for broadcast
    pub async fn send_signal(&self, msg: OverlayMessage) {
        let _ = self.core.out_tx.send(msg).await;
    }

    /// Serve the overlay over the home relay region, reconnecting on
    /// transport loss, until `stop`
    pub async fn listen_relay(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let mut region = core.home_region.load(Ordering::Relaxed);
        if region == 0 {
            region = self.pick_relay_home().await?;
        }
        ensure_broadcaster(&core);

        let mut shutdown = core.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let mut client = match RelayClient::connect(
                &core.relay_map,
                region,
                &core.self_key,
                core.settings.connect_timeout,
            )
            .await
            {
                Ok(client) => client,
                Err(e) => {
                    warn!("overlay relay connect failed: {}; retrying", e);
                    if !core.pause(&mut shutdown, core.settings.reconnect_delay).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            *core.relay_sink.write().await = Some(client.sender());
            info!("listening for overlay peers on relay region {}", region);

            loop {
                tokio::select! {
                    frame = client.recv() => {
                        match frame {
                            Some((src, payload)) => {
                                let reply = core
                                    .handle_message(&payload, ReturnPath::Relay(src), "relay")
                                    .await;
                                if let Some(reply) = reply {
                                    if client.send_to(src, reply).await.is_err() {
                                        warn!("failed to send overlay reply over relay");
                                    }
                                }
                            }
                            None => {
                                warn!("overlay transport lost: relay session closed; reconnecting");
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }

            *core.relay_sink.write().await = None;
            if !core.pause(&mut shutdown, core.settings.reconnect_delay).await {
                return Ok(());
            }
        }
    }

    /// Serve the overlay on a UDP socket, probing STUN for the reflexive
    /// address that goes into the auth key
    pub async fn listen_udp(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", 0)).await?);
        *core.udp_sink.write().await = Some(Arc::clone(&socket));
        ensure_broadcaster(&core);

        // STUN probe loop shares the serving socket
        let probe_core = Arc::clone(&core);
        let probe_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            probe_core.run_stun_probe(probe_socket).await;
        });

        let mut shutdown = core.shutdown.subscribe();
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => {
                    let (n, src) = match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            return Err(Error::TransportLost(format!("UDP read: {e}")));
                        }
                    };
                    let data = &buf[..n];

                    if stun::is_stun_message(data) {
                        match stun::parse_binding_response(data) {
                            Ok(addr) => core.record_reflexive_addr(addr),
                            Err(e) => debug!("discarding STUN message: {}", e),
                        }
                        continue;
                    }

                    if let Some(reply) = core
                        .handle_message(data, ReturnPath::Udp(src), "UDP")
                        .await
                    {
                        if let Err(e) = socket.send_to(&reply, src).await {
                            warn!("failed to send overlay reply over UDP: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// The reflexive UDP address, once the first STUN response arrived
    pub fn direct_addr(&self) -> Option<SocketAddr> {
        *self.core.direct_addr.borrow()
    }

    /// Wait for the first reflexive address
    pub async fn direct_addr_ready(&self) -> Result<SocketAddr> {
        let mut rx = self.core.direct_addr.subscribe();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return Ok(addr);
            }
            rx.changed()
                .await
                .map_err(|_| Error::TransportLost("overlay shut down".into()))?;
        }
    }

    /// Stop every task this overlay spawned and close its sockets
    pub fn stop(&self) {
        self.core.shutdown.send_replace(true);
    }
}

impl ReceiveCore {
    /// Seal a message for the session's senders
    fn seal(&self, msg: &OverlayMessage) -> Vec<u8> {
        let raw = serde_json::to_vec(msg).unwrap_or_default();
        self.self_key.seal_to(&self.overlay_key.public(), &raw)
    }

    /// Decrypt, dispatch, and answer one overlay datagram. Returns the
    /// sealed reply to send back on the same path, if any.
    async fn handle_message(
        &self,
        raw: &[u8],
        path: ReturnPath,
        transport: &'static str,
    ) -> Option<Vec<u8>> {
        let cleartext = match self.self_key.open_from(&self.overlay_key.public(), raw) {
            Ok(cleartext) => cleartext,
            Err(_) => {
                warn!("dropping overlay message over {}: failed decryption", transport);
                return None;
            }
        };

        let msg: OverlayMessage = match serde_json::from_slice(&cleartext) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping undecodable overlay message: {}", e);
                return None;
            }
        };

        // Identity for routing and dedup is the node key a peer declares;
        // peers without one yet share the placeholder zero entry.
        let peer_key = match &msg {
            OverlayMessage::Hello { node: Some(node), .. } => node.key,
            OverlayMessage::NodeUpdate { node } => node.key,
            _ => PublicKey::default(),
        };
        if !peer_key.is_zero() || matches!(msg, OverlayMessage::Hello { .. }) {
            self.peers.insert(peer_key, path);
        }

        let reply = match msg {
            OverlayMessage::Ping => Some(OverlayMessage::Pong),
            OverlayMessage::Pong => None,
            OverlayMessage::Hello { host, node, offer } => {
                self.events.on_peer(&host, transport);
                if let Some(node) = node {
                    let _ = self.nodes_tx.send(node).await;
                }
                if let Some(sdp) = offer {
                    self.events.on_offer(&peer_key, &sdp);
                }
                Some(OverlayMessage::HelloResponse {
                    host: HostInfo::local(),
                    node: self.last_node.read().await.clone(),
                    answer: None,
                })
            }
            OverlayMessage::NodeUpdate { node } => {
                debug!("received updated node {}", node.key);
                let _ = self.nodes_tx.send(node).await;
                // Answer with our latest node so a rejoining peer
                // converges without waiting for the next broadcast
                self.last_node
                    .read()
                    .await
                    .clone()
                    .map(|node| OverlayMessage::NodeUpdate { node })
            }
            OverlayMessage::Offer { sdp } => {
                self.events.on_offer(&peer_key, &sdp);
                None
            }
            OverlayMessage::Answer { sdp } => {
                self.events.on_answer(&peer_key, &sdp);
                None
            }
            OverlayMessage::Candidate { candidate } => {
                self.events.on_candidate(&peer_key, &candidate);
                None
            }
            OverlayMessage::HelloResponse { .. } | OverlayMessage::Unknown => None,
        };

        reply.map(|msg| self.seal(&msg))
    }

    async fn run_broadcaster(self: Arc<Self>) {
        let Some(mut out_rx) = self.out_rx.lock().await.take() else {
            return;
        };
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { return };
                    if let OverlayMessage::NodeUpdate { node } = &msg {
                        *self.last_node.write().await = Some(node.clone());
                    }
                    let sealed = self.seal(&msg);
                    self.broadcast(sealed).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Fan one sealed message out to every known peer. A dead or backed-up
    /// return path drops the message for that peer only.
    async fn broadcast(&self, sealed: Vec<u8>) {
        let targets: Vec<(PublicKey, ReturnPath)> = self
            .peers
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let relay_sink = self.relay_sink.read().await.clone();
        let udp_sink = self.udp_sink.read().await.clone();
        let mut dead = Vec::new();

        for (peer, path) in targets {
            match path {
                ReturnPath::Relay(dst) => match &relay_sink {
                    Some(sink) => {
                        if let Err(e) = sink.try_send_to(dst, sealed.clone()) {
                            warn!("dropping update for peer {}: {}", peer, e);
                        }
                    }
                    None => debug!("no relay session; skipping peer {}", peer),
                },
                ReturnPath::Udp(addr) => match &udp_sink {
                    Some(socket) => {
                        if let Err(e) = socket.send_to(&sealed, addr).await {
                            warn!("forgetting peer {} at {}: {}", peer, addr, e);
                            dead.push(peer);
                        }
                    }
                    None => debug!("no UDP socket; skipping peer {}", peer),
                },
            }
        }

        for peer in dead {
            self.peers.remove(&peer);
        }
    }

    async fn run_stun_probe(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let server = match tokio::net::lookup_host(self.settings.stun_server.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.find(|a| a.is_ipv4()))
        {
            Some(addr) => addr,
            None => {
                warn!("cannot resolve STUN server {}", self.settings.stun_server);
                return;
            }
        };

        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (pkt, _) = stun::binding_request();
            if let Err(e) = socket.send_to(&pkt, server).await {
                warn!("failed to send STUN request: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.stun_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Record a reflexive address. The first one is advertised in auth
    /// keys; later changes invalidate outstanding keys, so they are
    /// surfaced but never silently applied.
    fn record_reflexive_addr(&self, addr: SocketAddr) {
        let current = *self.direct_addr.borrow();
        match current {
            None => {
                info!("STUN address is {}", addr);
                self.direct_addr.send_replace(Some(addr));
            }
            Some(prev) if prev != addr => {
                warn!(
                    "STUN address changed {} -> {}; outstanding auth keys may be stale",
                    prev, addr
                );
            }
            _ => {}
        }
    }

    /// Sleep unless shutdown arrives first; false means stop
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => !*shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::random_service_ip;

    fn overlay() -> ReceiveOverlay {
        ReceiveOverlay::new(
            Arc::new(RelayMap::single(1, "test", "127.0.0.1", 1)),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn auth_key_requires_reachability() {
        let ov = overlay();
        assert!(ov.auth_key().is_err());

        ov.core.home_region.store(3, Ordering::Relaxed);
        let key = ov.auth_key().unwrap();
        assert_eq!(key.relay_region_id, 3);
        assert_eq!(key.listener_public_key, ov.public_key());
    }

    #[tokio::test]
    async fn node_stream_taken_once() {
        let ov = overlay();
        assert!(ov.take_node_stream().is_some());
        assert!(ov.take_node_stream().is_none());
    }

    #[tokio::test]
    async fn dispatcher_rejects_wrong_key_without_side_effects() {
        let ov = overlay();
        let imposter = SecretKey::generate();
        let sealed = imposter.seal_to(
            &ov.public_key(),
            &serde_json::to_vec(&OverlayMessage::Ping).unwrap(),
        );

        let reply = ov
            .core
            .handle_message(&sealed, ReturnPath::Udp("127.0.0.1:1".parse().unwrap()), "UDP")
            .await;
        assert!(reply.is_none());
        assert!(ov.core.peers.is_empty());
    }

    #[tokio::test]
    async fn dispatcher_answers_ping_with_pong() {
        let ov = overlay();
        let key = ov.auth_key_unchecked();
        let sealed = key
            .overlay_private_key
            .seal_to(&key.listener_public_key, &serde_json::to_vec(&OverlayMessage::Ping).unwrap());

        let reply = ov
            .core
            .handle_message(&sealed, ReturnPath::Udp("127.0.0.1:1".parse().unwrap()), "UDP")
            .await
            .expect("ping must be answered");

        let cleartext = key
            .overlay_private_key
            .open_from(&key.listener_public_key, &reply)
            .unwrap();
        let msg: OverlayMessage = serde_json::from_slice(&cleartext).unwrap();
        assert_eq!(msg, OverlayMessage::Pong);
    }

    #[tokio::test]
    async fn hello_yields_response_and_registers_peer() {
        let ov = overlay();
        let key = ov.auth_key_unchecked();
        let mut node = Node::default();
        node.key = SecretKey::generate().public();
        node.addresses = vec![format!("{}/128", random_service_ip())];

        let hello = OverlayMessage::Hello {
            host: HostInfo {
                username: "alice".into(),
                hostname: "laptop".into(),
            },
            node: Some(node.clone()),
            offer: None,
        };
        let sealed = key
            .overlay_private_key
            .seal_to(&key.listener_public_key, &serde_json::to_vec(&hello).unwrap());

        let mut nodes = ov.take_node_stream().unwrap();
        let reply = ov
            .core
            .handle_message(&sealed, ReturnPath::Udp("127.0.0.1:9".parse().unwrap()), "UDP")
            .await
            .expect("hello must be answered");

        let cleartext = key
            .overlay_private_key
            .open_from(&key.listener_public_key, &reply)
            .unwrap();
        assert!(matches!(
            serde_json::from_slice::<OverlayMessage>(&cleartext).unwrap(),
            OverlayMessage::HelloResponse { .. }
        ));

        // Bootstrap node surfaced to the control plane
        assert_eq!(nodes.recv().await.unwrap().key, node.key);
        assert!(ov.core.peers.contains_key(&node.key));
    }

    impl ReceiveOverlay {
        /// Auth key without the reachability check, for dispatcher tests
        fn auth_key_unchecked(&self) -> AuthKey {
            AuthKey {
                listener_public_key: self.core.self_key.public(),
                overlay_private_key: self.core.overlay_key.clone(),
                relay_region_id: 1,
                direct_udp_addr: None,
            }
        }
    }
}
