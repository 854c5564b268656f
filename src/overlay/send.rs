//! Sender Overlay
//!
//! Parses an auth key, opens the relay or direct-UDP path it advertises,
//! performs the hello handshake, and keeps the session warm with
//! heartbeats. The transport is retried indefinitely; only the absence of
//! any hello response within the connect timeout is surfaced, as
//! `PeerUnreachable`.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::auth::AuthKey;
use super::{default_events, random_service_ip, HostInfo, NodeUpdateSink, OverlayEvents, OverlayMessage};
use crate::error::{Error, Result};
use crate::key::SecretKey;
use crate::netmap::Node;
use crate::relay::{RelayClient, RelayMap};
use crate::settings::Settings;

/// The sender side of the overlay
pub struct SendOverlay {
    core: Arc<SendCore>,
    nodes_rx: StdMutex<Option<mpsc::Receiver<Node>>>,
}

struct SendCore {
    settings: Settings,
    relay_map: Arc<RelayMap>,
    auth: AuthKey,
    self_ip: Ipv6Addr,
    last_node: RwLock<Option<Node>>,
    hello_seen: watch::Sender<bool>,
    nodes_tx: mpsc::Sender<Node>,
    out_tx: mpsc::Sender<OverlayMessage>,
    out_rx: Mutex<Option<mpsc::Receiver<OverlayMessage>>>,
    events: Arc<dyn OverlayEvents>,
    shutdown: watch::Sender<bool>,
}

impl SendOverlay {
    /// Parse `auth_key` and prepare a session toward the listener it
    /// names. Also allocates this sender's random tunnel address.
    pub fn new(auth_key: &str, relay_map: Arc<RelayMap>, settings: Settings) -> Result<Self> {
        Self::with_events(auth_key, relay_map, settings, default_events())
    }

    pub fn with_events(
        auth_key: &str,
        relay_map: Arc<RelayMap>,
        settings: Settings,
        events: Arc<dyn OverlayEvents>,
    ) -> Result<Self> {
        let auth = AuthKey::parse(auth_key)?;
        let depth = settings.queue_depth;
        let (nodes_tx, nodes_rx) = mpsc::channel(depth);
        let (out_tx, out_rx) = mpsc::channel(depth);
        let (hello_seen, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            core: Arc::new(SendCore {
                settings,
                relay_map,
                auth,
                self_ip: random_service_ip(),
                last_node: RwLock::new(None),
                hello_seen,
                nodes_tx,
                out_tx,
                out_rx: Mutex::new(Some(out_rx)),
                events,
                shutdown,
            }),
            nodes_rx: StdMutex::new(Some(nodes_rx)),
        })
    }

    /// The parsed credential
    pub fn auth(&self) -> &AuthKey {
        &self.core.auth
    }

    /// The tunnel addresses this side claims
    pub fn ips(&self) -> Vec<IpAddr> {
        vec![IpAddr::V6(self.core.self_ip)]
    }

    /// Nodes received from the listener. Returns the stream on the first
    /// call only.
    pub fn take_node_stream(&self) -> Option<mpsc::Receiver<Node>> {
        self.nodes_rx.lock().ok().and_then(|mut g| g.take())
    }

    /// Cloneable handle the control plane uses to push this side's tunnel
    /// node to the listener
    pub fn update_sink(&self) -> NodeUpdateSink {
        NodeUpdateSink::new(self.core.out_tx.clone())
    }

    /// Send our current tunnel node to the listener, best effort
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

    /// Queue an arbitrary signaling message for the listener
    pub async fn send_signal(&self, msg: OverlayMessage) {
        let _ = self.core.out_tx.send(msg).await;
    }

    /// True once the listener answered our hello
    pub fn connected(&self) -> bool {
        *self.core.hello_seen.borrow()
    }

    /// Dial whichever path the credential advertises, trying direct UDP
    /// first when the listener exposed an address
    pub async fn listen(&self) -> Result<()> {
        if self.core.auth.direct_udp_addr.is_some() {
            self.listen_udp().await
        } else {
            self.listen_relay().await
        }
    }

    /// Dial the listener's relay region and serve until `stop`. Redials
    /// on transport loss and re-sends the hello after every reconnect.
    pub async fn listen_relay(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let region = core.auth.relay_region_id;
        if region == 0 {
            return Err(Error::BadCredential(
                "auth key advertises no relay region".into(),
            ));
        }
        let listener_key = core.auth.listener_public_key;

        let mut out_rx = core.take_out().await?;
        let mut shutdown = core.shutdown.subscribe();
        let hello_deadline = Instant::now() + core.settings.hello_timeout;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            // Fresh relay session key per connection; the listener
            // identifies us by the node key inside our messages, not by
            // the relay session.
            let session_key = SecretKey::generate();
            let mut client = match RelayClient::connect(
                &core.relay_map,
                region,
                &session_key,
                core.settings.connect_timeout,
            )
            .await
            {
                Ok(client) => client,
                Err(e) => {
                    warn!("overlay relay connect failed: {}; retrying", e);
                    core.check_hello_deadline(hello_deadline)?;
                    if !core.pause(&mut shutdown, core.settings.reconnect_delay).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if client
                .send_to(listener_key, core.seal(&core.hello_message().await))
                .await
                .is_err()
            {
                warn!("failed to send overlay hello; reconnecting");
                continue;
            }
            debug!("sent overlay hello over relay region {}", region);

            let mut idle = Box::pin(tokio::time::sleep(core.settings.heartbeat_interval));

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                    _ = tokio::time::sleep_until(hello_deadline), if !core.hello_received() => {
                        return Err(Error::PeerUnreachable(core.settings.hello_timeout));
                    }
                    msg = out_rx.recv() => {
                        let Some(msg) = msg else { return Ok(()) };
                        core.note_outgoing(&msg).await;
                        if client.send_to(listener_key, core.seal(&msg)).await.is_err() {
                            break;
                        }
                        idle.as_mut().reset(Instant::now() + core.settings.heartbeat_interval);
                    }
                    _ = idle.as_mut() => {
                        if client.send_to(listener_key, core.seal(&OverlayMessage::Ping)).await.is_err() {
                            break;
                        }
                        idle.as_mut().reset(Instant::now() + core.settings.heartbeat_interval);
                    }
                    frame = client.recv() => {
                        match frame {
                            None => {
                                warn!("overlay transport lost: relay session closed; reconnecting");
                                break;
                            }
                            Some((src, payload)) => {
                                if src != listener_key {
                                    debug!("overlay message from unknown relay peer {}", src);
                                    continue;
                                }
                                idle.as_mut().reset(Instant::now() + core.settings.heartbeat_interval);
                                if let Some(reply) = core.handle_message(&payload).await {
                                    if client.send_to(listener_key, reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            core.check_hello_deadline(hello_deadline)?;
            if !core.pause(&mut shutdown, core.settings.reconnect_delay).await {
                return Ok(());
            }
        }
    }

    /// Dial the listener's advertised direct UDP address and serve until
    /// `stop`
    pub async fn listen_udp(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let listener_addr = core.auth.direct_udp_addr.ok_or_else(|| {
            Error::BadCredential("auth key advertises no direct UDP address".into())
        })?;

        let bind_addr: SocketAddr = if listener_addr.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let mut out_rx = core.take_out().await?;
        let mut shutdown = core.shutdown.subscribe();
        let hello_deadline = Instant::now() + core.settings.hello_timeout;

        socket
            .send_to(&core.seal(&core.hello_message().await), listener_addr)
            .await?;
        debug!("sent overlay hello over UDP to {}", listener_addr);

        let mut idle = Box::pin(tokio::time::sleep(core.settings.heartbeat_interval));
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep_until(hello_deadline), if !core.hello_received() => {
                    return Err(Error::PeerUnreachable(core.settings.hello_timeout));
                }
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    core.note_outgoing(&msg).await;
                    if let Err(e) = socket.send_to(&core.seal(&msg), listener_addr).await {
                        warn!("overlay UDP send failed: {}", e);
                    }
                    idle.as_mut().reset(Instant::now() + core.settings.heartbeat_interval);
                }
                _ = idle.as_mut() => {
                    if let Err(e) = socket.send_to(&core.seal(&OverlayMessage::Ping), listener_addr).await {
                        warn!("overlay UDP ping failed: {}", e);
                    }
                    idle.as_mut().reset(Instant::now() + core.settings.heartbeat_interval);
                }
                res = socket.recv_from(&mut buf) => {
                    let (n, src) = match res {
                        Ok(pair) => pair,
                        Err(e) => return Err(Error::TransportLost(format!("UDP read: {e}"))),
                    };
                    idle.as_mut().reset(Instant::now() + core.settings.heartbeat_interval);
                    if let Some(reply) = core.handle_message(&buf[..n]).await {
                        if let Err(e) = socket.send_to(&reply, src).await {
                            warn!("overlay UDP reply failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Stop the session
    pub fn stop(&self) {
        self.core.shutdown.send_replace(true);
    }
}

impl SendCore {
    fn seal(&self, msg: &OverlayMessage) -> Vec<u8> {
        let raw = serde_json::to_vec(msg).unwrap_or_default();
        self.auth
            .overlay_private_key
            .seal_to(&self.auth.listener_public_key, &raw)
    }

    fn hello_received(&self) -> bool {
        *self.hello_seen.borrow()
    }

    fn check_hello_deadline(&self, deadline: Instant) -> Result<()> {
        if !self.hello_received() && Instant::now() >= deadline {
            return Err(Error::PeerUnreachable(self.settings.hello_timeout));
        }
        Ok(())
    }

    async fn take_out(&self) -> Result<mpsc::Receiver<OverlayMessage>> {
        self.out_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::TransportLost("overlay transport already running".into()))
    }

    /// Introduce ourselves, bootstrapping the last-known node when a
    /// reconnect races the engine's own updates
    async fn hello_message(&self) -> OverlayMessage {
        OverlayMessage::Hello {
            host: HostInfo::local(),
            node: self.last_node.read().await.clone(),
            offer: None,
        }
    }

    async fn note_outgoing(&self, msg: &OverlayMessage) {
        if let OverlayMessage::NodeUpdate { node } = msg {
            *self.last_node.write().await = Some(node.clone());
        }
    }

    /// Decrypt and dispatch one message from the listener
    async fn handle_message(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let cleartext = match self
            .auth
            .overlay_private_key
            .open_from(&self.auth.listener_public_key, raw)
        {
            Ok(cleartext) => cleartext,
            Err(_) => {
                warn!("dropping overlay message: failed decryption");
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

        let listener = self.auth.listener_public_key;
        let reply = match msg {
            OverlayMessage::Ping => Some(OverlayMessage::Pong),
            OverlayMessage::Pong => None,
            OverlayMessage::HelloResponse { host, node, answer } => {
                if !self.hello_received() {
                    info!("connected to {}", host.display());
                }
                if let Some(node) = node {
                    let _ = self.nodes_tx.send(node).await;
                }
                if let Some(sdp) = answer {
                    self.events.on_answer(&listener, &sdp);
                }
                self.hello_seen.send_replace(true);
                None
            }
            OverlayMessage::NodeUpdate { node } => {
                debug!("received updated node {}", node.key);
                let _ = self.nodes_tx.send(node).await;
                None
            }
            OverlayMessage::Offer { sdp } => {
                self.events.on_offer(&listener, &sdp);
                None
            }
            OverlayMessage::Answer { sdp } => {
                self.events.on_answer(&listener, &sdp);
                None
            }
            OverlayMessage::Candidate { candidate } => {
                self.events.on_candidate(&listener, &candidate);
                None
            }
            OverlayMessage::Hello { .. } | OverlayMessage::Unknown => None,
        };

        reply.map(|msg| self.seal(&msg))
    }

    /// Sleep unless shutdown arrives first; false means stop
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => !*shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A sender plus the listener private key its credential points at
    fn keyed_overlay() -> (SecretKey, SendOverlay) {
        let listener = SecretKey::generate();
        let auth = AuthKey {
            listener_public_key: listener.public(),
            overlay_private_key: SecretKey::generate(),
            relay_region_id: 1,
            direct_udp_addr: None,
        };
        let overlay = SendOverlay::new(
            &auth.encode(),
            Arc::new(RelayMap::single(1, "test", "127.0.0.1", 1)),
            Settings::default(),
        )
        .unwrap();
        (listener, overlay)
    }

    fn seal_as_listener(listener: &SecretKey, overlay: &SendOverlay, msg: &OverlayMessage) -> Vec<u8> {
        listener.seal_to(
            &overlay.auth().overlay_private_key.public(),
            &serde_json::to_vec(msg).unwrap(),
        )
    }

    #[test]
    fn new_rejects_garbage_key() {
        let map = Arc::new(RelayMap::single(1, "test", "127.0.0.1", 1));
        assert!(matches!(
            SendOverlay::new("not-a-key", map, Settings::default()),
            Err(Error::BadCredential(_))
        ));
    }

    #[test]
    fn sender_ip_is_in_service_prefix() {
        let (_, overlay) = keyed_overlay();
        match overlay.ips()[0] {
            IpAddr::V6(ip) => {
                assert_eq!(&ip.octets()[..6], &super::super::SERVICE_PREFIX)
            }
            other => panic!("expected v6 tunnel address, got {other}"),
        }
    }

    #[tokio::test]
    async fn hello_response_marks_connected_and_yields_node() {
        let (listener, overlay) = keyed_overlay();
        let mut nodes = overlay.take_node_stream().unwrap();

        let node = Node {
            key: SecretKey::generate().public(),
            ..Default::default()
        };
        let response = OverlayMessage::HelloResponse {
            host: HostInfo::default(),
            node: Some(node.clone()),
            answer: None,
        };
        let sealed = seal_as_listener(&listener, &overlay, &response);

        assert!(!overlay.connected());
        let reply = overlay.core.handle_message(&sealed).await;
        assert!(reply.is_none());
        assert!(overlay.connected());
        assert_eq!(nodes.recv().await.unwrap().key, node.key);
    }

    #[tokio::test]
    async fn ping_from_listener_is_answered() {
        let (listener, overlay) = keyed_overlay();
        let sealed = seal_as_listener(&listener, &overlay, &OverlayMessage::Ping);
        let reply = overlay.core.handle_message(&sealed).await.unwrap();

        let cleartext = overlay
            .auth()
            .overlay_private_key
            .open_from(&overlay.auth().listener_public_key, &reply)
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<OverlayMessage>(&cleartext).unwrap(),
            OverlayMessage::Pong
        );
    }

    #[tokio::test]
    async fn message_from_wrong_listener_is_dropped() {
        let (_, overlay) = keyed_overlay();
        let imposter = SecretKey::generate();
        let sealed = imposter.seal_to(
            &overlay.auth().overlay_private_key.public(),
            &serde_json::to_vec(&OverlayMessage::Ping).unwrap(),
        );
        assert!(overlay.core.handle_message(&sealed).await.is_none());
        assert!(!overlay.connected());
    }
}
