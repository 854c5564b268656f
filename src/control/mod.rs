//! Embedded Control Plane
//!
//! An in-process stand-in for the tunnel engine's coordination server,
//! serving the fixed control protocol over an in-memory listener: key
//! exchange, noise upgrade into cleartext HTTP/2, registration, and the
//! long-polled network-map stream. It contacts no external service; it is
//! driven entirely by overlay events on one side and the local tunnel
//! engine on the other.

mod dialer;
pub mod noise;
mod session;

pub use dialer::{memory_pair, DialedConn, MemDialer, MemListener};
pub use session::ControlSession;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::{PublicKey, SecretKey};
use crate::netmap::{self, KeyExchangeResponse, Node, PeerChange, MIN_CAPABILITY_VERSION};
use crate::overlay::NodeUpdateSink;
use crate::relay::RelayMap;
use crate::settings::Settings;

/// Value of the Upgrade header on the noise-upgrade endpoint
pub const UPGRADE_PROTOCOL: &str = "tailscale-control-protocol";

/// One change flowing into a control session's map stream
#[derive(Debug, Clone)]
pub enum NetMapUpdate {
    /// First mention of a node key: always the full node
    NewPeer(Node),
    /// Subsequent changes to a known peer
    PeerPatch(PeerChange),
}

/// Shared state behind all control sessions
pub(crate) struct ControlState {
    pub settings: Settings,
    /// The server's long-term machine key; its public half answers the
    /// key-exchange endpoint and anchors the noise handshake
    pub machine_key: SecretKey,
    pub relay_map: Arc<RelayMap>,
    /// The tunnel address allocated to this side's engine
    pub tunnel_ip: IpAddr,
    /// Peers learned from the overlay, by node key
    pub peers: DashMap<PublicKey, Node>,
    /// Streaming sessions' update queues
    pub sessions: DashMap<u64, mpsc::Sender<NetMapUpdate>>,
    pub session_seq: AtomicU64,
    /// Out-queue toward the overlay
    pub node_out: NodeUpdateSink,
    pub shutdown: watch::Sender<bool>,
}

/// The embedded control-plane server
pub struct ControlServer {
    state: Arc<ControlState>,
    listener: MemListener,
    dialer: MemDialer,
    nodes_in: StdMutex<Option<mpsc::Receiver<Node>>>,
}

impl ControlServer {
    /// Wire a control plane to one side's overlay: `nodes_in` yields the
    /// peer nodes the overlay received, `node_out` broadcasts our own.
    /// `tunnel_ip` is this side's allocated address (the listener's fixed
    /// well-known IP, or a sender's random one).
    pub fn new(
        relay_map: Arc<RelayMap>,
        tunnel_ip: IpAddr,
        nodes_in: mpsc::Receiver<Node>,
        node_out: NodeUpdateSink,
        settings: Settings,
    ) -> Self {
        let depth = settings.queue_depth;
        let (shutdown, _) = watch::channel(false);
        let (listener, dialer) = memory_pair(depth);

        Self {
            state: Arc::new(ControlState {
                settings,
                machine_key: SecretKey::generate(),
                relay_map,
                tunnel_ip,
                peers: DashMap::new(),
                sessions: DashMap::new(),
                session_seq: AtomicU64::new(1),
                node_out,
                shutdown,
            }),
            listener,
            dialer,
            nodes_in: StdMutex::new(Some(nodes_in)),
        }
    }

    /// The dialer capability to hand to the tunnel engine's control
    /// client
    pub fn dialer(&self) -> MemDialer {
        self.dialer.clone()
    }

    /// The public key the key-exchange endpoint advertises
    pub fn machine_public_key(&self) -> PublicKey {
        self.state.machine_key.public()
    }

    /// Serve the control plane until `stop`. Accepts in-memory
    /// connections and consumes overlay events.
    pub async fn serve(&self) -> Result<()> {
        if let Some(nodes_in) = self.nodes_in.lock().ok().and_then(|mut g| g.take()) {
            let state = Arc::clone(&self.state);
            tokio::spawn(overlay_pump(state, nodes_in));
        }

        let router = outer_router(Arc::clone(&self.state));
        let mut shutdown = self.state.shutdown.subscribe();

        loop {
            let conn = tokio::select! {
                conn = self.listener.accept() => conn,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };
            let conn = match conn {
                Ok(conn) => conn,
                Err(Error::ControlClosed) => return Ok(()),
                Err(e) => return Err(e),
            };

            let service = TowerToHyperService::new(router.clone());
            tokio::spawn(async move {
                let builder =
                    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                if let Err(e) = builder
                    .serve_connection_with_upgrades(TokioIo::new(conn), service)
                    .await
                {
                    debug!("control connection ended: {}", e);
                }
            });
        }
    }

    /// Stop serving; streaming sessions and the overlay pump exit with it
    pub fn stop(&self) {
        self.state.shutdown.send_replace(true);
    }
}

fn outer_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/key", get(key_handler))
        .route("/ts2021", post(noise_upgrade_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

/// GET /key?v=N
async fn key_handler(
    State(state): State<Arc<ControlState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let version = params.get("v").and_then(|v| v.parse::<u32>().ok());
    match version {
        Some(v) if v >= MIN_CAPABILITY_VERSION => {
            debug!("key exchange from engine, capability version {}", v);
            Json(KeyExchangeResponse {
                public_key: state.machine_key.public(),
            })
            .into_response()
        }
        Some(v) => {
            warn!("engine capability version {} unsupported", v);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// POST /ts2021: upgrade the connection, run the noise handshake, then
/// serve the machine endpoints as HTTP/2 over the encrypted stream
async fn noise_upgrade_handler(
    State(state): State<Arc<ControlState>>,
    mut req: Request,
) -> Response {
    debug!("noise upgrade request");
    let on_upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("control connection upgrade failed: {}", e);
                return;
            }
        };

        let mut io = TokioIo::new(upgraded);
        let (transport, machine_key) = match noise::respond(&mut io, &state.machine_key).await
        {
            Ok(done) => done,
            Err(e) => {
                warn!("noise handshake failed: {}", e);
                return;
            }
        };
        debug!("noise handshake complete with machine {}", machine_key);

        let session = Arc::new(ControlSession::new(Arc::clone(&state), machine_key));
        let session_id = session.id();
        let router = session_router(session);
        let result = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .serve_connection(
                TokioIo::new(transport.into_stream(io)),
                TowerToHyperService::new(router),
            )
            .await;
        if let Err(e) = result {
            debug!("engine session {} ended: {}", session_id, e);
        }
        state.sessions.remove(&session_id);
    });

    match Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, UPGRADE_PROTOCOL)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn session_router(session: Arc<ControlSession>) -> Router {
    Router::new()
        .route("/machine/register", post(session::register_handler))
        .route("/machine/map", post(session::map_handler))
        .route("/machine/update-health", post(session::update_health_handler))
        .fallback(session_fallback)
        .with_state(session)
}

async fn fallback_handler(uri: Uri) -> StatusCode {
    warn!("control handler not found: {}", uri.path());
    StatusCode::NOT_FOUND
}

async fn session_fallback(uri: Uri) -> StatusCode {
    warn!("machine handler not found: {}", uri.path());
    StatusCode::NOT_FOUND
}

/// Consume peer nodes from the overlay: first mention of a node key
/// becomes a full-node announcement, later mentions become patches, and
/// unchanged re-announcements are suppressed.
async fn overlay_pump(state: Arc<ControlState>, mut nodes_in: mpsc::Receiver<Node>) {
    let mut shutdown = state.shutdown.subscribe();

    loop {
        let node = tokio::select! {
            node = nodes_in.recv() => node,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };
        let Some(node) = node else { return };

        if node.key.is_zero() {
            debug!("ignoring overlay node without a key");
            continue;
        }

        let previous = state.peers.get(&node.key).map(|entry| entry.value().clone());
        let update = match previous {
            None => {
                info!("new peer {}", node.key);
                state.peers.insert(node.key, node.clone());
                NetMapUpdate::NewPeer(node)
            }
            Some(previous) => {
                let change = netmap::peer_change(&previous, &node);
                if change.is_empty() {
                    debug!("peer {} unchanged; suppressing duplicate", node.key);
                    continue;
                }
                state.peers.insert(node.key, node);
                NetMapUpdate::PeerPatch(change)
            }
        };

        let targets: Vec<(u64, mpsc::Sender<NetMapUpdate>)> = state
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(update.clone()).await.is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            debug!("dropping dead control session {}", id);
            state.sessions.remove(&id);
        }
    }
}
