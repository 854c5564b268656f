//! Control Sessions
//!
//! One session per noise-upgraded tunnel-engine connection: registration,
//! the long-polled network-map stream, and endpoint updates. Map frames
//! are JSON, optionally zstd-compressed, with a little-endian length
//! prefix.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{ControlState, NetMapUpdate};
use crate::key::PublicKey;
use crate::netmap::{
    self, Hostinfo, Login, MapRequest, MapRequestKind, MapResponse, Node, RegisterRequest,
    RegisterResponse, User,
};
use crate::overlay::cidr_of;

/// zstd level for map frames; throughput over ratio
const ZSTD_LEVEL: i32 = 1;

/// Encoders kept for reuse between frames
const ZSTD_POOL_MAX: usize = 8;

static ZSTD_POOL: StdMutex<Vec<zstd::bulk::Compressor<'static>>> = StdMutex::new(Vec::new());

/// State for one tunnel-engine connection
pub struct ControlSession {
    state: Arc<ControlState>,
    /// The engine's machine key, proven during the noise handshake
    machine_key: PublicKey,
    session_id: u64,
    node_key: RwLock<PublicKey>,
    /// Snapshot-swapped: readers clone the Arc, the endpoint-update
    /// handler installs a fresh one
    self_node: RwLock<Option<Arc<Node>>>,
    updates_rx: Mutex<Option<mpsc::Receiver<NetMapUpdate>>>,
}

impl ControlSession {
    /// Create the session and register its update queue with the server
    pub fn new(state: Arc<ControlState>, machine_key: PublicKey) -> Self {
        let session_id = state.session_seq.fetch_add(1, Ordering::Relaxed);
        let (updates_tx, updates_rx) = mpsc::channel(state.settings.queue_depth);
        state.sessions.insert(session_id, updates_tx);

        Self {
            state,
            machine_key,
            session_id,
            node_key: RwLock::new(PublicKey::default()),
            self_node: RwLock::new(None),
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }

    pub fn id(&self) -> u64 {
        self.session_id
    }

    async fn store_node(&self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        *self.self_node.write().await = Some(Arc::clone(&node));
        node
    }

    async fn self_node(&self) -> Option<Arc<Node>> {
        self.self_node.read().await.clone()
    }
}

/// POST /machine/register
pub async fn register_handler(
    State(session): State<Arc<ControlSession>>,
    body: Bytes,
) -> Response {
    let req: RegisterRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed register request: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    info!("registering engine node {}", req.node_key);
    *session.node_key.write().await = req.node_key;

    let user = User {
        id: 123,
        login_name: "burrow".into(),
        display_name: "burrow".into(),
        created: Some(Utc::now()),
    };
    let login = Login {
        id: 123,
        login_name: "burrow".into(),
        display_name: "burrow".into(),
    };

    let hostinfo = req.hostinfo.clone().unwrap_or_default();
    let address = cidr_of(session.state.tunnel_ip);
    let node = Node {
        id: (rand::random::<u64>() >> 1) as i64,
        stable_id: req.auth.auth_key.clone(),
        name: hostinfo.hostname.clone(),
        user: user.id,
        key: req.node_key,
        machine: session.machine_key,
        addresses: vec![address.clone()],
        allowed_ips: vec![address],
        hostinfo,
        online: Some(true),
        last_seen: Some(Utc::now()),
        cap: req.version,
        machine_authorized: true,
        ..Default::default()
    };

    let node = session.store_node(node).await;
    // Announce ourselves to the remote side
    session.state.node_out.send((*node).clone()).await;

    Json(RegisterResponse {
        user,
        login,
        machine_authorized: true,
        error: String::new(),
    })
    .into_response()
}

/// POST /machine/map
pub async fn map_handler(
    State(session): State<Arc<ControlSession>>,
    body: Bytes,
) -> Response {
    let req: MapRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            warn!("malformed map request: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let Some(node) = session.self_node().await else {
        debug!("map request before registration");
        return (StatusCode::UNAUTHORIZED, "node is nil").into_response();
    };

    match req.kind() {
        MapRequestKind::Streaming => handle_streaming(session, req, node).await,
        MapRequestKind::EndpointUpdate => handle_endpoint_update(session, req, node).await,
        MapRequestKind::Unknown => {
            warn!("unknown map request shape");
            (StatusCode::BAD_REQUEST, "unknown request type").into_response()
        }
    }
}

/// POST /machine/update-health: acknowledged and discarded
pub async fn update_health_handler(_body: Bytes) -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_streaming(
    session: Arc<ControlSession>,
    req: MapRequest,
    node: Arc<Node>,
) -> Response {
    let Some(mut updates_rx) = session.updates_rx.lock().await.take() else {
        warn!("second streaming map request on one session");
        return (StatusCode::BAD_REQUEST, "already streaming").into_response();
    };

    info!("engine session {} streaming", session.id());
    let compress = req.compress == "zstd";
    let state = Arc::clone(&session.state);

    let peers: Vec<Node> = state
        .peers
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    let initial = MapResponse {
        keep_alive: false,
        control_time: Some(Utc::now()),
        node: Some((*node).clone()),
        relay_map: Some((*state.relay_map).clone()),
        peers,
        packet_filter: netmap::filter_allow_all(),
        ..Default::default()
    };

    let (frames_tx, frames_rx) = mpsc::channel::<io::Result<Bytes>>(state.settings.queue_depth);
    let keepalive = state.settings.keepalive_interval;
    let mut shutdown = state.shutdown.subscribe();

    tokio::spawn(async move {
        match encode_map_frame(&initial, compress) {
            Ok(frame) => {
                if frames_tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("failed to encode initial map response: {}", e);
                let _ = frames_tx.send(Err(e)).await;
                return;
            }
        }

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive,
            keepalive,
        );

        loop {
            let response = tokio::select! {
                update = updates_rx.recv() => {
                    let Some(update) = update else { return };
                    let mut response = MapResponse {
                        keep_alive: false,
                        control_time: Some(Utc::now()),
                        ..Default::default()
                    };
                    match update {
                        NetMapUpdate::NewPeer(node) => response.peers = vec![node],
                        NetMapUpdate::PeerPatch(change) => {
                            response.peers_changed_patch = vec![change]
                        }
                    }
                    response
                }
                _ = ticker.tick() => MapResponse {
                    keep_alive: true,
                    control_time: Some(Utc::now()),
                    ..Default::default()
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            };

            let frame = match encode_map_frame(&response, compress) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("failed to encode map response: {}", e);
                    continue;
                }
            };
            if frames_tx.send(Ok(frame)).await.is_err() {
                // Engine went away; the session ends with the connection
                return;
            }
        }
    });

    Body::from_stream(ReceiverStream::new(frames_rx)).into_response()
}

async fn handle_endpoint_update(
    session: Arc<ControlSession>,
    req: MapRequest,
    node: Arc<Node>,
) -> Response {
    let mut node = (*node).clone();
    let mut change = netmap::request_change(&node, &req);
    let observable = !change.is_empty();
    change.online = Some(true);
    netmap::apply_change(&mut node, &change);

    let mut hostinfo_updated = false;
    if let Some(hostinfo) = &req.hostinfo {
        hostinfo_updated = hostinfo_changed(&node.hostinfo, hostinfo);
        node.hostinfo = hostinfo.clone();
        if node.preferred_relay() != 0 {
            node.relay_addr = format!("127.3.3.40:{}", node.preferred_relay());
        }
    }

    let node = session.store_node(node).await;

    if !observable && !hostinfo_updated {
        return StatusCode::OK.into_response();
    }

    debug!("endpoint update changed node {}", node.key);
    session.state.node_out.send((*node).clone()).await;
    StatusCode::OK.into_response()
}

/// Whether a new hostinfo blob is observably different
fn hostinfo_changed(old: &Hostinfo, new: &Hostinfo) -> bool {
    let mut old_routes = old.routable_ips.clone();
    let mut new_routes = new.routable_ips.clone();
    old_routes.sort();
    new_routes.sort();

    old.hostname != new.hostname
        || old.os != new.os
        || old_routes != new_routes
        || old.net_info != new.net_info
}

/// Serialize one map response: JSON, optional zstd, LE u32 length prefix
pub fn encode_map_frame(response: &MapResponse, compress: bool) -> io::Result<Bytes> {
    let json = serde_json::to_vec(response)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let body = if compress { zstd_encode(&json)? } else { json };

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(Bytes::from(out))
}

/// Compress with a pooled encoder to avoid per-frame allocation
fn zstd_encode(data: &[u8]) -> io::Result<Vec<u8>> {
    let pooled = match ZSTD_POOL.lock() {
        Ok(mut pool) => pool.pop(),
        Err(_) => None,
    };
    let mut encoder = match pooled {
        Some(encoder) => encoder,
        None => zstd::bulk::Compressor::new(ZSTD_LEVEL)?,
    };

    let out = encoder.compress(data)?;

    if let Ok(mut pool) = ZSTD_POOL.lock() {
        if pool.len() < ZSTD_POOL_MAX {
            pool.push(encoder);
        }
    }
    Ok(out)
}
