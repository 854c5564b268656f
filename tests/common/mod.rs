//! Shared test harness: an in-process relay, a loopback STUN responder,
//! and an engine-side control client speaking the real wire protocol
//! (HTTP/1 upgrade, noise handshake, HTTP/2 machine endpoints).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use burrow::control::{noise, ControlServer, MemDialer, UPGRADE_PROTOCOL};
use burrow::key::{PublicKey, SecretKey};
use burrow::netmap::{
    Hostinfo, KeyExchangeResponse, MapRequest, MapResponse, Node, RegisterAuth, RegisterRequest,
    RegisterResponse,
};
use burrow::overlay::{NodeUpdateSink, OverlayMessage};
use burrow::relay::{RelayMap, RelayServer};
use burrow::settings::Settings;
use burrow::stun;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Settings with intervals short enough for tests
pub fn fast_settings() -> Settings {
    Settings {
        heartbeat_interval: Duration::from_millis(300),
        hello_timeout: Duration::from_secs(2),
        stun_interval: Duration::from_millis(200),
        keepalive_interval: Duration::from_millis(400),
        reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        ..Settings::default()
    }
}

/// An in-process relay plus a map pointing at it
pub async fn local_relay() -> (RelayServer, Arc<RelayMap>) {
    let server = RelayServer::bind("127.0.0.1:0").await.expect("bind relay");
    let map = Arc::new(RelayMap::single(
        1,
        "local",
        "127.0.0.1",
        server.local_addr().port(),
    ));
    (server, map)
}

/// A loopback STUN responder answering binding requests with the
/// observed source address
pub async fn local_stun_responder() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind stun");
    let addr = socket.local_addr().expect("stun addr");
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if let Ok(txid) = stun::parse_binding_request(&buf[..n]) {
                let _ = socket.send_to(&stun::binding_response(&txid, src), src).await;
            }
        }
    });
    addr
}

/// A control server wired to raw channels standing in for an overlay
pub struct ControlFixture {
    pub server: Arc<ControlServer>,
    /// Peer nodes "received from the overlay"
    pub nodes_tx: mpsc::Sender<Node>,
    /// Self nodes "broadcast to the overlay"
    pub out_rx: mpsc::Receiver<OverlayMessage>,
}

pub fn control_fixture(relay_map: Arc<RelayMap>, settings: Settings) -> ControlFixture {
    let (nodes_tx, nodes_rx) = mpsc::channel(8);
    let (out_tx, out_rx) = mpsc::channel(8);
    let server = Arc::new(ControlServer::new(
        relay_map,
        std::net::IpAddr::V6(burrow::overlay::listener_ip()),
        nodes_rx,
        NodeUpdateSink::new(out_tx),
        settings,
    ));

    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve().await });

    ControlFixture {
        server,
        nodes_tx,
        out_rx,
    }
}

/// GET /key?v=N over the in-memory dialer
pub async fn key_exchange(
    dialer: &MemDialer,
    version: u32,
) -> (StatusCode, Option<PublicKey>) {
    let io = dialer.dial("127.0.0.1:80").await.expect("dial control");
    let (mut send, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(
        TokioIo::new(io),
    )
    .await
    .expect("http1 handshake");
    tokio::spawn(conn);

    let req = Request::builder()
        .method("GET")
        .uri(format!("/key?v={version}"))
        .header(header::HOST, "control")
        .body(Full::new(Bytes::new()))
        .expect("request");
    send.ready().await.expect("ready");
    let resp = send.send_request(req).await.expect("send");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let key = serde_json::from_slice::<KeyExchangeResponse>(&body)
        .ok()
        .map(|k| k.public_key);
    (status, key)
}

/// An engine-side control client over the upgraded encrypted channel
pub struct EngineClient {
    pub machine_key: SecretKey,
    pub node_key: PublicKey,
    h2: hyper::client::conn::http2::SendRequest<Full<Bytes>>,
}

impl EngineClient {
    /// Full connection dance: key exchange, upgrade, handshake, HTTP/2
    pub async fn connect(dialer: &MemDialer) -> Self {
        let (status, server_key) = key_exchange(dialer, 106).await;
        assert_eq!(status, StatusCode::OK);
        let server_key = server_key.expect("server public key");

        let io = dialer.dial("127.0.0.1:80").await.expect("dial control");
        let (mut send, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(
            TokioIo::new(io),
        )
        .await
        .expect("http1 handshake");
        tokio::spawn(conn.with_upgrades());

        let req = Request::builder()
            .method("POST")
            .uri("/ts2021")
            .header(header::HOST, "control")
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, UPGRADE_PROTOCOL)
            .body(Full::new(Bytes::new()))
            .expect("request");
        send.ready().await.expect("ready");
        let resp = send.send_request(req).await.expect("upgrade request");
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);

        let upgraded = hyper::upgrade::on(resp).await.expect("upgrade");
        let mut io = TokioIo::new(upgraded);
        let machine_key = SecretKey::generate();
        let transport = noise::initiate(&mut io, &machine_key, &server_key)
            .await
            .expect("noise handshake");

        let (h2, conn) = hyper::client::conn::http2::handshake::<_, _, Full<Bytes>>(
            TokioExecutor::new(),
            TokioIo::new(transport.into_stream(io)),
        )
        .await
        .expect("http2 handshake");
        tokio::spawn(conn);

        Self {
            machine_key,
            node_key: SecretKey::generate().public(),
            h2,
        }
    }

    async fn request(
        &mut self,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> hyper::Response<Incoming> {
        let req = Request::builder()
            .method(method)
            .uri(format!("http://control{path}"))
            .body(Full::new(Bytes::from(body)))
            .expect("request");
        self.h2.ready().await.expect("h2 ready");
        self.h2.send_request(req).await.expect("h2 send")
    }

    /// POST a raw body and return status plus collected response body
    pub async fn raw(&mut self, path: &str, body: Vec<u8>) -> (StatusCode, Bytes) {
        let resp = self.request("POST", path, body).await;
        let status = resp.status();
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        (status, bytes)
    }

    /// Register this engine's node key
    pub async fn register(&mut self, hostname: &str) -> RegisterResponse {
        let body = RegisterRequest {
            version: 106,
            node_key: self.node_key,
            hostinfo: Some(Hostinfo {
                hostname: hostname.into(),
                ..Default::default()
            }),
            auth: RegisterAuth {
                auth_key: "fixture".into(),
            },
        };
        let (status, bytes) = self
            .raw("/machine/register", serde_json::to_vec(&body).expect("json"))
            .await;
        assert_eq!(status, StatusCode::OK, "register failed: {bytes:?}");
        serde_json::from_slice(&bytes).expect("register response")
    }

    /// Open the long-polled map stream
    pub async fn map_stream(&mut self, compress: bool) -> MapStream {
        let body = MapRequest {
            version: 106,
            compress: if compress { "zstd" } else { "" }.into(),
            node_key: self.node_key,
            stream: true,
            ..Default::default()
        };
        let resp = self
            .request(
                "POST",
                "/machine/map",
                serde_json::to_vec(&body).expect("json"),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        MapStream {
            body: resp.into_body(),
            buf: Vec::new(),
            compressed: compress,
        }
    }

    /// Fire an endpoint update
    pub async fn endpoint_update(&mut self, mut req: MapRequest) -> StatusCode {
        req.version = 106;
        req.node_key = self.node_key;
        req.stream = false;
        req.omit_peers = true;
        let (status, _) = self
            .raw("/machine/map", serde_json::to_vec(&req).expect("json"))
            .await;
        status
    }
}

/// Reader over the length-prefixed map-response frames
pub struct MapStream {
    body: Incoming,
    buf: Vec<u8>,
    compressed: bool,
}

impl MapStream {
    /// Next decoded frame; `None` once the stream ends
    pub async fn next(&mut self) -> Option<MapResponse> {
        loop {
            if self.buf.len() >= 4 {
                let len =
                    u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                        as usize;
                if self.buf.len() >= 4 + len {
                    let frame: Vec<u8> = self.buf[4..4 + len].to_vec();
                    self.buf.drain(..4 + len);
                    let json = if self.compressed {
                        zstd_decode(&frame)
                    } else {
                        frame
                    };
                    return Some(serde_json::from_slice(&json).expect("map response"));
                }
            }

            let frame = self.body.frame().await?.ok()?;
            if let Ok(data) = frame.into_data() {
                self.buf.extend_from_slice(&data);
            }
        }
    }

    /// Next frame that is not a bare keep-alive
    pub async fn next_update(&mut self) -> Option<MapResponse> {
        loop {
            let response = self.next().await?;
            if !response.keep_alive {
                return Some(response);
            }
        }
    }
}

fn zstd_decode(data: &[u8]) -> Vec<u8> {
    zstd::decode_all(data).expect("zstd frame")
}

/// Drain overlay messages until a node update appears
pub async fn next_node(out_rx: &mut mpsc::Receiver<OverlayMessage>) -> Option<Node> {
    loop {
        match out_rx.recv().await? {
            OverlayMessage::NodeUpdate { node } => return Some(node),
            _ => continue,
        }
    }
}
