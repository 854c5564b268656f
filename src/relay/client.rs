//! Relay Client
//!
//! Persistent client connection to one relay region. Packets are addressed
//! by session public key; the relay forwards them to whichever client
//! registered that key.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::protocol::{read_frame, write_frame, RelayFrame};
use super::RelayMap;
use crate::error::{Error, Result};
use crate::key::{PublicKey, SecretKey};

/// A live session with one relay region
pub struct RelayClient {
    region_id: u16,
    public_key: PublicKey,
    out_tx: mpsc::Sender<RelayFrame>,
    in_rx: mpsc::Receiver<(PublicKey, Vec<u8>)>,
}

impl RelayClient {
    /// Connect to `region_id`, register `key`'s public half, and spawn the
    /// reader and writer tasks. Tries the region's nodes in order.
    pub async fn connect(
        map: &RelayMap,
        region_id: u16,
        key: &SecretKey,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let region = map
            .region(region_id)
            .ok_or(Error::UnknownRelayRegion(region_id))?;

        let mut last_err: Option<Error> = None;
        for node in &region.nodes {
            let addr = node.dial_addr();
            match Self::connect_node(&addr, region_id, key, connect_timeout).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!("relay node {} unavailable: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(Error::UnknownRelayRegion(region_id)))
    }

    async fn connect_node(
        addr: &str,
        region_id: u16,
        key: &SecretKey,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::ConnectionTimeout(addr.to_string())),
        };
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        let public_key = key.public();

        write_frame(
            &mut writer,
            &RelayFrame::ClientHello { public_key },
        )
        .await?;

        match timeout(connect_timeout, read_frame(&mut reader)).await {
            Ok(Ok(RelayFrame::ServerHello { region_id: rid })) => {
                debug!("relay session open to region {} as {}", rid, public_key);
            }
            Ok(Ok(other)) => {
                return Err(Error::TransportLost(format!(
                    "unexpected frame {} during relay hello",
                    other.type_name()
                )))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ConnectionTimeout(addr.to_string())),
        }

        let (out_tx, mut out_rx) = mpsc::channel::<RelayFrame>(64);
        let (in_tx, in_rx) = mpsc::channel::<(PublicKey, Vec<u8>)>(64);

        // Writer task: drains the outbound queue onto the socket
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("relay write failed: {}", e);
                    break;
                }
            }
        });

        // Reader task: surfaces forwarded packets, answers relay pings
        let ping_tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(RelayFrame::RecvPacket { src, payload }) => {
                        if in_tx.send((src, payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(RelayFrame::Ping) => {
                        let _ = ping_tx.send(RelayFrame::Pong).await;
                    }
                    Ok(RelayFrame::Pong) => {}
                    Ok(other) => {
                        debug!("ignoring relay frame {}", other.type_name());
                    }
                    Err(e) => {
                        debug!("relay read failed: {}", e);
                        break;
                    }
                }
            }
            // Dropping in_tx here wakes `recv` with None
        });

        Ok(Self {
            region_id,
            public_key,
            out_tx,
            in_rx,
        })
    }

    /// The session key other peers address us by on this relay
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn region_id(&self) -> u16 {
        self.region_id
    }

    /// A cloneable handle for sending packets through this session
    pub fn sender(&self) -> RelaySender {
        RelaySender {
            out_tx: self.out_tx.clone(),
        }
    }

    /// Send `payload` to the client registered under `dst`
    pub async fn send_to(&self, dst: PublicKey, payload: Vec<u8>) -> Result<()> {
        self.sender().send_to(dst, payload).await
    }

    /// Receive the next forwarded packet; `None` when the session died
    pub async fn recv(&mut self) -> Option<(PublicKey, Vec<u8>)> {
        self.in_rx.recv().await
    }
}

/// Cloneable sending half of a relay session
#[derive(Clone)]
pub struct RelaySender {
    out_tx: mpsc::Sender<RelayFrame>,
}

impl RelaySender {
    pub async fn send_to(&self, dst: PublicKey, payload: Vec<u8>) -> Result<()> {
        self.out_tx
            .send(RelayFrame::SendPacket { dst, payload })
            .await
            .map_err(|_| Error::TransportLost("relay session closed".into()))
    }

    /// Try to enqueue without waiting; used by broadcast paths that must
    /// not stall on one slow peer
    pub fn try_send_to(&self, dst: PublicKey, payload: Vec<u8>) -> Result<()> {
        self.out_tx
            .try_send(RelayFrame::SendPacket { dst, payload })
            .map_err(|_| Error::TransportLost("relay session closed or backed up".into()))
    }
}

/// Measure round-trip latency to a region: connect, hello, ping, pong.
pub async fn probe_region(
    map: &RelayMap,
    region_id: u16,
    connect_timeout: Duration,
) -> Result<Duration> {
    let key = SecretKey::generate();
    let start = Instant::now();
    let mut client = RelayClient::connect(map, region_id, &key, connect_timeout).await?;
    client
        .out_tx
        .send(RelayFrame::Ping)
        .await
        .map_err(|_| Error::TransportLost("relay session closed".into()))?;

    // The reader task swallows the pong; latency to ServerHello plus one
    // queued write is close enough for ranking regions.
    let elapsed = start.elapsed();
    client.in_rx.close();
    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::server::RelayServer;

    #[tokio::test]
    async fn connect_and_forward() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let map = RelayMap::single(1, "test", "127.0.0.1", server.local_addr().port());

        let ka = SecretKey::generate();
        let kb = SecretKey::generate();
        let a = RelayClient::connect(&map, 1, &ka, Duration::from_secs(2))
            .await
            .unwrap();
        let mut b = RelayClient::connect(&map, 1, &kb, Duration::from_secs(2))
            .await
            .unwrap();

        a.send_to(kb.public(), b"through the relay".to_vec())
            .await
            .unwrap();

        let (src, payload) = tokio::time::timeout(Duration::from_secs(2), b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(src, ka.public());
        assert_eq!(payload, b"through the relay");

        server.stop();
    }

    #[tokio::test]
    async fn unknown_region_errors() {
        let map = RelayMap::single(1, "test", "127.0.0.1", 1);
        let key = SecretKey::generate();
        assert!(matches!(
            RelayClient::connect(&map, 9, &key, Duration::from_millis(100)).await,
            Err(Error::UnknownRelayRegion(9))
        ));
    }
}
