//! Relay Server
//!
//! A minimal packet relay: clients register a session key with a hello,
//! then frames addressed to a key are forwarded to whichever connection
//! registered it. Used by the integration tests and available to hosts
//! that run their own relay fleet.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::protocol::{read_frame, write_frame, RelayFrame};
use crate::error::Result;
use crate::key::PublicKey;

/// Per-client forwarding queue depth; a client that stops reading has its
/// packets dropped once this fills
const CLIENT_QUEUE_DEPTH: usize = 32;

/// An in-process relay node
pub struct RelayServer {
    local_addr: SocketAddr,
    region_id: u16,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Bind and start serving; returns once the listener is live.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_region(addr, 1).await
    }

    /// Bind with an explicit region id echoed in server hellos
    pub async fn bind_region(addr: &str, region_id: u16) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let clients: Arc<DashMap<PublicKey, mpsc::Sender<RelayFrame>>> =
            Arc::new(DashMap::new());

        tokio::spawn(accept_loop(listener, region_id, clients, shutdown_rx));
        info!("relay listening on {} (region {})", local_addr, region_id);

        Ok(Self {
            local_addr,
            region_id,
            shutdown: shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn region_id(&self) -> u16 {
        self.region_id
    }

    /// Stop accepting and drop all client sessions
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    region_id: u16,
    clients: Arc<DashMap<PublicKey, mpsc::Sender<RelayFrame>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let clients = Arc::clone(&clients);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(socket, region_id, clients, shutdown).await {
                                debug!("relay client {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("relay accept error: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("relay stopped");
}

async fn handle_client(
    socket: TcpStream,
    region_id: u16,
    clients: Arc<DashMap<PublicKey, mpsc::Sender<RelayFrame>>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    // The first frame must announce the client's session key
    let key = match read_frame(&mut reader).await? {
        RelayFrame::ClientHello { public_key } => public_key,
        other => {
            debug!("expected ClientHello, got {}", other.type_name());
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::channel::<RelayFrame>(CLIENT_QUEUE_DEPTH);
    clients.insert(key, tx.clone());
    debug!("relay client {} registered", key);

    write_frame(&mut writer, &RelayFrame::ServerHello { region_id }).await?;

    // Writer half: forward queued frames to this client
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    // Reader half: route frames from this client
    let result = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(RelayFrame::SendPacket { dst, payload }) => {
                        match clients.get(&dst) {
                            Some(peer) => {
                                let forwarded = RelayFrame::RecvPacket { src: key, payload };
                                if peer.try_send(forwarded).is_err() {
                                    warn!("dropping packet for slow or gone client {}", dst);
                                }
                            }
                            None => debug!("packet for unknown client {}", dst),
                        }
                    }
                    Ok(RelayFrame::Ping) => {
                        let _ = tx.send(RelayFrame::Pong).await;
                    }
                    Ok(other) => debug!("ignoring relay frame {}", other.type_name()),
                    Err(e) => break Err(e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break Ok(());
                }
            }
        }
    };

    // Unregister only if the entry is still ours; the key may have been
    // re-registered by a reconnect
    clients.remove_if(&key, |_, sender| sender.same_channel(&tx));
    write_task.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::SecretKey;
    use crate::relay::protocol::write_frame as wf;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn rejects_frames_before_hello() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

        // A SendPacket before ClientHello closes the connection
        wf(
            &mut stream,
            &RelayFrame::SendPacket {
                dst: SecretKey::generate().public(),
                payload: vec![0],
            },
        )
        .await
        .unwrap();

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            tokio::io::AsyncReadExt::read(&mut stream, &mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(n, 0, "server should close without a ServerHello");

        server.stop();
    }
}
