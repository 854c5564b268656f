//! In-Memory Dialer
//!
//! The tunnel engine's control client is pointed at this dialer instead
//! of the network: localhost connections become in-memory pipes handed to
//! the embedded control-plane's virtual listener, while anything else
//! (the engine's own relay probes) dials out normally. Port 443 on
//! localhost is refused outright, since the control path carries no TLS.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{Error, Result};

/// Buffer size of each in-memory pipe half
const PIPE_BUF: usize = 64 * 1024;

/// Create a connected listener/dialer pair
pub fn memory_pair(depth: usize) -> (MemListener, MemDialer) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    (
        MemListener {
            incoming: Mutex::new(rx),
        },
        MemDialer { tx },
    )
}

/// The control plane's virtual listener
pub struct MemListener {
    incoming: Mutex<mpsc::Receiver<DuplexStream>>,
}

impl MemListener {
    /// Wait for the next in-memory connection
    pub async fn accept(&self) -> Result<DuplexStream> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ControlClosed)
    }
}

/// The dialer capability handed to the tunnel engine
#[derive(Clone)]
pub struct MemDialer {
    tx: mpsc::Sender<DuplexStream>,
}

impl MemDialer {
    /// Dial `addr` (`host:port`). Localhost lands on the in-memory
    /// listener; everything else uses the real network.
    pub async fn dial(&self, addr: &str) -> Result<DialedConn> {
        let (host, port) = split_host_port(addr)
            .ok_or_else(|| Error::DialRefused(format!("unparseable address {addr}")))?;

        let local = matches!(host, "127.0.0.1" | "::1" | "localhost");
        if local && port == 443 {
            return Err(Error::DialRefused(format!(
                "{addr}: tls is not served on the control path"
            )));
        }

        if !local {
            debug!("dialing {} on the real network", addr);
            let stream = TcpStream::connect((host, port)).await?;
            return Ok(DialedConn::Tcp(stream));
        }

        let (ours, theirs) = tokio::io::duplex(PIPE_BUF);
        self.tx
            .send(theirs)
            .await
            .map_err(|_| Error::ControlClosed)?;
        Ok(DialedConn::Mem(ours))
    }
}

fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    // Strip brackets from IPv6 literals
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}

/// Either side of what the dialer produced
pub enum DialedConn {
    Mem(DuplexStream),
    Tcp(TcpStream),
}

impl AsyncRead for DialedConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedConn::Mem(s) => Pin::new(s).poll_read(cx, buf),
            DialedConn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DialedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DialedConn::Mem(s) => Pin::new(s).poll_write(cx, buf),
            DialedConn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedConn::Mem(s) => Pin::new(s).poll_flush(cx),
            DialedConn::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DialedConn::Mem(s) => Pin::new(s).poll_shutdown(cx),
            DialedConn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn localhost_443_refused() {
        let (_listener, dialer) = memory_pair(4);
        assert!(matches!(
            dialer.dial("127.0.0.1:443").await,
            Err(Error::DialRefused(_))
        ));
        assert!(matches!(
            dialer.dial("[::1]:443").await,
            Err(Error::DialRefused(_))
        ));
    }

    #[tokio::test]
    async fn localhost_other_port_connects_through_memory() {
        let (listener, dialer) = memory_pair(4);

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"pong").await.unwrap();
            buf
        });

        let mut conn = dialer.dial("127.0.0.1:80").await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();

        assert_eq!(&buf, b"pong");
        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn bad_address_refused() {
        let (_listener, dialer) = memory_pair(4);
        assert!(dialer.dial("no-port-here").await.is_err());
    }
}
