//! Control-Channel Handshake and Encrypted Stream
//!
//! The tunnel engine upgrades its control connection with an IK-pattern
//! handshake: the initiator already knows the server's long-term machine
//! key (from `/key`) and proves its own machine key in the first message.
//! Both sides derive per-direction ChaCha20-Poly1305 cipher states with
//! counter nonces, and the upgraded byte stream then carries cleartext
//! HTTP/2 inside length-prefixed encrypted frames.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};
use crate::key::{PublicKey, SecretKey, KEY_LEN};

/// Hashed into the initial handshake state; both sides must agree
const PROTOCOL_NAME: &[u8] = b"burrow-control-ik-chacha20poly1305-sha256";

const TAG_LEN: usize = 16;
/// Message 1: ephemeral key, encrypted static key, empty payload tag
const MSG1_LEN: usize = KEY_LEN + (KEY_LEN + TAG_LEN) + TAG_LEN;
/// Message 2: ephemeral key, empty payload tag
const MSG2_LEN: usize = KEY_LEN + TAG_LEN;

/// Largest plaintext carried in one transport frame
const MAX_PLAINTEXT: usize = 16 * 1024;

/// One direction of the encrypted transport
struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        *Nonce::from_slice(&bytes)
    }

    fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .unwrap_or_default()
    }

    fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad })
            .map_err(|_| Error::Handshake("message authentication failed".into()))
    }
}

/// Chained hash-and-key state driving the handshake
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
}

impl SymmetricState {
    fn new() -> Self {
        let h: [u8; 32] = Sha256::digest(PROTOCOL_NAME).into();
        Self { ck: h, h }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), ikm);
        let mut okm = [0u8; 64];
        // Expanding 64 bytes out of HKDF-SHA256 cannot fail.
        let _ = hk.expand(b"", &mut okm);
        self.ck.copy_from_slice(&okm[..32]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[32..]);
        key
    }

    /// Final per-direction transport keys: (initiator→responder,
    /// responder→initiator)
    fn split(&self) -> ([u8; 32], [u8; 32]) {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck), &[]);
        let mut okm = [0u8; 64];
        let _ = hk.expand(b"transport", &mut okm);
        let mut k1 = [0u8; 32];
        let mut k2 = [0u8; 32];
        k1.copy_from_slice(&okm[..32]);
        k2.copy_from_slice(&okm[32..]);
        (k1, k2)
    }
}

/// Run the initiator side over `io`. `remote_static` is the server key
/// learned from the key-exchange endpoint.
pub async fn initiate<T>(
    io: &mut T,
    local_static: &SecretKey,
    remote_static: &PublicKey,
) -> Result<NoiseTransport>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut ss = SymmetricState::new();
    ss.mix_hash(remote_static.as_bytes());

    let e = SecretKey::generate();
    let e_pub = e.public();
    ss.mix_hash(e_pub.as_bytes());

    let k1 = ss.mix_key(&e.shared_secret(remote_static));
    let h1 = ss.h;
    let c_static = CipherState::new(&k1).seal(&h1, local_static.public().as_bytes());
    ss.mix_hash(&c_static);

    let k2 = ss.mix_key(&local_static.shared_secret(remote_static));
    let h2 = ss.h;
    let c_empty = CipherState::new(&k2).seal(&h2, &[]);
    ss.mix_hash(&c_empty);

    let mut msg1 = Vec::with_capacity(MSG1_LEN);
    msg1.extend_from_slice(e_pub.as_bytes());
    msg1.extend_from_slice(&c_static);
    msg1.extend_from_slice(&c_empty);
    io.write_all(&msg1).await?;
    io.flush().await?;

    let mut msg2 = [0u8; MSG2_LEN];
    io.read_exact(&mut msg2).await?;

    let mut re_bytes = [0u8; KEY_LEN];
    re_bytes.copy_from_slice(&msg2[..KEY_LEN]);
    let re_pub = PublicKey::from_bytes(re_bytes);
    ss.mix_hash(re_pub.as_bytes());

    ss.mix_key(&e.shared_secret(&re_pub));
    let k3 = ss.mix_key(&local_static.shared_secret(&re_pub));
    let h3 = ss.h;
    CipherState::new(&k3).open(&h3, &msg2[KEY_LEN..])?;
    ss.mix_hash(&msg2[KEY_LEN..]);

    let (ki, kr) = ss.split();
    Ok(NoiseTransport {
        send: CipherState::new(&ki),
        recv: CipherState::new(&kr),
    })
}

/// Run the responder side over `io` with the server's machine key.
/// Returns the transport plus the initiator's machine key, proven during
/// the handshake.
pub async fn respond<T>(
    io: &mut T,
    local_static: &SecretKey,
) -> Result<(NoiseTransport, PublicKey)>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut ss = SymmetricState::new();
    ss.mix_hash(local_static.public().as_bytes());

    let mut msg1 = [0u8; MSG1_LEN];
    io.read_exact(&mut msg1).await?;

    let mut e_bytes = [0u8; KEY_LEN];
    e_bytes.copy_from_slice(&msg1[..KEY_LEN]);
    let e_pub = PublicKey::from_bytes(e_bytes);
    ss.mix_hash(e_pub.as_bytes());

    let k1 = ss.mix_key(&local_static.shared_secret(&e_pub));
    let h1 = ss.h;
    let c_static = &msg1[KEY_LEN..KEY_LEN * 2 + TAG_LEN];
    let s_bytes = CipherState::new(&k1).open(&h1, c_static)?;
    let initiator_static = PublicKey::from_bytes(
        s_bytes
            .try_into()
            .map_err(|_| Error::Handshake("bad static key length".into()))?,
    );
    ss.mix_hash(c_static);

    let k2 = ss.mix_key(&local_static.shared_secret(&initiator_static));
    let h2 = ss.h;
    CipherState::new(&k2).open(&h2, &msg1[KEY_LEN * 2 + TAG_LEN..])?;
    ss.mix_hash(&msg1[KEY_LEN * 2 + TAG_LEN..]);

    let re = SecretKey::generate();
    let re_pub = re.public();
    ss.mix_hash(re_pub.as_bytes());

    ss.mix_key(&re.shared_secret(&e_pub));
    let k3 = ss.mix_key(&re.shared_secret(&initiator_static));
    let h3 = ss.h;
    let c_empty = CipherState::new(&k3).seal(&h3, &[]);
    ss.mix_hash(&c_empty);

    let mut msg2 = Vec::with_capacity(MSG2_LEN);
    msg2.extend_from_slice(re_pub.as_bytes());
    msg2.extend_from_slice(&c_empty);
    io.write_all(&msg2).await?;
    io.flush().await?;

    let (ki, kr) = ss.split();
    Ok((
        NoiseTransport {
            send: CipherState::new(&kr),
            recv: CipherState::new(&ki),
        },
        initiator_static,
    ))
}

/// The per-direction cipher states a finished handshake yields
pub struct NoiseTransport {
    send: CipherState,
    recv: CipherState,
}

impl NoiseTransport {
    /// Wrap `io` into an encrypted stream carrying this transport
    pub fn into_stream<T>(self, io: T) -> NoiseStream<T> {
        NoiseStream {
            io,
            send: self.send,
            recv: self.recv,
            read_plain: Vec::new(),
            read_plain_off: 0,
            read_buf: Vec::new(),
            read_need: FRAME_HEADER_LEN,
            write_buf: Vec::new(),
            write_off: 0,
        }
    }
}

const FRAME_HEADER_LEN: usize = 2;

/// An `AsyncRead + AsyncWrite` stream of length-prefixed encrypted
/// frames. HTTP/2 is served directly on top of this.
pub struct NoiseStream<T> {
    io: T,
    send: CipherState,
    recv: CipherState,
    read_plain: Vec<u8>,
    read_plain_off: usize,
    read_buf: Vec<u8>,
    read_need: usize,
    write_buf: Vec<u8>,
    write_off: usize,
}

impl<T: AsyncRead + AsyncWrite + Unpin> NoiseStream<T> {
    /// Drain pending ciphertext into the inner stream
    fn poll_flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_off < self.write_buf.len() {
            let n = ready!(
                Pin::new(&mut self.io).poll_write(cx, &self.write_buf[self.write_off..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_off += n;
        }
        self.write_buf.clear();
        self.write_off = 0;
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncRead for NoiseStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Serve decrypted bytes first
            if this.read_plain_off < this.read_plain.len() {
                let available = &this.read_plain[this.read_plain_off..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.read_plain_off += n;
                if this.read_plain_off == this.read_plain.len() {
                    this.read_plain.clear();
                    this.read_plain_off = 0;
                }
                return Poll::Ready(Ok(()));
            }

            // Accumulate the next wire frame
            while this.read_buf.len() < this.read_need {
                let mut tmp = [0u8; 4096];
                let mut tmp_buf = ReadBuf::new(&mut tmp);
                ready!(Pin::new(&mut this.io).poll_read(cx, &mut tmp_buf))?;
                let filled = tmp_buf.filled();
                if filled.is_empty() {
                    return if this.read_buf.is_empty() {
                        // Clean EOF on a frame boundary
                        Poll::Ready(Ok(()))
                    } else {
                        Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()))
                    };
                }
                this.read_buf.extend_from_slice(filled);
            }

            if this.read_need == FRAME_HEADER_LEN {
                let len = u16::from_be_bytes([this.read_buf[0], this.read_buf[1]]) as usize;
                if len < TAG_LEN {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "encrypted frame shorter than its tag",
                    )));
                }
                this.read_need = FRAME_HEADER_LEN + len;
                continue;
            }

            let ciphertext = &this.read_buf[FRAME_HEADER_LEN..this.read_need];
            let plaintext = this
                .recv
                .open(&[], ciphertext)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            this.read_buf.drain(..this.read_need);
            this.read_need = FRAME_HEADER_LEN;
            this.read_plain = plaintext;
            this.read_plain_off = 0;
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> AsyncWrite for NoiseStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;

        let chunk = &buf[..buf.len().min(MAX_PLAINTEXT)];
        let ciphertext = this.send.seal(&[], chunk);
        this.write_buf
            .extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        this.write_buf.extend_from_slice(&ciphertext);

        // Opportunistic drain; the bytes are committed either way
        let _ = this.poll_flush_pending(cx)?;
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_pending(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
