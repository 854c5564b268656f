//! Node and machine keys for the overlay and control plane
//!
//! Uses X25519 for key agreement and ChaCha20-Poly1305 for authenticated
//! encryption. The sealed box wraps overlay messages end-to-end: the sender
//! needs only the recipient's public key and its own key pair, and the
//! recipient verifies which key pair sealed the message.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::fmt;
use x25519_dalek::StaticSecret;

use crate::error::{Error, Result};

/// Length in bytes of raw public and private keys
pub const KEY_LEN: usize = 32;

const SEAL_NONCE_LEN: usize = 12;
const SEAL_TAG_LEN: usize = 16;
/// Bytes a sealed box adds on top of the plaintext
pub const SEAL_OVERHEAD: usize = KEY_LEN + SEAL_NONCE_LEN + SEAL_TAG_LEN;

/// Domain separation string for sealed-box key derivation
const SEAL_DOMAIN: &[u8] = b"burrow-overlay-box-v1";

/// A 32-byte X25519 public key identifying a node, machine, or overlay
/// session
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// The all-zero key, used as a placeholder before a peer has declared
    /// its identity
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(s.trim())
            .map_err(|e| Error::BadCredential(format!("decode public key: {e}")))?;
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::BadCredential("public key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Abbreviated fingerprint for logs, e.g. `[fd7a115c]`
    pub fn short(&self) -> String {
        format!(
            "[{:02x}{:02x}{:02x}{:02x}]",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.is_empty() {
            return Ok(PublicKey::default());
        }
        PublicKey::from_base64(&s).map_err(D::Error::custom)
    }
}

/// An X25519 private key with its derived public half
#[derive(Clone)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a fresh random key pair
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::rngs::OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0).to_bytes())
    }

    /// Seal `plaintext` to `recipient`. The output embeds our public key
    /// and a random nonce:
    ///
    /// ```text
    /// [32: sender public key] [12: nonce] [N+16: ciphertext]
    /// ```
    pub fn seal_to(&self, recipient: &PublicKey, plaintext: &[u8]) -> Vec<u8> {
        let sender_pub = self.public();
        let key = self.box_key(recipient, &sender_pub, recipient);

        let mut nonce_bytes = [0u8; SEAL_NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        // Encryption with a fresh random nonce and a valid key cannot fail.
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
            .unwrap_or_default();

        let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        out.extend_from_slice(sender_pub.as_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Open a sealed box, verifying it was sealed by `sender`'s key pair
    /// to our public key. Any mismatch or tampering yields `AuthFailed`.
    pub fn open_from(&self, sender: &PublicKey, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(Error::AuthFailed);
        }

        let mut embedded = [0u8; KEY_LEN];
        embedded.copy_from_slice(&sealed[..KEY_LEN]);
        let embedded = PublicKey(embedded);
        if embedded != *sender {
            return Err(Error::AuthFailed);
        }

        let key = self.box_key(sender, sender, &self.public());
        let nonce = Nonce::from_slice(&sealed[KEY_LEN..KEY_LEN + SEAL_NONCE_LEN]);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[KEY_LEN + SEAL_NONCE_LEN..],
                    aad: &[],
                },
            )
            .map_err(|_| Error::AuthFailed)
    }

    /// Raw X25519 shared secret with `their` key; the handshake layers
    /// feed this into their own key schedules
    pub(crate) fn shared_secret(&self, their: &PublicKey) -> [u8; KEY_LEN] {
        *self
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(*their.as_bytes()))
            .as_bytes()
    }

    /// Derive the symmetric box key. The salt fixes the roles so both
    /// directions of a key pair agree on the same key for the same
    /// (sender, recipient) ordering.
    fn box_key(
        &self,
        counterpart: &PublicKey,
        sender_pub: &PublicKey,
        recipient_pub: &PublicKey,
    ) -> [u8; KEY_LEN] {
        let shared = self
            .0
            .diffie_hellman(&x25519_dalek::PublicKey::from(*counterpart.as_bytes()));

        let mut salt = [0u8; KEY_LEN * 2];
        salt[..KEY_LEN].copy_from_slice(sender_pub.as_bytes());
        salt[KEY_LEN..].copy_from_slice(recipient_pub.as_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut key = [0u8; KEY_LEN];
        // Expanding 32 bytes out of HKDF-SHA256 cannot fail.
        let _ = hk.expand(SEAL_DOMAIN, &mut key);
        key
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print private material
        write!(f, "SecretKey({})", self.public().short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let listener = SecretKey::generate();
        let overlay = SecretKey::generate();

        let sealed = overlay.seal_to(&listener.public(), b"hello world");
        let opened = listener.open_from(&overlay.public(), &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn seal_open_is_symmetric_between_roles() {
        let listener = SecretKey::generate();
        let overlay = SecretKey::generate();

        // Reply direction: listener seals to the overlay key
        let sealed = listener.seal_to(&overlay.public(), b"pong");
        let opened = overlay.open_from(&listener.public(), &sealed).unwrap();
        assert_eq!(opened, b"pong");
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let listener = SecretKey::generate();
        let overlay = SecretKey::generate();
        let imposter = SecretKey::generate();

        let sealed = imposter.seal_to(&listener.public(), b"let me in");
        assert!(matches!(
            listener.open_from(&overlay.public(), &sealed),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let listener = SecretKey::generate();
        let overlay = SecretKey::generate();

        let mut sealed = overlay.seal_to(&listener.public(), b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(
            listener.open_from(&overlay.public(), &sealed),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn truncated_box_fails() {
        let listener = SecretKey::generate();
        let overlay = SecretKey::generate();
        assert!(matches!(
            listener.open_from(&overlay.public(), &[0u8; 10]),
            Err(Error::AuthFailed)
        ));
    }

    #[test]
    fn public_key_base64_roundtrip() {
        let key = SecretKey::generate().public();
        let parsed = PublicKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn public_key_serde_roundtrip() {
        let key = SecretKey::generate().public();
        let json = serde_json::to_string(&key).unwrap();
        let parsed: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn empty_string_deserializes_to_zero_key() {
        let parsed: PublicKey = serde_json::from_str("\"\"").unwrap();
        assert!(parsed.is_zero());
    }
}
