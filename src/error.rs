//! Burrow Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for burrow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Burrow error types
#[derive(Error, Debug)]
pub enum Error {
    // Credential errors
    #[error("invalid auth key: {0}")]
    BadCredential(String),

    // Overlay errors
    #[error("overlay message failed decryption")]
    AuthFailed,

    #[error("no hello response from peer within {0:?}")]
    PeerUnreachable(Duration),

    #[error("overlay transport lost: {0}")]
    TransportLost(String),

    // Relay errors
    #[error("relay map has no regions")]
    RelayMapEmpty,

    #[error("relay map unavailable: {0}")]
    RelayMapUnavailable(String),

    #[error("unknown relay region {0}")]
    UnknownRelayRegion(u16),

    #[error("relay frame checksum mismatch")]
    FrameChecksum,

    #[error("relay frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("relay frame encoding error: {0}")]
    Frame(#[from] bincode::Error),

    #[error("connection timeout to {0}")]
    ConnectionTimeout(String),

    // STUN errors
    #[error("invalid STUN message: {0}")]
    Stun(String),

    // Control plane errors
    #[error("noise handshake failed: {0}")]
    Handshake(String),

    #[error("control listener closed")]
    ControlClosed,

    #[error("dialer refused address {0}")]
    DialRefused(String),

    // I/O and encoding errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error is recovered locally by the overlay
    /// (dropped datagram or transport reconnect) rather than surfaced.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::AuthFailed | Error::TransportLost(_))
    }

    /// Check if this error is fatal at startup and must be propagated
    /// to the caller immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::RelayMapEmpty | Error::RelayMapUnavailable(_) | Error::Io(_)
        )
    }
}
