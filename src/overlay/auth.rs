//! Auth Key Codec
//!
//! The auth key is the single credential a sender needs: a Base58 string
//! packing the listener's public key, the session's shared overlay private
//! key, and how the listener can be reached (relay region and/or direct
//! UDP address).
//!
//! Binary layout, in order:
//!
//! ```text
//! [1: direct-UDP IP length (0, 4, or 16)]
//! [N: raw IP bytes][2: UDP port, big-endian]     (only when length > 0)
//! [2: relay region id, big-endian (0 = none)]
//! [32: listener public key]
//! [32: overlay private key]
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};
use crate::key::{PublicKey, SecretKey, KEY_LEN};
use crate::relay::RelayMap;

/// The parsed credential
#[derive(Debug, Clone)]
pub struct AuthKey {
    /// The listener's long-term public key; overlay messages to the
    /// listener are sealed to it
    pub listener_public_key: PublicKey,
    /// The session's shared overlay private key. Anyone holding it can
    /// connect, so the key travels only inside the credential.
    pub overlay_private_key: SecretKey,
    /// Relay region the listener is reachable on (0 = none)
    pub relay_region_id: u16,
    /// Direct UDP address when the listener is in STUN mode
    pub direct_udp_addr: Option<SocketAddr>,
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.listener_public_key == other.listener_public_key
            && self.overlay_private_key.to_bytes() == other.overlay_private_key.to_bytes()
            && self.relay_region_id == other.relay_region_id
            && self.direct_udp_addr == other.direct_udp_addr
    }
}

impl AuthKey {
    /// Encode into the printable Base58 form. Never fails for a
    /// well-formed key.
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(1 + 18 + 2 + KEY_LEN * 2);

        match self.direct_udp_addr {
            Some(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        buf.push(4);
                        buf.extend_from_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        buf.push(16);
                        buf.extend_from_slice(&ip.octets());
                    }
                }
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            None => buf.push(0),
        }

        buf.extend_from_slice(&self.relay_region_id.to_be_bytes());
        buf.extend_from_slice(self.listener_public_key.as_bytes());
        buf.extend_from_slice(&self.overlay_private_key.to_bytes());

        bs58::encode(buf).into_string()
    }

    /// Parse a printable auth key. Consumes the decoded bytes strictly in
    /// order; a short read, leftover bytes, or an unreachable credential
    /// all fail with `BadCredential`.
    pub fn parse(auth_key: &str) -> Result<Self> {
        if auth_key.is_empty() {
            return Err(Error::BadCredential("auth key is empty".into()));
        }

        let raw = bs58::decode(auth_key)
            .into_vec()
            .map_err(|_| Error::BadCredential("malformed base58".into()))?;
        let mut r = Reader::new(&raw);

        let ip_len = r.byte("direct UDP ip length")? as usize;
        let direct_udp_addr = match ip_len {
            0 => None,
            4 => {
                let mut octets = [0u8; 4];
                r.fill(&mut octets, "direct UDP ip")?;
                let port = u16::from_be_bytes(r.take2("direct UDP port")?);
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            16 => {
                let mut octets = [0u8; 16];
                r.fill(&mut octets, "direct UDP ip")?;
                let port = u16::from_be_bytes(r.take2("direct UDP port")?);
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => {
                return Err(Error::BadCredential(format!(
                    "direct UDP ip length {other} not one of 0, 4, 16"
                )))
            }
        };

        let relay_region_id = u16::from_be_bytes(r.take2("relay region")?);

        let mut pub_bytes = [0u8; KEY_LEN];
        r.fill(&mut pub_bytes, "listener public key")?;
        let mut priv_bytes = [0u8; KEY_LEN];
        r.fill(&mut priv_bytes, "overlay private key")?;

        if !r.done() {
            return Err(Error::BadCredential("trailing bytes".into()));
        }

        if relay_region_id == 0 && direct_udp_addr.is_none() {
            return Err(Error::BadCredential(
                "no relay region or direct UDP address".into(),
            ));
        }

        Ok(Self {
            listener_public_key: PublicKey::from_bytes(pub_bytes),
            overlay_private_key: SecretKey::from_bytes(priv_bytes),
            relay_region_id,
            direct_udp_addr,
        })
    }

    /// Multi-line reachability summary suitable for a host's startup log
    pub fn debug_summary(&self, relay_map: Option<&RelayMap>) -> String {
        let udp = match self.direct_udp_addr {
            Some(addr) => addr.to_string(),
            None => "disabled".to_string(),
        };
        let relay = if self.relay_region_id == 0 {
            "disabled".to_string()
        } else {
            relay_map
                .and_then(|m| m.region_name(self.relay_region_id))
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("region {}", self.relay_region_id))
        };
        format!(
            "overlay UDP address: {}\noverlay relay home:  {}\nlistener public key: {}\noverlay auth key:    {}",
            udp,
            relay,
            self.listener_public_key,
            self.overlay_private_key.public(),
        )
    }
}

/// Strict sequential reader over the decoded key bytes
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self, what: &str) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::BadCredential(format!("read {what}: short key")))?;
        self.pos += 1;
        Ok(b)
    }

    fn take2(&mut self, what: &str) -> Result<[u8; 2]> {
        let mut out = [0u8; 2];
        self.fill(&mut out, what)?;
        Ok(out)
    }

    fn fill(&mut self, out: &mut [u8], what: &str) -> Result<()> {
        let end = self.pos + out.len();
        let src = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| Error::BadCredential(format!("read {what}: short key")))?;
        out.copy_from_slice(src);
        self.pos = end;
        Ok(())
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(region: u16, addr: Option<SocketAddr>) -> AuthKey {
        AuthKey {
            listener_public_key: SecretKey::generate().public(),
            overlay_private_key: SecretKey::generate(),
            relay_region_id: region,
            direct_udp_addr: addr,
        }
    }

    #[test]
    fn roundtrip_relay_only() {
        let key = sample(7, None);
        let parsed = AuthKey::parse(&key.encode()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn roundtrip_with_udp_v4() {
        let key = sample(1, Some("203.0.113.20:41641".parse().unwrap()));
        let parsed = AuthKey::parse(&key.encode()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn roundtrip_with_udp_v6() {
        let key = sample(0, Some("[2001:db8::7]:3478".parse().unwrap()));
        let parsed = AuthKey::parse(&key.encode()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn empty_key_rejected() {
        assert!(matches!(
            AuthKey::parse(""),
            Err(Error::BadCredential(_))
        ));
    }

    #[test]
    fn malformed_base58_rejected() {
        assert!(matches!(
            AuthKey::parse("0OIl+not-base58"),
            Err(Error::BadCredential(_))
        ));
    }

    #[test]
    fn bad_ip_length_rejected() {
        // length byte 5 is not a valid address width
        let mut raw = vec![5u8];
        raw.extend_from_slice(&[0u8; 80]);
        let encoded = bs58::encode(raw).into_string();
        assert!(matches!(
            AuthKey::parse(&encoded),
            Err(Error::BadCredential(_))
        ));
    }

    #[test]
    fn missing_reachability_rejected() {
        let key = sample(0, None);
        assert!(matches!(
            AuthKey::parse(&key.encode()),
            Err(Error::BadCredential(_))
        ));
    }

    #[test]
    fn every_truncation_rejected() {
        // Chop one byte at every position; each must fail, none may panic
        for key in [
            sample(3, None),
            sample(3, Some("198.51.100.7:9999".parse().unwrap())),
            sample(0, Some("[2001:db8::1]:53".parse().unwrap())),
        ] {
            let raw = bs58::decode(key.encode()).into_vec().unwrap();
            for cut in 0..raw.len() {
                let truncated = bs58::encode(&raw[..cut]).into_string();
                assert!(
                    AuthKey::parse(&truncated).is_err(),
                    "truncation at {cut} of {} bytes parsed",
                    raw.len(),
                );
            }
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let key = sample(2, None);
        let mut raw = bs58::decode(key.encode()).into_vec().unwrap();
        raw.push(0xab);
        let extended = bs58::encode(raw).into_string();
        assert!(matches!(
            AuthKey::parse(&extended),
            Err(Error::BadCredential(_))
        ));
    }

    #[test]
    fn debug_summary_names_the_region() {
        let map = RelayMap::single(7, "Frankfurt", "relay.example.net", 443);
        let key = sample(7, None);
        let summary = key.debug_summary(Some(&map));
        assert!(summary.contains("Frankfurt"));
        assert!(summary.contains("disabled"));
    }
}
