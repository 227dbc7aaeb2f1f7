//! Peer identities and per-pair connection accounting
//!
//! A mesh peer is identified by an opaque 64-bit name. Every piece of
//! per-pair state in this module is keyed by the *directed* pair
//! `(src_peer, dst_peer)`: the two directions of one tunnel are tracked
//! independently.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Opaque 64-bit identifier of a mesh peer.
///
/// Totally ordered; no structure beyond equality and its big-endian byte
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerName(pub u64);

impl PeerName {
    /// Big-endian byte encoding, used in [`SpiKey`] and key derivation.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Addressing for one directed peer pair, as seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    /// This host's peer name.
    pub local_peer: PeerName,
    /// The remote host's peer name.
    pub remote_peer: PeerName,
    /// This host's overlay IPv4 address.
    pub local_ip: Ipv4Addr,
    /// The remote host's overlay IPv4 address.
    pub remote_ip: Ipv4Addr,
    /// UDP destination port of the remote overlay endpoint.
    pub remote_port: u16,
}

/// Directed key for one peer-pair direction: `BE(src) || BE(dst)`.
///
/// `SpiKey::new(a, b) != SpiKey::new(b, a)` for `a != b`, so the two
/// directions of a tunnel index separate rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpiKey([u8; 16]);

impl SpiKey {
    /// Build the key for the direction `src_peer -> dst_peer`.
    pub fn new(src_peer: PeerName, dst_peer: PeerName) -> Self {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&src_peer.to_be_bytes());
        key[8..].copy_from_slice(&dst_peer.to_be_bytes());
        SpiKey(key)
    }
}

impl fmt::Display for SpiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Reference counting for IPsec establishments.
///
/// The mesh may simultaneously create two connections for the same peer pair,
/// which would otherwise establish IPsec twice. `get` pre-increments and
/// `put` pre-decrements; a negative value after `put` means destroy was
/// called more often than establish and is an upper-layer bug.
#[derive(Debug, Default)]
pub struct ConnRefCount {
    refs: HashMap<SpiKey, i64>,
}

impl ConnRefCount {
    /// Create an empty counter table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `src_peer -> dst_peer` and return the new value.
    pub fn get(&mut self, src_peer: PeerName, dst_peer: PeerName) -> i64 {
        let count = self.refs.entry(SpiKey::new(src_peer, dst_peer)).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrement the counter for `src_peer -> dst_peer` and return the new value.
    pub fn put(&mut self, src_peer: PeerName, dst_peer: PeerName) -> i64 {
        let count = self.refs.entry(SpiKey::new(src_peer, dst_peer)).or_insert(0);
        *count -= 1;
        *count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_key_directional() {
        let a = PeerName(0x0102_0304_0506_0708);
        let b = PeerName(0x1112_1314_1516_1718);

        assert_ne!(SpiKey::new(a, b), SpiKey::new(b, a));
        assert_eq!(SpiKey::new(a, a), SpiKey::new(a, a));
    }

    #[test]
    fn test_spi_key_layout() {
        let key = SpiKey::new(PeerName(1), PeerName(2));
        assert_eq!(
            key.to_string(),
            "00000000000000010000000000000002"
        );
    }

    #[test]
    fn test_refcount_get_put() {
        let mut rc = ConnRefCount::new();
        let (a, b) = (PeerName(1), PeerName(2));

        assert_eq!(rc.get(a, b), 1);
        assert_eq!(rc.get(a, b), 2);
        assert_eq!(rc.put(a, b), 1);
        assert_eq!(rc.put(a, b), 0);
        assert_eq!(rc.put(a, b), -1);
    }

    #[test]
    fn test_refcount_directions_independent() {
        let mut rc = ConnRefCount::new();
        let (a, b) = (PeerName(1), PeerName(2));

        assert_eq!(rc.get(a, b), 1);
        assert_eq!(rc.get(b, a), 1);
        assert_eq!(rc.put(a, b), 0);
        assert_eq!(rc.get(b, a), 2);
    }

    #[test]
    fn test_peer_name_encoding() {
        let name = PeerName(0xdead_beef);
        assert_eq!(
            name.to_be_bytes(),
            [0, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(name.to_string(), "00000000deadbeef");
    }
}
