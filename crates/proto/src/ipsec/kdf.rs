//! Symmetric key derivation for ESP Security Associations
//!
//! Each SA direction gets its own AEAD key, derived with HKDF-SHA256 from
//! the session key the mesh runtime agreed for the peer pair:
//!
//! ```text
//! key || salt = HKDF-SHA256(ikm = session_key, salt = nonce,
//!                           info = BE(initiator_peer), L = 36)
//! ```
//!
//! The `info` binding to the initiator of the inbound SA prevents one
//! derivation from satisfying both directions of the pair. Derived key
//! material is zeroized on drop.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::ipsec::error::{Error, Result};
use crate::ipsec::peer::PeerName;

/// AES-GCM-128 key (32 bytes) plus 4-byte salt.
pub const KEY_SIZE: usize = 36;

/// HKDF salt transmitted in `CREATE_SA`.
pub const NONCE_SIZE: usize = 32;

/// Generate a fresh random nonce from the OS entropy source.
pub fn gen_nonce() -> Result<[u8; NONCE_SIZE]> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| Error::Crypto(format!("crypto rand failed: {}", e)))?;
    Ok(nonce)
}

/// Derive the 36-byte AEAD key material for one SA direction.
///
/// `initiator` is the peer that called `protect_init` for this direction, on
/// both sides of the exchange.
pub fn derive_key(
    session_key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    initiator: PeerName,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(Some(nonce), session_key);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(&initiator.to_be_bytes(), key.as_mut())
        .map_err(|_| Error::Crypto(format!("derived key length {} unsupported", KEY_SIZE)))?;

    Ok(key)
}
