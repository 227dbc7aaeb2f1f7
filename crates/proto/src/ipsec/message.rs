//! Wire codec for the `CREATE_SA` control message
//!
//! Exactly one message exists in this protocol. It is 65 bytes, big-endian:
//!
//! ```text
//! | offset | bytes | field                                  |
//! |--------|-------|----------------------------------------|
//! | 0      | 1     | protocol version = 1                   |
//! | 1      | 32    | nonce                                  |
//! | 33     | 4     | SPI                                    |
//! | 37     | 28    | reserved, emitted zero, ignored on read|
//! ```
//!
//! The trailing 32-byte field carries the 4-byte SPI in its first bytes; the
//! remainder is reserved. Receivers verify the exact size and the version
//! byte, and nothing else.

use meshguard_platform::Spi;

use crate::ipsec::error::{Error, Result};
use crate::ipsec::kdf::NONCE_SIZE;

/// Protocol version emitted and accepted by this implementation.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized size of a `CREATE_SA` message.
pub const CREATE_SA_SIZE: usize = 1 + NONCE_SIZE + 32;

/// The single control message: announces a freshly installed inbound SA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSa {
    /// HKDF salt chosen by the initiator.
    pub nonce: [u8; NONCE_SIZE],
    /// Kernel-assigned SPI of the initiator's inbound SA.
    pub spi: Spi,
}

impl CreateSa {
    /// Create a message from its fields.
    pub fn new(nonce: [u8; NONCE_SIZE], spi: Spi) -> Self {
        CreateSa { nonce, spi }
    }

    /// Serialize to the 65-byte wire format.
    pub fn compose(&self) -> [u8; CREATE_SA_SIZE] {
        let mut msg = [0u8; CREATE_SA_SIZE];
        msg[0] = PROTOCOL_VERSION;
        msg[1..1 + NONCE_SIZE].copy_from_slice(&self.nonce);
        msg[1 + NONCE_SIZE..1 + NONCE_SIZE + 4].copy_from_slice(&self.spi.0.to_be_bytes());
        msg
    }

    /// Parse a received buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] for any size other than 65 bytes
    /// and [`Error::UnsupportedVersion`] when byte 0 is not 1. These are the
    /// only parse-time validations.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        if msg.len() != CREATE_SA_SIZE {
            return Err(Error::MalformedMessage { size: msg.len() });
        }
        if msg[0] != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion(msg[0]));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&msg[1..1 + NONCE_SIZE]);
        let spi = u32::from_be_bytes([
            msg[1 + NONCE_SIZE],
            msg[2 + NONCE_SIZE],
            msg[3 + NONCE_SIZE],
            msg[4 + NONCE_SIZE],
        ]);

        Ok(CreateSa {
            nonce,
            spi: Spi(spi),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_length() {
        let msg = CreateSa::new([0u8; 32], Spi(1));
        assert_eq!(msg.compose().len(), 65);
    }

    #[test]
    fn test_roundtrip() {
        let mut nonce = [0u8; 32];
        for (i, b) in nonce.iter_mut().enumerate() {
            *b = i as u8;
        }

        for spi in [0u32, 1, 0x100, 0xdead_beef, u32::MAX] {
            let msg = CreateSa::new(nonce, Spi(spi));
            let parsed = CreateSa::parse(&msg.compose()).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn test_wire_layout() {
        let msg = CreateSa::new([0xAA; 32], Spi(0x0102_0304));
        let wire = msg.compose();

        assert_eq!(wire[0], 1);
        assert!(wire[1..33].iter().all(|&b| b == 0xAA));
        assert_eq!(&wire[33..37], &[0x01, 0x02, 0x03, 0x04]);
        // Reserved padding is emitted as zero.
        assert!(wire[37..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rejects_wrong_size() {
        for size in [0, 1, 64, 66, 128] {
            let buf = vec![1u8; size];
            match CreateSa::parse(&buf) {
                Err(Error::MalformedMessage { size: s }) => assert_eq!(s, size),
                other => panic!("expected MalformedMessage, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut wire = CreateSa::new([0u8; 32], Spi(7)).compose();
        wire[0] = 2;
        match CreateSa::parse(&wire) {
            Err(Error::UnsupportedVersion(2)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_bytes_ignored() {
        let mut wire = CreateSa::new([7u8; 32], Spi(9)).compose();
        for b in wire[37..].iter_mut() {
            *b = 0xFF;
        }
        let parsed = CreateSa::parse(&wire).unwrap();
        assert_eq!(parsed.spi, Spi(9));
        assert_eq!(parsed.nonce, [7u8; 32]);
    }
}
