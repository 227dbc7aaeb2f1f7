//! Protocol implementation for the Meshguard mesh security layer.
//!
//! This crate provides the control plane that protects overlay UDP traffic
//! between mesh peers with transport-mode ESP:
//!
//! - **IPsec establishment** - per-peer-pair SA negotiation and rekeying
//! - **Packet-filter enforcement** - marking and plaintext-bypass guards
//!
//! # Example
//!
//! ```rust
//! use meshguard_proto::ipsec::CreateSa;
//! use meshguard_platform::Spi;
//!
//! // Compose and parse the one control message of the protocol
//! let msg = CreateSa::new([0x42; 32], Spi(0x1001));
//! let wire = msg.compose();
//!
//! let parsed = CreateSa::parse(&wire).unwrap();
//! assert_eq!(parsed.spi, Spi(0x1001));
//! ```
//!
//! # Security
//!
//! - Symmetric keys are derived with HKDF-SHA256 and zeroized on drop
//! - Key material is never logged and never stored beyond the call that
//!   consumes it
//! - All kernel and packet-filter mutations are serialized under one lock

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ipsec;
