//! Per-peer IPsec establishment for a mesh overlay network
//!
//! Between each pair of mesh peers this module negotiates and maintains a
//! pair of unidirectional Security Associations that protect overlay UDP
//! traffic with transport-mode ESP (AES-GCM).
//!
//! # Overview
//!
//! Establishment is asymmetric and two-phased. For the direction R -> L:
//!
//! ```text
//! L: protect_init          R: protect_finish
//!   allocate inbound SPI     parse CREATE_SA
//!   derive key (HKDF)        derive the same key
//!   install inbound SA       install outbound SA
//!   install filter rules     install outbound policy
//!   send CREATE_SA  ------>
//! ```
//!
//! The opposite direction is set up by R independently invoking
//! `protect_init` on its side; a full bidirectional tunnel is two such
//! exchanges. Rekeying reuses the same exchange, driven by kernel soft-expiry
//! events observed by the [`engine::Ipsec::monitor`] loop.
//!
//! # Packet-filter contract
//!
//! Private chains mark inbound ESP carrying a known SPI and outbound overlay
//! UDP; a filter rule drops unprotected UDP from a protected peer, and an
//! OUTPUT guard drops marked packets that would otherwise leave in
//! plaintext. See [`rules`] for the exact rule graph.
//!
//! # Concurrency
//!
//! One instance is shared by every caller. A single lock serializes the
//! registry, the reference counter, and all kernel and packet-filter
//! mutations; if `send` succeeded, kernel state already reflects the new SA.

pub mod config;
pub mod engine;
pub mod error;
pub mod kdf;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod rules;

// Re-export commonly used types
pub use config::IpsecConfig;
pub use engine::{ControlSender, Ipsec};
pub use error::{Error, Result};
pub use message::CreateSa;
pub use metrics::IpsecMetrics;
pub use peer::{PeerLink, PeerName};
pub use registry::RekeyTrigger;
