//! # Meshguard Platform
//!
//! Operating-system integration layer for the Meshguard mesh IPsec subsystem.
//!
//! This crate provides:
//! - Unified error types (`MeshguardError`, `MeshguardResult`)
//! - The kernel and packet-filter capability traits (`Xfrm`, `Firewall`)
//! - A typed netlink client for the kernel XFRM subsystem (`XfrmClient`)
//! - An `iptables` command runner implementing `Firewall` (`IptablesCmd`)
//!
//! The capability traits are the seams the control plane is written against;
//! the concrete implementations here talk to the real kernel, while test
//! suites substitute recording mocks.
//!
//! # Examples
//!
//! ```no_run
//! use meshguard_platform::{MeshguardResult, XfrmClient};
//! use meshguard_platform::traits::Xfrm;
//!
//! # async fn example() -> MeshguardResult<()> {
//! let xfrm = XfrmClient::new()?;
//! let spi = xfrm.alloc_spi("10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap()).await?;
//! println!("kernel picked {}", spi);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod firewall;
pub mod netlink;
pub mod traits;
pub mod xfrm;

pub use error::{MeshguardError, MeshguardResult};
pub use firewall::IptablesCmd;
pub use traits::{Firewall, Xfrm};
pub use xfrm::{ExpiryEvent, Mark, PolicySpec, SaId, SaLimits, SaSpec, Spi, XfrmClient};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
