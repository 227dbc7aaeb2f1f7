//! Error types for IPsec establishment operations
//!
//! This module defines a unified error type for the control plane. Kernel and
//! packet-filter failures carry the operation that failed, so callers can log
//! which stage of an exchange went wrong.

use std::fmt;

use meshguard_platform::MeshguardError;

use crate::ipsec::peer::SpiKey;

/// Result type for IPsec establishment operations
pub type Result<T> = std::result::Result<T, Error>;

/// Kernel XFRM operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelOp {
    /// SPI allocation
    AllocSpi,
    /// SA replace-in-place
    StateUpdate,
    /// SA creation
    StateAdd,
    /// SA deletion
    StateDel,
    /// Policy creation
    PolicyAdd,
    /// Policy replace-in-place
    PolicyUpdate,
    /// Policy deletion
    PolicyDel,
    /// SA or policy enumeration
    List,
    /// Expiry subscription
    Monitor,
}

impl KernelOp {
    fn as_str(self) -> &'static str {
        match self {
            KernelOp::AllocSpi => "state_alloc_spi",
            KernelOp::StateUpdate => "state_update",
            KernelOp::StateAdd => "state_add",
            KernelOp::StateDel => "state_del",
            KernelOp::PolicyAdd => "policy_add",
            KernelOp::PolicyUpdate => "policy_update",
            KernelOp::PolicyDel => "policy_del",
            KernelOp::List => "list",
            KernelOp::Monitor => "monitor",
        }
    }
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet-filter operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// Rule append (plain or unique)
    Append,
    /// Rule deletion
    Delete,
    /// Rule presence check
    Exists,
    /// Chain create-or-flush
    Clear,
    /// Chain deletion
    DeleteChain,
}

impl FilterOp {
    fn as_str(self) -> &'static str {
        match self {
            FilterOp::Append => "append",
            FilterOp::Delete => "delete",
            FilterOp::Exists => "exists",
            FilterOp::Clear => "clear",
            FilterOp::DeleteChain => "delete_chain",
        }
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPsec establishment errors
#[derive(Debug)]
pub enum Error {
    /// A kernel XFRM operation failed
    Kernel {
        /// The operation that failed
        op: KernelOp,
        /// Underlying platform error
        source: MeshguardError,
    },

    /// A packet-filter operation failed
    Filter {
        /// The operation that failed
        op: FilterOp,
        /// Underlying platform error
        source: MeshguardError,
    },

    /// A `CREATE_SA` message had the wrong size
    MalformedMessage {
        /// Size of the rejected message
        size: usize,
    },

    /// A `CREATE_SA` message carried an unknown protocol version
    UnsupportedVersion(u8),

    /// Rekey requested for a peer pair with no prior inbound SA
    UnknownSpi(SpiKey),

    /// Random-source or key-derivation failure
    Crypto(String),

    /// Reference counter dropped below zero (an upper-layer bug)
    InvalidState(String),

    /// A caller-supplied `send` or `rekey` callback failed
    SendFailed(String),

    /// Invalid configuration
    Config(String),
}

impl Error {
    /// Wrap a platform error as a kernel failure with its operation tag.
    pub fn kernel(op: KernelOp, source: MeshguardError) -> Self {
        Error::Kernel { op, source }
    }

    /// Wrap a platform error as a packet-filter failure with its operation tag.
    pub fn filter(op: FilterOp, source: MeshguardError) -> Self {
        Error::Filter { op, source }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Kernel { op, source } => write!(f, "xfrm {}: {}", op, source),
            Error::Filter { op, source } => write!(f, "iptables {}: {}", op, source),
            Error::MalformedMessage { size } => {
                write!(f, "invalid CREATE_SA msg size: {}", size)
            }
            Error::UnsupportedVersion(vsn) => write!(f, "unsupported vsn: {}", vsn),
            Error::UnknownSpi(key) => write!(f, "cannot find SPI by {}", key),
            Error::Crypto(msg) => write!(f, "crypto error: {}", msg),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::SendFailed(msg) => write!(f, "callback failed: {}", msg),
            Error::Config(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Kernel { source, .. } | Error::Filter { source, .. } => Some(source),
            _ => None,
        }
    }
}
