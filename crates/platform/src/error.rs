//! Error types for Meshguard platform operations

use std::fmt;
use std::io;

/// Result type for Meshguard platform operations
pub type MeshguardResult<T> = Result<T, MeshguardError>;

/// Unified error type for kernel and packet-filter interactions
#[derive(Debug)]
pub enum MeshguardError {
    /// I/O error from socket or process operations
    Io(io::Error),

    /// The kernel rejected a netlink request
    Kernel {
        /// Positive errno value reported by the kernel
        errno: i32,
        /// Human-readable description of the errno
        message: String,
    },

    /// A netlink message was shorter than its fixed-size payload requires
    Truncated {
        /// Bytes required by the payload
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// A netlink message could not be interpreted
    InvalidMessage(String),

    /// An external command (the `iptables` binary) failed
    Command {
        /// Program that was invoked
        program: String,
        /// Exit status and captured stderr
        detail: String,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for MeshguardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshguardError::Io(e) => write!(f, "IO error: {}", e),
            MeshguardError::Kernel { errno, message } => {
                write!(f, "kernel error: {} (errno {})", message, errno)
            }
            MeshguardError::Truncated { expected, actual } => {
                write!(
                    f,
                    "message truncated: expected {} bytes, got {}",
                    expected, actual
                )
            }
            MeshguardError::InvalidMessage(msg) => write!(f, "invalid message: {}", msg),
            MeshguardError::Command { program, detail } => {
                write!(f, "{} failed: {}", program, detail)
            }
            MeshguardError::Other(e) => write!(f, "error: {}", e),
        }
    }
}

impl std::error::Error for MeshguardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MeshguardError::Io(e) => Some(e),
            MeshguardError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for MeshguardError {
    fn from(err: io::Error) -> Self {
        MeshguardError::Io(err)
    }
}

impl MeshguardError {
    /// Create a kernel error from the raw (negative) errno carried in a
    /// netlink ACK message.
    pub fn from_errno(raw: i32) -> Self {
        let errno = -raw;
        let message = io::Error::from_raw_os_error(errno).to_string();
        MeshguardError::Kernel { errno, message }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            MeshguardError::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ESRCH, ENODEV).
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno(), Some(2) | Some(3) | Some(19))
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        self.errno() == Some(17)
    }
}
