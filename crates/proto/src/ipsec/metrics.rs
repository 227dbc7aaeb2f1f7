//! Metrics for IPsec establishment
//!
//! Thread-safe atomic counters covering the SA lifecycle. Counters can be
//! exported to monitoring systems; `snapshot()` gives a point-in-time view.
//!
//! # Example
//!
//! ```
//! use meshguard_proto::ipsec::metrics::IpsecMetrics;
//!
//! let metrics = IpsecMetrics::new();
//! metrics.record_inbound_installed(false);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.inbound_sa_installed, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the IPsec control plane
#[derive(Debug, Clone, Default)]
pub struct IpsecMetrics {
    /// Inbound SAs installed (initiator side)
    pub inbound_sa_installed: Arc<AtomicU64>,

    /// Outbound SAs installed (responder side)
    pub outbound_sa_installed: Arc<AtomicU64>,

    /// Establishment attempts absorbed by the reference counter
    pub establishments_coalesced: Arc<AtomicU64>,

    /// Rekey exchanges performed (either side)
    pub rekeys: Arc<AtomicU64>,

    /// Soft expiries that fired a rekey trigger
    pub rekeys_triggered: Arc<AtomicU64>,

    /// Hard expiries processed
    pub hard_expiries: Arc<AtomicU64>,

    /// Peer pairs fully torn down
    pub tunnels_destroyed: Arc<AtomicU64>,

    /// Flush operations completed
    pub flushes: Arc<AtomicU64>,

    /// Currently registered inbound SAs
    pub inbound_sa_active: Arc<AtomicU64>,

    /// Currently registered outbound SAs
    pub outbound_sa_active: Arc<AtomicU64>,
}

impl IpsecMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an installed inbound SA
    pub fn record_inbound_installed(&self, rekey: bool) {
        self.inbound_sa_installed.fetch_add(1, Ordering::Relaxed);
        if rekey {
            self.rekeys.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an installed outbound SA
    pub fn record_outbound_installed(&self, rekey: bool) {
        self.outbound_sa_installed.fetch_add(1, Ordering::Relaxed);
        if rekey {
            self.rekeys.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a coalesced duplicate establishment
    pub fn record_coalesced(&self) {
        self.establishments_coalesced
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a soft expiry that fired its rekey trigger
    pub fn record_rekey_triggered(&self) {
        self.rekeys_triggered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a processed hard expiry
    pub fn record_hard_expiry(&self) {
        self.hard_expiries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed teardown
    pub fn record_destroyed(&self) {
        self.tunnels_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a flush
    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the active-SA gauges from registry row counts
    pub fn record_active(&self, inbound: usize, outbound: usize) {
        self.inbound_sa_active
            .store(inbound as u64, Ordering::Relaxed);
        self.outbound_sa_active
            .store(outbound as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inbound_sa_installed: self.inbound_sa_installed.load(Ordering::Relaxed),
            outbound_sa_installed: self.outbound_sa_installed.load(Ordering::Relaxed),
            establishments_coalesced: self.establishments_coalesced.load(Ordering::Relaxed),
            rekeys: self.rekeys.load(Ordering::Relaxed),
            rekeys_triggered: self.rekeys_triggered.load(Ordering::Relaxed),
            hard_expiries: self.hard_expiries.load(Ordering::Relaxed),
            tunnels_destroyed: self.tunnels_destroyed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            inbound_sa_active: self.inbound_sa_active.load(Ordering::Relaxed),
            outbound_sa_active: self.outbound_sa_active.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of all establishment metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Inbound SAs installed
    pub inbound_sa_installed: u64,
    /// Outbound SAs installed
    pub outbound_sa_installed: u64,
    /// Coalesced duplicate establishments
    pub establishments_coalesced: u64,
    /// Rekey exchanges performed
    pub rekeys: u64,
    /// Rekey triggers fired by soft expiry
    pub rekeys_triggered: u64,
    /// Hard expiries processed
    pub hard_expiries: u64,
    /// Peer pairs fully torn down
    pub tunnels_destroyed: u64,
    /// Flushes completed
    pub flushes: u64,
    /// Currently registered inbound SAs
    pub inbound_sa_active: u64,
    /// Currently registered outbound SAs
    pub outbound_sa_active: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_metrics_are_zero() {
        let snapshot = IpsecMetrics::new().snapshot();
        assert_eq!(snapshot.inbound_sa_installed, 0);
        assert_eq!(snapshot.outbound_sa_active, 0);
    }

    #[test]
    fn test_install_counters() {
        let metrics = IpsecMetrics::new();
        metrics.record_inbound_installed(false);
        metrics.record_inbound_installed(true);
        metrics.record_outbound_installed(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.inbound_sa_installed, 2);
        assert_eq!(snapshot.outbound_sa_installed, 1);
        assert_eq!(snapshot.rekeys, 2);
    }

    #[test]
    fn test_active_gauges() {
        let metrics = IpsecMetrics::new();
        metrics.record_active(2, 1);
        assert_eq!(metrics.snapshot().inbound_sa_active, 2);

        metrics.record_active(1, 1);
        assert_eq!(metrics.snapshot().inbound_sa_active, 1);
        assert_eq!(metrics.snapshot().outbound_sa_active, 1);
    }

    #[test]
    fn test_clone_shares_counters() {
        let a = IpsecMetrics::new();
        let b = a.clone();
        a.record_coalesced();
        b.record_coalesced();

        assert_eq!(a.snapshot().establishments_coalesced, 2);
        assert_eq!(b.snapshot().establishments_coalesced, 2);
    }
}
