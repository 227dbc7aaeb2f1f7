//! Structured logging for IPsec establishment
//!
//! Contextual logging over the `tracing` framework. Peer names and SPIs are
//! rendered in hex; key material is never logged.
//!
//! # Log levels
//!
//! - **DEBUG**: coalesced duplicate establishments, rule maintenance
//! - **INFO**: SA installation, rekeys, destroys, flushes
//! - **WARN**: tolerated inconsistencies (missing registry rows, cleanup
//!   failures on the expiry path)

use tracing::{debug, info, warn};

use meshguard_platform::Spi;

use crate::ipsec::peer::{PeerName, SpiKey};

/// Log installation of an inbound SA on the initiator side.
pub fn log_inbound_established(local: PeerName, remote: PeerName, spi: Spi, rekey: bool) {
    info!(
        local_peer = %local,
        remote_peer = %remote,
        spi = %spi,
        rekey = rekey,
        "inbound SA installed"
    );
}

/// Log installation of an outbound SA on the responder side.
pub fn log_outbound_established(local: PeerName, remote: PeerName, spi: Spi, rekey: bool) {
    info!(
        local_peer = %local,
        remote_peer = %remote,
        spi = %spi,
        rekey = rekey,
        "outbound SA installed"
    );
}

/// Log a duplicate establishment attempt absorbed by the reference counter.
pub fn log_coalesced(local: PeerName, remote: PeerName, count: i64) {
    debug!(
        local_peer = %local,
        remote_peer = %remote,
        refcount = count,
        "establishment already in place, coalescing"
    );
}

/// Log a soft expiry that starts a rekey exchange.
pub fn log_rekey_triggered(spi: Spi) {
    info!(spi = %spi, "soft expiry, requesting rekey");
}

/// Log hard-expiry cleanup of an SA.
pub fn log_hard_expiry(spi: Spi, outbound: bool) {
    info!(spi = %spi, outbound = outbound, "hard expiry, SA reclaimed");
}

/// Log completed teardown of a peer pair.
pub fn log_destroyed(local: PeerName, remote: PeerName) {
    info!(local_peer = %local, remote_peer = %remote, "tunnel state destroyed");
}

/// Log a flush of process-owned kernel and filter state.
pub fn log_flushed(destroy: bool) {
    info!(destroy = destroy, "flushed SAs, policies, and filter rules");
}

/// Log a destroy that found no inbound registry entry for the pair.
pub fn log_missing_inbound(key: SpiKey) {
    warn!(spi_key = %key, "no inbound SA registered for pair, removing rules anyway");
}

/// Log a failed rule removal on the hard-expiry path (tolerated).
pub fn log_expiry_cleanup_failed(spi: Spi, error: &crate::ipsec::error::Error) {
    warn!(spi = %spi, error = %error, "failed to remove rule for expired SA");
}
