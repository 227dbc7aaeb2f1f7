//! Bring up and tear down the Meshguard packet-filter scaffolding.
//!
//! This drives the real kernel adapters: it flushes any leftover state from
//! a previous run, installs the private chains and scaffolding rules,
//! watches for SA expiry events for a few seconds, then removes everything.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example ipsec_flush
//! ```
//!
//! # Requirements
//!
//! - CAP_NET_ADMIN (or root) for both netlink XFRM and `iptables`
//! - The `iptables` binary on PATH

use std::time::Duration;

use meshguard_platform::{IptablesCmd, XfrmClient};
use meshguard_proto::ipsec::{Ipsec, IpsecConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("meshguard_proto=debug,meshguard_platform=debug")
        .init();

    let ipsec = Ipsec::new(XfrmClient::new()?, IptablesCmd::new(), IpsecConfig::default())?;

    // Startup: reclaim anything a crashed previous run left behind and
    // install the chains and scaffolding rules.
    ipsec.flush(false).await?;
    println!("scaffolding installed (chains MESHGUARD-IN/OUT et al.)");

    // Watch for expiry events briefly; with no SAs established this just
    // demonstrates the monitor loop staying healthy.
    println!("watching for SA expiry events for 5 seconds...");
    match tokio::time::timeout(Duration::from_secs(5), ipsec.monitor()).await {
        Ok(result) => result?,
        Err(_elapsed) => println!("no expiry events (as expected on an idle host)"),
    }

    // Shutdown: remove chains, scaffolding, and any process-owned state.
    ipsec.flush(true).await?;
    println!("flushed; kernel and filter state removed");

    let snapshot = ipsec.metrics().snapshot();
    println!("flushes performed: {}", snapshot.flushes);

    Ok(())
}
