//! Capability traits for the kernel XFRM subsystem and the host packet filter
//!
//! The control plane is generic over these two traits. Production code uses
//! [`crate::XfrmClient`] and [`crate::IptablesCmd`]; tests substitute
//! recording mocks.

use std::net::Ipv4Addr;

use tokio::sync::mpsc;

use crate::error::MeshguardResult;
use crate::xfrm::{ExpiryEvent, PolicyEntry, PolicySpec, SaEntry, SaId, SaSpec, Spi};

/// Kernel XFRM operations required by the IPsec control plane.
///
/// All operations are synchronous from the caller's point of view: a call
/// returns once the kernel has acknowledged (or rejected) the request.
#[async_trait::async_trait]
pub trait Xfrm: Send + Sync {
    /// Ask the kernel to reserve an unused SPI for an ESP/transport SA on the
    /// given address pair. The returned SPI identifies a larval SA that must
    /// be materialized with [`state_update`](Xfrm::state_update).
    async fn alloc_spi(&self, src: Ipv4Addr, dst: Ipv4Addr) -> MeshguardResult<Spi>;

    /// Materialize (or replace in place) an SA previously allocated with
    /// [`alloc_spi`](Xfrm::alloc_spi).
    async fn state_update(&self, sa: &SaSpec) -> MeshguardResult<()>;

    /// Create a fresh SA. Fails if an SA with the same identity exists.
    async fn state_add(&self, sa: &SaSpec) -> MeshguardResult<()>;

    /// Delete an SA.
    async fn state_del(&self, id: &SaId) -> MeshguardResult<()>;

    /// Install an outbound policy. Fails if a matching policy exists.
    async fn policy_add(&self, policy: &PolicySpec) -> MeshguardResult<()>;

    /// Replace an outbound policy in place.
    async fn policy_update(&self, policy: &PolicySpec) -> MeshguardResult<()>;

    /// Delete an outbound policy.
    async fn policy_del(&self, policy: &PolicySpec) -> MeshguardResult<()>;

    /// Enumerate all IPv4 SAs currently known to the kernel.
    async fn state_list(&self) -> MeshguardResult<Vec<SaEntry>>;

    /// Enumerate all IPv4 policies currently known to the kernel.
    async fn policy_list(&self) -> MeshguardResult<Vec<PolicyEntry>>;

    /// Subscribe to kernel notifications of soft and hard SA lifetime expiry.
    ///
    /// The returned channel yields events until the subscription fails, at
    /// which point the error is delivered in-band and the channel closes.
    async fn expiry_events(
        &self,
    ) -> MeshguardResult<mpsc::Receiver<MeshguardResult<ExpiryEvent>>>;
}

/// Minimal packet-filter capability.
///
/// Mirrors the subset of `iptables` operations the rule manager needs. Rule
/// specifications are passed as pre-tokenized argument vectors, exactly as
/// they would appear after `iptables -t <table> -A <chain>`.
#[async_trait::async_trait]
pub trait Firewall: Send + Sync {
    /// Append a rule to a chain.
    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<()>;

    /// Append a rule only if an identical rule is not already present.
    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> MeshguardResult<()>;

    /// Insert a rule at the given position (1-based).
    async fn insert(
        &self,
        table: &str,
        chain: &str,
        pos: u32,
        spec: &[String],
    ) -> MeshguardResult<()>;

    /// Delete a rule from a chain. Fails if the rule is absent.
    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<()>;

    /// Check whether an identical rule is present in a chain.
    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<bool>;

    /// Create the chain if missing, otherwise remove all rules from it.
    async fn clear_chain(&self, table: &str, chain: &str) -> MeshguardResult<()>;

    /// Delete an (empty) chain.
    async fn delete_chain(&self, table: &str, chain: &str) -> MeshguardResult<()>;
}
