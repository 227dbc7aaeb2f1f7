//! IPsec establishment integration tests
//!
//! Drives the engine end-to-end through recording mock implementations of
//! the kernel and packet-filter capabilities: full two-sided establishment,
//! coalescing, rekey, expiry handling, teardown, and flush.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use meshguard_platform::xfrm::{PolicyEntry, SaEntry};
use meshguard_platform::{
    ExpiryEvent, Firewall, MeshguardError, MeshguardResult, PolicySpec, SaId, SaSpec, Spi, Xfrm,
};
use meshguard_proto::ipsec::{
    ControlSender, Error, Ipsec, IpsecConfig, PeerLink, PeerName, RekeyTrigger,
};
use tokio::sync::mpsc;

const PEER_L: PeerName = PeerName(0x0000_0000_0000_0001);
const PEER_R: PeerName = PeerName(0x0000_0000_0000_0002);
const IP_L: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const IP_R: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const PORT: u16 = 6783;
const SESSION_KEY: [u8; 32] = [0u8; 32];

/// L's view of the pair.
fn link_on_l() -> PeerLink {
    PeerLink {
        local_peer: PEER_L,
        remote_peer: PEER_R,
        local_ip: IP_L,
        remote_ip: IP_R,
        remote_port: PORT,
    }
}

/// R's view of the pair.
fn link_on_r() -> PeerLink {
    PeerLink {
        local_peer: PEER_R,
        remote_peer: PEER_L,
        local_ip: IP_R,
        remote_ip: IP_L,
        remote_port: PORT,
    }
}

// ---------------------------------------------------------------------------
// Mock kernel
// ---------------------------------------------------------------------------

#[derive(Default)]
struct XfrmInner {
    next_spi: AtomicU32,
    alloc_calls: AtomicU64,
    policy_updates: AtomicU64,
    states: StdMutex<Vec<SaEntry>>,
    policies: StdMutex<Vec<PolicyEntry>>,
    expiry_rx: StdMutex<Option<mpsc::Receiver<MeshguardResult<ExpiryEvent>>>>,
}

#[derive(Clone, Default)]
struct MockXfrm(Arc<XfrmInner>);

impl MockXfrm {
    fn new() -> Self {
        let mock = MockXfrm::default();
        mock.0.next_spi.store(0x100, Ordering::Relaxed);
        mock
    }

    /// Wire a test-controlled expiry event channel into the mock.
    fn with_expiry(rx: mpsc::Receiver<MeshguardResult<ExpiryEvent>>) -> Self {
        let mock = MockXfrm::new();
        *mock.0.expiry_rx.lock().unwrap() = Some(rx);
        mock
    }

    fn alloc_calls(&self) -> u64 {
        self.0.alloc_calls.load(Ordering::Relaxed)
    }

    fn policy_updates(&self) -> u64 {
        self.0.policy_updates.load(Ordering::Relaxed)
    }

    fn states(&self) -> Vec<SaEntry> {
        self.0.states.lock().unwrap().clone()
    }

    fn policies(&self) -> Vec<PolicyEntry> {
        self.0.policies.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Xfrm for MockXfrm {
    async fn alloc_spi(&self, _src: Ipv4Addr, _dst: Ipv4Addr) -> MeshguardResult<Spi> {
        self.0.alloc_calls.fetch_add(1, Ordering::Relaxed);
        Ok(Spi(self.0.next_spi.fetch_add(1, Ordering::Relaxed)))
    }

    async fn state_update(&self, sa: &SaSpec) -> MeshguardResult<()> {
        assert_eq!(sa.key.len(), 36, "AEAD key material must be 36 bytes");
        self.0.states.lock().unwrap().push(SaEntry {
            src: sa.src,
            dst: sa.dst,
            spi: sa.spi,
        });
        Ok(())
    }

    async fn state_add(&self, sa: &SaSpec) -> MeshguardResult<()> {
        self.state_update(sa).await
    }

    async fn state_del(&self, id: &SaId) -> MeshguardResult<()> {
        let mut states = self.0.states.lock().unwrap();
        let before = states.len();
        states.retain(|e| !(e.spi == id.spi && e.src == id.src && e.dst == id.dst));
        if states.len() == before {
            return Err(MeshguardError::from_errno(-3)); // ESRCH
        }
        Ok(())
    }

    async fn policy_add(&self, policy: &PolicySpec) -> MeshguardResult<()> {
        self.0.policies.lock().unwrap().push(PolicyEntry {
            src: policy.src,
            dst: policy.dst,
            mark: Some(policy.mark),
            tmpl_spi: Some(policy.spi),
        });
        Ok(())
    }

    async fn policy_update(&self, policy: &PolicySpec) -> MeshguardResult<()> {
        self.0.policy_updates.fetch_add(1, Ordering::Relaxed);
        let mut policies = self.0.policies.lock().unwrap();
        match policies
            .iter_mut()
            .find(|e| e.src == policy.src && e.dst == policy.dst)
        {
            Some(entry) => {
                entry.tmpl_spi = Some(policy.spi);
                Ok(())
            }
            None => Err(MeshguardError::from_errno(-3)),
        }
    }

    async fn policy_del(&self, policy: &PolicySpec) -> MeshguardResult<()> {
        let mut policies = self.0.policies.lock().unwrap();
        let before = policies.len();
        policies.retain(|e| !(e.src == policy.src && e.dst == policy.dst));
        if policies.len() == before {
            return Err(MeshguardError::from_errno(-3));
        }
        Ok(())
    }

    async fn state_list(&self) -> MeshguardResult<Vec<SaEntry>> {
        Ok(self.states())
    }

    async fn policy_list(&self) -> MeshguardResult<Vec<PolicyEntry>> {
        Ok(self.policies())
    }

    async fn expiry_events(
        &self,
    ) -> MeshguardResult<mpsc::Receiver<MeshguardResult<ExpiryEvent>>> {
        if let Some(rx) = self.0.expiry_rx.lock().unwrap().take() {
            return Ok(rx);
        }
        // No injected channel: return one that is already closed.
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Mock packet filter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FirewallInner {
    rules: StdMutex<Vec<(String, String, Vec<String>)>>,
    chains_cleared: StdMutex<Vec<(String, String)>>,
    chains_deleted: StdMutex<Vec<(String, String)>>,
}

#[derive(Clone, Default)]
struct MockFirewall(Arc<FirewallInner>);

impl MockFirewall {
    fn rule_count(&self) -> usize {
        self.0.rules.lock().unwrap().len()
    }

    /// Rules in one chain whose spec mentions `needle`.
    fn rules_mentioning(&self, chain: &str, needle: &str) -> usize {
        self.0
            .rules
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c, spec)| c == chain && spec.iter().any(|t| t.contains(needle)))
            .count()
    }

    fn chains_deleted(&self) -> usize {
        self.0.chains_deleted.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Firewall for MockFirewall {
    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<()> {
        self.0
            .rules
            .lock()
            .unwrap()
            .push((table.to_string(), chain.to_string(), spec.to_vec()));
        Ok(())
    }

    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        spec: &[String],
    ) -> MeshguardResult<()> {
        if self.exists(table, chain, spec).await? {
            return Ok(());
        }
        self.append(table, chain, spec).await
    }

    async fn insert(
        &self,
        table: &str,
        chain: &str,
        _pos: u32,
        spec: &[String],
    ) -> MeshguardResult<()> {
        self.0
            .rules
            .lock()
            .unwrap()
            .insert(0, (table.to_string(), chain.to_string(), spec.to_vec()));
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<()> {
        let mut rules = self.0.rules.lock().unwrap();
        let before = rules.len();
        rules.retain(|(t, c, s)| !(t == table && c == chain && s == spec));
        if rules.len() == before {
            return Err(MeshguardError::Command {
                program: "iptables".to_string(),
                detail: "no matching rule".to_string(),
            });
        }
        Ok(())
    }

    async fn exists(&self, table: &str, chain: &str, spec: &[String]) -> MeshguardResult<bool> {
        Ok(self
            .0
            .rules
            .lock()
            .unwrap()
            .iter()
            .any(|(t, c, s)| t == table && c == chain && s == spec))
    }

    async fn clear_chain(&self, table: &str, chain: &str) -> MeshguardResult<()> {
        self.0
            .rules
            .lock()
            .unwrap()
            .retain(|(t, c, _)| !(t == table && c == chain));
        self.0
            .chains_cleared
            .lock()
            .unwrap()
            .push((table.to_string(), chain.to_string()));
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> MeshguardResult<()> {
        self.0
            .chains_deleted
            .lock()
            .unwrap()
            .push((table.to_string(), chain.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Callback stubs
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChannelSender {
    frames: StdMutex<Vec<Vec<u8>>>,
}

impl ChannelSender {
    fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ControlSender for ChannelSender {
    async fn send(&self, frame: &[u8]) -> MeshguardResult<()> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

struct FailingSender;

#[async_trait::async_trait]
impl ControlSender for FailingSender {
    async fn send(&self, _frame: &[u8]) -> MeshguardResult<()> {
        Err(MeshguardError::Other("control link down".into()))
    }
}

#[derive(Default)]
struct CountingTrigger {
    count: AtomicU64,
}

#[async_trait::async_trait]
impl RekeyTrigger for CountingTrigger {
    async fn rekey(&self) -> MeshguardResult<()> {
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn engine(xfrm: MockXfrm, firewall: MockFirewall) -> Ipsec<MockXfrm, MockFirewall> {
    Ipsec::new(xfrm, firewall, IpsecConfig::default()).expect("valid config")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_establishes_one_direction() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx.clone(), lf.clone());
    let (rx, rf) = (MockXfrm::new(), MockFirewall::default());
    let r = engine(rx.clone(), rf.clone());

    let sender = ChannelSender::default();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();

    // L emitted one 65-byte CREATE_SA and installed the inbound SA R -> L.
    let frames = sender.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 65);
    assert_eq!(frames[0][0], 1);

    let states = lx.states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].src, IP_R);
    assert_eq!(states[0].dst, IP_L);
    assert_eq!(lf.rule_count(), 3);
    assert_eq!(l.metrics().snapshot().inbound_sa_active, 1);
    assert_eq!(l.metrics().snapshot().outbound_sa_active, 0);

    // R consumes the announcement and installs the outbound SA + policy.
    r.protect_finish(
        &frames[0],
        &link_on_r(),
        &SESSION_KEY,
        Arc::new(CountingTrigger::default()),
    )
    .await
    .unwrap();

    let states = rx.states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].src, IP_R);
    assert_eq!(states[0].dst, IP_L);
    assert_eq!(states[0].spi, lx.states()[0].spi);

    let policies = rx.policies();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].tmpl_spi, Some(states[0].spi));
    assert_eq!(rx.policy_updates(), 0);

    // The responder side installs no filter rules of its own.
    assert_eq!(rf.rule_count(), 0);
    assert_eq!(r.metrics().snapshot().outbound_sa_active, 1);
}

#[tokio::test]
async fn concurrent_double_init_coalesces() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx.clone(), lf.clone());

    let sender = ChannelSender::default();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();

    // Exactly one SPI allocation, one message, one set of rules.
    assert_eq!(lx.alloc_calls(), 1);
    assert_eq!(sender.frames().len(), 1);
    assert_eq!(lf.rule_count(), 3);
    assert_eq!(l.metrics().snapshot().establishments_coalesced, 1);
    assert_eq!(l.metrics().snapshot().inbound_sa_active, 1);
}

#[tokio::test]
async fn destroy_honors_refcount() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx.clone(), lf.clone());

    // Two establishment attempts for the pair, plus the reverse direction so
    // teardown covers the outbound half too.
    let sender = ChannelSender::default();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();

    let reverse = meshguard_proto::ipsec::CreateSa::new([9u8; 32], Spi(0x9999)).compose();
    l.protect_finish(
        &reverse,
        &link_on_l(),
        &SESSION_KEY,
        Arc::new(CountingTrigger::default()),
    )
    .await
    .unwrap();
    assert_eq!(lx.states().len(), 2);

    // First destroy: refcount 2 -> 1, nothing torn down.
    l.destroy(&link_on_l()).await.unwrap();
    assert_eq!(lx.states().len(), 2);
    assert_eq!(lf.rule_count(), 3);

    // Second destroy: refcount hits zero, everything goes.
    l.destroy(&link_on_l()).await.unwrap();
    assert!(lx.states().is_empty());
    assert!(lx.policies().is_empty());
    assert_eq!(lf.rule_count(), 0);
    assert_eq!(l.metrics().snapshot().inbound_sa_active, 0);
    assert_eq!(l.metrics().snapshot().outbound_sa_active, 0);
}

#[tokio::test]
async fn destroy_without_establish_is_invalid_state() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx.clone(), lf.clone());

    let err = l.destroy(&link_on_l()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
    assert!(lx.states().is_empty());
    assert_eq!(lf.rule_count(), 0);
}

#[tokio::test]
async fn rekey_adds_only_the_spi_rule() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx.clone(), lf.clone());

    let sender = ChannelSender::default();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();
    let s1 = lx.states()[0].spi;

    l.protect_init(&link_on_l(), &SESSION_KEY, true, &sender)
        .await
        .unwrap();
    let s2 = lx.states()[1].spi;
    assert_ne!(s1, s2);

    // One new rule only: the ESP-SPI match for s2. The old s1 rule stays
    // until hard expiry; the UDP rules are not duplicated.
    assert_eq!(lf.rule_count(), 4);
    assert_eq!(
        lf.rules_mentioning("MESHGUARD-IN", &format!("0x{:x}", s1.0)),
        1
    );
    assert_eq!(
        lf.rules_mentioning("MESHGUARD-IN", &format!("0x{:x}", s2.0)),
        1
    );
    assert_eq!(lx.alloc_calls(), 2);
    assert_eq!(l.metrics().snapshot().rekeys, 1);
}

#[tokio::test]
async fn rekey_without_prior_sa_is_rejected() {
    let l = engine(MockXfrm::new(), MockFirewall::default());

    let sender = ChannelSender::default();
    let err = l
        .protect_init(&link_on_l(), &SESSION_KEY, true, &sender)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSpi(_)));
    assert!(sender.frames().is_empty());
}

#[tokio::test]
async fn finish_rekey_updates_policy_in_place() {
    let (rx, rf) = (MockXfrm::new(), MockFirewall::default());
    let r = engine(rx.clone(), rf.clone());

    let first = meshguard_proto::ipsec::CreateSa::new([1u8; 32], Spi(0x100)).compose();
    let second = meshguard_proto::ipsec::CreateSa::new([2u8; 32], Spi(0x101)).compose();
    let trigger = Arc::new(CountingTrigger::default());

    r.protect_finish(&first, &link_on_r(), &SESSION_KEY, trigger.clone())
        .await
        .unwrap();
    r.protect_finish(&second, &link_on_r(), &SESSION_KEY, trigger)
        .await
        .unwrap();

    // Rekey is detected by registry lookup: the policy is updated, not added.
    assert_eq!(rx.policy_updates(), 1);
    let policies = rx.policies();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].tmpl_spi, Some(Spi(0x101)));
    assert_eq!(r.metrics().snapshot().rekeys, 1);
}

#[tokio::test]
async fn finish_rejects_bad_messages() {
    let r = engine(MockXfrm::new(), MockFirewall::default());
    let trigger = Arc::new(CountingTrigger::default());

    let err = r
        .protect_finish(&[0u8; 64], &link_on_r(), &SESSION_KEY, trigger.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedMessage { size: 64 }));

    let mut wire = meshguard_proto::ipsec::CreateSa::new([0u8; 32], Spi(1)).compose();
    wire[0] = 9;
    let err = r
        .protect_finish(&wire, &link_on_r(), &SESSION_KEY, trigger)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion(9)));
}

#[tokio::test]
async fn send_failure_leaves_kernel_state_for_reclamation() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx.clone(), lf.clone());

    let err = l
        .protect_init(&link_on_l(), &SESSION_KEY, false, &FailingSender)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SendFailed(_)));

    // Kernel state stays behind; the registry does not record the SA.
    assert_eq!(lx.states().len(), 1);
    assert_eq!(l.metrics().snapshot().inbound_sa_active, 0);
}

#[tokio::test]
async fn soft_expiry_fires_rekey_trigger_once() {
    let (tx, rx_events) = mpsc::channel(4);
    let (rx, rf) = (MockXfrm::with_expiry(rx_events), MockFirewall::default());
    let r = Arc::new(engine(rx.clone(), rf));

    let wire = meshguard_proto::ipsec::CreateSa::new([1u8; 32], Spi(0x500)).compose();
    let trigger = Arc::new(CountingTrigger::default());
    r.protect_finish(&wire, &link_on_r(), &SESSION_KEY, trigger.clone())
        .await
        .unwrap();

    let monitor = tokio::spawn({
        let r = r.clone();
        async move { r.monitor().await }
    });

    tx.send(Ok(ExpiryEvent {
        spi: Spi(0x500),
        src: IP_R,
        dst: IP_L,
        hard: false,
    }))
    .await
    .unwrap();
    // Soft expiry of an unknown SPI is ignored.
    tx.send(Ok(ExpiryEvent {
        spi: Spi(0x9999),
        src: IP_R,
        dst: IP_L,
        hard: false,
    }))
    .await
    .unwrap();
    drop(tx);

    monitor.await.unwrap().unwrap();
    assert_eq!(trigger.count.load(Ordering::Relaxed), 1);
    assert_eq!(r.metrics().snapshot().rekeys_triggered, 1);
    // The SA itself is still live.
    assert_eq!(r.metrics().snapshot().outbound_sa_active, 1);
}

#[tokio::test]
async fn hard_expiry_cleans_up_only_the_expired_sa() {
    let (tx, rx_events) = mpsc::channel(4);
    let (lx, lf) = (MockXfrm::with_expiry(rx_events), MockFirewall::default());
    let l = Arc::new(engine(lx.clone(), lf.clone()));

    let sender = ChannelSender::default();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();
    let s1 = lx.states()[0].spi;
    l.protect_init(&link_on_l(), &SESSION_KEY, true, &sender)
        .await
        .unwrap();
    let s2 = lx.states()[1].spi;
    assert_eq!(l.metrics().snapshot().inbound_sa_active, 2);

    let monitor = tokio::spawn({
        let l = l.clone();
        async move { l.monitor().await }
    });

    // The kernel reports the expired inbound state as src=remote, dst=local.
    tx.send(Ok(ExpiryEvent {
        spi: s1,
        src: IP_R,
        dst: IP_L,
        hard: true,
    }))
    .await
    .unwrap();
    drop(tx);
    monitor.await.unwrap().unwrap();

    // s1's ESP rule is gone, s2's remains, UDP rules untouched.
    assert_eq!(
        lf.rules_mentioning("MESHGUARD-IN", &format!("0x{:x}", s1.0)),
        0
    );
    assert_eq!(
        lf.rules_mentioning("MESHGUARD-IN", &format!("0x{:x}", s2.0)),
        1
    );
    assert_eq!(lf.rule_count(), 3);
    assert_eq!(l.metrics().snapshot().inbound_sa_active, 1);
    assert_eq!(l.metrics().snapshot().hard_expiries, 1);
}

#[tokio::test]
async fn flush_startup_installs_scaffolding() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx, lf.clone());

    l.flush(false).await.unwrap();

    // Six scaffolding rules present, no chains deleted.
    assert_eq!(lf.rule_count(), 6);
    assert_eq!(lf.chains_deleted(), 0);

    // Flushing again is idempotent.
    l.flush(false).await.unwrap();
    assert_eq!(lf.rule_count(), 6);
}

#[tokio::test]
async fn flush_destroy_removes_everything_marked() {
    let (lx, lf) = (MockXfrm::new(), MockFirewall::default());
    let l = engine(lx.clone(), lf.clone());

    l.flush(false).await.unwrap();

    let sender = ChannelSender::default();
    l.protect_init(&link_on_l(), &SESSION_KEY, false, &sender)
        .await
        .unwrap();
    let reverse = meshguard_proto::ipsec::CreateSa::new([3u8; 32], Spi(0x700)).compose();
    l.protect_finish(
        &reverse,
        &link_on_l(),
        &SESSION_KEY,
        Arc::new(CountingTrigger::default()),
    )
    .await
    .unwrap();

    assert_eq!(lx.states().len(), 2);
    assert_eq!(lx.policies().len(), 1);

    l.flush(true).await.unwrap();

    // Every marked policy and every registered SA is deleted, the private
    // chains (and with them the per-peer rules) are gone, and the
    // scaffolding rules have been removed.
    assert!(lx.policies().is_empty());
    assert!(lx.states().is_empty());
    assert_eq!(lf.chains_deleted(), 5);
    assert_eq!(lf.rule_count(), 0);
}

#[tokio::test]
async fn monitor_propagates_subscription_errors() {
    let (tx, rx_events) = mpsc::channel(1);
    let l = Arc::new(engine(
        MockXfrm::with_expiry(rx_events),
        MockFirewall::default(),
    ));

    let monitor = tokio::spawn({
        let l = l.clone();
        async move { l.monitor().await }
    });

    tx.send(Err(MeshguardError::from_errno(-105))) // ENOBUFS
        .await
        .unwrap();

    let err = monitor.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Kernel { .. }));
}
