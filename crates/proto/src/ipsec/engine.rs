//! The SA establishment engine
//!
//! [`Ipsec`] owns the per-peer SA lifecycle: the initiator half
//! ([`protect_init`](Ipsec::protect_init)), the responder half
//! ([`protect_finish`](Ipsec::protect_finish)), teardown
//! ([`destroy`](Ipsec::destroy)), bulk cleanup ([`flush`](Ipsec::flush)),
//! and the expiry monitor ([`monitor`](Ipsec::monitor)).
//!
//! # Locking
//!
//! One lock serializes everything: both registry indices, the reference
//! counter, and every kernel and packet-filter mutation. The lock is held
//! for the whole duration of a public operation, including the `send`
//! callback: when `send` succeeds, the kernel and the registry already
//! reflect the new SA, and a responder can never accept a `CREATE_SA` whose
//! inbound SA is not yet installed. SA operations are infrequent and
//! bounded, which makes the coarse lock affordable.
//!
//! # Partial failure
//!
//! If an operation fails after kernel state was installed, that state is
//! left in place: SPIs are unique, the peer has not been told about them,
//! and a later [`destroy`](Ipsec::destroy) or [`flush`](Ipsec::flush)
//! reclaims them. The engine never retries; establishment cadence belongs
//! to the upper layer.
//!
//! # Example
//!
//! ```no_run
//! use meshguard_platform::{IptablesCmd, XfrmClient};
//! use meshguard_proto::ipsec::{Ipsec, IpsecConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ipsec = Ipsec::new(XfrmClient::new()?, IptablesCmd::new(), IpsecConfig::default())?;
//!
//! // Flush leftovers from a previous run and install the scaffolding rules.
//! ipsec.flush(false).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use meshguard_platform::{
    ExpiryEvent, Firewall, MeshguardResult, PolicySpec, SaId, SaLimits, SaSpec, Spi, Xfrm,
};
use meshguard_platform::xfrm::REPLAY_WINDOW;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::ipsec::config::IpsecConfig;
use crate::ipsec::error::{Error, KernelOp, Result};
use crate::ipsec::kdf;
use crate::ipsec::logging;
use crate::ipsec::message::CreateSa;
use crate::ipsec::metrics::IpsecMetrics;
use crate::ipsec::peer::{ConnRefCount, PeerLink, SpiKey};
use crate::ipsec::registry::{RekeyTrigger, SaDirection, SpiRecord, SpiRegistry};
use crate::ipsec::rules::{self, RuleSet};

/// Delivers a serialized `CREATE_SA` to the remote peer.
///
/// Supplied by the mesh runtime per establishment; invoked while the engine
/// lock is held and must not call back into the engine.
#[async_trait::async_trait]
pub trait ControlSender: Send + Sync {
    /// Deliver one control frame to the peer.
    async fn send(&self, frame: &[u8]) -> MeshguardResult<()>;
}

/// Mutable state guarded by the engine lock.
#[derive(Default)]
struct EngineState {
    registry: SpiRegistry,
    refcount: ConnRefCount,
}

/// Per-peer IPsec establishment engine.
///
/// Generic over the kernel and packet-filter capabilities so tests can
/// substitute recording mocks.
pub struct Ipsec<X: Xfrm, F: Firewall> {
    xfrm: X,
    firewall: F,
    config: IpsecConfig,
    rules: RuleSet,
    metrics: IpsecMetrics,
    state: Mutex<EngineState>,
}

impl<X: Xfrm, F: Firewall> Ipsec<X, F> {
    /// Create an engine over the given kernel and packet-filter adapters.
    pub fn new(xfrm: X, firewall: F, config: IpsecConfig) -> Result<Self> {
        config.validate()?;
        let rules = RuleSet::new(config.mark);
        Ok(Ipsec {
            xfrm,
            firewall,
            config,
            rules,
            metrics: IpsecMetrics::new(),
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Establishment metrics for this instance.
    pub fn metrics(&self) -> &IpsecMetrics {
        &self.metrics
    }

    /// Initiator half: install the inbound SA for `remote -> local` and
    /// announce it to the peer.
    ///
    /// Without `is_rekey`, a duplicate establishment for a pair that is
    /// already protected short-circuits to success. With `is_rekey`, the
    /// pair must already have an inbound SA ([`Error::UnknownSpi`]
    /// otherwise), and only the SPI-specific filter rule is added for the
    /// fresh SA; the previous SA keeps carrying traffic until hard expiry.
    ///
    /// If `send` fails the error is returned and the installed kernel state
    /// is left behind for [`destroy`](Ipsec::destroy) or
    /// [`flush`](Ipsec::flush) to reclaim.
    pub async fn protect_init(
        &self,
        link: &PeerLink,
        session_key: &[u8; 32],
        is_rekey: bool,
        send: &dyn ControlSender,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        if !is_rekey {
            let count = state.refcount.get(link.local_peer, link.remote_peer);
            if count > 1 {
                // IPsec is already set up between the given peers
                logging::log_coalesced(link.local_peer, link.remote_peer, count);
                self.metrics.record_coalesced();
                return Ok(());
            }
        }

        let spi_key = SpiKey::new(link.remote_peer, link.local_peer);
        if is_rekey && state.registry.get_by_key(&spi_key).is_none() {
            return Err(Error::UnknownSpi(spi_key));
        }

        let nonce = kdf::gen_nonce()?;
        let key = kdf::derive_key(session_key, &nonce, link.local_peer)?;

        let spi = self
            .xfrm
            .alloc_spi(link.remote_ip, link.local_ip)
            .await
            .map_err(|e| Error::kernel(KernelOp::AllocSpi, e))?;

        let sa = self.inbound_sa(link, spi, &key);
        self.xfrm
            .state_update(&sa)
            .await
            .map_err(|e| Error::kernel(KernelOp::StateUpdate, e))?;

        if is_rekey {
            let rule = self
                .rules
                .protecting_in_rule(link.local_ip, link.remote_ip, spi);
            rules::install_unique(&self.firewall, &[rule]).await?;
        } else {
            let peer_rules =
                self.rules
                    .protecting_rules(link.local_ip, link.remote_ip, link.remote_port, spi);
            rules::install_unique(&self.firewall, &peer_rules).await?;
        }

        let msg = CreateSa::new(nonce, spi);
        send.send(&msg.compose())
            .await
            .map_err(|e| Error::SendFailed(e.to_string()))?;

        state.registry.insert(SpiRecord {
            key: spi_key,
            spi,
            dir: SaDirection::In,
        });

        logging::log_inbound_established(link.local_peer, link.remote_peer, spi, is_rekey);
        self.metrics.record_inbound_installed(is_rekey);
        let (inbound, outbound) = state.registry.active_counts();
        self.metrics.record_active(inbound, outbound);

        Ok(())
    }

    /// Responder half: consume a `CREATE_SA` and install the outbound SA
    /// for `local -> remote`.
    ///
    /// Whether this is a rekey is decided by registry lookup, not by the
    /// caller. The `rekey` trigger becomes owned state of the outbound
    /// record and fires on kernel soft expiry.
    pub async fn protect_finish(
        &self,
        create_sa_msg: &[u8],
        link: &PeerLink,
        session_key: &[u8; 32],
        rekey: Arc<dyn RekeyTrigger>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let msg = CreateSa::parse(create_sa_msg)?;

        let spi_key = SpiKey::new(link.local_peer, link.remote_peer);
        let is_rekey = state.registry.get_by_key(&spi_key).is_some();

        // The initiator of this direction is the remote peer.
        let key = kdf::derive_key(session_key, &msg.nonce, link.remote_peer)?;

        let sa = self.outbound_sa(link, msg.spi, &key);
        self.xfrm
            .state_add(&sa)
            .await
            .map_err(|e| Error::kernel(KernelOp::StateAdd, e))?;

        let policy = self.outbound_policy(link, msg.spi);
        if is_rekey {
            self.xfrm
                .policy_update(&policy)
                .await
                .map_err(|e| Error::kernel(KernelOp::PolicyUpdate, e))?;
        } else {
            self.xfrm
                .policy_add(&policy)
                .await
                .map_err(|e| Error::kernel(KernelOp::PolicyAdd, e))?;
        }

        state.registry.insert(SpiRecord {
            key: spi_key,
            spi: msg.spi,
            dir: SaDirection::Out { rekey },
        });

        logging::log_outbound_established(link.local_peer, link.remote_peer, msg.spi, is_rekey);
        self.metrics.record_outbound_installed(is_rekey);
        let (inbound, outbound) = state.registry.active_counts();
        self.metrics.record_active(inbound, outbound);

        Ok(())
    }

    /// Release one establishment reference; tear the pair down when the last
    /// reference is gone.
    ///
    /// Removes the inbound SA, the outbound policy and SA, and all three
    /// per-peer filter rules. A missing inbound registry entry is tolerated:
    /// rule removal proceeds with the last-known SPI and skips rules that
    /// are already gone.
    pub async fn destroy(&self, link: &PeerLink) -> Result<()> {
        let mut state = self.state.lock().await;

        let count = state.refcount.put(link.local_peer, link.remote_peer);
        if count > 0 {
            return Ok(());
        }
        if count < 0 {
            return Err(Error::InvalidState(format!(
                "refcount for {} -> {} dropped to {}",
                link.local_peer, link.remote_peer, count
            )));
        }

        let in_key = SpiKey::new(link.remote_peer, link.local_peer);
        let in_spi = state.registry.get_by_key(&in_key).map(|r| r.spi);
        if let Some(spi) = in_spi {
            self.xfrm
                .state_del(&SaId {
                    src: link.remote_ip,
                    dst: link.local_ip,
                    spi,
                })
                .await
                .map_err(|e| Error::kernel(KernelOp::StateDel, e))?;
            state.registry.remove_by_key(&in_key);
        } else {
            logging::log_missing_inbound(in_key);
        }

        let out_key = SpiKey::new(link.local_peer, link.remote_peer);
        if let Some(out_spi) = state.registry.get_by_key(&out_key).map(|r| r.spi) {
            self.xfrm
                .policy_del(&self.outbound_policy(link, out_spi))
                .await
                .map_err(|e| Error::kernel(KernelOp::PolicyDel, e))?;

            self.xfrm
                .state_del(&SaId {
                    src: link.local_ip,
                    dst: link.remote_ip,
                    spi: out_spi,
                })
                .await
                .map_err(|e| Error::kernel(KernelOp::StateDel, e))?;

            let peer_rules = self.rules.protecting_rules(
                link.local_ip,
                link.remote_ip,
                link.remote_port,
                in_spi.unwrap_or(Spi(0)),
            );
            rules::remove_rules(&self.firewall, &peer_rules).await?;

            state.registry.remove_by_key(&out_key);
        }

        logging::log_destroyed(link.local_peer, link.remote_peer);
        self.metrics.record_destroyed();
        let (inbound, outbound) = state.registry.active_counts();
        self.metrics.record_active(inbound, outbound);

        Ok(())
    }

    /// Remove every SA and policy this process owns, and reset the filter
    /// rule graph.
    ///
    /// Policies are recognized by the process mark, SAs by registered SPIs.
    /// With `destroy = false` the private chains and scaffolding are
    /// re-asserted (the startup call); with `destroy = true` they are
    /// removed for good. Reference counters and the SPI maps are left
    /// untouched; callers flush at shutdown after destroying every pair.
    pub async fn flush(&self, destroy: bool) -> Result<()> {
        let state = self.state.lock().await;

        let policies = self
            .xfrm
            .policy_list()
            .await
            .map_err(|e| Error::kernel(KernelOp::List, e))?;
        for entry in policies {
            if let (Some(mark), Some(spi)) = (entry.mark, entry.tmpl_spi) {
                if mark == self.config.mark {
                    self.xfrm
                        .policy_del(&PolicySpec {
                            src: entry.src,
                            dst: entry.dst,
                            spi,
                            mark,
                        })
                        .await
                        .map_err(|e| Error::kernel(KernelOp::PolicyDel, e))?;
                }
            }
        }

        let sas = self
            .xfrm
            .state_list()
            .await
            .map_err(|e| Error::kernel(KernelOp::List, e))?;
        for entry in sas {
            if state.registry.contains_spi(entry.spi) {
                self.xfrm
                    .state_del(&SaId {
                        src: entry.src,
                        dst: entry.dst,
                        spi: entry.spi,
                    })
                    .await
                    .map_err(|e| Error::kernel(KernelOp::StateDel, e))?;
            }
        }

        rules::reset(&self.firewall, &self.rules, destroy).await?;

        logging::log_flushed(destroy);
        self.metrics.record_flush();

        Ok(())
    }

    /// Consume kernel expiry notifications until the subscription fails.
    ///
    /// Hard expiry of an inbound SA removes its SPI-specific filter rule and
    /// its registry rows; hard expiry of an outbound SA removes rows only.
    /// Soft expiry of an outbound SA fires its rekey trigger; soft expiry of
    /// an inbound SA is ignored. Subscription and trigger errors are fatal
    /// and propagate to the caller. Returns `Ok(())` if the event source
    /// closes.
    pub async fn monitor(&self) -> Result<()> {
        let mut events = self
            .xfrm
            .expiry_events()
            .await
            .map_err(|e| Error::kernel(KernelOp::Monitor, e))?;

        while let Some(event) = events.recv().await {
            let event = event.map_err(|e| Error::kernel(KernelOp::Monitor, e))?;
            self.handle_expiry(event).await?;
        }

        Ok(())
    }

    async fn handle_expiry(&self, event: ExpiryEvent) -> Result<()> {
        let mut state = self.state.lock().await;

        let record = match state.registry.get_by_spi(event.spi) {
            Some(record) => record.clone(),
            None => return Ok(()),
        };

        if event.hard {
            if !record.dir.is_outbound() {
                // The expired state ran remote -> local; the kernel reports
                // it with src = remote, dst = local.
                let rule = self
                    .rules
                    .protecting_in_rule(event.dst, event.src, event.spi);
                if let Err(e) = rules::remove_rules(&self.firewall, &[rule]).await {
                    logging::log_expiry_cleanup_failed(event.spi, &e);
                }
            }
            state.registry.remove_by_spi(event.spi);
            logging::log_hard_expiry(event.spi, record.dir.is_outbound());
            self.metrics.record_hard_expiry();
            let (inbound, outbound) = state.registry.active_counts();
            self.metrics.record_active(inbound, outbound);
        } else if let SaDirection::Out { rekey } = record.dir {
            logging::log_rekey_triggered(event.spi);
            rekey
                .rekey()
                .await
                .map_err(|e| Error::SendFailed(e.to_string()))?;
            self.metrics.record_rekey_triggered();
        }

        Ok(())
    }

    fn inbound_sa(&self, link: &PeerLink, spi: Spi, key: &[u8; kdf::KEY_SIZE]) -> SaSpec {
        SaSpec {
            src: link.remote_ip,
            dst: link.local_ip,
            spi,
            key: Zeroizing::new(key.to_vec()),
            limits: SaLimits {
                // Soft expiry is the outbound side's concern.
                soft_packets: 0,
                soft_seconds: 0,
                hard_packets: self.config.limits.hard_packets,
                hard_seconds: self.config.limits.hard_seconds,
            },
            replay_window: REPLAY_WINDOW,
        }
    }

    fn outbound_sa(&self, link: &PeerLink, spi: Spi, key: &[u8; kdf::KEY_SIZE]) -> SaSpec {
        SaSpec {
            src: link.local_ip,
            dst: link.remote_ip,
            spi,
            key: Zeroizing::new(key.to_vec()),
            limits: self.config.limits,
            replay_window: REPLAY_WINDOW,
        }
    }

    fn outbound_policy(&self, link: &PeerLink, spi: Spi) -> PolicySpec {
        PolicySpec {
            src: link.local_ip,
            dst: link.remote_ip,
            spi,
            mark: self.config.mark,
        }
    }
}

// The engine's behavior is covered by the integration suite in
// `tests/ipsec_establish.rs`, which drives it through recording mocks.
