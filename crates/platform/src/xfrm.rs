//! Typed client for the kernel XFRM (IPsec SA/policy) subsystem.
//!
//! The control plane needs a small slice of XFRM: allocate an SPI, create,
//! replace and delete transport-mode ESP states, manage outbound policies,
//! enumerate both for flushing, and listen for lifetime-expiry events. This
//! module implements exactly that slice over `NETLINK_XFRM`, with the kernel
//! ABI structures expressed as zerocopy `#[repr(C)]` types.
//!
//! # Example
//!
//! ```ignore
//! use meshguard_platform::xfrm::XfrmClient;
//! use meshguard_platform::traits::Xfrm;
//!
//! let client = XfrmClient::new()?;
//! let spi = client.alloc_spi(remote, local).await?;
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use tokio::sync::mpsc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zeroize::Zeroizing;

use crate::error::{MeshguardError, MeshguardResult};
use crate::netlink::NetlinkSocket;
use crate::traits::Xfrm;

/// ESP protocol number.
pub const ESP_PROTO: u8 = 50;
/// AEAD algorithm the kernel uses for AES-GCM ESP (RFC 4106).
pub const AEAD_ALG: &str = "rfc4106(gcm(aes))";
/// Integrity check value length in bits.
pub const AEAD_ICV_BITS: u32 = 128;
/// Anti-replay window for every SA this subsystem creates.
pub const REPLAY_WINDOW: u8 = 32;

const AF_INET: u16 = 2;
const IPPROTO_UDP: u8 = 17;
const XFRM_INF: u64 = u64::MAX;
const XFRM_MODE_TRANSPORT: u8 = 0;
const XFRM_POLICY_OUT: u8 = 1;
const XFRM_POLICY_ALLOW: u8 = 0;

// XFRM message types (from linux/xfrm.h)
const XFRM_MSG_NEWSA: u16 = 0x10;
const XFRM_MSG_DELSA: u16 = 0x11;
const XFRM_MSG_GETSA: u16 = 0x12;
const XFRM_MSG_NEWPOLICY: u16 = 0x13;
const XFRM_MSG_DELPOLICY: u16 = 0x14;
const XFRM_MSG_GETPOLICY: u16 = 0x15;
const XFRM_MSG_ALLOCSPI: u16 = 0x16;
const XFRM_MSG_EXPIRE: u16 = 0x18;
const XFRM_MSG_UPDPOLICY: u16 = 0x19;
const XFRM_MSG_UPDSA: u16 = 0x1a;

// XFRM attribute types
const XFRMA_TMPL: u16 = 5;
const XFRMA_SRCADDR: u16 = 13;
const XFRMA_ALG_AEAD: u16 = 18;
const XFRMA_MARK: u16 = 21;

// Netlink constants
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_EXCL: u16 = 0x200;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_DUMP: u16 = 0x300;
const NLMSG_HDRLEN: usize = 16;

/// Multicast group carrying `XFRM_MSG_EXPIRE` notifications.
const XFRMNLGRP_EXPIRE: u32 = 2;

/// Default SPI allocation range, matching `ip xfrm state allocspi`.
const SPI_ALLOC_MIN: u32 = 0x100;
const SPI_ALLOC_MAX: u32 = 0xffff_ffff;

/// Security Parameter Index: the kernel-assigned identity of one SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Spi(pub u32);

impl fmt::Display for Spi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Firewall/policy mark value with mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    /// Mark value.
    pub value: u32,
    /// Mark mask.
    pub mask: u32,
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}/0x{:x}", self.value, self.mask)
    }
}

/// Packet and time lifetimes for an SA. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaLimits {
    /// Soft packet limit; crossing it emits a soft expiry event.
    pub soft_packets: u64,
    /// Hard packet limit; crossing it destroys the SA.
    pub hard_packets: u64,
    /// Soft time limit in seconds since the SA was added.
    pub soft_seconds: u64,
    /// Hard time limit in seconds since the SA was added.
    pub hard_seconds: u64,
}

/// Full description of one transport-mode ESP SA.
#[derive(Clone)]
pub struct SaSpec {
    /// Source endpoint.
    pub src: Ipv4Addr,
    /// Destination endpoint.
    pub dst: Ipv4Addr,
    /// SA identity.
    pub spi: Spi,
    /// 36-byte AEAD key material (32-byte AES-GCM key + 4-byte salt).
    pub key: Zeroizing<Vec<u8>>,
    /// Lifetime limits.
    pub limits: SaLimits,
    /// Anti-replay window size.
    pub replay_window: u8,
}

impl fmt::Debug for SaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaSpec")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("spi", &self.spi)
            .field("limits", &self.limits)
            .field("replay_window", &self.replay_window)
            .finish_non_exhaustive()
    }
}

/// Identity of an existing SA, for deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaId {
    /// Source endpoint.
    pub src: Ipv4Addr,
    /// Destination endpoint.
    pub dst: Ipv4Addr,
    /// SA identity.
    pub spi: Spi,
}

/// Outbound policy demanding ESP for UDP between two hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySpec {
    /// Local endpoint (`src/32` selector).
    pub src: Ipv4Addr,
    /// Remote endpoint (`dst/32` selector).
    pub dst: Ipv4Addr,
    /// SPI of the SA the policy template references.
    pub spi: Spi,
    /// Mark restricting the policy to marked packets.
    pub mark: Mark,
}

/// One SA as reported by a kernel dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaEntry {
    /// Source endpoint.
    pub src: Ipv4Addr,
    /// Destination endpoint.
    pub dst: Ipv4Addr,
    /// SA identity.
    pub spi: Spi,
}

/// One policy as reported by a kernel dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEntry {
    /// Selector source address.
    pub src: Ipv4Addr,
    /// Selector destination address.
    pub dst: Ipv4Addr,
    /// Mark attribute, if the policy carries one.
    pub mark: Option<Mark>,
    /// SPI of the first template, if any.
    pub tmpl_spi: Option<Spi>,
}

/// A soft or hard lifetime expiry notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryEvent {
    /// SPI of the expiring SA.
    pub spi: Spi,
    /// Source endpoint of the expiring SA.
    pub src: Ipv4Addr,
    /// Destination endpoint of the expiring SA.
    pub dst: Ipv4Addr,
    /// True for hard expiry (the kernel has reclaimed the SA),
    /// false for soft expiry (the SA is still usable).
    pub hard: bool,
}

// ---------------------------------------------------------------------------
// Kernel ABI structures
// ---------------------------------------------------------------------------

/// XFRM address (16 bytes; IPv4 occupies the first four).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmAddress {
    bytes: [u8; 16],
}

impl XfrmAddress {
    fn from_v4(addr: Ipv4Addr) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&addr.octets());
        Self { bytes }
    }

    fn to_v4(self) -> Ipv4Addr {
        Ipv4Addr::new(self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3])
    }
}

/// XFRM ID (identifies an SA by destination, SPI, and protocol).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmId {
    daddr: XfrmAddress,
    /// Network byte order.
    spi: u32,
    proto: u8,
    _pad: [u8; 3],
}

/// XFRM traffic selector.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmSelector {
    daddr: XfrmAddress,
    saddr: XfrmAddress,
    /// Network byte order.
    dport: u16,
    dport_mask: u16,
    /// Network byte order.
    sport: u16,
    sport_mask: u16,
    family: u16,
    prefixlen_d: u8,
    prefixlen_s: u8,
    proto: u8,
    _pad1: [u8; 3],
    ifindex: i32,
    user: u32,
}

/// XFRM lifetime configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmLifetimeCfg {
    soft_byte_limit: u64,
    hard_byte_limit: u64,
    soft_packet_limit: u64,
    hard_packet_limit: u64,
    soft_add_expires_seconds: u64,
    hard_add_expires_seconds: u64,
    soft_use_expires_seconds: u64,
    hard_use_expires_seconds: u64,
}

impl XfrmLifetimeCfg {
    /// Byte and packet limits raised to `XFRM_INF`, no time limits.
    fn unlimited() -> Self {
        XfrmLifetimeCfg {
            soft_byte_limit: XFRM_INF,
            hard_byte_limit: XFRM_INF,
            soft_packet_limit: XFRM_INF,
            hard_packet_limit: XFRM_INF,
            ..Default::default()
        }
    }

    fn from_limits(limits: &SaLimits) -> Self {
        let packets = |n: u64| if n == 0 { XFRM_INF } else { n };
        XfrmLifetimeCfg {
            soft_byte_limit: XFRM_INF,
            hard_byte_limit: XFRM_INF,
            soft_packet_limit: packets(limits.soft_packets),
            hard_packet_limit: packets(limits.hard_packets),
            soft_add_expires_seconds: limits.soft_seconds,
            hard_add_expires_seconds: limits.hard_seconds,
            soft_use_expires_seconds: 0,
            hard_use_expires_seconds: 0,
        }
    }
}

/// XFRM lifetime current values.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmLifetimeCur {
    bytes: u64,
    packets: u64,
    add_time: u64,
    use_time: u64,
}

/// XFRM statistics.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmStats {
    replay_window: u32,
    replay: u32,
    integrity_failed: u32,
}

/// `xfrm_usersa_info`: the main SA structure (224 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUsersaInfo {
    sel: XfrmSelector,
    id: XfrmId,
    saddr: XfrmAddress,
    lft: XfrmLifetimeCfg,
    curlft: XfrmLifetimeCur,
    stats: XfrmStats,
    seq: u32,
    reqid: u32,
    family: u16,
    mode: u8,
    replay_window: u8,
    flags: u8,
    _pad: [u8; 7],
}

/// `xfrm_userspi_info`: ALLOCSPI request (232 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserSpiInfo {
    info: XfrmUsersaInfo,
    min: u32,
    max: u32,
}

/// `xfrm_usersa_id`: DELSA request (24 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUsersaId {
    daddr: XfrmAddress,
    /// Network byte order.
    spi: u32,
    family: u16,
    proto: u8,
    _pad: u8,
}

/// `xfrm_userpolicy_info`: the main policy structure (168 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserpolicyInfo {
    sel: XfrmSelector,
    lft: XfrmLifetimeCfg,
    curlft: XfrmLifetimeCur,
    priority: u32,
    index: u32,
    dir: u8,
    action: u8,
    flags: u8,
    share: u8,
    _pad: [u8; 4],
}

/// `xfrm_userpolicy_id`: DELPOLICY request (64 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserpolicyId {
    sel: XfrmSelector,
    index: u32,
    dir: u8,
    _pad: [u8; 3],
}

/// `xfrm_user_tmpl`: policy template (64 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserTmpl {
    id: XfrmId,
    family: u16,
    _pad1: [u8; 2],
    saddr: XfrmAddress,
    reqid: u32,
    mode: u8,
    share: u8,
    optional: u8,
    _pad2: u8,
    aalgos: u32,
    ealgos: u32,
    calgos: u32,
}

/// `xfrm_mark` attribute payload (8 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmMarkAbi {
    v: u32,
    m: u32,
}

/// `xfrm_user_expire`: expiry notification (232 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct XfrmUserExpire {
    state: XfrmUsersaInfo,
    hard: u8,
    _pad: [u8; 7],
}

// ---------------------------------------------------------------------------
// Netlink message plumbing
// ---------------------------------------------------------------------------

/// Incremental builder for one netlink message.
struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(msg_type: u16, flags: u16, seq: u32, pid: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len (fill later)
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&pid.to_ne_bytes());
        Self { buf }
    }

    fn payload(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    fn attr(mut self, attr_type: u16, data: &[u8]) -> Self {
        let len = (4 + data.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(data);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Iterator over the netlink messages packed into one receive buffer.
///
/// Yields `(nlmsg_type, payload)` pairs, where the payload excludes the
/// 16-byte header.
struct NetlinkMessages<'a> {
    data: &'a [u8],
}

impl<'a> NetlinkMessages<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for NetlinkMessages<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }
        let len = u32::from_ne_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
            as usize;
        let msg_type = u16::from_ne_bytes([self.data[4], self.data[5]]);
        if len < NLMSG_HDRLEN || len > self.data.len() {
            return None;
        }
        let payload = &self.data[NLMSG_HDRLEN..len];
        let aligned = (len + 3) & !3;
        self.data = if aligned >= self.data.len() {
            &[]
        } else {
            &self.data[aligned..]
        };
        Some((msg_type, payload))
    }
}

/// Parse a netlink attribute, advancing the input.
fn parse_nla<'a>(input: &mut &'a [u8]) -> Option<(u16, &'a [u8])> {
    if input.len() < 4 {
        return None;
    }

    let len = u16::from_ne_bytes([input[0], input[1]]) as usize;
    let attr_type = u16::from_ne_bytes([input[2], input[3]]);
    *input = &input[4..];

    if len < 4 {
        return None;
    }

    let payload_len = len - 4;
    if input.len() < payload_len {
        return None;
    }

    let payload = &input[..payload_len];
    *input = &input[payload_len..];

    let aligned = (len + 3) & !3;
    let padding = aligned - len;
    if input.len() >= padding {
        *input = &input[padding..];
    }

    Some((attr_type, payload))
}

/// Extract the errno from an `NLMSG_ERROR` payload.
fn ack_errno(payload: &[u8]) -> MeshguardResult<i32> {
    if payload.len() < 4 {
        return Err(MeshguardError::Truncated {
            expected: 4,
            actual: payload.len(),
        });
    }
    Ok(i32::from_ne_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Netlink-backed implementation of the [`Xfrm`] capability.
pub struct XfrmClient {
    sock: tokio::sync::Mutex<NetlinkSocket>,
}

impl XfrmClient {
    /// Open a new `NETLINK_XFRM` socket. Requires `CAP_NET_ADMIN`.
    pub fn new() -> MeshguardResult<Self> {
        Ok(Self {
            sock: tokio::sync::Mutex::new(NetlinkSocket::xfrm()?),
        })
    }

    /// Send one request and wait for its ACK.
    async fn request_ack(
        &self,
        msg_type: u16,
        extra_flags: u16,
        payload: &[u8],
        attrs: &[(u16, Vec<u8>)],
    ) -> MeshguardResult<()> {
        let sock = self.sock.lock().await;
        let seq = sock.next_seq();
        let mut builder = MessageBuilder::new(
            msg_type,
            NLM_F_REQUEST | NLM_F_ACK | extra_flags,
            seq,
            sock.pid(),
        )
        .payload(payload);
        for (attr_type, data) in attrs {
            builder = builder.attr(*attr_type, data);
        }
        sock.send(&builder.finish()).await?;

        loop {
            let data = sock.recv_msg().await?;
            for (msg_type, payload) in NetlinkMessages::new(&data) {
                if msg_type == NLMSG_ERROR {
                    let errno = ack_errno(payload)?;
                    if errno != 0 {
                        return Err(MeshguardError::from_errno(errno));
                    }
                    return Ok(());
                }
            }
        }
    }

    fn sa_payload(spec: &SaSpec) -> (XfrmUsersaInfo, Vec<u8>) {
        let mut info = XfrmUsersaInfo::default();
        info.saddr = XfrmAddress::from_v4(spec.src);
        info.id.daddr = XfrmAddress::from_v4(spec.dst);
        info.id.spi = spec.spi.0.to_be();
        info.id.proto = ESP_PROTO;
        info.family = AF_INET;
        info.mode = XFRM_MODE_TRANSPORT;
        info.replay_window = spec.replay_window;
        info.lft = XfrmLifetimeCfg::from_limits(&spec.limits);

        // xfrm_algo_aead: 64-byte name, key length and ICV length in bits,
        // then the raw key.
        let mut aead = vec![0u8; 64 + 4 + 4];
        aead[..AEAD_ALG.len()].copy_from_slice(AEAD_ALG.as_bytes());
        aead[64..68].copy_from_slice(&((spec.key.len() as u32) * 8).to_ne_bytes());
        aead[68..72].copy_from_slice(&AEAD_ICV_BITS.to_ne_bytes());
        aead.extend_from_slice(&spec.key);

        (info, aead)
    }

    fn policy_payload(spec: &PolicySpec) -> (XfrmUserpolicyInfo, Vec<u8>, Vec<u8>) {
        let mut info = XfrmUserpolicyInfo::default();
        info.sel.saddr = XfrmAddress::from_v4(spec.src);
        info.sel.daddr = XfrmAddress::from_v4(spec.dst);
        info.sel.prefixlen_s = 32;
        info.sel.prefixlen_d = 32;
        info.sel.proto = IPPROTO_UDP;
        info.sel.family = AF_INET;
        info.lft = XfrmLifetimeCfg::unlimited();
        info.dir = XFRM_POLICY_OUT;
        info.action = XFRM_POLICY_ALLOW;

        let mut tmpl = XfrmUserTmpl::default();
        tmpl.id.daddr = XfrmAddress::from_v4(spec.dst);
        tmpl.id.spi = spec.spi.0.to_be();
        tmpl.id.proto = ESP_PROTO;
        tmpl.family = AF_INET;
        tmpl.saddr = XfrmAddress::from_v4(spec.src);
        tmpl.mode = XFRM_MODE_TRANSPORT;
        tmpl.aalgos = u32::MAX;
        tmpl.ealgos = u32::MAX;
        tmpl.calgos = u32::MAX;

        let mark = XfrmMarkAbi {
            v: spec.mark.value,
            m: spec.mark.mask,
        };

        (info, tmpl.as_bytes().to_vec(), mark.as_bytes().to_vec())
    }
}

#[async_trait::async_trait]
impl Xfrm for XfrmClient {
    async fn alloc_spi(&self, src: Ipv4Addr, dst: Ipv4Addr) -> MeshguardResult<Spi> {
        let sock = self.sock.lock().await;
        let seq = sock.next_seq();

        let mut req = XfrmUserSpiInfo::default();
        req.info.saddr = XfrmAddress::from_v4(src);
        req.info.id.daddr = XfrmAddress::from_v4(dst);
        req.info.id.proto = ESP_PROTO;
        req.info.family = AF_INET;
        req.info.mode = XFRM_MODE_TRANSPORT;
        req.info.replay_window = REPLAY_WINDOW;
        req.info.lft = XfrmLifetimeCfg::unlimited();
        req.min = SPI_ALLOC_MIN;
        req.max = SPI_ALLOC_MAX;

        let msg = MessageBuilder::new(XFRM_MSG_ALLOCSPI, NLM_F_REQUEST, seq, sock.pid())
            .payload(req.as_bytes())
            .finish();
        sock.send(&msg).await?;

        loop {
            let data = sock.recv_msg().await?;
            for (msg_type, payload) in NetlinkMessages::new(&data) {
                match msg_type {
                    NLMSG_ERROR => {
                        let errno = ack_errno(payload)?;
                        if errno != 0 {
                            return Err(MeshguardError::from_errno(errno));
                        }
                    }
                    XFRM_MSG_NEWSA => {
                        let (info, _) = XfrmUsersaInfo::ref_from_prefix(payload).map_err(|_| {
                            MeshguardError::Truncated {
                                expected: std::mem::size_of::<XfrmUsersaInfo>(),
                                actual: payload.len(),
                            }
                        })?;
                        let spi = info.id.spi;
                        tracing::debug!(spi = %Spi(u32::from_be(spi)), "allocated SPI");
                        return Ok(Spi(u32::from_be(spi)));
                    }
                    _ => {}
                }
            }
        }
    }

    async fn state_update(&self, sa: &SaSpec) -> MeshguardResult<()> {
        let (info, aead) = Self::sa_payload(sa);
        self.request_ack(
            XFRM_MSG_UPDSA,
            0,
            info.as_bytes(),
            &[(XFRMA_ALG_AEAD, aead)],
        )
        .await
    }

    async fn state_add(&self, sa: &SaSpec) -> MeshguardResult<()> {
        let (info, aead) = Self::sa_payload(sa);
        self.request_ack(
            XFRM_MSG_NEWSA,
            NLM_F_CREATE | NLM_F_EXCL,
            info.as_bytes(),
            &[(XFRMA_ALG_AEAD, aead)],
        )
        .await
    }

    async fn state_del(&self, id: &SaId) -> MeshguardResult<()> {
        let mut req = XfrmUsersaId::default();
        req.daddr = XfrmAddress::from_v4(id.dst);
        req.spi = id.spi.0.to_be();
        req.family = AF_INET;
        req.proto = ESP_PROTO;

        let src = XfrmAddress::from_v4(id.src);
        self.request_ack(
            XFRM_MSG_DELSA,
            0,
            req.as_bytes(),
            &[(XFRMA_SRCADDR, src.as_bytes().to_vec())],
        )
        .await
    }

    async fn policy_add(&self, policy: &PolicySpec) -> MeshguardResult<()> {
        let (info, tmpl, mark) = Self::policy_payload(policy);
        self.request_ack(
            XFRM_MSG_NEWPOLICY,
            NLM_F_CREATE | NLM_F_EXCL,
            info.as_bytes(),
            &[(XFRMA_TMPL, tmpl), (XFRMA_MARK, mark)],
        )
        .await
    }

    async fn policy_update(&self, policy: &PolicySpec) -> MeshguardResult<()> {
        let (info, tmpl, mark) = Self::policy_payload(policy);
        self.request_ack(
            XFRM_MSG_UPDPOLICY,
            0,
            info.as_bytes(),
            &[(XFRMA_TMPL, tmpl), (XFRMA_MARK, mark)],
        )
        .await
    }

    async fn policy_del(&self, policy: &PolicySpec) -> MeshguardResult<()> {
        let mut req = XfrmUserpolicyId::default();
        req.sel.saddr = XfrmAddress::from_v4(policy.src);
        req.sel.daddr = XfrmAddress::from_v4(policy.dst);
        req.sel.prefixlen_s = 32;
        req.sel.prefixlen_d = 32;
        req.sel.proto = IPPROTO_UDP;
        req.sel.family = AF_INET;
        req.dir = XFRM_POLICY_OUT;

        let mark = XfrmMarkAbi {
            v: policy.mark.value,
            m: policy.mark.mask,
        };
        self.request_ack(
            XFRM_MSG_DELPOLICY,
            0,
            req.as_bytes(),
            &[(XFRMA_MARK, mark.as_bytes().to_vec())],
        )
        .await
    }

    async fn state_list(&self) -> MeshguardResult<Vec<SaEntry>> {
        let sock = self.sock.lock().await;
        let seq = sock.next_seq();
        let msg = MessageBuilder::new(
            XFRM_MSG_GETSA,
            NLM_F_REQUEST | NLM_F_DUMP,
            seq,
            sock.pid(),
        )
        .payload(XfrmUsersaInfo::default().as_bytes())
        .finish();
        sock.send(&msg).await?;

        let mut entries = Vec::new();
        loop {
            let data = sock.recv_msg().await?;
            for (msg_type, payload) in NetlinkMessages::new(&data) {
                match msg_type {
                    NLMSG_DONE => return Ok(entries),
                    NLMSG_ERROR => {
                        let errno = ack_errno(payload)?;
                        if errno != 0 {
                            return Err(MeshguardError::from_errno(errno));
                        }
                    }
                    _ => {
                        if let Ok((info, _)) = XfrmUsersaInfo::ref_from_prefix(payload) {
                            let family = info.family;
                            if family == AF_INET {
                                let saddr = info.saddr;
                                let daddr = info.id.daddr;
                                let spi = info.id.spi;
                                entries.push(SaEntry {
                                    src: saddr.to_v4(),
                                    dst: daddr.to_v4(),
                                    spi: Spi(u32::from_be(spi)),
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    async fn policy_list(&self) -> MeshguardResult<Vec<PolicyEntry>> {
        let sock = self.sock.lock().await;
        let seq = sock.next_seq();
        let msg = MessageBuilder::new(
            XFRM_MSG_GETPOLICY,
            NLM_F_REQUEST | NLM_F_DUMP,
            seq,
            sock.pid(),
        )
        .payload(XfrmUserpolicyInfo::default().as_bytes())
        .finish();
        sock.send(&msg).await?;

        let mut entries = Vec::new();
        loop {
            let data = sock.recv_msg().await?;
            for (msg_type, payload) in NetlinkMessages::new(&data) {
                match msg_type {
                    NLMSG_DONE => return Ok(entries),
                    NLMSG_ERROR => {
                        let errno = ack_errno(payload)?;
                        if errno != 0 {
                            return Err(MeshguardError::from_errno(errno));
                        }
                    }
                    _ => {
                        if let Some(entry) = parse_policy_entry(payload) {
                            entries.push(entry);
                        }
                    }
                }
            }
        }
    }

    async fn expiry_events(
        &self,
    ) -> MeshguardResult<mpsc::Receiver<MeshguardResult<ExpiryEvent>>> {
        let mut sock = NetlinkSocket::xfrm()?;
        sock.add_membership(XFRMNLGRP_EXPIRE)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            loop {
                let data = match sock.recv_msg().await {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for (msg_type, payload) in NetlinkMessages::new(&data) {
                    if msg_type != XFRM_MSG_EXPIRE {
                        continue;
                    }
                    if let Some(event) = parse_expire(payload) {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Parse a policy dump entry; foreign address families yield `None`.
fn parse_policy_entry(payload: &[u8]) -> Option<PolicyEntry> {
    let (info, _) = XfrmUserpolicyInfo::ref_from_prefix(payload).ok()?;
    let family = info.sel.family;
    if family != AF_INET {
        return None;
    }

    let saddr = info.sel.saddr;
    let daddr = info.sel.daddr;
    let mut entry = PolicyEntry {
        src: saddr.to_v4(),
        dst: daddr.to_v4(),
        mark: None,
        tmpl_spi: None,
    };

    let attr_start = std::mem::size_of::<XfrmUserpolicyInfo>();
    if payload.len() > attr_start {
        let mut input = &payload[attr_start..];
        while let Some((attr_type, attr_data)) = parse_nla(&mut input) {
            match attr_type {
                XFRMA_MARK => {
                    if let Ok((mark, _)) = XfrmMarkAbi::read_from_prefix(attr_data) {
                        entry.mark = Some(Mark {
                            value: mark.v,
                            mask: mark.m,
                        });
                    }
                }
                XFRMA_TMPL => {
                    if let Ok((tmpl, _)) = XfrmUserTmpl::ref_from_prefix(attr_data) {
                        let spi = tmpl.id.spi;
                        entry.tmpl_spi = Some(Spi(u32::from_be(spi)));
                    }
                }
                _ => {}
            }
        }
    }

    Some(entry)
}

/// Parse an expiry notification; foreign address families yield `None`.
fn parse_expire(payload: &[u8]) -> Option<ExpiryEvent> {
    let (expire, _) = XfrmUserExpire::ref_from_prefix(payload).ok()?;
    let family = expire.state.family;
    if family != AF_INET {
        return None;
    }
    let saddr = expire.state.saddr;
    let daddr = expire.state.id.daddr;
    let spi = expire.state.id.spi;
    Some(ExpiryEvent {
        spi: Spi(u32::from_be(spi)),
        src: saddr.to_v4(),
        dst: daddr.to_v4(),
        hard: expire.hard != 0,
    })
}
