// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Runtime state of a single flow.
//!
//! A [`Stream`] is shared between the channel that transmits it, the
//! receive path and the periodic rollup. Counters and flags are individual
//! atomics; nothing here promises a consistent multi-field snapshot. The
//! transmit-only state (packet buffer, sequence, pacing) is owned by the
//! scheduler slot, not by the stream.

pub mod group;
pub mod registry;
pub mod verify;

pub use crate::packet::header::{Direction, StreamKind, SubType};
pub use group::{GroupSet, StreamGroup};
pub use registry::StreamRegistry;
pub use verify::{MacCheck, RxPacket, RxVerdict};

use serde::Serialize;
use std::net::{IpAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::collaborators::EndpointGate;
use crate::config::StreamConfig;
use crate::packet::builder::{FlowAddresses, Topology};
use crate::packet::chain::TCP_FLAG_ACK;
use crate::packet::parser::MplsLabel;
use crate::stats::{Delta, FlowScope, RateEstimator, TrafficStats};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct StreamCounters {
    pub tx_packets: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_loss: AtomicU64,
    pub rx_wrong_order: AtomicU64,
    pub rx_wrong_session: AtomicU64,
    pub rx_interface_changes: AtomicU64,
}

/// Receive-side state, written only by the receive path and reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RxState {
    pub first_seq: u64,
    pub last_seq: u64,
    pub first_epoch: u32,
    pub last_epoch: u32,
    pub len: usize,
    pub tos: u8,
    pub ttl: u8,
    pub outer_vlan_pbit: u8,
    pub inner_vlan_pbit: u8,
    pub mpls: [Option<MplsLabel>; 2],
    pub min_delay_us: u64,
    pub max_delay_us: u64,
    pub interface: Option<String>,
    pub interface_changed_epoch: u32,
}

#[derive(Debug, Default)]
struct SyncState {
    tx_packets: u64,
    rx_packets: u64,
    loss: u64,
    wrong_session: u64,
    tx_rate: RateEstimator,
    rx_rate: RateEstimator,
}

/// IPv4 address and port packed into one word: bit 48 marks it set, the
/// address sits in bits 16..48 and the port in the low 16 bits.
struct NatSource;

impl NatSource {
    const UNSET: u64 = 0;
    const SET: u64 = 1 << 48;

    fn encode(source: SocketAddrV4) -> u64 {
        Self::SET | (u64::from(u32::from(*source.ip())) << 16) | u64::from(source.port())
    }

    fn decode(word: u64) -> Option<SocketAddrV4> {
        if word & Self::SET == 0 {
            return None;
        }
        let ip = std::net::Ipv4Addr::from((word >> 16) as u32);
        Some(SocketAddrV4::new(ip, word as u16))
    }
}

/// Counter values at the last reset, subtracted in reports
#[derive(Debug, Default)]
struct ResetBaseline {
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    loss: AtomicU64,
}

/// Everything needed to create a stream
pub struct StreamSpec {
    pub flow_id: u64,
    pub config: Arc<StreamConfig>,
    pub kind: StreamKind,
    pub direction: Direction,
    pub topology: Topology,
    pub session_id: Option<u32>,
    pub tunnel_id: Option<u16>,
    pub tx_interface: String,
    pub endpoint: Arc<EndpointGate>,
    pub enabled: bool,
    pub ldp_lookup: bool,
}

pub struct Stream {
    pub flow_id: u64,
    pub config: Arc<StreamConfig>,
    pub kind: StreamKind,
    pub sub_type: SubType,
    pub direction: Direction,
    pub topology: Topology,
    pub session_id: Option<u32>,
    pub tunnel_id: Option<u16>,
    pub session_traffic: bool,
    pub tx_interface: String,
    pub pps: f64,
    pub nat: bool,
    pub ldp_lookup: bool,
    pub counters: StreamCounters,
    reverse: Option<u64>,
    endpoint: Arc<EndpointGate>,
    enabled: AtomicBool,
    verified: AtomicBool,
    reset_pending: AtomicBool,
    setup: AtomicBool,
    tcp_flags: AtomicU8,
    tx_len: AtomicU64,
    tx_first_epoch: AtomicU32,
    lag: AtomicBool,
    /// Translated source seen on an upstream NAT flow, see [`NatSource`]
    nat_source: AtomicU64,
    baseline: ResetBaseline,
    addresses: Mutex<Option<FlowAddresses>>,
    pub(crate) rx: Mutex<RxState>,
    sync: Mutex<SyncState>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("flow_id", &self.flow_id)
            .field("name", &self.config.name)
            .field("direction", &self.direction)
            .field("topology", &self.topology)
            .field("tx_interface", &self.tx_interface)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub fn new(spec: StreamSpec) -> Self {
        let config = spec.config;
        Self {
            flow_id: spec.flow_id,
            kind: spec.kind,
            sub_type: config.sub_type,
            direction: spec.direction,
            topology: spec.topology,
            session_id: spec.session_id,
            tunnel_id: spec.tunnel_id,
            session_traffic: config.session_traffic,
            tx_interface: spec.tx_interface,
            pps: config.pps_for(spec.direction),
            nat: config.nat && config.sub_type == SubType::Ipv4,
            ldp_lookup: spec.ldp_lookup,
            counters: StreamCounters::default(),
            reverse: None,
            endpoint: spec.endpoint,
            enabled: AtomicBool::new(spec.enabled),
            verified: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            setup: AtomicBool::new(config.setup_interval > 0),
            tcp_flags: AtomicU8::new(TCP_FLAG_ACK),
            tx_len: AtomicU64::new(0),
            tx_first_epoch: AtomicU32::new(0),
            lag: AtomicBool::new(false),
            nat_source: AtomicU64::new(NatSource::UNSET),
            baseline: ResetBaseline::default(),
            addresses: Mutex::new(None),
            rx: Mutex::new(RxState::default()),
            sync: Mutex::new(SyncState::default()),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Pair with the opposite direction; only before the stream is shared.
    pub fn set_reverse(&mut self, flow_id: u64) {
        self.reverse = Some(flow_id);
    }

    pub fn reverse(&self) -> Option<u64> {
        self.reverse
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn endpoint(&self) -> &EndpointGate {
        &self.endpoint
    }

    pub fn is_active(&self) -> bool {
        self.endpoint.is_active()
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    /// Flip to verified; true only for the caller that performed the flip.
    pub(crate) fn mark_verified(&self) -> bool {
        self.verified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn in_setup(&self) -> bool {
        self.setup.load(Ordering::Relaxed)
    }

    pub(crate) fn set_setup(&self, setup: bool) {
        self.setup.store(setup, Ordering::Relaxed);
    }

    pub fn tcp_flags(&self) -> u8 {
        self.tcp_flags.load(Ordering::Relaxed)
    }

    pub fn set_tcp_flags(&self, flags: u8) {
        self.tcp_flags.store(flags, Ordering::Relaxed);
    }

    pub fn is_lag(&self) -> bool {
        self.lag.load(Ordering::Relaxed)
    }

    pub(crate) fn set_lag(&self) {
        self.lag.store(true, Ordering::Relaxed);
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    pub(crate) fn take_reset(&self) -> bool {
        self.reset_pending.swap(false, Ordering::AcqRel)
    }

    pub fn tx_len(&self) -> u64 {
        self.tx_len.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tx_len(&self, len: usize) {
        self.tx_len.store(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_tx_first_epoch(&self, epoch: u32) {
        self.tx_first_epoch.store(epoch, Ordering::Relaxed);
    }

    pub fn addresses(&self) -> Option<FlowAddresses> {
        *lock(&self.addresses)
    }

    pub(crate) fn set_addresses(&self, addresses: FlowAddresses) {
        *lock(&self.addresses) = Some(addresses);
    }

    pub fn rx_state(&self) -> RxState {
        lock(&self.rx).clone()
    }

    /// Lock-free, read by the paired downstream flow on every send.
    pub fn nat_source(&self) -> Option<SocketAddrV4> {
        NatSource::decode(self.nat_source.load(Ordering::Acquire))
    }

    pub(crate) fn set_nat_source(&self, source: SocketAddrV4) {
        self.nat_source
            .store(NatSource::encode(source), Ordering::Release);
    }

    pub fn tx_packets(&self) -> u64 {
        self.counters
            .tx_packets
            .load(Ordering::Relaxed)
            .saturating_sub(self.baseline.tx_packets.load(Ordering::Relaxed))
    }

    pub fn rx_packets(&self) -> u64 {
        self.counters
            .rx_packets
            .load(Ordering::Relaxed)
            .saturating_sub(self.baseline.rx_packets.load(Ordering::Relaxed))
    }

    pub fn rx_loss(&self) -> u64 {
        self.counters
            .rx_loss
            .load(Ordering::Relaxed)
            .saturating_sub(self.baseline.loss.load(Ordering::Relaxed))
    }

    /// Rebaseline counters and clear receive state.
    ///
    /// The transmit side re-initializes on its next due cycle.
    pub fn reset(&self) {
        let c = &self.counters;
        self.baseline
            .tx_packets
            .store(c.tx_packets.load(Ordering::Relaxed), Ordering::Relaxed);
        self.baseline
            .rx_packets
            .store(c.rx_packets.load(Ordering::Relaxed), Ordering::Relaxed);
        self.baseline
            .loss
            .store(c.rx_loss.load(Ordering::Relaxed), Ordering::Relaxed);
        {
            let mut rx = lock(&self.rx);
            let interface = rx.interface.take();
            let changed = rx.interface_changed_epoch;
            *rx = RxState {
                interface,
                interface_changed_epoch: changed,
                ..RxState::default()
            };
        }
        {
            let mut sync = lock(&self.sync);
            sync.tx_rate.reset_max();
            sync.rx_rate.reset_max();
        }
        self.nat_source.store(NatSource::UNSET, Ordering::Release);
        self.reset_pending.store(true, Ordering::Release);
        self.verified.store(false, Ordering::Release);
    }

    /// Fold counter deltas since the previous rollup into `stats`.
    pub fn rollup(&self, stats: &TrafficStats, rate_calc: bool) {
        let c = &self.counters;
        let mut sync = lock(&self.sync);
        let rate = rate_calc && self.pps >= 1.0;

        let tx = c.tx_packets.load(Ordering::Relaxed);
        let delta = tx.saturating_sub(sync.tx_packets);
        if delta > 0 {
            sync.tx_packets = tx;
            stats.record_tx(
                self.scope(&self.tx_interface),
                Delta {
                    packets: delta,
                    bytes: delta * self.tx_len(),
                    loss: 0,
                },
            );
        }
        if rate {
            sync.tx_rate.update(tx);
        }
        if self.kind == StreamKind::Multicast {
            return;
        }

        let rx = c.rx_packets.load(Ordering::Relaxed);
        let delta = rx.saturating_sub(sync.rx_packets);
        if delta > 0 {
            sync.rx_packets = rx;
            let loss = c.rx_loss.load(Ordering::Relaxed);
            let loss_delta = loss.saturating_sub(sync.loss);
            sync.loss = loss;
            let (len, interface) = {
                let state = lock(&self.rx);
                (state.len as u64, state.interface.clone())
            };
            if let Some(interface) = interface {
                stats.record_rx(
                    self.scope(&interface),
                    Delta {
                        packets: delta,
                        bytes: delta * len,
                        loss: loss_delta,
                    },
                );
                let wrong = c.rx_wrong_session.load(Ordering::Relaxed);
                stats.record_wrong_session(
                    &interface,
                    self.sub_type,
                    wrong.saturating_sub(sync.wrong_session),
                );
                sync.wrong_session = wrong;
            }
        }
        if rate {
            sync.rx_rate.update(rx);
        }
    }

    fn scope<'a>(&self, interface: &'a str) -> FlowScope<'a> {
        FlowScope {
            interface,
            session_id: self.session_id,
            tunnel_id: self.tunnel_id,
            sub_type: self.sub_type,
            session_traffic: self.session_traffic,
            multicast: self.kind == StreamKind::Multicast,
        }
    }

    /// Current (tx, rx) rate estimators
    pub fn rates(&self) -> (RateEstimator, RateEstimator) {
        let sync = lock(&self.sync);
        (sync.tx_rate.clone(), sync.rx_rate.clone())
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            flow_id: self.flow_id,
            name: self.config.name.clone(),
            kind: self.kind.as_str(),
            sub_type: self.sub_type.as_str(),
            direction: self.direction.as_str(),
            enabled: self.is_enabled(),
            active: self.is_active(),
            verified: self.is_verified(),
            interface: self.tx_interface.clone(),
            session_id: self.session_id,
            session_traffic: self.session_id.map(|_| self.session_traffic),
        }
    }

    /// Detailed report; `nat_target` is the reverse flow's observed source.
    pub fn info(&self, nat_target: Option<SocketAddrV4>, debug: bool) -> StreamInfo {
        let (tx_rate, rx_rate) = self.rates();
        let tx_len = self.tx_len();
        let tx_packets = self.tx_packets();

        let (mut src_port, mut dst_port) = (self.config.source_port, self.config.destination_port);
        if self.direction == Direction::Down && self.reverse.is_some() {
            std::mem::swap(&mut src_port, &mut dst_port);
        }
        let addresses = self.addresses();
        let source_address = addresses.map(|a| a.src);
        let mut destination_address = addresses.map(|a| a.dst);
        if self.nat {
            if let Some(target) = nat_target {
                destination_address = Some(IpAddr::V4(*target.ip()));
                dst_port = target.port();
            }
        }

        let rx = (self.kind == StreamKind::Unicast).then(|| {
            let state = self.rx_state();
            let rx_len = state.len as u64;
            let rx_packets = self.rx_packets();
            let changes = self.counters.rx_interface_changes.load(Ordering::Relaxed);
            RxInfo {
                rx_interface: state.interface.clone(),
                rx_first_seq: state.first_seq,
                rx_last_seq: state.last_seq,
                rx_tos_tc: state.tos,
                rx_ttl: state.ttl,
                rx_outer_vlan_pbit: state.outer_vlan_pbit,
                rx_inner_vlan_pbit: state.inner_vlan_pbit,
                rx_len,
                rx_packets,
                rx_bytes: rx_packets * rx_len,
                rx_loss: self.rx_loss(),
                rx_wrong_order: self.counters.rx_wrong_order.load(Ordering::Relaxed),
                rx_delay_us_min: state.min_delay_us,
                rx_delay_us_max: state.max_delay_us,
                rx_pps: rx_rate.avg,
                rx_pps_max: rx_rate.avg_max,
                rx_bps_l2: rx_rate.avg * rx_len * 8,
                rx_bps_l3: rx_rate.avg * u64::from(self.config.length) * 8,
                rx_mbps_l2: (rx_rate.avg * rx_len * 8) as f64 / 1_000_000.0,
                rx_mbps_l3: (rx_rate.avg * u64::from(self.config.length) * 8) as f64 / 1_000_000.0,
                rx_first_epoch: state.first_epoch,
                rx_last_epoch: state.last_epoch,
                rx_interface_changes: (changes > 0).then_some(changes),
                rx_interface_changed_epoch: (changes > 0).then_some(state.interface_changed_epoch),
                rx_mpls1_expected: (self.config.rx_label1 != 0).then_some(self.config.rx_label1),
                rx_mpls1: state.mpls[0].map(MplsInfo::from),
                rx_mpls2_expected: (self.config.rx_label2 != 0).then_some(self.config.rx_label2),
                rx_mpls2: state.mpls[1].map(MplsInfo::from),
                rx_source_ip: self.nat_source().map(|s| *s.ip()),
                rx_source_port: self.nat_source().map(|s| s.port()),
                rx_wrong_session: self
                    .session_id
                    .map(|_| self.counters.rx_wrong_session.load(Ordering::Relaxed)),
            }
        });

        StreamInfo {
            flow_id: self.flow_id,
            name: self.config.name.clone(),
            kind: self.kind.as_str(),
            sub_type: self.sub_type.as_str(),
            direction: self.direction.as_str(),
            topology: self.topology.as_str(),
            enabled: self.is_enabled(),
            active: self.is_active(),
            verified: self.is_verified(),
            source_address,
            source_port: src_port,
            destination_address,
            destination_port: dst_port,
            protocol: if self.config.raw_tcp { "tcp" } else { "udp" },
            tx_interface: self.tx_interface.clone(),
            tx_len,
            tx_packets,
            tx_bytes: tx_packets * tx_len,
            tx_pps: tx_rate.avg,
            tx_pps_max: tx_rate.avg_max,
            tx_bps_l2: tx_rate.avg * tx_len * 8,
            tx_mbps_l2: (tx_rate.avg * tx_len * 8) as f64 / 1_000_000.0,
            tx_first_epoch: self.tx_first_epoch.load(Ordering::Relaxed),
            session_id: self.session_id,
            session_traffic: self.session_id.map(|_| self.session_traffic),
            reverse_flow_id: self.reverse,
            rx,
            debug: debug.then(|| StreamDebug {
                nat: self.nat,
                reset: self.reset_pending(),
                lag: self.is_lag(),
                setup: self.in_setup(),
                tx_pps_config: self.pps,
                tx_packets_real: self.counters.tx_packets.load(Ordering::Relaxed),
                tcp_flags: self.tcp_flags(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamSummary {
    pub flow_id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sub_type: &'static str,
    pub direction: &'static str,
    pub enabled: bool,
    pub active: bool,
    pub verified: bool,
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_traffic: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MplsInfo {
    pub label: u32,
    pub exp: u8,
    pub ttl: u8,
}

impl From<MplsLabel> for MplsInfo {
    fn from(label: MplsLabel) -> Self {
        Self {
            label: label.label,
            exp: label.exp,
            ttl: label.ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RxInfo {
    pub rx_interface: Option<String>,
    pub rx_first_seq: u64,
    pub rx_last_seq: u64,
    pub rx_tos_tc: u8,
    pub rx_ttl: u8,
    pub rx_outer_vlan_pbit: u8,
    pub rx_inner_vlan_pbit: u8,
    pub rx_len: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_loss: u64,
    pub rx_wrong_order: u64,
    pub rx_delay_us_min: u64,
    pub rx_delay_us_max: u64,
    pub rx_pps: u64,
    pub rx_pps_max: u64,
    pub rx_bps_l2: u64,
    pub rx_bps_l3: u64,
    pub rx_mbps_l2: f64,
    pub rx_mbps_l3: f64,
    pub rx_first_epoch: u32,
    pub rx_last_epoch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_interface_changes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_interface_changed_epoch: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_mpls1_expected: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_mpls1: Option<MplsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_mpls2_expected: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_mpls2: Option<MplsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_source_ip: Option<std::net::Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_source_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_wrong_session: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamDebug {
    pub nat: bool,
    pub reset: bool,
    pub lag: bool,
    pub setup: bool,
    pub tx_pps_config: f64,
    pub tx_packets_real: u64,
    pub tcp_flags: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamInfo {
    pub flow_id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sub_type: &'static str,
    pub direction: &'static str,
    pub topology: &'static str,
    pub enabled: bool,
    pub active: bool,
    pub verified: bool,
    pub source_address: Option<IpAddr>,
    pub source_port: u16,
    pub destination_address: Option<IpAddr>,
    pub destination_port: u16,
    pub protocol: &'static str,
    pub tx_interface: String,
    pub tx_len: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_pps: u64,
    pub tx_pps_max: u64,
    pub tx_bps_l2: u64,
    pub tx_mbps_l2: f64,
    pub tx_first_epoch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_traffic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_flow_id: Option<u64>,
    #[serde(flatten)]
    pub rx: Option<RxInfo>,
    #[serde(flatten)]
    pub debug: Option<StreamDebug>,
}
