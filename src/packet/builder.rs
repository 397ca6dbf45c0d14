// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Topology builders and the per-stream packet buffer.
//!
//! A stream's topology is classified once when the stream is created
//! ([`Topology::resolve`]). Each build then dispatches through a fixed table
//! to the matching builder, which resolves addresses, assembles a
//! [`HeaderChain`] and serializes it. Only the 16-byte trailer (and the
//! transport checksum/flags) change after that, see [`PacketBuffer::stamp`].
//!
//! Address precedence is the same everywhere: explicit stream setting, then
//! session or interface state, then the topology default. A destination that
//! cannot be resolved yet is a [`BuildError`]; the caller retries on the next
//! send opportunity.

use super::chain::{
    ChainError, Header, HeaderChain, TransportSpan, ETH_TYPE_QINQ, ETH_TYPE_VLAN, L2TP_UDP_PORT,
};
use super::checksum::{transport_checksum, IPPROTO_TCP, IPPROTO_UDP};
use super::header::{
    multicast_mac, write_trailer, Direction, HeaderScope, SubType, TestHeader, Timestamp,
    TRAILER_LEN,
};
use crate::collaborators::{
    AccessType, InterfaceDirectory, InterfaceRole, InterfaceView, SessionView,
};
use crate::config::StreamConfig;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4};
use thiserror::Error;

/// Local address used for the far end of relayed and tunneled sessions
pub const MOCK_IPV4_LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 10);
/// Link-local counterpart for relayed IPv6 sessions
pub const MOCK_IPV6_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

/// Smallest buffer reserved for any frame
const MIN_FRAME_CAPACITY: usize = 256;
/// Worst case link and tunnel overhead on top of the configured length
const MAX_TOPOLOGY_OVERHEAD: usize = 128;

pub fn frame_capacity(length: u16) -> usize {
    (usize::from(length) + MAX_TOPOLOGY_OVERHEAD).max(MIN_FRAME_CAPACITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    AccessTunneledUp = 0,
    AccessBridgedUp = 1,
    RelayTunneled = 2,
    RelayBridged = 3,
    NetworkDown = 4,
    NestedTunnelDown = 5,
}

impl Topology {
    /// Classify a stream from its session bindings and direction.
    ///
    /// Raw streams (no session) are always [`Topology::NetworkDown`].
    pub fn resolve(session: Option<&SessionView>, direction: Direction) -> Self {
        let Some(session) = session else {
            return Topology::NetworkDown;
        };
        match session.access_type {
            AccessType::Pppoe => {
                if session.tunnel.is_some() {
                    match direction {
                        Direction::Up => Topology::AccessTunneledUp,
                        Direction::Down => Topology::NestedTunnelDown,
                    }
                } else if session.relay.is_some() {
                    Topology::RelayTunneled
                } else {
                    match direction {
                        Direction::Up => Topology::AccessTunneledUp,
                        Direction::Down => Topology::NetworkDown,
                    }
                }
            }
            AccessType::Ipoe => {
                if session.relay.is_some() {
                    Topology::RelayBridged
                } else {
                    match direction {
                        Direction::Up => Topology::AccessBridgedUp,
                        Direction::Down => Topology::NetworkDown,
                    }
                }
            }
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Topology::AccessTunneledUp => "access-tunneled-up",
            Topology::AccessBridgedUp => "access-bridged-up",
            Topology::RelayTunneled => "relay-tunneled",
            Topology::RelayBridged => "relay-bridged",
            Topology::NetworkDown => "network-down",
            Topology::NestedTunnelDown => "nested-tunnel-down",
        }
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("session is missing")]
    MissingSession,
    #[error("interface {0} not found")]
    MissingInterface(String),
    #[error("session has no {0} binding")]
    MissingBinding(&'static str),
    #[error("no {0} address")]
    MissingAddress(&'static str),
    #[error("{sub_type} not supported by {topology}")]
    UnsupportedSubType { topology: Topology, sub_type: SubType },
    #[error("waiting for translated source address")]
    NatPending,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Everything a builder may consult.
pub struct BuildContext<'a> {
    pub config: &'a StreamConfig,
    pub flow_id: u64,
    pub sub_type: SubType,
    pub direction: Direction,
    pub session: Option<&'a SessionView>,
    pub interfaces: &'a dyn InterfaceDirectory,
    /// Interface the stream transmits on
    pub tx_interface: &'a str,
    /// Label from the path lookup, replaces `tx-label1`
    pub path_label: Option<u32>,
    /// Translated source seen by the upstream partner of a NAT stream
    pub nat_target: Option<SocketAddrV4>,
    pub has_reverse: bool,
    pub tcp_flags: u8,
}

impl BuildContext<'_> {
    fn session(&self) -> Result<&SessionView, BuildError> {
        self.session.ok_or(BuildError::MissingSession)
    }

    fn interface(&self, name: &str) -> Result<InterfaceView, BuildError> {
        self.interfaces
            .interface(name)
            .ok_or_else(|| BuildError::MissingInterface(name.to_string()))
    }

    /// Downstream ports mirror the upstream flow when both exist.
    fn ports(&self) -> (u16, u16) {
        let (src, dst) = (self.config.source_port, self.config.destination_port);
        if self.direction == Direction::Down && self.has_reverse {
            (dst, src)
        } else {
            (src, dst)
        }
    }

    fn transport(&self, src_port: u16, dst_port: u16) -> Header {
        if self.config.raw_tcp {
            Header::Tcp {
                src_port,
                dst_port,
                flags: self.tcp_flags,
            }
        } else {
            Header::Udp { src_port, dst_port }
        }
    }

    fn test_header(&self, scope: HeaderScope) -> TestHeader {
        TestHeader {
            sub_type: self.sub_type,
            direction: self.direction,
            tos: self.config.priority,
            session_id: self.session.map_or(0, |s| s.session_id),
            scope,
            flow_id: self.flow_id,
            seq: 0,
            timestamp: Timestamp::ZERO,
        }
    }

    fn session_scope(&self) -> HeaderScope {
        match self.session {
            Some(s) => HeaderScope::Unicast {
                ifindex: s.ifindex,
                outer_vlan: s.vlan.outer,
                inner_vlan: s.vlan.inner,
            },
            None => HeaderScope::Unicast {
                ifindex: 0,
                outer_vlan: 0,
                inner_vlan: 0,
            },
        }
    }

    fn ipv4(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Header {
        Header::Ipv4 {
            src,
            dst,
            tos: self.config.priority,
            ttl: self.config.ttl,
            dont_fragment: self.config.ipv4_df,
        }
    }

    fn ipv6(&self, src: Ipv6Addr, dst: Ipv6Addr) -> Header {
        Header::Ipv6 {
            src,
            dst,
            traffic_class: self.config.priority,
            hop_limit: self.config.ttl,
        }
    }

    fn network(&self, src: IpAddr, dst: IpAddr) -> Header {
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => self.ipv4(s, d),
            (IpAddr::V6(s), IpAddr::V6(d)) => self.ipv6(s, d),
            // Families never mix; builders resolve both ends per sub-type.
            (s, d) => self.ipv6(to_v6(s), to_v6(d)),
        }
    }

    /// Append network, transport and test headers, then serialize.
    fn finish(
        &self,
        mut chain: HeaderChain,
        addresses: FlowAddresses,
        scope: HeaderScope,
    ) -> Result<BuiltPacket, BuildError> {
        chain
            .push(self.network(addresses.src, addresses.dst))
            .push(self.transport(addresses.src_port, addresses.dst_port))
            .push(Header::Test {
                header: self.test_header(scope),
                padding: self.sub_type.padding(self.config.length),
            });
        let frame = chain.encode(frame_capacity(self.config.length))?;
        Ok(BuiltPacket {
            bytes: frame.bytes,
            transport: frame.transport,
            addresses,
        })
    }
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn session_ipv6(session: &SessionView, sub_type: SubType) -> Option<Ipv6Addr> {
    match sub_type {
        SubType::Ipv6pd => session.delegated_ipv6_address,
        _ => session.ipv6_address,
    }
}

fn push_vlans(chain: &mut HeaderChain, qinq: bool, tags: [u16; 3], priority: u8) {
    for (i, id) in tags.into_iter().enumerate() {
        if id == 0 {
            continue;
        }
        let tpid = if i == 0 && qinq {
            ETH_TYPE_QINQ
        } else {
            ETH_TYPE_VLAN
        };
        chain.push(Header::Vlan { tpid, id, priority });
    }
}

/// Resolved endpoints of a built packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowAddresses {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPacket {
    pub bytes: Vec<u8>,
    pub transport: Option<TransportSpan>,
    pub addresses: FlowAddresses,
}

impl BuiltPacket {
    pub fn trailer_offset(&self) -> usize {
        self.bytes.len().saturating_sub(TRAILER_LEN)
    }
}

type BuildFn = fn(&BuildContext<'_>) -> Result<BuiltPacket, BuildError>;

/// Indexed by `Topology as usize`
const BUILDERS: [BuildFn; 6] = [
    build_access_tunneled_up,
    build_access_bridged_up,
    build_relay_tunneled,
    build_relay_bridged,
    build_network_down,
    build_nested_tunnel_down,
];

pub fn build(topology: Topology, ctx: &BuildContext<'_>) -> Result<BuiltPacket, BuildError> {
    BUILDERS[topology as usize](ctx)
}

fn build_access_tunneled_up(ctx: &BuildContext<'_>) -> Result<BuiltPacket, BuildError> {
    build_access_up(ctx, true)
}

fn build_access_bridged_up(ctx: &BuildContext<'_>) -> Result<BuiltPacket, BuildError> {
    build_access_up(ctx, false)
}

fn build_access_up(ctx: &BuildContext<'_>, pppoe: bool) -> Result<BuiltPacket, BuildError> {
    let session = ctx.session()?;
    let config = ctx.config;

    // Looked up only when the destination falls back to it.
    let network = || -> Result<InterfaceView, BuildError> {
        match config
            .network_interface
            .as_deref()
            .or(session.network_interface.as_deref())
        {
            Some(name) => ctx.interface(name),
            None => ctx
                .interfaces
                .first(InterfaceRole::Network)
                .ok_or(BuildError::MissingBinding("network interface")),
        }
    };

    let (src, dst): (IpAddr, IpAddr) = match ctx.sub_type {
        SubType::Ipv4 => {
            let src = config
                .ipv4_access_src_address
                .or(session.ipv4_address)
                .ok_or(BuildError::MissingAddress("session ipv4"))?;
            let tunneled = pppoe && session.tunnel.is_some();
            let dst = match config.ipv4_destination_address {
                Some(dst) => dst,
                None if tunneled => MOCK_IPV4_LOCAL,
                None => match config.ipv4_network_address {
                    Some(dst) => dst,
                    None => network()?
                        .ipv4
                        .map(|p| p.address)
                        .ok_or(BuildError::MissingAddress("network ipv4"))?,
                },
            };
            (src.into(), dst.into())
        }
        SubType::Ipv6 | SubType::Ipv6pd => {
            let src = config
                .ipv6_access_src_address
                .or_else(|| session_ipv6(session, ctx.sub_type))
                .ok_or(BuildError::MissingAddress("session ipv6"))?;
            let dst = match config.ipv6_destination_address.or(config.ipv6_network_address) {
                Some(dst) => dst,
                None => network()?
                    .ipv6
                    .ok_or(BuildError::MissingAddress("network ipv6"))?,
            };
            (src.into(), dst.into())
        }
    };

    let mut chain = HeaderChain::new();
    chain.push(Header::Ethernet {
        dst: session.server_mac,
        src: session.client_mac,
    });
    let vlan = session.vlan;
    push_vlans(&mut chain, vlan.qinq, [vlan.outer, vlan.inner, vlan.third], config.vlan_priority);
    if pppoe {
        chain.push(Header::PppoeSession {
            session_id: session.pppoe_session_id,
        });
    }
    let (src_port, dst_port) = ctx.ports();
    let addresses = FlowAddresses {
        src,
        dst,
        src_port,
        dst_port,
    };
    ctx.finish(chain, addresses, ctx.session_scope())
}

fn build_relay_tunneled(ctx: &BuildContext<'_>) -> Result<BuiltPacket, BuildError> {
    build_relay(ctx, true)
}

fn build_relay_bridged(ctx: &BuildContext<'_>) -> Result<BuiltPacket, BuildError> {
    build_relay(ctx, false)
}

fn build_relay(ctx: &BuildContext<'_>, pppoe: bool) -> Result<BuiltPacket, BuildError> {
    let session = ctx.session()?;
    let relay = session
        .relay
        .as_ref()
        .ok_or(BuildError::MissingBinding("a10nsp relay"))?;
    let a10nsp = ctx.interface(&relay.interface)?;
    let config = ctx.config;
    let up = ctx.direction == Direction::Up;

    let (src, dst): (IpAddr, IpAddr) = match ctx.sub_type {
        SubType::Ipv4 => {
            let client = session
                .ipv4_address
                .ok_or(BuildError::MissingAddress("session ipv4"))?;
            let (src, mut dst) = if up {
                (client, MOCK_IPV4_LOCAL)
            } else {
                (MOCK_IPV4_LOCAL, client)
            };
            if let Some(explicit) = config.ipv4_destination_address {
                dst = explicit;
            }
            (src.into(), dst.into())
        }
        SubType::Ipv6 | SubType::Ipv6pd => {
            let client = session
                .link_local_ipv6_address
                .ok_or(BuildError::MissingAddress("session link-local ipv6"))?;
            let (src, mut dst) = if up {
                (client, MOCK_IPV6_LINK_LOCAL)
            } else {
                (MOCK_IPV6_LINK_LOCAL, client)
            };
            if let Some(explicit) = config.ipv6_destination_address {
                dst = explicit;
            }
            (src.into(), dst.into())
        }
    };

    let mut chain = HeaderChain::new();
    let (eth_dst, eth_src, qinq, outer) = if up {
        (session.server_mac, session.client_mac, session.vlan.qinq, session.vlan.outer)
    } else {
        (session.client_mac, session.server_mac, a10nsp.qinq, relay.s_vlan)
    };
    chain.push(Header::Ethernet {
        dst: eth_dst,
        src: eth_src,
    });
    push_vlans(
        &mut chain,
        qinq,
        [outer, session.vlan.inner, session.vlan.third],
        config.vlan_priority,
    );
    if pppoe {
        chain.push(Header::PppoeSession {
            session_id: session.pppoe_session_id,
        });
    }
    let (src_port, dst_port) = ctx.ports();
    let addresses = FlowAddresses {
        src,
        dst,
        src_port,
        dst_port,
    };
    ctx.finish(chain, addresses, ctx.session_scope())
}

fn build_network_down(ctx: &BuildContext<'_>) -> Result<BuiltPacket, BuildError> {
    let network = ctx.interface(ctx.tx_interface)?;
    let config = ctx.config;
    let (src_port, mut dst_port) = ctx.ports();
    let mut eth_dst = network.gateway_mac;

    let (src, dst): (IpAddr, IpAddr) = match ctx.sub_type {
        SubType::Ipv4 => {
            let src = config
                .ipv4_network_address
                .or(network.ipv4.map(|p| p.address))
                .ok_or(BuildError::MissingAddress("network ipv4"))?;
            let dst = if config.nat && ctx.has_reverse {
                let target = ctx.nat_target.ok_or(BuildError::NatPending)?;
                dst_port = target.port();
                *target.ip()
            } else if let Some(dst) = config.ipv4_destination_address {
                dst
            } else if let Some(client) = ctx.session.and_then(|s| s.ipv4_address) {
                // Directly attached IPoE clients are reached without the gateway.
                if let Some(session) = ctx.session {
                    if session.access_type == AccessType::Ipoe
                        && network.ipv4.is_some_and(|p| p.contains(client))
                    {
                        eth_dst = session.client_mac;
                    }
                }
                client
            } else {
                return Err(BuildError::MissingAddress("destination ipv4"));
            };
            if dst.is_multicast() {
                eth_dst = multicast_mac(dst);
            }
            (src.into(), dst.into())
        }
        SubType::Ipv6 | SubType::Ipv6pd => {
            let src = config
                .ipv6_network_address
                .or(network.ipv6)
                .ok_or(BuildError::MissingAddress("network ipv6"))?;
            let dst = config
                .ipv6_destination_address
                .or_else(|| ctx.session.and_then(|s| session_ipv6(s, ctx.sub_type)))
                .ok_or(BuildError::MissingAddress("destination ipv6"))?;
            (src.into(), dst.into())
        }
    };

    let mut chain = HeaderChain::new();
    chain.push(Header::Ethernet {
        dst: eth_dst,
        src: network.mac,
    });
    push_vlans(&mut chain, false, [network.vlan, 0, 0], config.vlan_priority);
    let label1 = ctx
        .path_label
        .or((config.tx_label1 != 0).then_some(config.tx_label1));
    if let Some(label) = label1 {
        chain.push(Header::Mpls {
            label,
            exp: config.tx_label1_exp,
            ttl: config.tx_label1_ttl,
        });
        if config.tx_label2 != 0 {
            chain.push(Header::Mpls {
                label: config.tx_label2,
                exp: config.tx_label2_exp,
                ttl: config.tx_label2_ttl,
            });
        }
    }

    let scope = match (src, dst) {
        (IpAddr::V4(source), IpAddr::V4(group)) if group.is_multicast() => {
            HeaderScope::Multicast { source, group }
        }
        _ => ctx.session_scope(),
    };
    let addresses = FlowAddresses {
        src,
        dst,
        src_port,
        dst_port,
    };
    ctx.finish(chain, addresses, scope)
}

fn build_nested_tunnel_down(ctx: &BuildContext<'_>) -> Result<BuiltPacket, BuildError> {
    if ctx.sub_type != SubType::Ipv4 {
        return Err(BuildError::UnsupportedSubType {
            topology: Topology::NestedTunnelDown,
            sub_type: ctx.sub_type,
        });
    }
    let session = ctx.session()?;
    let tunnel = session
        .tunnel
        .as_ref()
        .ok_or(BuildError::MissingBinding("l2tp tunnel"))?;
    let network = ctx.interface(&tunnel.network_interface)?;
    let client = session
        .ipv4_address
        .ok_or(BuildError::MissingAddress("session ipv4"))?;
    let config = ctx.config;

    let mut chain = HeaderChain::new();
    chain.push(Header::Ethernet {
        dst: network.gateway_mac,
        src: network.mac,
    });
    push_vlans(&mut chain, false, [network.vlan, 0, 0], config.vlan_priority);
    chain
        .push(Header::Ipv4 {
            src: tunnel.server_ip,
            dst: tunnel.peer_ip,
            tos: config.priority,
            ttl: config.ttl,
            dont_fragment: false,
        })
        .push(Header::Udp {
            src_port: L2TP_UDP_PORT,
            dst_port: L2TP_UDP_PORT,
        })
        .push(Header::L2tpData {
            tunnel_id: tunnel.peer_tunnel_id,
            session_id: tunnel.peer_session_id,
            with_length: tunnel.data_with_length,
            with_offset: tunnel.data_with_offset,
        });
    let (src_port, dst_port) = ctx.ports();
    let addresses = FlowAddresses {
        src: MOCK_IPV4_LOCAL.into(),
        dst: client.into(),
        src_port,
        dst_port,
    };
    ctx.finish(chain, addresses, ctx.session_scope())
}

/// Owned frame of one stream, rebuilt lazily after invalidation.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    packet: Option<BuiltPacket>,
}

impl PacketBuffer {
    pub fn is_built(&self) -> bool {
        self.packet.is_some()
    }

    pub fn invalidate(&mut self) {
        self.packet = None;
    }

    pub fn install(&mut self, packet: BuiltPacket) {
        self.packet = Some(packet);
    }

    pub fn packet(&self) -> Option<&BuiltPacket> {
        self.packet.as_ref()
    }

    /// Stamp the trailer and refresh the transport header for one send.
    ///
    /// TCP flags and checksum are always refreshed; the UDP checksum only
    /// when `udp_checksum` is set (it stays zero otherwise).
    pub fn stamp(
        &mut self,
        seq: u64,
        timestamp: Timestamp,
        tcp_flags: u8,
        udp_checksum: bool,
    ) -> Option<&[u8]> {
        let packet = self.packet.as_mut()?;
        let at = packet.trailer_offset();
        write_trailer(&mut packet.bytes[at..], seq, timestamp);

        if let Some(span) = packet.transport {
            let bytes = &mut packet.bytes;
            let off = span.offset;
            match span.protocol {
                IPPROTO_TCP => {
                    bytes[off + 13] = tcp_flags & 0x3f;
                    bytes[off + 16..off + 18].fill(0);
                    let sum = transport_checksum(&span.pseudo, IPPROTO_TCP, &bytes[off..]);
                    bytes[off + 16..off + 18].copy_from_slice(&sum.to_be_bytes());
                }
                IPPROTO_UDP if udp_checksum => {
                    bytes[off + 6..off + 8].fill(0);
                    let sum = transport_checksum(&span.pseudo, IPPROTO_UDP, &bytes[off..]);
                    bytes[off + 6..off + 8].copy_from_slice(&sum.to_be_bytes());
                }
                _ => {}
            }
        }
        Some(&packet.bytes)
    }
}
