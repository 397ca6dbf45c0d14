// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Interfaces to the systems the engine depends on but does not own.
//!
//! Session state machines, interface management, the label distribution
//! database and raw packet I/O all live elsewhere. The engine only sees
//! them through the traits below and the snapshot types they return, so
//! every lookup hands back an owned view rather than a reference into
//! foreign state.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::packet::header::SubType;

pub type MacAddr = [u8; 6];

pub fn format_mac(mac: &MacAddr) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse `aa:bb:cc:dd:ee:ff`
pub fn parse_mac(text: &str) -> Option<MacAddr> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    Disabled = 0,
    #[default]
    Passive = 1,
    Active = 2,
}

/// Shared switch deciding whether a set of streams may transmit.
#[derive(Debug, Default)]
pub struct EndpointGate(AtomicU8);

impl EndpointGate {
    pub fn new(state: GateState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn shared(state: GateState) -> Arc<Self> {
        Arc::new(Self::new(state))
    }

    pub fn state(&self) -> GateState {
        match self.0.load(Ordering::Relaxed) {
            0 => GateState::Disabled,
            2 => GateState::Active,
            _ => GateState::Passive,
        }
    }

    pub fn set(&self, state: GateState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == GateState::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Pppoe,
    Ipoe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VlanStack {
    pub qinq: bool,
    pub outer: u16,
    pub inner: u16,
    pub third: u16,
}

/// Per-family session traffic gates owned by the session
#[derive(Debug, Clone, Default)]
pub struct SessionEndpoints {
    pub ipv4: Arc<EndpointGate>,
    pub ipv6: Arc<EndpointGate>,
    pub ipv6pd: Arc<EndpointGate>,
}

impl SessionEndpoints {
    pub fn for_family(&self, sub_type: SubType) -> &Arc<EndpointGate> {
        match sub_type {
            SubType::Ipv4 => &self.ipv4,
            SubType::Ipv6 => &self.ipv6,
            SubType::Ipv6pd => &self.ipv6pd,
        }
    }
}

/// L2TP tunnel carrying a PPPoE session towards the network side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelBinding {
    pub network_interface: String,
    pub tunnel_id: u16,
    pub server_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub peer_tunnel_id: u16,
    pub peer_session_id: u16,
    #[serde(default)]
    pub data_with_length: bool,
    #[serde(default)]
    pub data_with_offset: bool,
}

/// Session relayed through an A10NSP handover interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayBinding {
    pub interface: String,
    pub s_vlan: u16,
}

#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: u32,
    pub access_type: AccessType,
    pub state: SessionState,
    pub access_interface: String,
    pub ifindex: u32,
    pub client_mac: MacAddr,
    pub server_mac: MacAddr,
    pub vlan: VlanStack,
    pub pppoe_session_id: u16,
    pub ipv4_address: Option<Ipv4Addr>,
    pub ipv6_address: Option<Ipv6Addr>,
    pub delegated_ipv6_address: Option<Ipv6Addr>,
    /// Used by relayed IPv6 flows
    pub link_local_ipv6_address: Option<Ipv6Addr>,
    pub stream_group_id: u16,
    /// Interfaces named by the session's access configuration
    pub network_interface: Option<String>,
    pub a10nsp_interface: Option<String>,
    pub relay: Option<RelayBinding>,
    pub tunnel: Option<TunnelBinding>,
    pub endpoints: SessionEndpoints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceRole {
    Access,
    Network,
    A10nsp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Prefix {
    pub address: Ipv4Addr,
    pub len: u8,
}

impl Ipv4Prefix {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.len == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(self.len.min(32)));
        (u32::from(self.address) & mask) == (u32::from(addr) & mask)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagView {
    pub members: Vec<String>,
    /// Member selection is driven by LACP
    pub lacp: bool,
}

#[derive(Debug, Clone)]
pub struct InterfaceView {
    pub name: String,
    pub role: InterfaceRole,
    pub ifindex: u32,
    pub mac: MacAddr,
    pub gateway_mac: MacAddr,
    pub vlan: u16,
    pub qinq: bool,
    pub ipv4: Option<Ipv4Prefix>,
    pub ipv6: Option<Ipv6Addr>,
    pub ldp_adjacency: bool,
    /// Output channels available for transmission, at least one
    pub tx_channels: usize,
    pub lag: Option<LagView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathEntry {
    pub label: u32,
    pub version: u64,
    pub active: bool,
}

pub trait SessionDirectory: Send + Sync {
    fn session(&self, session_id: u32) -> Option<SessionView>;
    /// Topology version of the session; any change invalidates built packets
    fn session_version(&self, session_id: u32) -> Option<u64>;
}

pub trait InterfaceDirectory: Send + Sync {
    fn interface(&self, name: &str) -> Option<InterfaceView>;
    /// First configured interface of the given role
    fn first(&self, role: InterfaceRole) -> Option<InterfaceView>;
    /// Every interface in configuration order
    fn all(&self) -> Vec<InterfaceView>;
}

/// Label lookup (LDP database) for network-side streams
pub trait PathLookup: Send + Sync {
    fn lookup(&self, interface: &str, destination: IpAddr) -> Option<PathEntry>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EgressError {
    #[error("output queue of {0} is full")]
    QueueFull(String),
    #[error("interface {0} is down")]
    InterfaceDown(String),
    #[error("send failed on {interface}: {reason}")]
    Io { interface: String, reason: String },
}

/// Raw frame transmission
pub trait Egress {
    fn send(&mut self, interface: &str, frame: &[u8]) -> Result<(), EgressError>;
}

/// Handles to every external collaborator the engine consults
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<dyn SessionDirectory>,
    pub interfaces: Arc<dyn InterfaceDirectory>,
    pub paths: Arc<dyn PathLookup>,
}
