// SPDX-License-Identifier: Apache-2.0 OR MIT
//! In-memory implementation of the collaborator traits.
//!
//! `StaticDirectory` is loaded from the `topology` section of the config
//! file and backs the binary's `plan`/`simulate` commands and the tests.
//! Mutators bump the session topology version exactly like a live session
//! manager would, so cached frames are rebuilt.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::collaborators::{
    parse_mac, AccessType, Collaborators, EndpointGate, GateState, InterfaceDirectory,
    InterfaceRole, InterfaceView, Ipv4Prefix, LagView, MacAddr, PathEntry, PathLookup,
    RelayBinding, SessionDirectory, SessionEndpoints, SessionState, SessionView, TunnelBinding,
    VlanStack,
};
use crate::config::ConfigError;
use crate::validation;

fn default_channels() -> usize {
    1
}
fn default_prefix_len() -> u8 {
    24
}
fn default_access_type() -> AccessType {
    AccessType::Ipoe
}
fn default_state() -> SessionState {
    SessionState::Established
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct TopologyConfig {
    pub interfaces: Vec<InterfaceSpec>,
    pub sessions: Vec<SessionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceSpec {
    pub name: String,
    pub role: InterfaceRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_mac: Option<String>,
    #[serde(default)]
    pub vlan: u16,
    #[serde(default)]
    pub qinq: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default = "default_prefix_len")]
    pub ipv4_prefix_len: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default)]
    pub ldp_adjacency: bool,
    #[serde(default = "default_channels")]
    pub tx_channels: usize,
    /// Makes this a link aggregation over the named interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lag_members: Vec<String>,
    #[serde(default)]
    pub lacp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SessionSpec {
    pub session_id: u32,
    #[serde(default = "default_access_type")]
    pub access_type: AccessType,
    #[serde(default = "default_state")]
    pub state: SessionState,
    pub access_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_mac: Option<String>,
    #[serde(default)]
    pub vlan: VlanStack,
    #[serde(default)]
    pub pppoe_session_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegated_ipv6_address: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_local_ipv6_address: Option<Ipv6Addr>,
    #[serde(default)]
    pub stream_group_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a10nsp_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<RelayBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelBinding>,
}

impl TopologyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for spec in &self.interfaces {
            validation::validate_interface_name(&spec.name).map_err(|reason| {
                ConfigError::InvalidInterfaceName {
                    name: spec.name.clone(),
                    reason,
                }
            })?;
            if !names.insert(spec.name.as_str()) {
                return Err(ConfigError::Topology(format!(
                    "duplicate interface '{}'",
                    spec.name
                )));
            }
            for mac in [&spec.mac, &spec.gateway_mac].into_iter().flatten() {
                if parse_mac(mac).is_none() {
                    return Err(ConfigError::Topology(format!(
                        "interface '{}' has invalid mac '{mac}'",
                        spec.name
                    )));
                }
            }
            if spec.tx_channels == 0 {
                return Err(ConfigError::Topology(format!(
                    "interface '{}' needs at least one tx channel",
                    spec.name
                )));
            }
            if spec.ipv4_prefix_len > 32 {
                return Err(ConfigError::Topology(format!(
                    "interface '{}' prefix length {} exceeds 32",
                    spec.name, spec.ipv4_prefix_len
                )));
            }
            validation::validate_vlan_id(spec.vlan, &spec.name).map_err(ConfigError::Topology)?;
        }
        for spec in &self.interfaces {
            for member in &spec.lag_members {
                if !names.contains(member.as_str()) {
                    return Err(ConfigError::Topology(format!(
                        "lag '{}' references unknown member '{member}'",
                        spec.name
                    )));
                }
            }
        }

        let role_of = |name: &str| {
            self.interfaces
                .iter()
                .find(|i| i.name == name)
                .map(|i| i.role)
        };
        let mut ids = HashSet::new();
        for session in &self.sessions {
            if session.session_id == 0 || !ids.insert(session.session_id) {
                return Err(ConfigError::Topology(format!(
                    "invalid or duplicate session id {}",
                    session.session_id
                )));
            }
            if role_of(&session.access_interface) != Some(InterfaceRole::Access) {
                return Err(ConfigError::Topology(format!(
                    "session {} access interface '{}' is not an access interface",
                    session.session_id, session.access_interface
                )));
            }
            let referenced = [
                session.network_interface.as_deref(),
                session.a10nsp_interface.as_deref(),
                session.tunnel.as_ref().map(|t| t.network_interface.as_str()),
                session.relay.as_ref().map(|r| r.interface.as_str()),
            ];
            for name in referenced.into_iter().flatten() {
                if role_of(name).is_none() {
                    return Err(ConfigError::Topology(format!(
                        "session {} references unknown interface '{name}'",
                        session.session_id
                    )));
                }
            }
            for mac in [&session.client_mac, &session.server_mac].into_iter().flatten() {
                if parse_mac(mac).is_none() {
                    return Err(ConfigError::Topology(format!(
                        "session {} has invalid mac '{mac}'",
                        session.session_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Locally administered MAC derived from an index
fn synthetic_mac(kind: u8, index: u32) -> MacAddr {
    let b = index.to_be_bytes();
    [0x02, kind, b[0], b[1], b[2], b[3]]
}

impl InterfaceSpec {
    fn view(&self, ifindex: u32) -> InterfaceView {
        InterfaceView {
            name: self.name.clone(),
            role: self.role,
            ifindex,
            mac: self
                .mac
                .as_deref()
                .and_then(parse_mac)
                .unwrap_or_else(|| synthetic_mac(0x00, ifindex)),
            gateway_mac: self
                .gateway_mac
                .as_deref()
                .and_then(parse_mac)
                .unwrap_or_else(|| synthetic_mac(0xfe, ifindex)),
            vlan: self.vlan,
            qinq: self.qinq,
            ipv4: self.ipv4.map(|address| Ipv4Prefix {
                address,
                len: self.ipv4_prefix_len,
            }),
            ipv6: self.ipv6,
            ldp_adjacency: self.ldp_adjacency,
            tx_channels: self.tx_channels.max(1),
            lag: (!self.lag_members.is_empty()).then(|| LagView {
                members: self.lag_members.clone(),
                lacp: self.lacp,
            }),
        }
    }
}

fn gate_for(established: bool, present: bool) -> Arc<EndpointGate> {
    EndpointGate::shared(match (present, established) {
        (false, _) => GateState::Disabled,
        (true, true) => GateState::Active,
        (true, false) => GateState::Passive,
    })
}

impl SessionSpec {
    fn view(&self, ifindex: u32) -> SessionView {
        let established = self.state == SessionState::Established;
        SessionView {
            session_id: self.session_id,
            access_type: self.access_type,
            state: self.state,
            access_interface: self.access_interface.clone(),
            ifindex,
            client_mac: self
                .client_mac
                .as_deref()
                .and_then(parse_mac)
                .unwrap_or_else(|| synthetic_mac(0x01, self.session_id)),
            server_mac: self
                .server_mac
                .as_deref()
                .and_then(parse_mac)
                .unwrap_or_else(|| synthetic_mac(0xfd, self.session_id)),
            vlan: self.vlan,
            pppoe_session_id: self.pppoe_session_id,
            ipv4_address: self.ipv4_address,
            ipv6_address: self.ipv6_address,
            delegated_ipv6_address: self.delegated_ipv6_address,
            link_local_ipv6_address: self.link_local_ipv6_address,
            stream_group_id: self.stream_group_id,
            network_interface: self.network_interface.clone(),
            a10nsp_interface: self.a10nsp_interface.clone(),
            relay: self.relay.clone(),
            tunnel: self.tunnel.clone(),
            endpoints: SessionEndpoints {
                ipv4: gate_for(established, self.ipv4_address.is_some()),
                ipv6: gate_for(established, self.ipv6_address.is_some()),
                ipv6pd: gate_for(established, self.delegated_ipv6_address.is_some()),
            },
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    view: SessionView,
    version: u64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    interfaces: RwLock<Vec<InterfaceView>>,
    sessions: RwLock<HashMap<u32, SessionEntry>>,
    paths: RwLock<HashMap<(String, IpAddr), PathEntry>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &TopologyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let directory = Self::new();
        for (idx, spec) in config.interfaces.iter().enumerate() {
            directory.add_interface(spec.view(idx as u32 + 1));
        }
        for spec in &config.sessions {
            let ifindex = directory
                .interface(&spec.access_interface)
                .map_or(0, |i| i.ifindex);
            directory.add_session(spec.view(ifindex));
        }
        Ok(directory)
    }

    /// Bundle this directory as every lookup collaborator
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            sessions: Arc::clone(self) as Arc<dyn SessionDirectory>,
            interfaces: Arc::clone(self) as Arc<dyn InterfaceDirectory>,
            paths: Arc::clone(self) as Arc<dyn PathLookup>,
        }
    }

    pub fn add_interface(&self, view: InterfaceView) {
        let mut interfaces = write(&self.interfaces);
        interfaces.retain(|i| i.name != view.name);
        interfaces.push(view);
    }

    pub fn add_session(&self, view: SessionView) {
        write(&self.sessions).insert(view.session_id, SessionEntry { view, version: 1 });
    }

    /// Ids in ascending order
    pub fn session_ids(&self) -> Vec<u32> {
        let mut ids: Vec<_> = read(&self.sessions).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Apply a change to a session and bump its topology version.
    pub fn update_session(&self, session_id: u32, change: impl FnOnce(&mut SessionView)) -> bool {
        match write(&self.sessions).get_mut(&session_id) {
            Some(entry) => {
                change(&mut entry.view);
                entry.version += 1;
                true
            }
            None => false,
        }
    }

    pub fn set_session_state(&self, session_id: u32, state: SessionState) -> bool {
        self.update_session(session_id, |view| view.state = state)
    }

    pub fn set_path(&self, interface: &str, destination: IpAddr, entry: PathEntry) {
        write(&self.paths).insert((interface.to_string(), destination), entry);
    }

    pub fn remove_path(&self, interface: &str, destination: IpAddr) {
        write(&self.paths).remove(&(interface.to_string(), destination));
    }
}

impl SessionDirectory for StaticDirectory {
    fn session(&self, session_id: u32) -> Option<SessionView> {
        read(&self.sessions).get(&session_id).map(|e| e.view.clone())
    }

    fn session_version(&self, session_id: u32) -> Option<u64> {
        read(&self.sessions).get(&session_id).map(|e| e.version)
    }
}

impl InterfaceDirectory for StaticDirectory {
    fn interface(&self, name: &str) -> Option<InterfaceView> {
        read(&self.interfaces).iter().find(|i| i.name == name).cloned()
    }

    fn first(&self, role: InterfaceRole) -> Option<InterfaceView> {
        read(&self.interfaces).iter().find(|i| i.role == role).cloned()
    }

    fn all(&self) -> Vec<InterfaceView> {
        read(&self.interfaces).clone()
    }
}

impl PathLookup for StaticDirectory {
    fn lookup(&self, interface: &str, destination: IpAddr) -> Option<PathEntry> {
        read(&self.paths)
            .get(&(interface.to_string(), destination))
            .copied()
    }
}
