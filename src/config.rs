// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for streamd.
//!
//! The file is JSON5 (comments and trailing commas allowed) with kebab-case
//! keys. Stream templates are immutable after load; every runtime stream
//! holds an `Arc<StreamConfig>` to the template it was created from.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::collaborators::{parse_mac, MacAddr};
use crate::directory::TopologyConfig;
use crate::stream::{Direction, SubType};
use crate::validation;

/// UDP port used for test traffic when none is configured
pub const DEFAULT_UDP_PORT: u16 = 65056;
pub const DEFAULT_TTL: u8 = 64;
/// Group id of session-traffic templates
pub const SESSION_TRAFFIC_GROUP_ID: u16 = u16::MAX;
pub const MAX_STREAM_LENGTH: u16 = 9000;

pub const SESSION_TRAFFIC_IPV4: &str = "session-ipv4";
pub const SESSION_TRAFFIC_IPV6: &str = "session-ipv6";
pub const SESSION_TRAFFIC_IPV6PD: &str = "session-ipv6pd";
pub const MULTICAST_TRAFFIC: &str = "multicast";

fn default_true() -> bool {
    true
}
fn default_pps() -> f64 {
    1.0
}
fn default_length() -> u16 {
    128
}
fn default_ttl() -> u8 {
    DEFAULT_TTL
}
fn default_port() -> u16 {
    DEFAULT_UDP_PORT
}
fn default_label_ttl() -> u8 {
    255
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub traffic: TrafficConfig,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,

    #[serde(default)]
    pub session_traffic: SessionTrafficConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast_traffic: Option<MulticastTrafficConfig>,

    /// Static interfaces and sessions for the in-memory directory
    #[serde(default)]
    pub topology: TopologyConfig,
}

/// Engine-wide traffic behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrafficConfig {
    pub autostart: bool,
    /// Disable streams once verified
    pub stop_verified: bool,
    /// Packets sent per channel and send opportunity
    pub max_burst: u16,
    pub stream_rate_calculation: bool,
    pub stream_delay_calculation: bool,
    pub udp_checksum: bool,
    /// How far a bucket may lag behind now before catch-up is dropped
    pub stream_burst_ms: u32,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            stop_verified: false,
            max_burst: 16,
            stream_rate_calculation: true,
            stream_delay_calculation: true,
            udp_checksum: false,
            stream_burst_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectionConfig {
    Upstream,
    Downstream,
    #[default]
    Both,
}

impl DirectionConfig {
    pub fn includes(self, direction: Direction) -> bool {
        match self {
            DirectionConfig::Both => true,
            DirectionConfig::Upstream => direction == Direction::Up,
            DirectionConfig::Downstream => direction == Direction::Down,
        }
    }
}

/// One stream template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    pub name: String,

    /// 0 for raw network streams, otherwise matched against sessions
    #[serde(default)]
    pub stream_group_id: u16,

    #[serde(rename = "type", default)]
    pub sub_type: SubType,

    #[serde(default)]
    pub direction: DirectionConfig,

    #[serde(default = "default_pps")]
    pub pps: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pps_upstream: Option<f64>,

    #[serde(default = "default_length")]
    pub length: u16,

    #[serde(default)]
    pub max_packets: u64,

    /// Seconds to wait before the first packet
    #[serde(default)]
    pub start_delay: u32,

    /// Seconds between packets until the flow is verified
    #[serde(default)]
    pub setup_interval: u32,

    /// IPv4 ToS or IPv6 traffic class
    #[serde(default)]
    pub priority: u8,

    #[serde(default)]
    pub vlan_priority: u8,

    #[serde(default = "default_ttl")]
    pub ttl: u8,

    #[serde(default)]
    pub ipv4_df: bool,

    #[serde(default = "default_port")]
    pub source_port: u16,

    #[serde(default = "default_port")]
    pub destination_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_access_src_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_network_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4_destination_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_access_src_address: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_network_address: Option<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_destination_address: Option<Ipv6Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a10nsp_interface: Option<String>,

    /// MPLS labels pushed on transmit, 0 for none
    #[serde(default)]
    pub tx_label1: u32,
    #[serde(default)]
    pub tx_label1_exp: u8,
    #[serde(default = "default_label_ttl")]
    pub tx_label1_ttl: u8,
    #[serde(default)]
    pub tx_label2: u32,
    #[serde(default)]
    pub tx_label2_exp: u8,
    #[serde(default = "default_label_ttl")]
    pub tx_label2_ttl: u8,

    /// MPLS labels expected on receive, 0 for no check
    #[serde(default)]
    pub rx_label1: u32,
    #[serde(default)]
    pub rx_label2: u32,

    /// Expected destination MAC on receive, `aa:bb:cc:dd:ee:ff`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_mac: Option<String>,

    #[serde(default)]
    pub nat: bool,
    #[serde(default)]
    pub raw_tcp: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldp_ipv4_lookup_address: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldp_ipv6_lookup_address: Option<Ipv6Addr>,

    #[serde(default = "default_true")]
    pub autostart: bool,

    /// Set on the generated per-session templates only
    #[serde(skip)]
    pub session_traffic: bool,
}

impl StreamConfig {
    /// Template with every optional field unset
    pub fn new(name: &str, sub_type: SubType, direction: DirectionConfig, pps: f64) -> Self {
        Self {
            name: name.to_string(),
            stream_group_id: 0,
            sub_type,
            direction,
            pps,
            pps_upstream: None,
            length: default_length(),
            max_packets: 0,
            start_delay: 0,
            setup_interval: 0,
            priority: 0,
            vlan_priority: 0,
            ttl: DEFAULT_TTL,
            ipv4_df: false,
            source_port: DEFAULT_UDP_PORT,
            destination_port: DEFAULT_UDP_PORT,
            ipv4_access_src_address: None,
            ipv4_network_address: None,
            ipv4_destination_address: None,
            ipv6_access_src_address: None,
            ipv6_network_address: None,
            ipv6_destination_address: None,
            network_interface: None,
            a10nsp_interface: None,
            tx_label1: 0,
            tx_label1_exp: 0,
            tx_label1_ttl: 255,
            tx_label2: 0,
            tx_label2_exp: 0,
            tx_label2_ttl: 255,
            rx_label1: 0,
            rx_label2: 0,
            rx_mac: None,
            nat: false,
            raw_tcp: false,
            ldp_ipv4_lookup_address: None,
            ldp_ipv6_lookup_address: None,
            autostart: true,
            session_traffic: false,
        }
    }

    /// Rate used for the upstream direction
    pub fn upstream_pps(&self) -> f64 {
        self.pps_upstream.unwrap_or(self.pps)
    }

    pub fn pps_for(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Up => self.upstream_pps(),
            Direction::Down => self.pps,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.stream_group_id == 0
    }

    pub fn is_multicast(&self) -> bool {
        self.sub_type == SubType::Ipv4
            && self
                .ipv4_destination_address
                .is_some_and(|addr| addr.is_multicast())
    }

    /// Parsed `rx-mac`; validation guarantees it parses when set
    pub fn expected_rx_mac(&self) -> Option<MacAddr> {
        self.rx_mac.as_deref().and_then(parse_mac)
    }

    pub fn has_ldp_lookup(&self) -> bool {
        self.ldp_ipv4_lookup_address.is_some() || self.ldp_ipv6_lookup_address.is_some()
    }
}

/// Automatically generated per-session flows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionTrafficConfig {
    pub ipv4_pps: f64,
    pub ipv6_pps: f64,
    pub ipv6pd_pps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_address: Option<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<Ipv6Addr>,
    pub ipv4_label: u32,
    pub ipv6_label: u32,
    pub autostart: bool,
}

impl Default for SessionTrafficConfig {
    fn default() -> Self {
        Self {
            ipv4_pps: 0.0,
            ipv6_pps: 0.0,
            ipv6pd_pps: 0.0,
            ipv4_address: None,
            ipv6_address: None,
            ipv4_label: 0,
            ipv6_label: 0,
            autostart: true,
        }
    }
}

impl SessionTrafficConfig {
    /// Templates for one family, upstream first; `None` when the family is off
    pub fn templates(&self, sub_type: SubType) -> Option<(StreamConfig, StreamConfig)> {
        let (name, pps, label) = match sub_type {
            SubType::Ipv4 => (SESSION_TRAFFIC_IPV4, self.ipv4_pps, self.ipv4_label),
            SubType::Ipv6 => (SESSION_TRAFFIC_IPV6, self.ipv6_pps, self.ipv6_label),
            SubType::Ipv6pd => (SESSION_TRAFFIC_IPV6PD, self.ipv6pd_pps, self.ipv6_label),
        };
        if pps <= 0.0 {
            return None;
        }
        let make = |direction| {
            let mut config = StreamConfig::new(name, sub_type, direction, pps);
            config.stream_group_id = SESSION_TRAFFIC_GROUP_ID;
            config.session_traffic = true;
            config.length = sub_type.min_length();
            config.autostart = self.autostart;
            match sub_type {
                SubType::Ipv4 => config.ipv4_network_address = self.ipv4_address,
                _ => config.ipv6_network_address = self.ipv6_address,
            }
            config
        };
        let up = make(DirectionConfig::Upstream);
        let mut down = make(DirectionConfig::Downstream);
        if label != 0 {
            down.tx_label1 = label;
            down.tx_label1_ttl = 255;
        }
        Some((up, down))
    }
}

/// Autogenerated IPv4 multicast flows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MulticastTrafficConfig {
    pub group: Ipv4Addr,
    /// Increment between consecutive groups
    #[serde(default = "default_group_iter")]
    pub group_iter: u32,
    #[serde(default = "default_group_count")]
    pub group_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Ipv4Addr>,
    #[serde(default = "default_multicast_pps")]
    pub pps: f64,
    #[serde(default = "default_length")]
    pub length: u16,
    #[serde(default)]
    pub tos: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_interface: Option<String>,
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_group_iter() -> u32 {
    1
}
fn default_group_count() -> u32 {
    1
}
fn default_multicast_pps() -> f64 {
    1000.0
}

impl MulticastTrafficConfig {
    /// One downstream template per group; `source` fills in when none is configured
    pub fn templates(&self, source: Ipv4Addr) -> Vec<StreamConfig> {
        let base = u32::from(self.group);
        (0..self.group_count)
            .map(|i| {
                let group = Ipv4Addr::from(base.wrapping_add(i.wrapping_mul(self.group_iter)));
                let mut config = StreamConfig::new(
                    MULTICAST_TRAFFIC,
                    SubType::Ipv4,
                    DirectionConfig::Downstream,
                    self.pps,
                );
                config.length = self.length;
                config.priority = self.tos;
                config.ipv4_destination_address = Some(group);
                config.ipv4_network_address = Some(self.source.unwrap_or(source));
                config.network_interface = self.network_interface.clone();
                config
            })
            .collect()
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Pretty output; json5 has no serializer so serde_json writes it
    pub fn to_json5(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for (idx, stream) in self.streams.iter().enumerate() {
            validate_stream(idx, stream)?;

            // Both directions of one entry share a name, distinct entries may not.
            if !names.insert((stream.stream_group_id, stream.name.as_str())) {
                return Err(ConfigError::DuplicateStream {
                    name: stream.name.clone(),
                    group_id: stream.stream_group_id,
                });
            }

            if !self.topology.interfaces.is_empty() {
                for name in [&stream.network_interface, &stream.a10nsp_interface]
                    .into_iter()
                    .flatten()
                {
                    if !self.topology.interfaces.iter().any(|i| &i.name == name) {
                        return Err(ConfigError::UnknownInterface {
                            stream: stream.name.clone(),
                            interface: name.clone(),
                        });
                    }
                }
            }
        }

        for (pps, family) in [
            (self.session_traffic.ipv4_pps, "ipv4"),
            (self.session_traffic.ipv6_pps, "ipv6"),
            (self.session_traffic.ipv6pd_pps, "ipv6pd"),
        ] {
            if pps < 0.0 || !pps.is_finite() {
                return Err(ConfigError::InvalidRate {
                    context: format!("session-traffic {family}"),
                    pps,
                });
            }
        }
        for label in [self.session_traffic.ipv4_label, self.session_traffic.ipv6_label] {
            validation::validate_label(label, "session-traffic label")
                .map_err(|reason| ConfigError::InvalidLabel { stream: "session-traffic".into(), reason })?;
        }

        if let Some(multicast) = &self.multicast_traffic {
            if !multicast.group.is_multicast() {
                return Err(ConfigError::InvalidMulticastGroup(multicast.group));
            }
            if multicast.pps <= 0.0 || !multicast.pps.is_finite() {
                return Err(ConfigError::InvalidRate {
                    context: "multicast-traffic".into(),
                    pps: multicast.pps,
                });
            }
        }

        self.topology.validate()?;
        Ok(())
    }
}

fn validate_stream(idx: usize, stream: &StreamConfig) -> Result<(), ConfigError> {
    if stream.name.trim().is_empty() {
        return Err(ConfigError::EmptyName(idx));
    }
    for (pps, context) in [(stream.pps, "pps"), (stream.upstream_pps(), "pps-upstream")] {
        if pps <= 0.0 || !pps.is_finite() {
            return Err(ConfigError::InvalidRate {
                context: format!("stream {} {context}", stream.name),
                pps,
            });
        }
    }
    let min = stream.sub_type.min_length();
    if stream.length < min || stream.length > MAX_STREAM_LENGTH {
        return Err(ConfigError::InvalidLength {
            stream: stream.name.clone(),
            length: stream.length,
            min,
        });
    }
    if stream.tx_label2 != 0 && stream.tx_label1 == 0 {
        return Err(ConfigError::LabelOrder {
            stream: stream.name.clone(),
            which: "tx",
        });
    }
    if stream.rx_label2 != 0 && stream.rx_label1 == 0 {
        return Err(ConfigError::LabelOrder {
            stream: stream.name.clone(),
            which: "rx",
        });
    }
    for label in [stream.tx_label1, stream.tx_label2, stream.rx_label1, stream.rx_label2] {
        validation::validate_label(label, &stream.name).map_err(|reason| {
            ConfigError::InvalidLabel {
                stream: stream.name.clone(),
                reason,
            }
        })?;
    }
    for exp in [stream.tx_label1_exp, stream.tx_label2_exp] {
        if exp > 7 {
            return Err(ConfigError::InvalidLabel {
                stream: stream.name.clone(),
                reason: format!("exp {exp} exceeds 7"),
            });
        }
    }
    if stream.vlan_priority > 7 {
        return Err(ConfigError::InvalidVlanPriority {
            stream: stream.name.clone(),
            priority: stream.vlan_priority,
        });
    }
    for (port, context) in [
        (stream.source_port, "source-port"),
        (stream.destination_port, "destination-port"),
    ] {
        validation::validate_port(port, context).map_err(|reason| ConfigError::InvalidPort {
            stream: stream.name.clone(),
            reason,
        })?;
    }
    for name in [&stream.network_interface, &stream.a10nsp_interface]
        .into_iter()
        .flatten()
    {
        validation::validate_interface_name(name).map_err(|reason| {
            ConfigError::InvalidInterfaceName {
                name: name.clone(),
                reason,
            }
        })?;
    }

    if let Some(mac) = &stream.rx_mac {
        if parse_mac(mac).is_none() {
            return Err(ConfigError::InvalidMac {
                stream: stream.name.clone(),
                mac: mac.clone(),
            });
        }
    }

    if stream.is_raw() {
        let resolvable = match stream.sub_type {
            SubType::Ipv4 => stream.ipv4_destination_address.is_some(),
            SubType::Ipv6 | SubType::Ipv6pd => stream.ipv6_destination_address.is_some(),
        };
        if !resolvable {
            return Err(ConfigError::MissingDestination {
                stream: stream.name.clone(),
                family: stream.sub_type,
            });
        }
    } else if stream.is_multicast() {
        return Err(ConfigError::SessionMulticast(stream.name.clone()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("stream #{0} has an empty name")]
    EmptyName(usize),

    #[error("duplicate stream '{name}' in stream-group-id {group_id}")]
    DuplicateStream { name: String, group_id: u16 },

    #[error("invalid rate {pps} for {context}")]
    InvalidRate { context: String, pps: f64 },

    #[error("stream '{stream}' length {length} outside {min}..=9000")]
    InvalidLength { stream: String, length: u16, min: u16 },

    #[error("stream '{stream}' sets {which}-label2 without {which}-label1")]
    LabelOrder { stream: String, which: &'static str },

    #[error("stream '{stream}': {reason}")]
    InvalidLabel { stream: String, reason: String },

    #[error("stream '{stream}' vlan-priority {priority} exceeds 7")]
    InvalidVlanPriority { stream: String, priority: u8 },

    #[error("stream '{stream}': {reason}")]
    InvalidPort { stream: String, reason: String },

    #[error("invalid interface name '{name}': {reason}")]
    InvalidInterfaceName { name: String, reason: String },

    #[error("stream '{stream}' references unknown interface '{interface}'")]
    UnknownInterface { stream: String, interface: String },

    #[error("raw stream '{stream}' has no {family} destination address")]
    MissingDestination { stream: String, family: SubType },

    #[error("stream '{stream}' has invalid rx-mac '{mac}'")]
    InvalidMac { stream: String, mac: String },

    #[error("session stream '{0}' cannot use a multicast destination")]
    SessionMulticast(String),

    #[error("multicast-traffic group {0} is not a multicast address")]
    InvalidMulticastGroup(Ipv4Addr),

    #[error("topology: {0}")]
    Topology(String),
}
