// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Engine context.
//!
//! [`StreamEngine`] turns the configuration into streams, binds each one to
//! an output channel and a rollup group, and owns everything that is global
//! to the engine: the registry, the aggregate stats, the raw and multicast
//! traffic gates and the flow/verified totals. Channels are handed out once
//! through [`StreamEngine::take_channels`] and then driven by their own
//! workers; streams created later reach them through the channel inbox.

use metrics::gauge;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::collaborators::{
    Collaborators, EndpointGate, GateState, InterfaceRole, InterfaceView, SessionView,
};
use crate::config::{Config, ConfigError, StreamConfig};
use crate::logging::{Facility, Logger, Severity};
use crate::packet::builder::Topology;
use crate::packet::header::{Direction, StreamKind, SubType, Timestamp};
use crate::packet::parser::parse_frame;
use crate::scheduler::{Channel, ChannelHandle, SendContext};
use crate::stats::TrafficStats;
use crate::stream::verify::{self, RxContext};
use crate::stream::{
    lock, GroupSet, MacCheck, RxPacket, RxVerdict, Stream, StreamGroup, StreamRegistry, StreamSpec,
};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session {0} not found")]
    SessionNotFound(u32),

    #[error("stream {stream}: interface {interface} not found")]
    UnknownInterface { stream: String, interface: String },

    #[error("stream {0}: no network interface")]
    NoNetworkInterface(String),

    #[error("stream {stream} ({direction}): missing {family} destination address")]
    MissingDestination {
        stream: String,
        direction: Direction,
        family: SubType,
    },

    #[error("stream {0} (downstream): missing interface")]
    MissingInterface(String),

    #[error("lag {0} has no member interfaces")]
    LagWithoutMembers(String),

    #[error("multicast traffic: no IPv4 source address")]
    MissingMulticastSource,

    #[error("stream engine is shutting down")]
    ShuttingDown,
}

/// Upstream and downstream halves of one session template, before ids
type SessionPair = (Option<StreamSpec>, Option<StreamSpec>);

/// Global flow and verified counters
#[derive(Debug, Default)]
pub struct FlowCounters {
    pub stream_flows: AtomicU64,
    pub stream_flows_verified: AtomicU64,
    pub session_traffic_flows: AtomicU64,
    pub session_traffic_flows_verified: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FlowTotals {
    pub total_flows: u64,
    pub verified_flows: u64,
    pub session_traffic_flows: u64,
    pub session_traffic_flows_verified: u64,
}

impl FlowCounters {
    pub fn totals(&self) -> FlowTotals {
        FlowTotals {
            total_flows: self.stream_flows.load(Ordering::Relaxed),
            verified_flows: self.stream_flows_verified.load(Ordering::Relaxed),
            session_traffic_flows: self.session_traffic_flows.load(Ordering::Relaxed),
            session_traffic_flows_verified: self
                .session_traffic_flows_verified
                .load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelTable {
    by_interface: HashMap<String, Vec<Arc<ChannelHandle>>>,
    /// Created but not yet handed out by `take_channels`
    untaken: Vec<Arc<ChannelHandle>>,
    /// Streams on LACP-controlled LAGs waiting for the LAG to come up
    lag_pending: HashMap<String, Vec<Arc<Stream>>>,
}

impl ChannelTable {
    fn handles(&mut self, view: &InterfaceView) -> &[Arc<ChannelHandle>] {
        let untaken = &mut self.untaken;
        self.by_interface
            .entry(view.name.clone())
            .or_insert_with(|| {
                (0..view.tx_channels.max(1))
                    .map(|index| {
                        let handle = ChannelHandle::new(&view.name, index);
                        untaken.push(Arc::clone(&handle));
                        handle
                    })
                    .collect()
            })
    }
}

fn least_loaded<'a>(handles: impl Iterator<Item = &'a Arc<ChannelHandle>>) -> Option<Arc<ChannelHandle>> {
    handles
        .min_by(|a, b| a.load().total_cmp(&b.load()))
        .cloned()
}

enum ChannelTarget {
    Channel(Arc<ChannelHandle>),
    Parked(String),
}

struct GroupTimers {
    runtime: tokio::runtime::Handle,
    tasks: Vec<JoinHandle<()>>,
}

pub struct StreamEngine {
    config: Config,
    collaborators: Collaborators,
    logger: Logger,
    registry: Arc<StreamRegistry>,
    stats: Arc<TrafficStats>,
    flows: FlowCounters,
    traffic_gate: Arc<EndpointGate>,
    multicast_gate: Arc<EndpointGate>,
    group_templates: HashMap<u16, Vec<Arc<StreamConfig>>>,
    session_templates: Vec<Arc<StreamConfig>>,
    groups: Mutex<GroupSet>,
    channels: Mutex<ChannelTable>,
    timers: Mutex<Option<GroupTimers>>,
    /// Held while flow ids are assigned so they stay contiguous
    attach_lock: Mutex<()>,
    /// Set by teardown; no stream is created or released afterwards
    shutdown: AtomicBool,
}

impl std::fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEngine").finish_non_exhaustive()
    }
}

impl StreamEngine {
    /// Validate the configuration and create every raw and multicast stream.
    pub fn setup(
        config: Config,
        collaborators: Collaborators,
        logger: Logger,
    ) -> Result<Self, SetupError> {
        config.validate()?;

        let mut group_templates: HashMap<u16, Vec<Arc<StreamConfig>>> = HashMap::new();
        let mut raw_templates = Vec::new();
        for stream in &config.streams {
            let stream = Arc::new(stream.clone());
            if stream.is_raw() {
                raw_templates.push(stream);
            } else {
                group_templates
                    .entry(stream.stream_group_id)
                    .or_default()
                    .push(stream);
            }
        }
        let session_templates = [SubType::Ipv4, SubType::Ipv6, SubType::Ipv6pd]
            .into_iter()
            .filter_map(|sub_type| config.session_traffic.templates(sub_type))
            .flat_map(|(up, down)| [Arc::new(up), Arc::new(down)])
            .collect();

        let autostart = if config.traffic.autostart {
            GateState::Active
        } else {
            GateState::Passive
        };
        let multicast_autostart = config
            .multicast_traffic
            .as_ref()
            .map_or(true, |m| m.autostart);
        let multicast_state = if multicast_autostart {
            autostart
        } else {
            GateState::Passive
        };

        let engine = Self {
            collaborators,
            logger,
            registry: Arc::new(StreamRegistry::new()),
            stats: Arc::new(TrafficStats::new()),
            flows: FlowCounters::default(),
            traffic_gate: EndpointGate::shared(autostart),
            multicast_gate: EndpointGate::shared(multicast_state),
            group_templates,
            session_templates,
            groups: Mutex::new(GroupSet::new()),
            channels: Mutex::new(ChannelTable::default()),
            timers: Mutex::new(None),
            attach_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            config,
        };

        {
            let mut table = lock(&engine.channels);
            for view in engine.collaborators.interfaces.all() {
                if view.lag.is_none() {
                    table.handles(&view);
                }
            }
        }

        for template in &raw_templates {
            if let Err(err) = engine.add_raw_stream(template) {
                log_error!(engine.logger, Facility::Engine, "Failed to add stream {}: {}", template.name, err);
                return Err(err);
            }
        }
        engine.add_multicast_streams()?;

        log_info!(
            engine.logger,
            Facility::Engine,
            "stream engine ready: {} streams, {} flows",
            engine.registry.len(),
            engine.flows.stream_flows.load(Ordering::Relaxed)
        );
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    pub fn flows(&self) -> FlowTotals {
        self.flows.totals()
    }

    pub fn send_context(&self) -> SendContext<'_> {
        SendContext {
            collaborators: &self.collaborators,
            registry: &self.registry,
            traffic: &self.config.traffic,
            logger: &self.logger,
        }
    }

    /// Start raw (non-session) traffic.
    pub fn start_traffic(&self) {
        self.traffic_gate.set(GateState::Active);
        log_info!(self.logger, Facility::Engine, "traffic started");
    }

    pub fn stop_traffic(&self) {
        self.traffic_gate.set(GateState::Passive);
        log_info!(self.logger, Facility::Engine, "traffic stopped");
    }

    pub fn traffic_active(&self) -> bool {
        self.traffic_gate.is_active()
    }

    pub fn start_multicast(&self) {
        self.multicast_gate.set(GateState::Active);
    }

    pub fn stop_multicast(&self) {
        self.multicast_gate.set(GateState::Passive);
    }

    /// Channels created since the previous call, ready to be driven.
    pub fn take_channels(&self) -> Vec<Channel> {
        lock(&self.channels)
            .untaken
            .drain(..)
            .map(Channel::new)
            .collect()
    }

    fn add_raw_stream(&self, config: &Arc<StreamConfig>) -> Result<(), SetupError> {
        let interfaces = &self.collaborators.interfaces;
        let view = match &config.network_interface {
            Some(name) => interfaces
                .interface(name)
                .ok_or_else(|| SetupError::UnknownInterface {
                    stream: config.name.clone(),
                    interface: name.clone(),
                })?,
            None => interfaces
                .first(InterfaceRole::Network)
                .ok_or_else(|| SetupError::NoNetworkInterface(config.name.clone()))?,
        };
        let multicast = config.is_multicast();
        let spec = StreamSpec {
            flow_id: self.registry.next_flow_id(),
            config: Arc::clone(config),
            kind: if multicast {
                StreamKind::Multicast
            } else {
                StreamKind::Unicast
            },
            direction: Direction::Down,
            topology: Topology::NetworkDown,
            session_id: None,
            tunnel_id: None,
            tx_interface: view.name.clone(),
            endpoint: if multicast {
                Arc::clone(&self.multicast_gate)
            } else {
                Arc::clone(&self.traffic_gate)
            },
            enabled: multicast || config.autostart,
            ldp_lookup: view.ldp_adjacency && config.has_ldp_lookup(),
        };
        self.attach(vec![Stream::new(spec)])
    }

    fn add_multicast_streams(&self) -> Result<(), SetupError> {
        let Some(multicast) = &self.config.multicast_traffic else {
            return Ok(());
        };
        let interfaces = &self.collaborators.interfaces;
        let view = match &multicast.network_interface {
            Some(name) => interfaces.interface(name),
            None => interfaces.first(InterfaceRole::Network),
        }
        .ok_or_else(|| SetupError::NoNetworkInterface("multicast".into()))?;
        let source = multicast
            .source
            .or(view.ipv4.map(|p| p.address))
            .ok_or(SetupError::MissingMulticastSource)?;
        for mut template in multicast.templates(source) {
            template.network_interface = Some(view.name.clone());
            self.add_raw_stream(&Arc::new(template))?;
        }
        Ok(())
    }

    /// Create the streams of a session: session traffic first, then every
    /// template of the session's stream group. Returns how many were added.
    pub fn add_session(&self, session_id: u32) -> Result<usize, SetupError> {
        let session = self
            .collaborators
            .sessions
            .session(session_id)
            .ok_or(SetupError::SessionNotFound(session_id))?;
        let _attach = lock(&self.attach_lock);
        if self.is_shut_down() {
            return Err(SetupError::ShuttingDown);
        }
        if self.registry.has_session(session_id) {
            log_debug!(self.logger, Facility::Engine, "session {} already has streams", session_id);
            return Ok(0);
        }

        // Resolve every template first so a failure leaves no stream behind.
        let mut pairs = Vec::new();
        for template in &self.session_templates {
            if session.endpoints.for_family(template.sub_type).state() != GateState::Disabled {
                pairs.push(self.session_pair(template, &session)?);
            }
        }
        if session.stream_group_id != 0 {
            if let Some(templates) = self.group_templates.get(&session.stream_group_id) {
                for template in templates {
                    pairs.push(self.session_pair(template, &session)?);
                }
            }
        }

        let streams = self.number_pairs(pairs);
        let added = streams.len();
        self.attach(streams)?;
        Ok(added)
    }

    /// Assign consecutive flow ids (upstream first) and link each pair.
    fn number_pairs(&self, pairs: Vec<SessionPair>) -> Vec<Stream> {
        let mut next = self.registry.next_flow_id();
        let mut streams = Vec::with_capacity(pairs.len() * 2);
        for (up, down) in pairs {
            let mut number = |mut spec: StreamSpec| {
                spec.flow_id = next;
                next += 1;
                Stream::new(spec)
            };
            let mut up = up.map(&mut number);
            let mut down = down.map(&mut number);
            if let (Some(up), Some(down)) = (up.as_mut(), down.as_mut()) {
                up.set_reverse(down.flow_id);
                down.set_reverse(up.flow_id);
            }
            streams.extend(up);
            streams.extend(down);
        }
        streams
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Network and A10NSP candidates in precedence order; at most one is set.
    fn session_interfaces(
        &self,
        config: &StreamConfig,
        session: &SessionView,
    ) -> Result<(Option<InterfaceView>, Option<InterfaceView>), SetupError> {
        let interfaces = &self.collaborators.interfaces;
        let lookup = |name: &String| {
            interfaces
                .interface(name)
                .ok_or_else(|| SetupError::UnknownInterface {
                    stream: config.name.clone(),
                    interface: name.clone(),
                })
        };
        if let Some(name) = &config.network_interface {
            return Ok((Some(lookup(name)?), None));
        }
        if let Some(name) = &config.a10nsp_interface {
            return Ok((None, Some(lookup(name)?)));
        }
        if let Some(name) = &session.network_interface {
            return Ok((Some(lookup(name)?), None));
        }
        if let Some(name) = &session.a10nsp_interface {
            return Ok((None, Some(lookup(name)?)));
        }
        if let Some(network) = interfaces.first(InterfaceRole::Network) {
            return Ok((Some(network), None));
        }
        Ok((None, interfaces.first(InterfaceRole::A10nsp)))
    }

    fn session_pair(
        &self,
        config: &Arc<StreamConfig>,
        session: &SessionView,
    ) -> Result<SessionPair, SetupError> {
        let (network, a10nsp) = self.session_interfaces(config, session)?;
        if config.session_traffic && network.is_none() && a10nsp.is_none() {
            return Ok((None, None));
        }
        let gate = session.endpoints.for_family(config.sub_type);

        let up = if config.direction.includes(Direction::Up) {
            let reachable = match config.sub_type {
                SubType::Ipv4 => {
                    network.as_ref().is_some_and(|n| n.ipv4.is_some())
                        || config.ipv4_destination_address.is_some()
                        || config.ipv4_network_address.is_some()
                        || a10nsp.is_some()
                }
                SubType::Ipv6 | SubType::Ipv6pd => {
                    network.as_ref().is_some_and(|n| n.ipv6.is_some())
                        || config.ipv6_destination_address.is_some()
                        || config.ipv6_network_address.is_some()
                        || a10nsp.is_some()
                }
            };
            if !reachable {
                log_error!(
                    self.logger,
                    Facility::Engine,
                    "Failed to add stream {} (upstream) because of missing {} destination address",
                    config.name,
                    config.sub_type
                );
                return Err(SetupError::MissingDestination {
                    stream: config.name.clone(),
                    direction: Direction::Up,
                    family: config.sub_type,
                });
            }
            Some(StreamSpec {
                flow_id: 0,
                config: Arc::clone(config),
                kind: StreamKind::Unicast,
                direction: Direction::Up,
                topology: Topology::resolve(Some(session), Direction::Up),
                session_id: Some(session.session_id),
                tunnel_id: None,
                tx_interface: session.access_interface.clone(),
                endpoint: Arc::clone(gate),
                enabled: config.autostart,
                ldp_lookup: false,
            })
        } else {
            None
        };

        let down = if config.direction.includes(Direction::Down) {
            let tx_interface = if let Some(tunnel) = &session.tunnel {
                tunnel.network_interface.clone()
            } else if let Some(relay) = &session.relay {
                relay.interface.clone()
            } else if let Some(view) = network.as_ref().or(a10nsp.as_ref()) {
                view.name.clone()
            } else {
                log_error!(
                    self.logger,
                    Facility::Engine,
                    "Failed to add stream {} (downstream) because of missing interface",
                    config.name
                );
                return Err(SetupError::MissingInterface(config.name.clone()));
            };
            let ldp_lookup = config.has_ldp_lookup()
                && self
                    .collaborators
                    .interfaces
                    .interface(&tx_interface)
                    .is_some_and(|view| view.ldp_adjacency);
            Some(StreamSpec {
                flow_id: 0,
                config: Arc::clone(config),
                kind: StreamKind::Unicast,
                direction: Direction::Down,
                topology: Topology::resolve(Some(session), Direction::Down),
                session_id: Some(session.session_id),
                tunnel_id: session.tunnel.as_ref().map(|t| t.tunnel_id),
                tx_interface,
                endpoint: Arc::clone(gate),
                enabled: config.autostart,
                ldp_lookup,
            })
        } else {
            None
        };

        Ok((up, down))
    }

    /// Register streams, count them, and hand each to its group and channel.
    ///
    /// Every stream must resolve a channel before any is registered, so a
    /// session's streams are attached whole or not at all.
    fn attach(&self, streams: Vec<Stream>) -> Result<(), SetupError> {
        let mut table = lock(&self.channels);
        for stream in &streams {
            self.select_channel(stream, &mut table)?;
        }
        for stream in streams {
            let target = self.select_channel(&stream, &mut table)?;
            self.register(stream, target, &mut table);
        }
        Ok(())
    }

    fn register(&self, stream: Stream, target: ChannelTarget, table: &mut ChannelTable) {
        let stream = self.registry.insert(stream);
        if stream.session_traffic {
            self.flows.session_traffic_flows.fetch_add(1, Ordering::Relaxed);
            if let Some(session_id) = stream.session_id {
                self.stats.add_session_flow(session_id);
            }
        } else if stream.kind == StreamKind::Unicast {
            let flows = self.flows.stream_flows.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!("stream_flows").set(flows as f64);
        }

        let (group, opened) = lock(&self.groups).add(&stream);
        if opened {
            self.spawn_group_timer(&group);
        }

        match target {
            ChannelTarget::Channel(handle) => {
                log_debug!(
                    self.logger,
                    Facility::Engine,
                    "Traffic stream {} ({}) added to {} channel {} with {:.2} PPS",
                    stream.name(),
                    stream.direction,
                    handle.interface,
                    handle.index,
                    stream.pps
                );
                handle.assign(stream);
            }
            ChannelTarget::Parked(lag) => {
                stream.set_lag();
                table.lag_pending.entry(lag).or_default().push(stream);
            }
        }
    }

    fn select_channel(
        &self,
        stream: &Stream,
        table: &mut ChannelTable,
    ) -> Result<ChannelTarget, SetupError> {
        let interfaces = &self.collaborators.interfaces;
        let view = interfaces
            .interface(&stream.tx_interface)
            .ok_or_else(|| SetupError::UnknownInterface {
                stream: stream.name().to_string(),
                interface: stream.tx_interface.clone(),
            })?;
        let Some(lag) = &view.lag else {
            return least_loaded(table.handles(&view).iter())
                .map(ChannelTarget::Channel)
                .ok_or(SetupError::MissingInterface(stream.name().to_string()));
        };
        if lag.lacp {
            return Ok(ChannelTarget::Parked(view.name.clone()));
        }
        stream.set_lag();
        self.lag_member_channel(&view.name, &lag.members, table)
            .map(ChannelTarget::Channel)
    }

    fn lag_member_channel(
        &self,
        lag: &str,
        members: &[String],
        table: &mut ChannelTable,
    ) -> Result<Arc<ChannelHandle>, SetupError> {
        let mut candidates = Vec::new();
        for member in members {
            if let Some(view) = self.collaborators.interfaces.interface(member) {
                candidates.extend(table.handles(&view).iter().cloned());
            }
        }
        least_loaded(candidates.iter()).ok_or_else(|| {
            log_error!(self.logger, Facility::Engine, "LAG {} has no member interfaces", lag);
            SetupError::LagWithoutMembers(lag.to_string())
        })
    }

    /// Release streams parked on an LACP-controlled LAG.
    pub fn lag_up(&self, lag: &str) -> Result<usize, SetupError> {
        let mut table = lock(&self.channels);
        if self.is_shut_down() {
            return Err(SetupError::ShuttingDown);
        }
        let Some(streams) = table.lag_pending.remove(lag) else {
            return Ok(0);
        };
        let members = self
            .collaborators
            .interfaces
            .interface(lag)
            .and_then(|view| view.lag)
            .map(|l| l.members)
            .unwrap_or_default();
        let count = streams.len();
        for (idx, stream) in streams.iter().enumerate() {
            match self.lag_member_channel(lag, &members, &mut table) {
                Ok(handle) => handle.assign(Arc::clone(stream)),
                Err(err) => {
                    table
                        .lag_pending
                        .insert(lag.to_string(), streams[idx..].to_vec());
                    return Err(err);
                }
            }
        }
        log_info!(self.logger, Facility::Engine, "LAG {} up, {} streams released", lag, count);
        Ok(count)
    }

    /// Streams waiting for an LACP-controlled LAG
    pub fn lag_pending(&self, lag: &str) -> usize {
        lock(&self.channels)
            .lag_pending
            .get(lag)
            .map_or(0, Vec::len)
    }

    /// Parse a received frame and feed it to the receive path.
    ///
    /// The destination MAC check follows the receiving interface: session
    /// binding on access interfaces, the interface MAC elsewhere.
    pub fn rx_frame(&self, interface: &str, frame: &[u8], timestamp: Timestamp) -> Option<RxVerdict> {
        let parsed = parse_frame(frame).ok()?;
        let header = parsed.test_header?;
        let check = match self.collaborators.interfaces.interface(interface) {
            Some(view) if view.role == InterfaceRole::Access => MacCheck::Session,
            Some(view) => MacCheck::Expect(view.mac),
            None => MacCheck::Skip,
        };
        self.rx(
            &RxPacket {
                frame: &parsed,
                header: &header,
                interface,
                timestamp,
            },
            check,
        )
    }

    /// Correlate one test packet; `None` when no unicast stream matches.
    pub fn rx(&self, packet: &RxPacket<'_>, check: MacCheck) -> Option<RxVerdict> {
        if packet.header.kind() != StreamKind::Unicast {
            return None;
        }
        let stream = self.registry.get(packet.header.flow_id)?;
        if stream.kind != StreamKind::Unicast {
            return None;
        }
        let ctx = RxContext {
            sessions: self.collaborators.sessions.as_ref(),
            delay_calc: self.config.traffic.stream_delay_calculation,
            logger: &self.logger,
        };
        let verdict = verify::receive(&stream, packet, check, &ctx);
        if let RxVerdict::Accepted {
            newly_verified: true,
            ..
        } = verdict
        {
            self.on_verified(&stream);
        }
        Some(verdict)
    }

    fn on_verified(&self, stream: &Stream) {
        log_flow!(
            self.logger,
            Severity::Debug,
            Facility::Verify,
            stream.flow_id,
            "stream {} ({}) verified",
            stream.name(),
            stream.direction
        );
        if stream.session_traffic {
            let verified = self
                .flows
                .session_traffic_flows_verified
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            if let Some(session_id) = stream.session_id {
                self.stats.add_session_flow_verified(session_id);
            }
            if verified == self.flows.session_traffic_flows.load(Ordering::Relaxed) {
                log_info!(self.logger, Facility::Verify, "ALL SESSION TRAFFIC FLOWS VERIFIED");
            }
        } else {
            let verified = self.flows.stream_flows_verified.fetch_add(1, Ordering::Relaxed) + 1;
            gauge!("stream_flows_verified").set(verified as f64);
            if verified == self.flows.stream_flows.load(Ordering::Relaxed) {
                log_info!(self.logger, Facility::Verify, "ALL STREAM TRAFFIC FLOWS VERIFIED");
            }
        }

        let reverse = stream.reverse().and_then(|id| self.registry.get(id));
        if stream.in_setup() {
            match &reverse {
                Some(reverse) if reverse.is_verified() => {
                    stream.set_setup(false);
                    reverse.set_setup(false);
                }
                Some(_) => {}
                None => stream.set_setup(false),
            }
        }
        if self.config.traffic.stop_verified && stream.session_id.is_some() && !stream.session_traffic {
            match &reverse {
                Some(reverse) if reverse.is_verified() => {
                    stream.set_enabled(false);
                    reverse.set_enabled(false);
                }
                Some(_) => {}
                None => stream.set_enabled(false),
            }
        }
    }

    /// Reset every stream except session traffic.
    pub fn reset_all(&self) -> usize {
        let mut count = 0;
        for stream in self.registry.all() {
            if stream.session_traffic {
                continue;
            }
            stream.reset();
            count += 1;
        }
        self.flows.stream_flows_verified.store(0, Ordering::Relaxed);
        gauge!("stream_flows_verified").set(0.0);
        log_info!(self.logger, Facility::Engine, "reset {} streams", count);
        count
    }

    /// Fold every stream into the aggregates once.
    pub fn rollup(&self) {
        let rate_calc = self.config.traffic.stream_rate_calculation;
        let groups: Vec<Arc<StreamGroup>> = lock(&self.groups).groups().to_vec();
        for group in groups {
            group.tick(&self.stats, rate_calc);
        }
        self.stats.update_session_rates();
    }

    pub fn group_count(&self) -> usize {
        lock(&self.groups).len()
    }

    /// Drive every group (and session rates) from tokio intervals.
    ///
    /// Must be called from within a tokio runtime; groups opened later get
    /// their timer on creation.
    pub fn spawn_group_timers(&self) {
        let runtime = tokio::runtime::Handle::current();
        let stats = Arc::clone(&self.stats);
        let sessions = runtime.spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            interval.tick().await;
            loop {
                interval.tick().await;
                stats.update_session_rates();
            }
        });
        *lock(&self.timers) = Some(GroupTimers {
            runtime,
            tasks: vec![sessions],
        });
        let groups: Vec<Arc<StreamGroup>> = lock(&self.groups).groups().to_vec();
        for group in &groups {
            self.spawn_group_timer(group);
        }
    }

    fn spawn_group_timer(&self, group: &Arc<StreamGroup>) {
        let mut timers = lock(&self.timers);
        let Some(timers) = timers.as_mut() else {
            return;
        };
        let group = Arc::clone(group);
        let stats = Arc::clone(&self.stats);
        let rate_calc = self.config.traffic.stream_rate_calculation;
        let task = timers.runtime.spawn(async move {
            let mut interval = tokio::time::interval(group.interval());
            interval.tick().await;
            loop {
                interval.tick().await;
                group.tick(&stats, rate_calc);
            }
        });
        timers.tasks.push(task);
    }

    pub fn stop_group_timers(&self) {
        if let Some(timers) = lock(&self.timers).take() {
            for task in timers.tasks {
                task.abort();
            }
        }
    }

    /// Stop all traffic and stream creation, run a last rollup and stop the
    /// timers.
    pub fn teardown(&self) {
        {
            let _attach = lock(&self.attach_lock);
            self.shutdown.store(true, Ordering::Release);
        }
        self.traffic_gate.set(GateState::Disabled);
        self.multicast_gate.set(GateState::Disabled);
        self.stop_group_timers();
        self.rollup();
        let totals = self.flows.totals();
        log_info!(
            self.logger,
            Facility::Engine,
            "stream engine stopped: {}/{} flows verified, {}/{} session traffic flows verified",
            totals.verified_flows,
            totals.total_flows,
            totals.session_traffic_flows_verified,
            totals.session_traffic_flows
        );
    }
}
