// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Stream control commands.
//!
//! The control transport hands over a JSON request (`command`, optional
//! `session-id`, optional `arguments`) and gets back a response carrying a
//! numeric code and a short status. Parsing and handling are pure so both
//! are unit-testable without a socket.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::DirectionConfig;
use crate::engine::{FlowTotals, StreamEngine};
use crate::logging::Facility;
use crate::packet::chain::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_RST, TCP_FLAG_SYN};
use crate::stream::{Stream, StreamInfo, StreamKind, StreamSummary};

/// Raw request as it arrives from the transport
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub session_id: u32,
    #[serde(default)]
    pub arguments: RequestArguments,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RequestArguments {
    pub flow_id: Option<u64>,
    pub debug: bool,
    pub session_group_id: Option<i64>,
    pub name: Option<String>,
    pub interface: Option<String>,
    pub direction: Option<String>,
    pub verified_only: bool,
    pub bidirectional_verified_only: bool,
    pub tcp_flags: Option<String>,
}

/// Which streams an enable/disable applies to, by verification state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifiedFilter {
    #[default]
    Any,
    Verified,
    /// Verified and, if paired, the reverse flow verified too
    BothVerified,
}

impl VerifiedFilter {
    fn matches(self, stream: &Stream, engine: &StreamEngine) -> bool {
        match self {
            VerifiedFilter::Any => true,
            VerifiedFilter::Verified => stream.is_verified(),
            VerifiedFilter::BothVerified => {
                stream.is_verified()
                    && stream
                        .reverse()
                        .and_then(|id| engine.registry().get(id))
                        .map_or(true, |reverse| reverse.is_verified())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    /// `None` matches every stream, `Some(0)` sessions of the default group
    pub session_group_id: Option<u16>,
    pub name: Option<String>,
    pub interface: Option<String>,
    pub direction: DirectionConfig,
    pub verified: VerifiedFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Stats,
    Info { flow_id: u64, debug: bool },
    Summary(StreamFilter),
    SessionStreams { session_id: u32 },
    Reset,
    Pending,
    SetEnabled {
        enabled: bool,
        flow_id: Option<u64>,
        session_id: Option<u32>,
        filter: StreamFilter,
    },
    Update { flow_id: u64, tcp_flags: Option<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("unknown command")]
    UnknownCommand(String),
    #[error("missing flow-id")]
    MissingFlowId,
    #[error("missing session-id")]
    MissingSessionId,
    #[error("invalid session-group-id")]
    InvalidSessionGroup,
    #[error("invalid direction")]
    InvalidDirection,
    #[error("invalid tcp-flags (ack|fin|fin-ack|syn|syn-ack|rst)")]
    InvalidTcpFlags,
    #[error("stream not found")]
    StreamNotFound,
    #[error("session not found")]
    SessionNotFound,
}

impl ControlError {
    pub fn code(&self) -> u16 {
        match self {
            ControlError::StreamNotFound | ControlError::SessionNotFound => 404,
            _ => 400,
        }
    }
}

fn parse_direction(direction: Option<&str>) -> Result<DirectionConfig, ControlError> {
    match direction {
        None | Some("both") => Ok(DirectionConfig::Both),
        Some("upstream") => Ok(DirectionConfig::Upstream),
        Some("downstream") => Ok(DirectionConfig::Downstream),
        Some(_) => Err(ControlError::InvalidDirection),
    }
}

pub fn parse_tcp_flags(flags: &str) -> Result<u8, ControlError> {
    match flags {
        "ack" => Ok(TCP_FLAG_ACK),
        "fin" => Ok(TCP_FLAG_FIN),
        "fin-ack" => Ok(TCP_FLAG_FIN | TCP_FLAG_ACK),
        "syn" => Ok(TCP_FLAG_SYN),
        "syn-ack" => Ok(TCP_FLAG_SYN | TCP_FLAG_ACK),
        "rst" => Ok(TCP_FLAG_RST),
        _ => Err(ControlError::InvalidTcpFlags),
    }
}

fn parse_filter(args: &RequestArguments, verified: VerifiedFilter) -> Result<StreamFilter, ControlError> {
    let session_group_id = args
        .session_group_id
        .map(|id| u16::try_from(id).map_err(|_| ControlError::InvalidSessionGroup))
        .transpose()?;
    let verified = if args.bidirectional_verified_only {
        VerifiedFilter::BothVerified
    } else if args.verified_only {
        VerifiedFilter::Verified
    } else {
        verified
    };
    Ok(StreamFilter {
        session_group_id,
        name: args.name.clone(),
        interface: args.interface.clone(),
        direction: parse_direction(args.direction.as_deref())?,
        verified,
    })
}

impl TryFrom<&ControlRequest> for StreamCommand {
    type Error = ControlError;

    fn try_from(request: &ControlRequest) -> Result<Self, Self::Error> {
        let args = &request.arguments;
        let session_id = (request.session_id != 0).then_some(request.session_id);
        let set_enabled = |enabled, verified| -> Result<StreamCommand, ControlError> {
            Ok(StreamCommand::SetEnabled {
                enabled,
                flow_id: args.flow_id,
                session_id,
                filter: parse_filter(args, verified)?,
            })
        };
        match request.command.as_str() {
            "stream-stats" => Ok(StreamCommand::Stats),
            "stream-info" => Ok(StreamCommand::Info {
                flow_id: args.flow_id.ok_or(ControlError::MissingFlowId)?,
                debug: args.debug,
            }),
            "stream-summary" => Ok(StreamCommand::Summary(parse_filter(args, VerifiedFilter::Any)?)),
            "session-streams" => Ok(StreamCommand::SessionStreams {
                session_id: session_id.ok_or(ControlError::MissingSessionId)?,
            }),
            "stream-reset" => Ok(StreamCommand::Reset),
            "streams-pending" => Ok(StreamCommand::Pending),
            "stream-start" => set_enabled(true, VerifiedFilter::Any),
            "stream-stop" => set_enabled(false, VerifiedFilter::Any),
            "stream-stop-verified" => set_enabled(false, VerifiedFilter::Verified),
            "stream-update" => Ok(StreamCommand::Update {
                flow_id: args.flow_id.ok_or(ControlError::MissingFlowId)?,
                tcp_flags: args.tcp_flags.as_deref().map(parse_tcp_flags).transpose()?,
            }),
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionStreams {
    pub session_id: u32,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_pps: u64,
    pub tx_pps: u64,
    pub session_traffic_flows: u64,
    pub session_traffic_flows_verified: u64,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseBody {
    StreamStats(FlowTotals),
    StreamInfo(Box<StreamInfo>),
    StreamSummary(Vec<StreamSummary>),
    SessionStreams(SessionStreams),
    StreamsPending(Vec<u64>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse {
    pub status: &'static str,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub body: Option<ResponseBody>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok",
            code: 200,
            message: None,
            body: None,
        }
    }

    fn with(body: ResponseBody) -> Self {
        Self {
            body: Some(body),
            ..Self::ok()
        }
    }

    pub fn error(err: &ControlError) -> Self {
        let code = err.code();
        Self {
            status: if code == 404 { "warning" } else { "error" },
            code,
            message: Some(err.to_string()),
            body: None,
        }
    }
}

impl StreamFilter {
    fn matches(&self, stream: &Stream, engine: &StreamEngine) -> bool {
        if let Some(group) = self.session_group_id {
            let in_group = stream
                .session_id
                .and_then(|id| engine.collaborators().sessions.session(id))
                .is_some_and(|session| session.stream_group_id == group);
            if !in_group {
                return false;
            }
        }
        if self.name.as_deref().is_some_and(|name| name != stream.name()) {
            return false;
        }
        if self
            .interface
            .as_deref()
            .is_some_and(|interface| interface != stream.tx_interface)
        {
            return false;
        }
        self.direction.includes(stream.direction) && self.verified.matches(stream, engine)
    }
}

/// Detailed report including the NAT target learned by the reverse flow
pub fn stream_info(engine: &StreamEngine, stream: &Stream, debug: bool) -> StreamInfo {
    let nat_target = if stream.nat {
        stream
            .reverse()
            .and_then(|id| engine.registry().get(id))
            .and_then(|reverse| reverse.nat_source())
    } else {
        None
    };
    stream.info(nat_target, debug)
}

/// Streams an enable/disable may touch: no session traffic, no multicast.
fn controllable(stream: &Stream) -> bool {
    !stream.session_traffic && stream.kind == StreamKind::Unicast
}

fn set_enabled(
    engine: &StreamEngine,
    enabled: bool,
    flow_id: Option<u64>,
    session_id: Option<u32>,
    filter: &StreamFilter,
) -> Result<usize, ControlError> {
    if let Some(flow_id) = flow_id {
        let stream = engine
            .registry()
            .get(flow_id)
            .ok_or(ControlError::StreamNotFound)?;
        stream.set_enabled(enabled);
        return Ok(1);
    }
    let candidates: Vec<Arc<Stream>> = match session_id {
        Some(session_id) => {
            if engine.collaborators().sessions.session(session_id).is_none() {
                return Err(ControlError::SessionNotFound);
            }
            engine.registry().session_streams(session_id)
        }
        None => engine.registry().all(),
    };
    let mut changed = 0;
    for stream in candidates {
        if controllable(&stream) && filter.matches(&stream, engine) {
            stream.set_enabled(enabled);
            changed += 1;
        }
    }
    Ok(changed)
}

fn execute(engine: &StreamEngine, command: &StreamCommand) -> Result<ControlResponse, ControlError> {
    let registry = engine.registry();
    match command {
        StreamCommand::Stats => Ok(ControlResponse::with(ResponseBody::StreamStats(engine.flows()))),
        StreamCommand::Info { flow_id, debug } => {
            let stream = registry.get(*flow_id).ok_or(ControlError::StreamNotFound)?;
            Ok(ControlResponse::with(ResponseBody::StreamInfo(Box::new(
                stream_info(engine, &stream, *debug),
            ))))
        }
        StreamCommand::Summary(filter) => {
            let summary = registry
                .all()
                .iter()
                .filter(|stream| filter.matches(stream, engine))
                .map(|stream| stream.summary())
                .collect();
            Ok(ControlResponse::with(ResponseBody::StreamSummary(summary)))
        }
        StreamCommand::SessionStreams { session_id } => {
            if engine.collaborators().sessions.session(*session_id).is_none() {
                return Err(ControlError::SessionNotFound);
            }
            let stats = engine.stats().session(*session_id).unwrap_or_default();
            let streams = registry
                .session_streams(*session_id)
                .iter()
                .map(|stream| stream_info(engine, stream, false))
                .collect();
            Ok(ControlResponse::with(ResponseBody::SessionStreams(SessionStreams {
                session_id: *session_id,
                rx_packets: stats.packets_rx,
                tx_packets: stats.packets_tx,
                rx_pps: stats.rate_rx.avg,
                tx_pps: stats.rate_tx.avg,
                session_traffic_flows: stats.session_traffic_flows,
                session_traffic_flows_verified: stats.session_traffic_flows_verified,
                streams,
            })))
        }
        StreamCommand::Reset => {
            engine.reset_all();
            Ok(ControlResponse::ok())
        }
        StreamCommand::Pending => {
            let pending = registry
                .all()
                .iter()
                .filter(|stream| !stream.is_verified())
                .map(|stream| stream.flow_id)
                .collect();
            Ok(ControlResponse::with(ResponseBody::StreamsPending(pending)))
        }
        StreamCommand::SetEnabled {
            enabled,
            flow_id,
            session_id,
            filter,
        } => {
            let changed = set_enabled(engine, *enabled, *flow_id, *session_id, filter)?;
            log_debug!(
                engine.logger(),
                Facility::Control,
                "{} {} streams",
                if *enabled { "started" } else { "stopped" },
                changed
            );
            Ok(ControlResponse::ok())
        }
        StreamCommand::Update { flow_id, tcp_flags } => {
            let stream = registry.get(*flow_id).ok_or(ControlError::StreamNotFound)?;
            if let Some(flags) = tcp_flags {
                stream.set_tcp_flags(*flags);
            }
            Ok(ControlResponse::ok())
        }
    }
}

/// Parse and run one request.
pub fn handle_stream_command(engine: &StreamEngine, request: &ControlRequest) -> ControlResponse {
    let result = StreamCommand::try_from(request).and_then(|command| execute(engine, &command));
    match result {
        Ok(response) => response,
        Err(err) => {
            log_debug!(engine.logger(), Facility::Control, "{}: {}", request.command, err);
            ControlResponse::error(&err)
        }
    }
}

/// Parse a JSON request and serialize the response.
pub fn handle_json(engine: &StreamEngine, request: &str) -> String {
    let response = match serde_json::from_str::<ControlRequest>(request) {
        Ok(request) => handle_stream_command(engine, &request),
        Err(err) => ControlResponse {
            status: "error",
            code: 400,
            message: Some(format!("invalid request: {err}")),
            body: None,
        },
    };
    serde_json::to_string(&response).unwrap_or_else(|_| {
        r#"{"status":"error","code":500,"message":"internal error"}"#.to_string()
    })
}
