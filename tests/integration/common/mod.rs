// SPDX-License-Identifier: Apache-2.0 OR MIT
// Integration test utilities
//
// Everything runs in-process: the engine is built against a StaticDirectory
// loaded from an inline JSON5 config and channels are polled at simulated
// timestamps, so no privileges or real interfaces are needed.

use std::ops::RangeInclusive;
use std::sync::Arc;

use traffic_streams::collaborators::Egress;
use traffic_streams::directory::StaticDirectory;
use traffic_streams::egress::LoopbackEgress;
use traffic_streams::logging::{LogEntry, Logger, MPSCRingBuffer};
use traffic_streams::packet::header::read_trailer;
use traffic_streams::packet::{parse_frame, ParsedFrame, TestHeader, Timestamp};
use traffic_streams::{Channel, Config, StreamEngine};

/// Arbitrary wall-clock origin for simulated runs
pub const T0_NS: u64 = 1_700_000_000 * 1_000_000_000;

/// Access interface, network interface and one IPoE session in group 1.
pub const TOPOLOGY: &str = r#"
    topology: {
        interfaces: [
            { name: "acc0", role: "access", mac: "02:00:00:00:00:10" },
            {
                name: "net0",
                role: "network",
                mac: "02:00:00:00:00:20",
                "gateway-mac": "02:00:00:00:00:21",
                ipv4: "10.0.0.1",
            },
        ],
        sessions: [
            {
                "session-id": 1,
                "access-interface": "acc0",
                "client-mac": "02:00:00:00:01:01",
                "ipv4-address": "100.64.0.2",
                "stream-group-id": 1,
            },
        ],
    },
"#;

/// Wraps stream and traffic sections with the shared topology.
pub fn config(body: &str) -> Config {
    let text = format!("{{ {TOPOLOGY} {body} }}");
    match Config::parse(&text) {
        Ok(config) => config,
        Err(err) => panic!("test config does not parse: {err}\n{text}"),
    }
}

pub struct Harness {
    pub engine: StreamEngine,
    pub directory: Arc<StaticDirectory>,
    pub ring: Arc<MPSCRingBuffer>,
    pub channels: Vec<Channel>,
}

impl Harness {
    /// Build the engine, attach every configured session and take channels.
    pub fn new(config: Config) -> Self {
        let directory =
            Arc::new(StaticDirectory::from_config(&config.topology).expect("valid topology"));
        let ring = Arc::new(MPSCRingBuffer::new(1024));
        let logger = Logger::from_ring(ring.clone());
        let engine = StreamEngine::setup(config, directory.collaborators(), logger)
            .expect("engine setup");
        for session_id in directory.session_ids() {
            engine.add_session(session_id).expect("session streams");
        }
        let channels = engine.take_channels();
        Self {
            engine,
            directory,
            ring,
            channels,
        }
    }

    /// Poll every channel once per millisecond over `ms`.
    pub fn drive(&mut self, egress: &mut dyn Egress, ms: RangeInclusive<u64>) -> usize {
        self.drive_from(T0_NS, egress, ms)
    }

    /// [`Harness::drive`] on a clock that starts at `origin_ns`.
    pub fn drive_from(
        &mut self,
        origin_ns: u64,
        egress: &mut dyn Egress,
        ms: RangeInclusive<u64>,
    ) -> usize {
        let ctx = self.engine.send_context();
        let mut sent = 0;
        for ms in ms {
            let now = Timestamp::from_nanos(origin_ns + ms * 1_000_000);
            for channel in &mut self.channels {
                sent += channel.poll(now, egress, &ctx);
            }
        }
        sent
    }

    /// Same as [`Harness::drive`] with sent frames received back by the engine.
    pub fn drive_loopback(&mut self, ms: RangeInclusive<u64>, peers: &[(&str, &str)]) -> usize {
        let mut egress = LoopbackEgress::new(&self.engine);
        for (tx, rx) in peers {
            egress = egress.with_peer(tx, rx);
        }
        let ctx = self.engine.send_context();
        let mut sent = 0;
        for ms in ms {
            let now = at_ms(ms);
            egress.set_now(now);
            for channel in &mut self.channels {
                sent += channel.poll(now, &mut egress, &ctx);
            }
        }
        sent
    }

    pub fn channel(&self, interface: &str) -> &Channel {
        self.channels
            .iter()
            .find(|c| c.interface() == interface)
            .expect("channel exists")
    }

    /// Drain the log ring.
    pub fn logs(&self) -> Vec<LogEntry> {
        std::iter::from_fn(|| self.ring.read()).collect()
    }

    pub fn logged(&self, message: &str) -> bool {
        self.logs().iter().any(|entry| entry.message().contains(message))
    }
}

pub fn at_ms(ms: u64) -> Timestamp {
    Timestamp::from_nanos(T0_NS + ms * 1_000_000)
}

/// Parse a sent frame that must carry a test header.
pub fn parse(frame: &[u8]) -> (ParsedFrame, TestHeader) {
    let parsed = parse_frame(frame).expect("frame parses");
    let header = parsed.test_header.expect("test header present");
    (parsed, header)
}

/// Sequence numbers stamped into the trailers of `frames`.
pub fn sequences<'a>(frames: impl Iterator<Item = &'a [u8]>) -> Vec<u64> {
    frames
        .filter_map(read_trailer)
        .map(|(seq, _)| seq)
        .collect()
}
