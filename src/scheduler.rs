// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-channel transmit scheduling.
//!
//! Every output channel owns its streams' transmit state, grouped into
//! buckets of equal rate. A bucket has a base time that advances by one
//! packet interval per round; the slots inside it are spread evenly over
//! that interval through their `expired` offset. A poll walks the buckets
//! round-robin, resuming where the previous poll stopped, and sends at most
//! `max-burst` frames.
//!
//! Streams reach a running channel through its [`ChannelHandle`] inbox,
//! which the channel drains with `try_lock` at the start of each poll so the
//! send path never waits on the control side.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use metrics::counter;

use crate::collaborators::{Collaborators, Egress};
use crate::config::TrafficConfig;
use crate::logging::{Facility, Logger, Severity};
use crate::packet::builder::{build, BuildContext, PacketBuffer};
use crate::packet::header::{Direction, SubType, Timestamp};
use crate::stream::{lock, Stream, StreamRegistry};

const NSEC_PER_SEC: f64 = 1_000_000_000.0;

/// Shared side of a channel: identity, load and the stream inbox.
#[derive(Debug)]
pub struct ChannelHandle {
    pub interface: String,
    pub index: usize,
    load: Mutex<f64>,
    inbox: Mutex<Vec<Arc<Stream>>>,
    pub packets_sent: AtomicU64,
    pub send_errors: AtomicU64,
}

impl ChannelHandle {
    pub fn new(interface: &str, index: usize) -> Arc<Self> {
        Arc::new(Self {
            interface: interface.to_string(),
            index,
            load: Mutex::new(0.0),
            inbox: Mutex::new(Vec::new()),
            packets_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    /// Sum of the configured rates assigned to this channel
    pub fn load(&self) -> f64 {
        *lock(&self.load)
    }

    /// Queue a stream; it is picked up by the next poll.
    pub fn assign(&self, stream: Arc<Stream>) {
        *lock(&self.load) += stream.pps;
        lock(&self.inbox).push(stream);
    }

    pub fn pending(&self) -> usize {
        lock(&self.inbox).len()
    }
}

/// Everything a poll needs besides the channel itself
pub struct SendContext<'a> {
    pub collaborators: &'a Collaborators,
    pub registry: &'a StreamRegistry,
    pub traffic: &'a TrafficConfig,
    pub logger: &'a Logger,
}

impl SendContext<'_> {
    fn burst_ns(&self) -> u64 {
        u64::from(self.traffic.stream_burst_ms) * 1_000_000
    }
}

/// Transmit state of one stream on its channel
#[derive(Debug)]
struct TxSlot {
    stream: Arc<Stream>,
    /// Offset into the bucket interval at which this slot becomes due
    expired: u64,
    buffer: PacketBuffer,
    flow_seq: u64,
    max_packets: u64,
    /// Start delay still to be served; set on creation and by every reset
    start_delay_armed: bool,
    wait_start: Option<Timestamp>,
    session_version: Option<u64>,
    path_version: Option<u64>,
    path_label: Option<u32>,
}

impl TxSlot {
    fn new(stream: Arc<Stream>) -> Self {
        let max_packets = stream.config.max_packets;
        let start_delay_armed = stream.config.start_delay > 0;
        Self {
            stream,
            expired: 0,
            buffer: PacketBuffer::default(),
            flow_seq: 1,
            max_packets,
            start_delay_armed,
            wait_start: None,
            session_version: None,
            path_version: None,
            path_label: None,
        }
    }

    /// Gate and stamp the frame for one send; false skips this slot.
    fn prepare(&mut self, now: Timestamp, ctx: &SendContext<'_>) -> bool {
        let stream = &*self.stream;
        let config = &*stream.config;

        if stream.take_reset() {
            self.flow_seq = 1;
            if config.max_packets != 0 {
                self.max_packets =
                    stream.counters.tx_packets.load(Ordering::Relaxed) + config.max_packets;
            }
            if config.setup_interval > 0 {
                stream.set_setup(true);
            }
            self.start_delay_armed = config.start_delay > 0;
            self.buffer.invalidate();
            self.wait_start = None;
            return false;
        }
        if !stream.is_enabled() || !self.can_send(ctx) {
            return false;
        }

        let stream = &*self.stream;
        let config = &*stream.config;
        let tx_packets = stream.counters.tx_packets.load(Ordering::Relaxed);
        if self.max_packets != 0 && tx_packets >= self.max_packets {
            return false;
        }
        if self.start_delay_armed {
            match self.wait_start {
                Some(start) if now.sec.saturating_sub(start.sec) <= config.start_delay => {
                    return false
                }
                Some(_) => {
                    self.wait_start = None;
                    self.start_delay_armed = false;
                }
                None => {
                    self.wait_start = Some(now);
                    return false;
                }
            }
        }
        if stream.in_setup() {
            match self.wait_start {
                Some(start) if now.sec.saturating_sub(start.sec) <= config.setup_interval => {
                    return false
                }
                _ => self.wait_start = Some(now),
            }
        }

        if let Some(session_id) = stream.session_id {
            let version = ctx.collaborators.sessions.session_version(session_id);
            if version != self.session_version {
                self.buffer.invalidate();
                self.session_version = version;
            }
        }

        if !self.buffer.is_built() {
            let session = stream
                .session_id
                .and_then(|id| ctx.collaborators.sessions.session(id));
            let nat_target = if stream.nat && stream.direction == Direction::Down {
                stream
                    .reverse()
                    .and_then(|id| ctx.registry.get(id))
                    .and_then(|reverse| reverse.nat_source())
            } else {
                None
            };
            let build_ctx = BuildContext {
                config,
                flow_id: stream.flow_id,
                sub_type: stream.sub_type,
                direction: stream.direction,
                session: session.as_ref(),
                interfaces: ctx.collaborators.interfaces.as_ref(),
                tx_interface: &stream.tx_interface,
                path_label: self.path_label,
                nat_target,
                has_reverse: stream.reverse().is_some(),
                tcp_flags: stream.tcp_flags(),
            };
            match build(stream.topology, &build_ctx) {
                Ok(packet) => {
                    stream.set_tx_len(packet.bytes.len());
                    stream.set_addresses(packet.addresses);
                    self.buffer.install(packet);
                }
                Err(err) => {
                    log_flow!(
                        ctx.logger,
                        Severity::Error,
                        Facility::Builder,
                        stream.flow_id,
                        "Failed to build packet for stream {}: {}",
                        config.name,
                        err
                    );
                    return false;
                }
            }
        }

        if self
            .buffer
            .stamp(self.flow_seq, now, stream.tcp_flags(), ctx.traffic.udp_checksum)
            .is_none()
        {
            return false;
        }
        if self.flow_seq == 1 {
            stream.set_tx_first_epoch(now.sec);
        }
        true
    }

    /// Endpoint and path gating; a failed gate drops the built frame.
    fn can_send(&mut self, ctx: &SendContext<'_>) -> bool {
        let stream = &*self.stream;
        if !stream.is_active() {
            self.buffer.invalidate();
            return false;
        }
        if stream.ldp_lookup {
            let config = &stream.config;
            let destination = match stream.sub_type {
                SubType::Ipv4 => config.ldp_ipv4_lookup_address.map(IpAddr::V4),
                SubType::Ipv6 | SubType::Ipv6pd => config.ldp_ipv6_lookup_address.map(IpAddr::V6),
            };
            let Some(entry) =
                destination.and_then(|dst| ctx.collaborators.paths.lookup(&stream.tx_interface, dst))
            else {
                return false;
            };
            if !entry.active {
                return false;
            }
            if self.path_version != Some(entry.version) {
                self.buffer.invalidate();
                self.path_version = Some(entry.version);
                self.path_label = Some(entry.label);
            }
            return true;
        }
        if stream.nat && stream.direction == Direction::Down {
            let observed = stream
                .reverse()
                .and_then(|id| ctx.registry.get(id))
                .is_some_and(|reverse| reverse.nat_source().is_some());
            if !observed {
                self.buffer.invalidate();
            }
            return observed;
        }
        true
    }
}

#[derive(Debug)]
struct Bucket {
    pps: f64,
    nsec: u64,
    /// Start of the current round; `None` until the first poll or a rebase
    base: Option<u64>,
    cursor: Option<usize>,
    slots: Vec<TxSlot>,
}

impl Bucket {
    fn new(pps: f64) -> Self {
        Self {
            pps,
            nsec: ((NSEC_PER_SEC / pps) as u64).max(1),
            base: None,
            cursor: None,
            slots: Vec::new(),
        }
    }

    fn push(&mut self, slot: TxSlot) {
        self.slots.push(slot);
        let count = self.slots.len() as u64;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.expired = i as u64 * self.nsec / count;
        }
    }
}

/// Transmit side of one output channel, driven by [`Channel::poll`].
#[derive(Debug)]
pub struct Channel {
    handle: Arc<ChannelHandle>,
    buckets: Vec<Bucket>,
    current: usize,
}

impl Channel {
    pub fn new(handle: Arc<ChannelHandle>) -> Self {
        Self {
            handle,
            buckets: Vec::new(),
            current: 0,
        }
    }

    pub fn handle(&self) -> &Arc<ChannelHandle> {
        &self.handle
    }

    pub fn interface(&self) -> &str {
        &self.handle.interface
    }

    pub fn stream_count(&self) -> usize {
        self.buckets.iter().map(|b| b.slots.len()).sum()
    }

    fn add(&mut self, stream: Arc<Stream>) {
        let pps = stream.pps;
        let slot = TxSlot::new(stream);
        match self.buckets.iter_mut().find(|b| b.pps == pps) {
            Some(bucket) => bucket.push(slot),
            None => {
                let mut bucket = Bucket::new(pps);
                bucket.push(slot);
                self.buckets.push(bucket);
            }
        }
    }

    fn drain_inbox(&mut self) {
        let streams: Vec<_> = match self.handle.inbox.try_lock() {
            Ok(mut inbox) => inbox.drain(..).collect(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().drain(..).collect(),
            Err(TryLockError::WouldBlock) => return,
        };
        for stream in streams {
            self.add(stream);
        }
    }

    /// Next due and ready slot as (bucket, slot), advancing the cursors.
    fn next_due(&mut self, now: Timestamp, ctx: &SendContext<'_>) -> Option<(usize, usize)> {
        let n = self.buckets.len();
        if n == 0 {
            return None;
        }
        let now_ns = now.as_nanos();
        let min = now_ns.saturating_sub(ctx.burst_ns());
        let start = self.current % n;
        let mut b = start;
        loop {
            let bucket = &mut self.buckets[b];
            let mut s = match bucket.cursor {
                Some(s) => s,
                None => {
                    bucket.cursor = Some(0);
                    bucket.base = Some(match bucket.base {
                        Some(base) => (base + bucket.nsec).max(min),
                        None => now_ns,
                    });
                    0
                }
            };
            if let Some(base) = bucket.base.filter(|&base| base < now_ns) {
                let expired = now_ns - base;
                let started_at_head = s == 0;
                let mut exhausted = true;
                while s < bucket.slots.len() {
                    if bucket.slots[s].expired > expired {
                        bucket.cursor = Some(s);
                        exhausted = false;
                        break;
                    }
                    if bucket.slots[s].prepare(now, ctx) {
                        bucket.cursor = (s + 1 < bucket.slots.len()).then_some(s + 1);
                        self.current = b;
                        return Some((b, s));
                    }
                    s += 1;
                }
                if exhausted {
                    if started_at_head {
                        bucket.base = None;
                    }
                    bucket.cursor = None;
                }
            }
            b = (b + 1) % n;
            if b == start {
                return None;
            }
        }
    }

    /// One send opportunity; returns the number of frames sent.
    pub fn poll(&mut self, now: Timestamp, egress: &mut dyn Egress, ctx: &SendContext<'_>) -> usize {
        self.drain_inbox();
        let max_burst = usize::from(ctx.traffic.max_burst.max(1));
        let mut sent = 0;
        while sent < max_burst {
            let Some((b, s)) = self.next_due(now, ctx) else {
                break;
            };
            let slot = &mut self.buckets[b].slots[s];
            let Some(packet) = slot.buffer.packet() else {
                continue;
            };
            match egress.send(&self.handle.interface, &packet.bytes) {
                Ok(()) => {
                    slot.stream.counters.tx_packets.fetch_add(1, Ordering::Relaxed);
                    slot.flow_seq += 1;
                    sent += 1;
                }
                Err(err) => {
                    self.buckets[b].cursor = Some(s);
                    self.current = b;
                    self.handle.send_errors.fetch_add(1, Ordering::Relaxed);
                    counter!("stream_send_errors_total", "interface" => self.handle.interface.clone())
                        .increment(1);
                    log_debug!(
                        ctx.logger,
                        Facility::Scheduler,
                        "send on {} channel {} failed: {}",
                        self.handle.interface,
                        self.handle.index,
                        err
                    );
                    break;
                }
            }
        }
        if sent > 0 {
            self.handle
                .packets_sent
                .fetch_add(sent as u64, Ordering::Relaxed);
        }
        sent
    }

    /// Forget pacing state so the next poll starts fresh rounds.
    pub fn stop(&mut self) {
        for bucket in &mut self.buckets {
            bucket.base = None;
            bucket.cursor = None;
            for slot in &mut bucket.slots {
                slot.wait_start = None;
            }
        }
        self.current = 0;
    }
}
