// SPDX-License-Identifier: Apache-2.0 OR MIT
//! In-process egress backends.
//!
//! Real packet I/O belongs to the interface layer. These backends stand in
//! for it: [`CaptureEgress`] records frames for inspection and
//! [`LoopbackEgress`] feeds every sent frame straight back into the
//! engine's receive path, which is what `streamd simulate` runs on.

use std::collections::{HashMap, HashSet};

use crate::collaborators::{Egress, EgressError};
use crate::engine::StreamEngine;
use crate::packet::header::Timestamp;
use crate::packet::parser::parse_frame;
use crate::stream::{MacCheck, RxPacket, RxVerdict};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EgressStats {
    pub packets_sent: u64,
    pub send_errors: u64,
    pub bytes_sent: u64,
}

impl EgressStats {
    fn sent(&mut self, len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += len as u64;
    }
}

/// Records every frame; optionally refuses once `capacity` frames are held.
#[derive(Debug, Default)]
pub struct CaptureEgress {
    pub frames: Vec<(String, Vec<u8>)>,
    capacity: Option<usize>,
    down: HashSet<String>,
    stats: EgressStats,
}

impl CaptureEgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn set_down(&mut self, interface: &str, down: bool) {
        if down {
            self.down.insert(interface.to_string());
        } else {
            self.down.remove(interface);
        }
    }

    pub fn stats(&self) -> &EgressStats {
        &self.stats
    }

    /// Frames sent on one interface, in order
    pub fn on<'a>(&'a self, interface: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.frames
            .iter()
            .filter(move |(name, _)| name == interface)
            .map(|(_, frame)| frame.as_slice())
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Egress for CaptureEgress {
    fn send(&mut self, interface: &str, frame: &[u8]) -> Result<(), EgressError> {
        if self.down.contains(interface) {
            self.stats.send_errors += 1;
            return Err(EgressError::InterfaceDown(interface.to_string()));
        }
        if self.capacity.is_some_and(|cap| self.frames.len() >= cap) {
            self.stats.send_errors += 1;
            return Err(EgressError::QueueFull(interface.to_string()));
        }
        self.stats.sent(frame.len());
        self.frames.push((interface.to_string(), frame.to_vec()));
        Ok(())
    }
}

/// Delivers sent frames to the engine as if received on a peer interface.
///
/// The peer defaults to the sending interface itself. Destination MACs are
/// not checked since the frame never crossed a wire.
pub struct LoopbackEgress<'a> {
    engine: &'a StreamEngine,
    peers: HashMap<String, String>,
    now: Timestamp,
    stats: EgressStats,
    verdicts: HashMap<&'static str, u64>,
}

impl<'a> LoopbackEgress<'a> {
    pub fn new(engine: &'a StreamEngine) -> Self {
        Self {
            engine,
            peers: HashMap::new(),
            now: Timestamp::ZERO,
            stats: EgressStats::default(),
            verdicts: HashMap::new(),
        }
    }

    /// Frames sent on `tx` are received on `rx`.
    pub fn with_peer(mut self, tx: &str, rx: &str) -> Self {
        self.peers.insert(tx.to_string(), rx.to_string());
        self
    }

    /// Receive timestamp applied to the following frames
    pub fn set_now(&mut self, now: Timestamp) {
        self.now = now;
    }

    pub fn stats(&self) -> &EgressStats {
        &self.stats
    }

    /// Received frames by outcome: accepted, rejected, wrong-session, unmatched
    pub fn verdicts(&self) -> &HashMap<&'static str, u64> {
        &self.verdicts
    }
}

impl Egress for LoopbackEgress<'_> {
    fn send(&mut self, interface: &str, frame: &[u8]) -> Result<(), EgressError> {
        self.stats.sent(frame.len());
        let rx_interface = self
            .peers
            .get(interface)
            .map_or(interface, String::as_str);
        let outcome = match parse_frame(frame) {
            Ok(parsed) => match parsed.test_header {
                Some(header) => {
                    let packet = RxPacket {
                        frame: &parsed,
                        header: &header,
                        interface: rx_interface,
                        timestamp: self.now,
                    };
                    match self.engine.rx(&packet, MacCheck::Skip) {
                        Some(RxVerdict::Accepted { .. }) => "accepted",
                        Some(RxVerdict::Rejected(_)) => "rejected",
                        Some(RxVerdict::WrongSession) => "wrong-session",
                        None => "unmatched",
                    }
                }
                None => "unmatched",
            },
            Err(_) => "unmatched",
        };
        *self.verdicts.entry(outcome).or_default() += 1;
        Ok(())
    }
}
