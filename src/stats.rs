// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Aggregate traffic counters fed by stream group rollups.
//!
//! Streams never touch these directly; the periodic rollup folds each
//! stream's counter deltas into the interface, session and tunnel scopes
//! it belongs to and mirrors them into `metrics` counters.

use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::packet::SubType;

/// Samples kept by [`RateEstimator`]
pub const RATE_SAMPLES: usize = 5;

/// Moving average over the last five per-interval deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateEstimator {
    samples: [u64; RATE_SAMPLES],
    next: usize,
    filled: usize,
    last_value: u64,
    pub avg: u64,
    pub avg_max: u64,
}

impl RateEstimator {
    /// Feed the current value of a monotonically increasing counter.
    pub fn update(&mut self, value: u64) {
        let delta = value.saturating_sub(self.last_value);
        self.last_value = value;
        self.samples[self.next] = delta;
        self.next = (self.next + 1) % RATE_SAMPLES;
        self.filled = (self.filled + 1).min(RATE_SAMPLES);
        let sum: u64 = self.samples[..self.filled].iter().sum();
        self.avg = sum / self.filled as u64;
        self.avg_max = self.avg_max.max(self.avg);
    }

    pub fn reset_max(&mut self) {
        self.avg_max = 0;
    }
}

/// Per-family session traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FamilyCounters {
    pub ipv4: u64,
    pub ipv6: u64,
    pub ipv6pd: u64,
}

impl FamilyCounters {
    fn add(&mut self, sub_type: SubType, value: u64) {
        match sub_type {
            SubType::Ipv4 => self.ipv4 += value,
            SubType::Ipv6 => self.ipv6 += value,
            SubType::Ipv6pd => self.ipv6pd += value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceStats {
    pub packets_tx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub bytes_rx: u64,
    pub stream_tx: u64,
    pub stream_rx: u64,
    pub stream_loss: u64,
    pub mc_tx: u64,
    pub l2tp_data_tx: u64,
    pub l2tp_data_rx: u64,
    pub session_tx: FamilyCounters,
    pub session_rx: FamilyCounters,
    pub session_loss: FamilyCounters,
    pub session_wrong_session: FamilyCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionStats {
    pub packets_tx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub bytes_rx: u64,
    /// Session traffic flows of this session and how many are verified
    pub session_traffic_flows: u64,
    pub session_traffic_flows_verified: u64,
    #[serde(skip)]
    pub rate_tx: RateEstimator,
    #[serde(skip)]
    pub rate_rx: RateEstimator,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelStats {
    pub data_tx: u64,
    pub data_rx: u64,
    pub data_ipv4_tx: u64,
    pub data_ipv4_rx: u64,
}

/// What a rollup knows about the stream it is folding in
#[derive(Debug, Clone, Copy)]
pub struct FlowScope<'a> {
    pub interface: &'a str,
    pub session_id: Option<u32>,
    pub tunnel_id: Option<u16>,
    pub sub_type: SubType,
    pub session_traffic: bool,
    pub multicast: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Delta {
    pub packets: u64,
    pub bytes: u64,
    pub loss: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct TrafficStats {
    interfaces: Mutex<HashMap<String, InterfaceStats>>,
    sessions: Mutex<HashMap<u32, SessionStats>>,
    tunnels: Mutex<HashMap<u16, TunnelStats>>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tx(&self, scope: FlowScope<'_>, delta: Delta) {
        if delta.packets == 0 {
            return;
        }
        {
            let mut interfaces = lock(&self.interfaces);
            let stats = interfaces.entry(scope.interface.to_string()).or_default();
            stats.packets_tx += delta.packets;
            stats.bytes_tx += delta.bytes;
            stats.stream_tx += delta.packets;
            if scope.multicast {
                stats.mc_tx += delta.packets;
            }
            if scope.tunnel_id.is_some() {
                stats.l2tp_data_tx += delta.packets;
            }
            if scope.session_traffic {
                stats.session_tx.add(scope.sub_type, delta.packets);
            }
        }
        if let Some(id) = scope.session_id {
            let mut sessions = lock(&self.sessions);
            let stats = sessions.entry(id).or_default();
            stats.packets_tx += delta.packets;
            stats.bytes_tx += delta.bytes;
        }
        if let Some(id) = scope.tunnel_id {
            let mut tunnels = lock(&self.tunnels);
            let stats = tunnels.entry(id).or_default();
            stats.data_tx += delta.packets;
            if scope.sub_type == SubType::Ipv4 {
                stats.data_ipv4_tx += delta.packets;
            }
        }
        counter!("stream_tx_packets_total", "interface" => scope.interface.to_string())
            .increment(delta.packets);
    }

    pub fn record_rx(&self, scope: FlowScope<'_>, delta: Delta) {
        if delta.packets == 0 {
            return;
        }
        {
            let mut interfaces = lock(&self.interfaces);
            let stats = interfaces.entry(scope.interface.to_string()).or_default();
            stats.packets_rx += delta.packets;
            stats.bytes_rx += delta.bytes;
            stats.stream_rx += delta.packets;
            stats.stream_loss += delta.loss;
            if scope.tunnel_id.is_some() {
                stats.l2tp_data_rx += delta.packets;
            }
            if scope.session_traffic {
                stats.session_rx.add(scope.sub_type, delta.packets);
                stats.session_loss.add(scope.sub_type, delta.loss);
            }
        }
        if let Some(id) = scope.session_id {
            let mut sessions = lock(&self.sessions);
            let stats = sessions.entry(id).or_default();
            stats.packets_rx += delta.packets;
            stats.bytes_rx += delta.bytes;
        }
        if let Some(id) = scope.tunnel_id {
            let mut tunnels = lock(&self.tunnels);
            let stats = tunnels.entry(id).or_default();
            stats.data_rx += delta.packets;
            if scope.sub_type == SubType::Ipv4 {
                stats.data_ipv4_rx += delta.packets;
            }
        }
        counter!("stream_rx_packets_total", "interface" => scope.interface.to_string())
            .increment(delta.packets);
        counter!("stream_rx_loss_total", "interface" => scope.interface.to_string())
            .increment(delta.loss);
    }

    pub fn record_wrong_session(&self, interface: &str, sub_type: SubType, packets: u64) {
        if packets == 0 {
            return;
        }
        lock(&self.interfaces)
            .entry(interface.to_string())
            .or_default()
            .session_wrong_session
            .add(sub_type, packets);
    }

    pub fn add_session_flow(&self, session_id: u32) {
        lock(&self.sessions)
            .entry(session_id)
            .or_default()
            .session_traffic_flows += 1;
    }

    pub fn add_session_flow_verified(&self, session_id: u32) {
        lock(&self.sessions)
            .entry(session_id)
            .or_default()
            .session_traffic_flows_verified += 1;
    }

    /// Advance per-session rate estimators from their packet totals.
    pub fn update_session_rates(&self) {
        for stats in lock(&self.sessions).values_mut() {
            let (tx, rx) = (stats.packets_tx, stats.packets_rx);
            stats.rate_tx.update(tx);
            stats.rate_rx.update(rx);
        }
    }

    pub fn interface(&self, name: &str) -> Option<InterfaceStats> {
        lock(&self.interfaces).get(name).cloned()
    }

    pub fn session(&self, session_id: u32) -> Option<SessionStats> {
        lock(&self.sessions).get(&session_id).cloned()
    }

    pub fn tunnel(&self, tunnel_id: u16) -> Option<TunnelStats> {
        lock(&self.tunnels).get(&tunnel_id).cloned()
    }

    pub fn interfaces(&self) -> Vec<(String, InterfaceStats)> {
        let mut all: Vec<_> = lock(&self.interfaces)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
