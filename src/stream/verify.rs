// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Receive-side correlation of test packets with their stream.
//!
//! The first packet of a flow (or the first after a reset) is checked
//! against what the stream expects: MPLS labels, sub-type, direction and
//! the destination MAC or session binding. Once accepted, later packets only
//! feed the sequence accounting. A rejected first packet leaves the stream
//! untouched except for the wrong-session counter.

use std::net::{IpAddr, SocketAddrV4};
use std::sync::atomic::Ordering;

use super::{lock, Stream};
use crate::collaborators::{MacAddr, SessionDirectory, SessionState};
use crate::logging::{Facility, Logger, Severity};
use crate::packet::checksum::{IPPROTO_TCP, IPPROTO_UDP};
use crate::packet::header::{HeaderScope, TestHeader, Timestamp};
use crate::packet::parser::ParsedFrame;

/// How the destination MAC of a first packet is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacCheck {
    /// Routed or looped-back traffic where the MAC carries no meaning
    Skip,
    /// Must match the receiving interface
    Expect(MacAddr),
    /// Must match the client MAC of an established session
    Session,
}

/// One received test packet
#[derive(Debug, Clone, Copy)]
pub struct RxPacket<'a> {
    pub frame: &'a ParsedFrame,
    pub header: &'a TestHeader,
    pub interface: &'a str,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LabelMismatch,
    TypeMismatch,
    MacMismatch,
    SessionDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    Rejected(RejectReason),
    /// Packet of this flow arrived for a different session
    WrongSession,
    Accepted {
        first: bool,
        /// This packet flipped the stream to verified
        newly_verified: bool,
    },
}

/// Settings that apply to every received packet
pub struct RxContext<'a> {
    pub sessions: &'a dyn SessionDirectory,
    pub delay_calc: bool,
    pub logger: &'a Logger,
}

pub fn receive(stream: &Stream, packet: &RxPacket<'_>, check: MacCheck, ctx: &RxContext<'_>) -> RxVerdict {
    let header = packet.header;
    let seq = header.seq;
    let counters = &stream.counters;
    let mut rx = lock(&stream.rx);

    let first = rx.last_seq == 0;
    if !first {
        if seq > rx.last_seq {
            if seq > rx.last_seq + 1 {
                let loss = seq - rx.last_seq - 1;
                counters.rx_loss.fetch_add(loss, Ordering::Relaxed);
                log_flow!(
                    ctx.logger,
                    Severity::Debug,
                    Facility::Loss,
                    stream.flow_id,
                    "LOSS Unicast flow: {} seq: {} last: {} loss: {}",
                    stream.flow_id,
                    seq,
                    rx.last_seq,
                    loss
                );
            }
            rx.last_seq = seq;
            rx.last_epoch = packet.timestamp.sec;
        } else {
            counters.rx_wrong_order.fetch_add(1, Ordering::Relaxed);
        }
    } else {
        let frame = packet.frame;
        let config = &stream.config;
        if config.rx_label1 != 0 {
            let outer = frame.mpls[0].map(|l| l.label);
            if outer != Some(config.rx_label1) {
                return RxVerdict::Rejected(RejectReason::LabelMismatch);
            }
            if config.rx_label2 != 0 && frame.mpls[1].map(|l| l.label) != Some(config.rx_label2) {
                return RxVerdict::Rejected(RejectReason::LabelMismatch);
            }
        }
        if header.sub_type != stream.sub_type || header.direction != stream.direction {
            return RxVerdict::Rejected(RejectReason::TypeMismatch);
        }
        match check {
            MacCheck::Skip => {}
            MacCheck::Expect(mac) => {
                if frame.dst_mac != mac {
                    return RxVerdict::Rejected(RejectReason::MacMismatch);
                }
            }
            MacCheck::Session => {
                let Some(session) = stream.session_id.and_then(|id| ctx.sessions.session(id)) else {
                    return RxVerdict::Rejected(RejectReason::SessionDown);
                };
                if matches!(session.state, SessionState::Idle | SessionState::Terminated) {
                    return RxVerdict::Rejected(RejectReason::SessionDown);
                }
                if frame.dst_mac != session.client_mac {
                    return RxVerdict::Rejected(RejectReason::MacMismatch);
                }
                if stream.session_traffic {
                    let (outer, inner) = match header.scope {
                        HeaderScope::Unicast {
                            outer_vlan,
                            inner_vlan,
                            ..
                        } => (outer_vlan, inner_vlan),
                        HeaderScope::Multicast { .. } => (0, 0),
                    };
                    if outer != session.vlan.outer
                        || inner != session.vlan.inner
                        || header.session_id != session.session_id
                    {
                        counters.rx_wrong_session.fetch_add(1, Ordering::Relaxed);
                        return RxVerdict::WrongSession;
                    }
                }
            }
        }

        rx.len = frame.frame_len;
        rx.tos = frame.network.tos;
        rx.ttl = frame.network.ttl;
        rx.outer_vlan_pbit = frame.outer_vlan().map_or(0, |v| v.priority);
        rx.inner_vlan_pbit = frame.inner_vlan().map_or(0, |v| v.priority);
        rx.mpls = frame.mpls;
        if stream.nat && stream.direction == super::Direction::Up {
            if let IpAddr::V4(src) = frame.network.src {
                if matches!(frame.transport.protocol, IPPROTO_UDP | IPPROTO_TCP) {
                    stream.set_nat_source(SocketAddrV4::new(src, frame.transport.src_port));
                }
            }
        }
        rx.first_seq = seq;
        rx.last_seq = seq;
        rx.first_epoch = packet.timestamp.sec;
        rx.last_epoch = packet.timestamp.sec;
    }
    counters.rx_packets.fetch_add(1, Ordering::Relaxed);

    if ctx.delay_calc {
        let delay_us = (packet.timestamp.nanos_since(header.timestamp) / 1_000).max(1);
        rx.max_delay_us = rx.max_delay_us.max(delay_us);
        if rx.min_delay_us == 0 || delay_us < rx.min_delay_us {
            rx.min_delay_us = delay_us;
        }
    }

    match rx.interface.as_deref() {
        Some(current) if current == packet.interface => {}
        Some(_) if check == MacCheck::Session => {}
        Some(_) => {
            counters.rx_interface_changes.fetch_add(1, Ordering::Relaxed);
            rx.interface_changed_epoch = packet.timestamp.sec;
            rx.interface = Some(packet.interface.to_string());
        }
        None => rx.interface = Some(packet.interface.to_string()),
    }
    drop(rx);

    let newly_verified = first && stream.mark_verified();
    RxVerdict::Accepted {
        first,
        newly_verified,
    }
}
