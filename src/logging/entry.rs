// SPDX-License-Identifier: Apache-2.0 OR MIT
// Fixed-size log entry, copied by value into the ring slots

use super::{Facility, Severity};
use std::sync::OnceLock;
use std::time::Instant;

const KEY_CAP: usize = 10;
const VALUE_CAP: usize = 20;
pub(crate) const MESSAGE_CAP: usize = 144;

/// Short key/value pair, e.g. `flow=42` or `iface=eth1`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct KeyValue {
    key_len: u8,
    value_len: u8,
    key: [u8; KEY_CAP],
    value: [u8; VALUE_CAP],
}

impl KeyValue {
    pub const fn empty() -> Self {
        Self {
            key_len: 0,
            value_len: 0,
            key: [0; KEY_CAP],
            value: [0; VALUE_CAP],
        }
    }

    pub fn new(key: &str, value: &str) -> Self {
        let mut kv = Self::empty();
        kv.key_len = copy_truncated(&mut kv.key, key) as u8;
        kv.value_len = copy_truncated(&mut kv.value, value) as u8;
        kv
    }

    pub fn key(&self) -> &str {
        std::str::from_utf8(&self.key[..self.key_len as usize]).unwrap_or("")
    }

    pub fn value(&self) -> &str {
        std::str::from_utf8(&self.value[..self.value_len as usize]).unwrap_or("")
    }
}

impl std::fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key(), self.value())
    }
}

/// One log record, 256 bytes.
///
/// Messages longer than the inline capacity are cut at a character
/// boundary.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct LogEntry {
    pub severity: Severity,
    pub facility: Facility,
    message_len: u8,
    kv_count: u8,
    pub timestamp_ns: u64,
    pub sequence: u64,
    /// Flow the message refers to, 0 when not flow specific
    pub flow_id: u64,
    message: [u8; MESSAGE_CAP],
    kvs: [KeyValue; 2],
}

impl LogEntry {
    pub fn new(severity: Severity, facility: Facility, message: &str) -> Self {
        let mut entry = Self {
            severity,
            facility,
            timestamp_ns: monotonic_nanos(),
            ..Default::default()
        };
        entry.message_len = copy_truncated(&mut entry.message, message) as u8;
        entry
    }

    pub fn with_flow(mut self, flow_id: u64) -> Self {
        self.flow_id = flow_id;
        self
    }

    pub fn message(&self) -> &str {
        std::str::from_utf8(&self.message[..self.message_len as usize]).unwrap_or("")
    }

    /// Add a key-value pair; pairs beyond the second are dropped
    pub fn add_kv(&mut self, key: &str, value: &str) {
        if let Some(slot) = self.kvs.get_mut(self.kv_count as usize) {
            *slot = KeyValue::new(key, value);
            self.kv_count += 1;
        }
    }

    pub fn kvs(&self) -> &[KeyValue] {
        &self.kvs[..self.kv_count as usize]
    }
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            severity: Severity::Info,
            facility: Facility::Unknown,
            message_len: 0,
            kv_count: 0,
            timestamp_ns: 0,
            sequence: 0,
            flow_id: 0,
            message: [0; MESSAGE_CAP],
            kvs: [KeyValue::empty(); 2],
        }
    }
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("LogEntry");
        debug
            .field("severity", &self.severity)
            .field("facility", &self.facility)
            .field("message", &self.message());
        if self.flow_id != 0 {
            debug.field("flow_id", &self.flow_id);
        }
        if self.kv_count > 0 {
            debug.field("kvs", &self.kvs());
        }
        debug.finish()
    }
}

/// Copy as much of `text` as fits, never splitting a UTF-8 sequence.
fn copy_truncated(dst: &mut [u8], text: &str) -> usize {
    let mut len = text.len().min(dst.len());
    while !text.is_char_boundary(len) {
        len -= 1;
    }
    dst[..len].copy_from_slice(&text.as_bytes()[..len]);
    len
}

fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
