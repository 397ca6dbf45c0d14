// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logger handles and the per-facility ring registry

use super::entry::LogEntry;
use super::ringbuffer::MPSCRingBuffer;
use super::{Facility, Severity};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

/// Destination for finished log entries
pub trait RingBuffer: Send + Sync {
    fn write(&self, entry: LogEntry);
}

impl RingBuffer for MPSCRingBuffer {
    fn write(&self, entry: LogEntry) {
        MPSCRingBuffer::write(self, entry);
    }
}

/// Writes one JSON object per entry straight to stderr.
pub struct StderrJsonLogger;

impl RingBuffer for StderrJsonLogger {
    fn write(&self, entry: LogEntry) {
        let mut line = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "level": entry.severity.as_str(),
            "facility": entry.facility.as_str(),
            "message": entry.message(),
        });
        if entry.flow_id != 0 {
            line["flow-id"] = entry.flow_id.into();
        }
        for kv in entry.kvs() {
            line[kv.key()] = kv.value().into();
        }
        eprintln!("{line}");
    }
}

#[derive(Clone)]
struct Levels {
    global: Arc<AtomicU8>,
    facilities: Arc<RwLock<HashMap<Facility, Severity>>>,
}

impl Levels {
    fn new(global: Severity) -> Self {
        Self {
            global: Arc::new(AtomicU8::new(global as u8)),
            facilities: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn allows(&self, severity: Severity, facility: Facility) -> bool {
        if let Ok(levels) = self.facilities.read() {
            if let Some(&min) = levels.get(&facility) {
                return severity <= min;
            }
        }
        severity.as_u8() <= self.global.load(Ordering::Relaxed)
    }
}

/// Cheap cloneable logging handle.
///
/// Entries are routed to the ring of their facility; facilities without a
/// ring of their own go to the fallback sink.
#[derive(Clone)]
pub struct Logger {
    rings: Arc<HashMap<Facility, Arc<dyn RingBuffer>>>,
    fallback: Arc<dyn RingBuffer>,
    levels: Levels,
}

impl Logger {
    /// Logger writing every facility into a single sink
    pub fn from_ring(ring: Arc<dyn RingBuffer>) -> Self {
        Self {
            rings: Arc::new(HashMap::new()),
            fallback: ring,
            levels: Levels::new(Severity::Info),
        }
    }

    /// Logger writing JSON lines directly to stderr (no consumer task needed)
    pub fn stderr_json() -> Self {
        Self::from_ring(Arc::new(StderrJsonLogger))
    }

    #[inline]
    pub fn enabled(&self, severity: Severity, facility: Facility) -> bool {
        self.levels.allows(severity, facility)
    }

    #[inline]
    fn sink(&self, facility: Facility) -> &Arc<dyn RingBuffer> {
        self.rings.get(&facility).unwrap_or(&self.fallback)
    }

    #[inline]
    pub fn log(&self, severity: Severity, facility: Facility, message: &str) {
        if self.enabled(severity, facility) {
            self.sink(facility)
                .write(LogEntry::new(severity, facility, message));
        }
    }

    /// Log a message about one flow
    #[inline]
    pub fn log_flow(&self, severity: Severity, facility: Facility, flow_id: u64, message: &str) {
        if self.enabled(severity, facility) {
            self.sink(facility)
                .write(LogEntry::new(severity, facility, message).with_flow(flow_id));
        }
    }

    pub fn log_kv(
        &self,
        severity: Severity,
        facility: Facility,
        message: &str,
        kvs: &[(&str, &str)],
    ) {
        if !self.enabled(severity, facility) {
            return;
        }
        let mut entry = LogEntry::new(severity, facility, message);
        for (key, value) in kvs {
            entry.add_kv(key, value);
        }
        self.sink(facility).write(entry);
    }

    pub fn critical(&self, facility: Facility, message: &str) {
        self.log(Severity::Critical, facility, message);
    }

    pub fn error(&self, facility: Facility, message: &str) {
        self.log(Severity::Error, facility, message);
    }

    pub fn warning(&self, facility: Facility, message: &str) {
        self.log(Severity::Warning, facility, message);
    }

    pub fn notice(&self, facility: Facility, message: &str) {
        self.log(Severity::Notice, facility, message);
    }

    pub fn info(&self, facility: Facility, message: &str) {
        self.log(Severity::Info, facility, message);
    }

    pub fn debug(&self, facility: Facility, message: &str) {
        self.log(Severity::Debug, facility, message);
    }

    pub fn set_global_level(&self, level: Severity) {
        self.levels.global.store(level as u8, Ordering::Relaxed);
    }

    pub fn set_facility_level(&self, facility: Facility, level: Severity) {
        if let Ok(mut levels) = self.levels.facilities.write() {
            levels.insert(facility, level);
        }
    }

    pub fn clear_facility_level(&self, facility: Facility) {
        if let Ok(mut levels) = self.levels.facilities.write() {
            levels.remove(&facility);
        }
    }
}

/// Owns one MPSC ring per facility and hands out routing loggers.
pub struct LogRegistry {
    rings: Vec<(Facility, Arc<MPSCRingBuffer>)>,
    logger: Logger,
}

impl LogRegistry {
    pub fn new_mpsc() -> Self {
        let rings: Vec<(Facility, Arc<MPSCRingBuffer>)> = Facility::ALL
            .iter()
            .map(|&facility| (facility, Arc::new(MPSCRingBuffer::new(facility.buffer_size()))))
            .collect();
        let routes = rings
            .iter()
            .map(|(facility, ring)| (*facility, Arc::clone(ring) as Arc<dyn RingBuffer>))
            .collect();
        let fallback: Arc<dyn RingBuffer> = Arc::new(MPSCRingBuffer::new(Facility::Unknown.buffer_size()));
        Self {
            logger: Logger {
                rings: Arc::new(routes),
                fallback,
                levels: Levels::new(Severity::Info),
            },
            rings,
        }
    }

    pub fn logger(&self) -> Logger {
        self.logger.clone()
    }

    pub fn set_global_level(&self, level: Severity) {
        self.logger.set_global_level(level);
    }

    pub fn global_level(&self) -> Severity {
        Severity::from_u8(self.logger.levels.global.load(Ordering::Relaxed)).unwrap_or(Severity::Info)
    }

    pub fn set_facility_level(&self, facility: Facility, level: Severity) {
        self.logger.set_facility_level(facility, level);
    }

    /// Rings for the consumer task
    pub fn export_mpsc_ringbuffers(&self) -> Vec<(Facility, Arc<MPSCRingBuffer>)> {
        self.rings
            .iter()
            .map(|(facility, ring)| (*facility, Arc::clone(ring)))
            .collect()
    }
}
