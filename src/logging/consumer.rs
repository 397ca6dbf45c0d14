// SPDX-License-Identifier: Apache-2.0 OR MIT
// Consumers draining facility rings into output sinks

use super::entry::LogEntry;
use super::ringbuffer::MPSCRingBuffer;
use super::Facility;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub trait LogSink: Send {
    fn write_entry(&mut self, entry: &LogEntry);
    fn flush(&mut self);
}

/// Plain-text sink: `[LEVEL] [Facility] message flow=N key=value`
pub struct TextSink<W: Write + Send> {
    out: W,
}

pub type StdoutSink = TextSink<std::io::Stdout>;
pub type StderrSink = TextSink<std::io::Stderr>;

impl<W: Write + Send> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl StdoutSink {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl StderrSink {
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

/// Render an entry the way the text sinks print it
pub fn format_entry(entry: &LogEntry) -> String {
    let mut line = format!(
        "[{}] [{}] {}",
        entry.severity,
        entry.facility.as_str(),
        entry.message()
    );
    if entry.flow_id != 0 {
        line.push_str(&format!(" flow={}", entry.flow_id));
    }
    for kv in entry.kvs() {
        line.push_str(&format!(" {kv:?}"));
    }
    line
}

impl<W: Write + Send> LogSink for TextSink<W> {
    fn write_entry(&mut self, entry: &LogEntry) {
        let _ = writeln!(self.out, "{}", format_entry(entry));
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
    }
}

/// Tokio task that polls every facility ring and forwards to a sink
pub struct AsyncConsumer {
    ringbuffers: Vec<(Facility, Arc<MPSCRingBuffer>)>,
    sink: Box<dyn LogSink>,
    running: Arc<AtomicBool>,
}

impl AsyncConsumer {
    pub fn new(ringbuffers: Vec<(Facility, Arc<MPSCRingBuffer>)>, sink: Box<dyn LogSink>) -> Self {
        Self {
            ringbuffers,
            sink,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stderr(ringbuffers: Vec<(Facility, Arc<MPSCRingBuffer>)>) -> Self {
        Self::new(ringbuffers, Box::new(StderrSink::stderr()))
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Drain everything currently readable; returns the number of entries
    pub fn drain_once(&mut self) -> usize {
        let mut count = 0;
        for (_, ring) in &self.ringbuffers {
            while let Some(entry) = ring.read() {
                self.sink.write_entry(&entry);
                count += 1;
            }
        }
        if count > 0 {
            self.sink.flush();
        }
        count
    }

    pub async fn run(mut self) {
        while self.running.load(Ordering::Relaxed) {
            if self.drain_once() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        self.drain_once();
    }
}
