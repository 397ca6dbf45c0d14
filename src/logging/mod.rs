// SPDX-License-Identifier: Apache-2.0 OR MIT
// Lock-free structured logging: per-facility MPSC rings drained by a
// consumer task, or direct JSON lines on stderr.

mod consumer;
mod entry;
mod facility;
mod logger;
#[macro_use]
mod macros;
mod ringbuffer;
mod severity;

pub use consumer::{format_entry, AsyncConsumer, LogSink, StderrSink, StdoutSink, TextSink};
pub use entry::{KeyValue, LogEntry};
pub use facility::Facility;
pub use logger::{LogRegistry, Logger, RingBuffer, StderrJsonLogger};
pub use ringbuffer::MPSCRingBuffer;
pub use severity::Severity;
