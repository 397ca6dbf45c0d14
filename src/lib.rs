// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Test traffic stream engine.
//!
//! Streams are created from configuration templates (raw network flows,
//! per-session flows, session traffic and autogenerated multicast), paced
//! onto output channels by phase-offset buckets, and correlated on receive
//! through an embedded test header carrying flow id, sequence and send time.
//! Sessions, interfaces, label lookup and raw packet I/O are consumed
//! through the traits in [`collaborators`]; [`directory`] provides an
//! in-memory implementation driven by the configuration file.

#[macro_use]
pub mod logging;

pub mod collaborators;
pub mod config;
pub mod control;
pub mod directory;
pub mod egress;
pub mod engine;
pub mod metrics;
pub mod packet;
pub mod scheduler;
pub mod stats;
pub mod stream;
pub mod validation;

pub use config::Config;
pub use control::{handle_stream_command, ControlRequest, ControlResponse};
pub use engine::{SetupError, StreamEngine};
pub use scheduler::Channel;
