// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (engine component identifiers)

use serde::{Deserialize, Serialize};

/// Component that produced a log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Setup, session attach, teardown
    Engine = 0,
    /// Packet template construction
    Builder = 1,
    /// Channel send loops and pacing
    Scheduler = 2,
    /// Receive correlation and verification
    Verify = 3,
    /// Sequence gap reports
    Loss = 4,
    /// Group rollups and aggregates
    Stats = 5,
    /// Control command handling
    Control = 6,
    /// Configuration loading
    Config = 7,
    Test = 12,
    Unknown = 255,
}

impl Facility {
    pub const ALL: [Facility; 9] = [
        Facility::Engine,
        Facility::Builder,
        Facility::Scheduler,
        Facility::Verify,
        Facility::Loss,
        Facility::Stats,
        Facility::Control,
        Facility::Config,
        Facility::Test,
    ];

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Engine => "Engine",
            Facility::Builder => "Builder",
            Facility::Scheduler => "Scheduler",
            Facility::Verify => "Verify",
            Facility::Loss => "Loss",
            Facility::Stats => "Stats",
            Facility::Control => "Control",
            Facility::Config => "Config",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::Engine,
            1 => Facility::Builder,
            2 => Facility::Scheduler,
            3 => Facility::Verify,
            4 => Facility::Loss,
            5 => Facility::Stats,
            6 => Facility::Control,
            7 => Facility::Config,
            12 => Facility::Test,
            _ => Facility::Unknown,
        }
    }

    /// Facilities written from the per-packet paths
    pub const fn is_high_frequency(self) -> bool {
        matches!(self, Facility::Verify | Facility::Loss | Facility::Scheduler)
    }

    /// Ring capacity in entries (power of two)
    pub const fn buffer_size(self) -> usize {
        match self {
            Facility::Loss => 8192,
            Facility::Verify => 4096,
            Facility::Scheduler | Facility::Builder => 2048,
            Facility::Engine => 1024,
            _ => 512,
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
