// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Rollup groups: streams of equal rate folded into the aggregates together.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::Stream;
use crate::stats::TrafficStats;

/// Streams per group before a new group with the same rate is opened
pub const MAX_GROUP_STREAMS: usize = 256;

#[derive(Debug)]
pub struct StreamGroup {
    pub pps: f64,
    streams: RwLock<Vec<Arc<Stream>>>,
}

impl StreamGroup {
    fn new(pps: f64) -> Self {
        Self {
            pps,
            streams: RwLock::new(Vec::new()),
        }
    }

    /// One second, or one packet interval for sub-1 pps groups
    pub fn interval(&self) -> Duration {
        if self.pps > 0.0 && self.pps < 1.0 {
            Duration::from_secs_f64(1.0 / self.pps)
        } else {
            Duration::from_secs(1)
        }
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_push(&self, stream: &Arc<Stream>) -> bool {
        let mut streams = self.streams.write().unwrap_or_else(|p| p.into_inner());
        if streams.len() >= MAX_GROUP_STREAMS {
            return false;
        }
        streams.push(Arc::clone(stream));
        true
    }

    pub fn tick(&self, stats: &TrafficStats, rate_calc: bool) {
        let streams = self.streams.read().unwrap_or_else(|p| p.into_inner()).clone();
        for stream in streams {
            stream.rollup(stats, rate_calc);
        }
    }
}

#[derive(Debug, Default)]
pub struct GroupSet {
    groups: Vec<Arc<StreamGroup>>,
}

impl GroupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a stream; the flag is set when a new group was opened for it.
    pub fn add(&mut self, stream: &Arc<Stream>) -> (Arc<StreamGroup>, bool) {
        for group in &self.groups {
            if group.pps == stream.pps && group.try_push(stream) {
                return (Arc::clone(group), false);
            }
        }
        let group = Arc::new(StreamGroup::new(stream.pps));
        group.try_push(stream);
        self.groups.push(Arc::clone(&group));
        (group, true)
    }

    pub fn groups(&self) -> &[Arc<StreamGroup>] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
