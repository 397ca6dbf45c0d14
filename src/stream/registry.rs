// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Dense flow-id indexed store of every stream.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{lock, Stream};

/// Flow ids start at 1 and are never reused, so `flow_id - 1` is the slot.
///
/// Lookups read an immutable snapshot and never block. Inserts come from
/// the engine only; each publishes a new snapshot under `writer`. The
/// per-session index serves the control side and keeps its own lock.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: ArcSwap<Vec<Arc<Stream>>>,
    writer: Mutex<()>,
    by_session: RwLock<HashMap<u32, Vec<u64>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next inserted stream must carry
    pub fn next_flow_id(&self) -> u64 {
        self.len() as u64 + 1
    }

    pub fn insert(&self, stream: Stream) -> Arc<Stream> {
        let stream = Arc::new(stream);
        {
            let _writer = lock(&self.writer);
            let current = self.streams.load();
            debug_assert_eq!(stream.flow_id, current.len() as u64 + 1);
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&stream));
            self.streams.store(Arc::new(next));
        }

        if let Some(session_id) = stream.session_id {
            self.by_session
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .entry(session_id)
                .or_default()
                .push(stream.flow_id);
        }
        stream
    }

    pub fn get(&self, flow_id: u64) -> Option<Arc<Stream>> {
        let index = usize::try_from(flow_id.checked_sub(1)?).ok()?;
        self.streams.load().get(index).cloned()
    }

    /// Snapshot in insertion order
    pub fn all(&self) -> Vec<Arc<Stream>> {
        Vec::clone(&self.streams.load())
    }

    pub fn len(&self) -> usize {
        self.streams.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn session_streams(&self, session_id: u32) -> Vec<Arc<Stream>> {
        let ids = self
            .by_session
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&session_id)
            .cloned()
            .unwrap_or_default();
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn has_session(&self, session_id: u32) -> bool {
        self.by_session
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&session_id)
    }
}
