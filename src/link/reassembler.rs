//! Stream reassembly: rebuilds logical messages from ordered fragments.
//!
//! Each stream keeps the contiguous prefix received so far plus any
//! out-of-order fragments waiting for the missing piece.  A stream finishes
//! exactly once: either with a [`LogicalMessage`] when its final fragment is
//! reached in order, or with a failure (gap timeout, buffer overflow).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use tokio::time::Instant;

use super::{InboundFrame, LogicalMessage, MessageEvent, StreamId};
use crate::config::LinkConfig;
use crate::error::ChatError;

/// How many finished stream ids are remembered to swallow late frames.
const FINISHED_MEMORY: usize = 1024;

/// Per-stream buffering limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    pub max_fragments: usize,
    pub max_bytes:     usize,
    pub gap_timeout:   Duration,
}

impl ReassemblyLimits {
    pub fn from_config(cfg: &LinkConfig) -> Self {
        Self {
            max_fragments: cfg.max_fragments_per_stream,
            max_bytes:     cfg.max_stream_bytes,
            gap_timeout:   cfg.gap_timeout,
        }
    }
}

#[derive(Debug, Default)]
struct StreamBuffer {
    /// Next sequence number that extends the contiguous prefix.
    expected:  u64,
    fragments: Vec<String>,
    pending:   BTreeMap<u64, (String, bool)>,
    bytes:     usize,
    final_seq: Option<u64>,
    /// When the current gap opened.
    gap_since: Option<Instant>,
}

impl StreamBuffer {
    fn fragment_count(&self) -> usize {
        self.fragments.len() + self.pending.len()
    }

    /// Move pending fragments onto the prefix while they are contiguous.
    /// Returns true once the final fragment has been appended.
    fn drain_pending(&mut self) -> bool {
        while let Some((fragment, is_final)) = self.pending.remove(&self.expected) {
            self.fragments.push(fragment);
            self.expected += 1;
            if is_final {
                return true;
            }
        }
        false
    }
}

#[derive(Debug)]
pub struct Reassembler {
    limits:         ReassemblyLimits,
    streams:        HashMap<StreamId, StreamBuffer>,
    finished:       HashSet<StreamId>,
    finished_order: VecDeque<StreamId>,
}

impl Reassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            limits,
            streams:        HashMap::new(),
            finished:       HashSet::new(),
            finished_order: VecDeque::new(),
        }
    }

    /// Feed one frame.  Returns an event when the frame completes or fails
    /// its stream.
    pub fn accept(&mut self, frame: InboundFrame, now: Instant) -> Option<MessageEvent> {
        let InboundFrame { stream_id, sequence, fragment, is_final } = frame;

        if self.finished.contains(&stream_id) {
            debug!("reassembler: late frame {sequence} for finished stream {stream_id}, dropped");
            return None;
        }

        let limits = self.limits;
        let buf = self.streams.entry(stream_id.clone()).or_default();

        if sequence < buf.expected || buf.pending.contains_key(&sequence) {
            debug!("reassembler: duplicate frame {sequence} for stream {stream_id}, dropped");
            return None;
        }
        if buf.final_seq.is_some_and(|f| sequence > f) {
            debug!("reassembler: frame {sequence} past final for stream {stream_id}, dropped");
            return None;
        }

        if buf.fragment_count() + 1 > limits.max_fragments {
            let limit = format!("{} fragments", limits.max_fragments);
            return Some(self.fail(stream_id.clone(), ChatError::BufferOverflow { stream_id, limit }));
        }
        if buf.bytes + fragment.len() > limits.max_bytes {
            let limit = format!("{} bytes", limits.max_bytes);
            return Some(self.fail(stream_id.clone(), ChatError::BufferOverflow { stream_id, limit }));
        }

        buf.bytes += fragment.len();
        if is_final {
            buf.final_seq = Some(sequence);
        }

        if sequence > buf.expected {
            buf.pending.insert(sequence, (fragment, is_final));
            buf.gap_since.get_or_insert(now);
            debug!("reassembler: stream {stream_id} waiting for {} (got {sequence})", buf.expected);
            return None;
        }

        buf.fragments.push(fragment);
        buf.expected += 1;
        let done = is_final || buf.drain_pending();
        if done {
            return Some(self.complete(stream_id));
        }
        // Progress made; any remaining gap is a new one.
        buf.gap_since = if buf.pending.is_empty() { None } else { Some(now) };
        None
    }

    /// Fail every stream whose gap has been open for at least the gap timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<MessageEvent> {
        let timeout = self.limits.gap_timeout;
        let mut expired: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, b)| b.gap_since.is_some_and(|t| now.duration_since(t) >= timeout))
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();

        expired
            .into_iter()
            .map(|stream_id| {
                let err = ChatError::GapTimeout { stream_id: stream_id.clone(), waited: timeout };
                self.fail(stream_id, err)
            })
            .collect()
    }

    /// Earliest instant at which [`expire`](Self::expire) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.streams
            .values()
            .filter_map(|b| b.gap_since)
            .min()
            .map(|t| t + self.limits.gap_timeout)
    }

    /// Streams with buffered, unfinished data.
    pub fn active_stream_ids(&self) -> impl Iterator<Item = &StreamId> {
        self.streams.keys()
    }

    /// Drop all partial streams (session teardown).
    pub fn clear(&mut self) {
        self.streams.clear();
        self.finished.clear();
        self.finished_order.clear();
    }

    fn complete(&mut self, stream_id: StreamId) -> MessageEvent {
        let buf = self.streams.remove(&stream_id).unwrap_or_default();
        self.remember(stream_id.clone());
        debug!("reassembler: stream {stream_id} complete ({} fragments)", buf.fragments.len());
        MessageEvent::Complete(LogicalMessage {
            stream_id,
            content:      buf.fragments.concat(),
            completed_at: Utc::now(),
        })
    }

    fn fail(&mut self, stream_id: StreamId, error: ChatError) -> MessageEvent {
        self.streams.remove(&stream_id);
        self.remember(stream_id.clone());
        warn!("reassembler: {error}");
        MessageEvent::Failed { stream_id, error }
    }

    fn remember(&mut self, stream_id: StreamId) {
        if self.finished.insert(stream_id.clone()) {
            self.finished_order.push_back(stream_id);
        }
        while self.finished_order.len() > FINISHED_MEMORY {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }
}
