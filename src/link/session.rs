//! Session state owned by the supervisor.
//!
//! A `Session` lives from the first `connect()`/`submit()` until `close()`.
//! The outbound queue and the reassembler are fields of it; nothing else
//! holds a copy.

use std::collections::HashSet;

use tokio::time::Instant;
use uuid::Uuid;

use super::queue::{OutboundQueue, RetryPolicy};
use super::reassembler::{Reassembler, ReassemblyLimits};
use super::StreamId;
use crate::config::LinkConfig;

#[derive(Debug)]
pub struct Session {
    pub session_id:  Uuid,
    pub queue:       OutboundQueue,
    pub reassembler: Reassembler,
    /// Last cursor reported by a polling transport; the next one resumes there.
    pub poll_cursor: u64,
}

impl Session {
    pub fn new(cfg: &LinkConfig) -> Self {
        Session {
            session_id:  Uuid::new_v4(),
            queue:       OutboundQueue::new(RetryPolicy::from_config(cfg)),
            reassembler: Reassembler::new(ReassemblyLimits::from_config(cfg)),
            poll_cursor: 0,
        }
    }

    /// Streams with partially received content.
    pub fn active_stream_ids(&self) -> HashSet<StreamId> {
        self.reassembler.active_stream_ids().cloned().collect()
    }

    /// Earliest timer owned by the session (gap, ack or retry deadline).
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.reassembler.next_deadline(), self.queue.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b)             => a.or(b),
        }
    }
}
