//! Outbound queue: FIFO of messages waiting for delivery.
//!
//! Only the head message is ever on the wire.  It stays at the head until the
//! server acknowledges it or its retry budget runs out, so a later message is
//! never sent before an earlier one.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::time::Instant;

use super::MessageId;
use crate::config::LinkConfig;

/// A chat message waiting to be delivered.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id:              MessageId,
    pub payload:         String,
    pub enqueued_at:     DateTime<Utc>,
    pub attempts:        u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Set while a send is awaiting its acknowledgement.
    ack_deadline: Option<Instant>,
    /// Earliest time of the next attempt after a failure.
    retry_at:     Option<Instant>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            id:              MessageId::generate(),
            payload:         payload.into(),
            enqueued_at:     Utc::now(),
            attempts:        0,
            last_attempt_at: None,
            ack_deadline:    None,
            retry_at:        None,
        }
    }

    /// True while a sent copy of this message is awaiting acknowledgement.
    pub fn is_in_flight(&self) -> bool {
        self.ack_deadline.is_some()
    }
}

/// Per-message retry parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before the message is given up.
    pub budget:      u32,
    pub base_delay:  Duration,
    pub max_delay:   Duration,
    pub ack_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &LinkConfig) -> Self {
        Self {
            budget:      cfg.message_retry_budget,
            base_delay:  cfg.message_retry_base,
            max_delay:   cfg.backoff.max_delay,
            ack_timeout: cfg.ack_timeout,
        }
    }

    /// Wait before the attempt following `attempts` failures:
    /// `base_delay * 2^(attempts-1)`, capped at `max_delay`.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift).min(self.max_delay)
    }
}

#[derive(Debug)]
pub struct OutboundQueue {
    policy:   RetryPolicy,
    messages: VecDeque<OutboundMessage>,
}

impl OutboundQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, messages: VecDeque::new() }
    }

    /// Append an already-built message.  A message whose id is already queued
    /// is ignored.
    pub fn push(&mut self, msg: OutboundMessage) {
        if self.messages.iter().any(|m| m.id == msg.id) {
            debug!("queue: {} already queued", msg.id);
            return;
        }
        self.messages.push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.messages.iter()
    }

    /// The head message if it may be sent at `now`.  `None` while the head is
    /// in flight, so a concurrent flush never sends it twice.
    pub fn ready_head(&self, now: Instant) -> Option<&OutboundMessage> {
        let head = self.messages.front()?;
        if head.is_in_flight() {
            debug!("queue: {} in flight, flush skipped", head.id);
            return None;
        }
        match head.retry_at {
            Some(t) if t > now => None,
            _ => Some(head),
        }
    }

    /// Record that the head is being handed to the transport.  Returns a
    /// copy of it with `attempts` naming this send.
    pub fn mark_sent(&mut self, now: Instant) -> Option<OutboundMessage> {
        let ack_timeout = self.policy.ack_timeout;
        let head = self.messages.front_mut()?;
        head.attempts += 1;
        head.last_attempt_at = Some(Utc::now());
        head.ack_deadline = Some(now + ack_timeout);
        head.retry_at = None;
        Some(head.clone())
    }

    /// Remove an acknowledged message.  Unknown ids (duplicate acks) are
    /// ignored.
    pub fn acknowledge(&mut self, id: &MessageId) -> Option<OutboundMessage> {
        let pos = self.messages.iter().position(|m| &m.id == id)?;
        self.messages.remove(pos)
    }

    /// Record a failed attempt of message `id`.  Returns the message when its
    /// budget is exhausted; it has then been removed from the queue.
    pub fn record_failure(&mut self, id: &MessageId, now: Instant) -> Option<OutboundMessage> {
        let pos = self.messages.iter().position(|m| &m.id == id)?;
        let budget = self.policy.budget;
        let msg = &mut self.messages[pos];
        msg.ack_deadline = None;
        if msg.attempts >= budget {
            warn!("queue: {} failed after {} attempts", msg.id, msg.attempts);
            return self.messages.remove(pos);
        }
        let delay = self.policy.delay_after(msg.attempts);
        debug!("queue: {} attempt {} failed, retry in {delay:?}", msg.id, msg.attempts);
        msg.retry_at = Some(now + delay);
        None
    }

    /// A server refusal of message `id`.  Only counts when it answers the
    /// send in flight: a refusal of an earlier attempt, or of a message not
    /// in flight, is stale and ignored.  `attempt: None` means the current one.
    pub fn record_rejection(
        &mut self,
        id:      &MessageId,
        attempt: Option<u32>,
        now:     Instant,
    ) -> Option<OutboundMessage> {
        let msg = self.messages.iter().find(|m| &m.id == id)?;
        let current = msg.is_in_flight() && attempt.map_or(true, |a| a == msg.attempts);
        if !current {
            debug!("queue: stale rejection of {id} (attempt {attempt:?}, now {})", msg.attempts);
            return None;
        }
        self.record_failure(id, now)
    }

    /// Treat an in-flight head whose acknowledgement is overdue as failed.
    pub fn expire_acks(&mut self, now: Instant) -> Option<OutboundMessage> {
        let head = self.messages.front()?;
        match head.ack_deadline {
            Some(deadline) if deadline <= now => {
                let id = head.id.clone();
                self.record_failure(&id, now)
            }
            _ => None,
        }
    }

    /// The transport carrying the in-flight head went away.  Counts as a
    /// failed attempt.
    pub fn abandon_in_flight(&mut self, now: Instant) -> Option<OutboundMessage> {
        let head = self.messages.front()?;
        if !head.is_in_flight() {
            return None;
        }
        let id = head.id.clone();
        self.record_failure(&id, now)
    }

    /// A fresh transport is ready: pending retries may go out immediately.
    pub fn clear_retry_timers(&mut self) {
        for m in &mut self.messages {
            m.retry_at = None;
        }
    }

    /// Earliest ack deadline or retry time of the head.
    pub fn next_deadline(&self) -> Option<Instant> {
        let head = self.messages.front()?;
        head.ack_deadline.or(head.retry_at)
    }

    /// Remove every message (session teardown).
    pub fn drain(&mut self) -> Vec<OutboundMessage> {
        self.messages.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(q: &mut OutboundQueue, payload: &str) -> MessageId {
        let msg = OutboundMessage::new(payload);
        let id = msg.id.clone();
        q.push(msg);
        id
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            budget:      3,
            base_delay:  Duration::from_secs(1),
            max_delay:   Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn fifo_order_and_unique_ids() {
        let mut q = OutboundQueue::new(policy());
        let a = enqueue(&mut q, "a");
        let b = enqueue(&mut q, "b");
        assert_ne!(a, b);
        let order: Vec<_> = q.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
        assert_eq!(q.ready_head(Instant::now()).unwrap().id, a);
    }

    #[test]
    fn in_flight_head_is_not_sent_twice() {
        let mut q = OutboundQueue::new(policy());
        let now = Instant::now();
        enqueue(&mut q, "hi");
        assert!(q.ready_head(now).is_some());
        q.mark_sent(now);
        assert!(q.ready_head(now).is_none());
        assert_eq!(q.iter().next().unwrap().attempts, 1);
        assert!(q.iter().next().unwrap().last_attempt_at.is_some());
    }

    #[test]
    fn ack_removes_message() {
        let mut q = OutboundQueue::new(policy());
        let now = Instant::now();
        let id = enqueue(&mut q, "hi");
        q.mark_sent(now);
        assert_eq!(q.acknowledge(&id).unwrap().payload, "hi");
        assert!(q.is_empty());
        assert!(q.acknowledge(&id).is_none());
    }

    #[test]
    fn failure_backs_off_then_exhausts() {
        let mut q = OutboundQueue::new(policy());
        let now = Instant::now();
        let id = enqueue(&mut q, "hi");
        enqueue(&mut q, "next");

        q.mark_sent(now);
        assert!(q.record_failure(&id, now).is_none());
        assert!(q.ready_head(now).is_none());
        assert_eq!(q.next_deadline(), Some(now + Duration::from_secs(1)));
        let t1 = now + Duration::from_secs(1);
        assert_eq!(q.ready_head(t1).unwrap().id, id);

        q.mark_sent(t1);
        assert!(q.record_failure(&id, t1).is_none());
        assert_eq!(q.next_deadline(), Some(t1 + Duration::from_secs(2)));

        let t2 = t1 + Duration::from_secs(2);
        q.mark_sent(t2);
        let dead = q.record_failure(&id, t2).unwrap();
        assert_eq!(dead.attempts, 3);
        // The next distinct message is not blocked.
        assert_eq!(q.ready_head(t2).unwrap().payload, "next");
    }

    #[test]
    fn overdue_ack_counts_as_failure() {
        let mut q = OutboundQueue::new(policy());
        let now = Instant::now();
        enqueue(&mut q, "hi");
        q.mark_sent(now);
        assert!(q.expire_acks(now + Duration::from_secs(9)).is_none());
        assert!(q.iter().next().unwrap().is_in_flight());
        assert!(q.expire_acks(now + Duration::from_secs(10)).is_none());
        assert!(!q.iter().next().unwrap().is_in_flight());
    }

    #[test]
    fn abandon_only_touches_in_flight_head() {
        let mut q = OutboundQueue::new(policy());
        let now = Instant::now();
        enqueue(&mut q, "hi");
        assert!(q.abandon_in_flight(now).is_none());
        assert_eq!(q.iter().next().unwrap().attempts, 0);
        q.mark_sent(now);
        q.abandon_in_flight(now);
        assert!(!q.iter().next().unwrap().is_in_flight());
        q.clear_retry_timers();
        assert!(q.ready_head(now).is_some());
    }

    #[test]
    fn duplicate_push_is_ignored() {
        let mut q = OutboundQueue::new(policy());
        let msg = OutboundMessage::new("hi");
        q.push(msg.clone());
        q.push(msg);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn retry_delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_after(1), Duration::from_secs(1));
        assert_eq!(p.delay_after(3), Duration::from_secs(4));
        assert_eq!(p.delay_after(40), Duration::from_secs(30));
    }

    #[test]
    fn stale_rejection_does_not_touch_current_attempt() {
        let mut q = OutboundQueue::new(policy());
        let now = Instant::now();
        let id = enqueue(&mut q, "hi");
        assert_eq!(q.mark_sent(now).unwrap().attempts, 1);
        assert!(q.expire_acks(now + Duration::from_secs(10)).is_none());

        let t1 = now + Duration::from_secs(11);
        assert_eq!(q.mark_sent(t1).unwrap().attempts, 2);
        // The answer to the first send arrives late.
        assert!(q.record_rejection(&id, Some(1), t1).is_none());
        assert!(q.iter().next().unwrap().is_in_flight());
        assert!(q.ready_head(t1).is_none());

        // A refusal of the current send counts.
        assert!(q.record_rejection(&id, Some(2), t1).is_none());
        assert!(!q.iter().next().unwrap().is_in_flight());
        // Nothing in flight: an untagged refusal is stale too.
        assert!(q.record_rejection(&id, None, t1).is_none());
        assert_eq!(q.iter().next().unwrap().attempts, 2);
    }
}
