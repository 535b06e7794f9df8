//! Connection supervisor: the event loop that owns the session.
//!
//! Flow:
//!   1. `connect()` (or the first `submit()`) opens a streaming transport
//!   2. Open failures back off exponentially; after `max_streaming_attempts`
//!      the supervisor falls back to a polling transport (`Degraded`)
//!   3. While degraded, a streaming probe runs every `probe_cooldown`
//!   4. Every transition is published before the queue flush it triggers
//!
//! All state is owned by one task.  Transports report through a channel and
//! every report carries the transport's generation, so anything from a
//! replaced or closed transport is dropped on arrival.  Events of the
//! transport being opened may overtake its open result; they are held until
//! the result arrives.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::queue::OutboundMessage;
use super::session::Session;
use super::transport::{Connector, EventSink, Generation, Transport, TransportEvent};
use super::{ConnectionState, DeliveryReport, MessageEvent, TransportKind};
use crate::backoff::Backoff;
use crate::config::LinkConfig;
use crate::error::{ChatError, Result};

pub type StatusListener   = Box<dyn FnMut(&ConnectionState) + Send>;
pub type MessageListener  = Box<dyn FnMut(&MessageEvent) + Send>;
pub type DeliveryListener = Box<dyn FnMut(&DeliveryReport) + Send>;

/// Requests from the facade, processed in the order sent.
pub enum Command {
    Connect,
    Submit(OutboundMessage),
    Close,
    OnStatus(StatusListener),
    OnMessage(MessageListener),
    OnDelivery(DeliveryListener),
    /// Resolved once no submitted message is waiting for a delivery report.
    WhenIdle(oneshot::Sender<()>),
}

/// Result of a transport open that ran in its own task.
struct Opened {
    generation: Generation,
    transport:  Box<dyn Transport>,
    result:     Result<()>,
}

#[derive(Default)]
struct Listeners {
    status:   Vec<StatusListener>,
    message:  Vec<MessageListener>,
    delivery: Vec<DeliveryListener>,
}

pub struct Supervisor {
    cfg:          Arc<LinkConfig>,
    connector:    Arc<dyn Connector>,
    state:        ConnectionState,
    status_tx:    watch::Sender<ConnectionState>,
    session:      Option<Session>,
    /// Transport kind used for regular (non-probe) attempts.
    mode:         TransportKind,
    probing:      bool,
    active:       Option<Box<dyn Transport>>,
    generation:   Generation,
    opening:      Option<JoinHandle<()>>,
    /// Events of the opening generation received before its open result.
    early:        Vec<TransportEvent>,
    backoff:      Backoff,
    reconnect_at: Option<Instant>,
    probe_at:     Option<Instant>,
    events_tx:    mpsc::UnboundedSender<(Generation, TransportEvent)>,
    opened_tx:    mpsc::UnboundedSender<Opened>,
    listeners:    Listeners,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

/// Channel ends the supervisor loop reads from.
pub struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    events:   mpsc::UnboundedReceiver<(Generation, TransportEvent)>,
    opened:   mpsc::UnboundedReceiver<Opened>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None    => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b)             => a.or(b),
    }
}

impl Supervisor {
    /// Build a supervisor in the `Disconnected` state.  Returns it with the
    /// command sender, the status watch and the inbox to pass to [`run`](Self::run).
    pub fn new(
        cfg:       Arc<LinkConfig>,
        connector: Arc<dyn Connector>,
        backoff:   Backoff,
    ) -> (Self, mpsc::UnboundedSender<Command>, watch::Receiver<ConnectionState>, Inbox) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (opened_tx, opened) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);

        let sup = Supervisor {
            cfg,
            connector,
            state:        ConnectionState::Disconnected,
            status_tx,
            session:      None,
            mode:         TransportKind::Streaming,
            probing:      false,
            active:       None,
            generation:   0,
            opening:      None,
            early:        Vec::new(),
            backoff,
            reconnect_at: None,
            probe_at:     None,
            events_tx,
            opened_tx,
            listeners:    Listeners::default(),
            idle_waiters: Vec::new(),
        };
        (sup, commands_tx, status_rx, Inbox { commands, events, opened })
    }

    /// Run until every command sender is dropped, then tear the session down.
    pub async fn run(mut self, inbox: Inbox) {
        let Inbox { mut commands, mut events, mut opened } = inbox;
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None      => break,
                },
                Some(op) = opened.recv() => self.on_opened(op).await,
                Some((generation, ev)) = events.recv() => self.on_transport_event(generation, ev).await,
                _ = sleep_until_opt(deadline) => self.on_timer(Instant::now()).await,
            }
            self.notify_idle();
        }
        self.close().await;
        debug!("link: supervisor stopped");
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Submit(msg) => {
                debug!("link: queued {}", msg.id);
                self.ensure_session().queue.push(msg);
                if matches!(self.state, ConnectionState::Disconnected | ConnectionState::Failed) {
                    self.connect();
                } else {
                    self.flush().await;
                }
            }
            Command::Close              => self.close().await,
            Command::OnStatus(l)        => self.listeners.status.push(l),
            Command::OnMessage(l)       => self.listeners.message.push(l),
            Command::OnDelivery(l)      => self.listeners.delivery.push(l),
            Command::WhenIdle(tx)       => self.idle_waiters.push(tx),
        }
    }

    fn notify_idle(&mut self) {
        if self.idle_waiters.is_empty() || self.session.as_ref().is_some_and(|s| !s.queue.is_empty()) {
            return;
        }
        for tx in self.idle_waiters.drain(..) {
            let _ = tx.send(());
        }
    }

    fn ensure_session(&mut self) -> &mut Session {
        let cfg = &self.cfg;
        self.session.get_or_insert_with(|| {
            let s = Session::new(cfg);
            info!("link: session {} created", s.session_id);
            s
        })
    }

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.ensure_session();
                self.mode = TransportKind::Streaming;
                self.probing = false;
                self.backoff.reset();
                self.start_attempt();
            }
            other => debug!("link: connect ignored while {other}"),
        }
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Disconnected && self.session.is_none() {
            debug!("link: already closed");
            return;
        }
        self.supersede().await;
        self.reconnect_at = None;
        self.probe_at = None;
        self.probing = false;
        self.mode = TransportKind::Streaming;
        self.backoff.reset();
        self.transition(ConnectionState::Disconnected);

        if let Some(mut session) = self.session.take() {
            let partial = session.active_stream_ids();
            if !partial.is_empty() {
                debug!("link: discarding {} partial stream(s)", partial.len());
            }
            session.reassembler.clear();
            for msg in session.queue.drain() {
                self.publish_delivery(DeliveryReport::Failed { id: msg.id, error: ChatError::SessionClosed });
            }
            info!("link: session {} closed", session.session_id);
        }
    }

    // ── Transitions ───────────────────────────────────────────────────────────

    /// Publish a state change to the watch channel and every status listener.
    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        info!("link: {} -> {}", self.state, next);
        self.state = next;
        self.status_tx.send_replace(next);
        for l in &mut self.listeners.status {
            l(&next);
        }
    }

    /// Abandon any open in progress and close the active transport.  Late
    /// results from either are stale afterwards.
    async fn supersede(&mut self) {
        self.generation += 1;
        self.early.clear();
        if let Some(handle) = self.opening.take() {
            handle.abort();
        }
        if let Some(mut transport) = self.active.take() {
            transport.close().await;
        }
    }

    /// Open a transport of the current kind in a background task.
    fn start_attempt(&mut self) {
        self.reconnect_at = None;
        let kind = if self.probing { TransportKind::Streaming } else { self.mode };
        let session = self.ensure_session();
        let (session_id, poll_cursor) = (session.session_id, session.poll_cursor);
        self.transition(ConnectionState::Connecting(kind));

        self.generation += 1;
        self.early.clear();
        let generation = self.generation;
        let mut transport = self.connector.build(kind, session_id, poll_cursor);
        let sink = EventSink::new(generation, self.events_tx.clone());
        let opened_tx = self.opened_tx.clone();
        let open_timeout = self.cfg.open_timeout;
        debug!("link: opening {kind} transport (generation {generation})");
        self.opening = Some(tokio::spawn(async move {
            let result = match tokio::time::timeout(open_timeout, transport.open(sink)).await {
                Ok(result) => result,
                Err(_)     => Err(ChatError::Transport(format!("open timed out after {open_timeout:?}"))),
            };
            let _ = opened_tx.send(Opened { generation, transport, result });
        }));
    }

    async fn on_opened(&mut self, op: Opened) {
        let Opened { generation, mut transport, result } = op;
        if generation != self.generation || !matches!(self.state, ConnectionState::Connecting(_)) {
            debug!("link: dropping stale open result (generation {generation})");
            transport.close().await;
            return;
        }
        self.opening = None;
        let kind = transport.kind();

        match result {
            Ok(()) => {
                info!("link: {kind} transport open");
                self.active = Some(transport);
                self.backoff.reset();
                match kind {
                    TransportKind::Streaming => {
                        self.mode = TransportKind::Streaming;
                        self.probing = false;
                        self.probe_at = None;
                        self.transition(ConnectionState::Connected);
                    }
                    TransportKind::Polling => {
                        self.probe_at = Some(Instant::now() + self.cfg.probe_cooldown);
                        self.transition(ConnectionState::Degraded);
                    }
                }
                if let Some(session) = self.session.as_mut() {
                    session.queue.clear_retry_timers();
                }
                for ev in std::mem::take(&mut self.early) {
                    if self.active.is_none() {
                        break;
                    }
                    self.dispatch(ev).await;
                }
                self.flush().await;
            }
            Err(e) => {
                self.early.clear();
                warn!("link: {kind} open failed: {e}");
                transport.close().await;
                self.on_open_failed(kind);
            }
        }
    }

    fn on_open_failed(&mut self, kind: TransportKind) {
        if self.probing {
            info!("link: streaming still unavailable, back to polling");
            self.probing = false;
            self.start_attempt();
            return;
        }

        let failures = self.backoff.attempt() + 1;
        match kind {
            TransportKind::Streaming if failures >= self.cfg.max_streaming_attempts => {
                warn!("link: streaming failed {failures} times, falling back to polling");
                self.mode = TransportKind::Polling;
                self.backoff.reset();
                self.start_attempt();
            }
            TransportKind::Polling if failures >= self.cfg.max_polling_attempts => {
                warn!("link: polling failed {failures} times, giving up");
                self.backoff.reset();
                self.reconnect_at = None;
                self.probe_at = None;
                self.transition(ConnectionState::Failed);
            }
            _ => self.schedule_reconnect(),
        }
    }

    fn schedule_reconnect(&mut self) {
        self.transition(ConnectionState::Reconnecting);
        let delay = self.backoff.next_delay();
        info!("link: reconnecting in {delay:?} (attempt {})", self.backoff.attempt());
        self.reconnect_at = Some(Instant::now() + delay);
    }

    /// The active transport went away without `close()` being called.
    async fn on_transport_lost(&mut self, reason: Option<ChatError>) {
        match &reason {
            Some(e) => warn!("link: {} transport lost: {e}", self.mode),
            None    => warn!("link: {} transport closed by server", self.mode),
        }
        self.supersede().await;
        self.probe_at = None;
        self.schedule_reconnect();

        let now = Instant::now();
        let exhausted = self.session.as_mut().and_then(|s| s.queue.abandon_in_flight(now));
        if let Some(msg) = exhausted {
            self.report_exhausted(msg);
        }
    }

    // ── Transport events ──────────────────────────────────────────────────────

    async fn on_transport_event(&mut self, generation: Generation, ev: TransportEvent) {
        if generation != self.generation {
            debug!("link: dropping stale event from generation {generation}");
            return;
        }
        if self.active.is_none() {
            if matches!(self.state, ConnectionState::Connecting(_)) {
                self.early.push(ev);
            } else {
                debug!("link: dropping event of generation {generation}, no transport");
            }
            return;
        }
        self.dispatch(ev).await;
    }

    /// Handle an event of the active transport.
    async fn dispatch(&mut self, ev: TransportEvent) {
        let now = Instant::now();
        match ev {
            TransportEvent::Frame(frame) => {
                let done = self.session.as_mut().and_then(|s| s.reassembler.accept(frame, now));
                if let Some(ev) = done {
                    self.publish_message(ev);
                }
            }
            TransportEvent::Ack(id) => {
                let acked = self.session.as_mut().and_then(|s| s.queue.acknowledge(&id));
                match acked {
                    Some(_) => {
                        debug!("link: {id} delivered");
                        self.publish_delivery(DeliveryReport::Delivered(id));
                        self.flush().await;
                    }
                    None => debug!("link: duplicate ack for {id}"),
                }
            }
            TransportEvent::Rejected { id, attempt, reason } => {
                warn!("link: {id} rejected: {reason}");
                let exhausted = self.session.as_mut().and_then(|s| s.queue.record_rejection(&id, attempt, now));
                if let Some(msg) = exhausted {
                    self.report_exhausted(msg);
                    self.flush().await;
                }
            }
            TransportEvent::Cursor(cursor) => {
                if let Some(session) = self.session.as_mut() {
                    session.poll_cursor = cursor;
                }
            }
            TransportEvent::Closed(reason) => self.on_transport_lost(reason).await,
        }
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline = earliest(self.reconnect_at, self.probe_at);
        if let Some(session) = &self.session {
            // Queue deadlines only matter while something can be sent.
            let session_deadline = if self.state.is_ready() {
                session.next_deadline()
            } else {
                session.reassembler.next_deadline()
            };
            deadline = earliest(deadline, session_deadline);
        }
        deadline
    }

    async fn on_timer(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|t| t <= now) {
            self.reconnect_at = None;
            if self.state == ConnectionState::Reconnecting {
                self.start_attempt();
            }
        }

        if self.probe_at.is_some_and(|t| t <= now) {
            self.probe_at = None;
            if self.state == ConnectionState::Degraded {
                self.start_probe().await;
            }
        }

        let expired = self.session.as_mut().map(|s| s.reassembler.expire(now)).unwrap_or_default();
        for ev in expired {
            self.publish_message(ev);
        }

        if self.state.is_ready() {
            let exhausted = self.session.as_mut().and_then(|s| s.queue.expire_acks(now));
            if let Some(msg) = exhausted {
                self.report_exhausted(msg);
            }
            self.flush().await;
        }
    }

    /// Leave polling for a streaming attempt.  Postponed while a message is
    /// waiting for its acknowledgement.
    async fn start_probe(&mut self) {
        let busy = self
            .session
            .as_ref()
            .is_some_and(|s| s.queue.iter().next().is_some_and(|m| m.is_in_flight()));
        if busy {
            debug!("link: probe postponed, message in flight");
            self.probe_at = Some(Instant::now() + self.cfg.ack_timeout);
            return;
        }
        info!("link: probing streaming transport");
        self.supersede().await;
        self.probing = true;
        self.start_attempt();
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Send the head of the queue if a transport is ready and nothing is in
    /// flight.
    async fn flush(&mut self) {
        if !self.state.is_ready() {
            return;
        }
        loop {
            let now = Instant::now();
            let (Some(session), Some(transport)) = (self.session.as_mut(), self.active.as_mut()) else {
                return;
            };
            if !transport.is_open() {
                // Its close event is on the way.
                return;
            }
            if session.queue.ready_head(now).is_none() {
                return;
            }
            let Some(msg) = session.queue.mark_sent(now) else { return };
            debug!("link: sending {} (attempt {})", msg.id, msg.attempts);

            let err = match transport.send(&msg).await {
                Ok(())  => return,
                Err(e)  => e,
            };
            warn!("link: send {} failed: {err}", msg.id);
            match session.queue.record_failure(&msg.id, now) {
                Some(dead) => self.report_exhausted(dead),
                None       => return,
            }
        }
    }

    fn report_exhausted(&mut self, msg: OutboundMessage) {
        let error = ChatError::RetryExhausted { id: msg.id.clone(), attempts: msg.attempts };
        self.publish_delivery(DeliveryReport::Failed { id: msg.id, error });
    }

    // ── Publishing ────────────────────────────────────────────────────────────

    fn publish_message(&mut self, ev: MessageEvent) {
        for l in &mut self.listeners.message {
            l(&ev);
        }
    }

    fn publish_delivery(&mut self, report: DeliveryReport) {
        for l in &mut self.listeners.delivery {
            l(&report);
        }
    }
}
