//! Transports: the channels that carry chat traffic.
//!
//! A transport is opened once, reports everything it receives through an
//! [`EventSink`], and is discarded after it closes.  The supervisor builds
//! transports through a [`Connector`] so it never depends on a concrete
//! channel.

pub mod polling;
pub mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::queue::OutboundMessage;
use super::{InboundFrame, MessageId, TransportKind};
use crate::config::LinkConfig;
use crate::error::{ChatError, Result};
use crate::tls;

pub use polling::PollingTransport;
pub use websocket::StreamingTransport;

/// Header carrying the session id on every connection and request.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Identity of one transport instance.  Events tagged with an older
/// generation than the supervisor's current one are stale.
pub type Generation = u64;

/// Everything a transport can report.
#[derive(Debug)]
pub enum TransportEvent {
    Frame(InboundFrame),
    /// The server accepted message `id`.
    Ack(MessageId),
    /// The server refused message `id`.  `attempt` names the send it answers
    /// when the channel can tell; `None` means the one currently in flight.
    Rejected { id: MessageId, attempt: Option<u32>, reason: String },
    /// Position the polling channel has consumed up to.
    Cursor(u64),
    /// The channel is gone.  `None` for an orderly close by the server.
    Closed(Option<ChatError>),
}

/// Generation-tagged event producer handed to [`Transport::open`].
///
/// After [`closed`](Self::closed) or [`silence`](Self::silence) nothing more
/// is delivered, so no frame can follow a close event.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: Generation,
    tx:         mpsc::UnboundedSender<(Generation, TransportEvent)>,
    closed:     Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<(Generation, TransportEvent)>) -> Self {
        Self { generation, tx, closed: Arc::new(AtomicBool::new(false)) }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    fn push(&self, event: TransportEvent) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.tx.send((self.generation, event)).is_ok()
    }

    /// Deliver a frame.  Returns false once the sink is closed.
    pub fn frame(&self, frame: InboundFrame) -> bool {
        self.push(TransportEvent::Frame(frame))
    }

    pub fn ack(&self, id: MessageId) -> bool {
        self.push(TransportEvent::Ack(id))
    }

    pub fn rejected(&self, id: MessageId, attempt: Option<u32>, reason: impl Into<String>) -> bool {
        self.push(TransportEvent::Rejected { id, attempt, reason: reason.into() })
    }

    pub fn cursor(&self, cursor: u64) -> bool {
        self.push(TransportEvent::Cursor(cursor))
    }

    /// Report the end of the channel.  Only the first call is delivered.
    pub fn closed(&self, reason: Option<ChatError>) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send((self.generation, TransportEvent::Closed(reason)));
        }
    }

    /// Stop delivery without reporting a close (the owner closed us).
    pub fn silence(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Uniform contract of the streaming and polling channels.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// True between a successful `open` and the close of the channel.
    fn is_open(&self) -> bool;

    /// Establish the channel.  Calling it again while open is a no-op; a
    /// transport that has been closed cannot be reopened.
    async fn open(&mut self, events: EventSink) -> Result<()>;

    /// Hand a message to the channel.  The acknowledgement arrives later as
    /// [`TransportEvent::Ack`].  Fails with [`ChatError::Send`] when not open.
    async fn send(&mut self, msg: &OutboundMessage) -> Result<()>;

    /// Tear the channel down.  No event is delivered afterwards.
    async fn close(&mut self);
}

/// Builds transports for the supervisor.  `poll_cursor` is where a polling
/// transport resumes; streaming transports ignore it.
pub trait Connector: Send + Sync + 'static {
    fn build(&self, kind: TransportKind, session_id: Uuid, poll_cursor: u64) -> Box<dyn Transport>;
}

/// Builds the real WebSocket and HTTP transports from the configuration.
pub struct DefaultConnector {
    cfg:  Arc<LinkConfig>,
    tls:  Option<Arc<rustls::ClientConfig>>,
    http: reqwest::Client,
}

impl DefaultConnector {
    pub fn new(cfg: Arc<LinkConfig>) -> Result<Self> {
        if cfg.stream_url.is_none() || cfg.poll_url.is_none() {
            return Err(ChatError::Config("stream_url and poll_url are required".into()));
        }
        let tls = tls::build_tls_config(&cfg)?;

        let mut builder = reqwest::Client::builder().timeout(cfg.request_timeout);
        if let Some(ca_file) = &cfg.ca_file {
            for cert in tls::load_ca_certs(ca_file)? {
                builder = builder.add_root_certificate(reqwest::Certificate::from_der(cert.as_ref())?);
            }
        }
        let http = builder.build()?;

        Ok(Self { cfg, tls, http })
    }
}

impl Connector for DefaultConnector {
    fn build(&self, kind: TransportKind, session_id: Uuid, poll_cursor: u64) -> Box<dyn Transport> {
        match kind {
            TransportKind::Streaming => Box::new(StreamingTransport::new(
                self.cfg.stream_url.clone().unwrap_or_default(),
                self.cfg.auth_token.clone(),
                session_id,
                self.cfg.heartbeat_interval,
                self.cfg.heartbeat_timeout,
                self.cfg.open_timeout,
                self.tls.clone(),
            )),
            TransportKind::Polling => Box::new(PollingTransport::new(
                self.cfg.poll_url.clone().unwrap_or_default(),
                self.cfg.auth_token.clone(),
                session_id,
                self.cfg.poll_interval,
                poll_cursor,
                self.http.clone(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::StreamId;

    fn frame(seq: u64) -> InboundFrame {
        InboundFrame { stream_id: StreamId::new("s"), sequence: seq, fragment: "x".into(), is_final: false }
    }

    #[test]
    fn sink_tags_events_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.frame(frame(0)));
        let (generation, ev) = rx.try_recv().unwrap();
        assert_eq!(generation, 7);
        assert!(matches!(ev, TransportEvent::Frame(f) if f.sequence == 0));
    }

    #[test]
    fn nothing_after_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(1, tx);
        sink.closed(None);
        sink.closed(Some(ChatError::Transport("again".into())));
        assert!(!sink.frame(frame(0)));
        assert!(!sink.ack(MessageId::new("m")));
        assert!(matches!(rx.try_recv().unwrap().1, TransportEvent::Closed(None)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rejection_carries_attempt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(2, tx);
        assert!(sink.rejected(MessageId::new("m"), Some(3), "HTTP 500"));
        assert!(sink.cursor(11));
        assert!(matches!(
            rx.try_recv().unwrap().1,
            TransportEvent::Rejected { attempt: Some(3), ref reason, .. } if reason == "HTTP 500"
        ));
        assert!(matches!(rx.try_recv().unwrap().1, TransportEvent::Cursor(11)));
    }

    #[test]
    fn silenced_sink_reports_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(1, tx);
        let clone = sink.clone();
        sink.silence();
        assert!(clone.is_closed());
        clone.closed(None);
        assert!(!clone.frame(frame(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn default_connector_requires_endpoints() {
        assert!(DefaultConnector::new(Arc::new(LinkConfig::default())).is_err());
    }
}
