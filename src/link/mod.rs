//! Real-time chat link: transports, supervision, reassembly and the
//! outbound queue.

pub mod ids;
pub mod queue;
pub mod reassembler;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod wire;

use chrono::{DateTime, Utc};

use crate::error::ChatError;

pub use ids::{MessageId, StreamId};

/// Which transport variant a connection attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Streaming,
    Polling,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => f.write_str("streaming"),
            Self::Polling   => f.write_str("polling"),
        }
    }
}

/// Connection state as seen by the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// A transport of the given kind is being opened.
    Connecting(TransportKind),
    /// Streaming transport open.
    Connected,
    /// Waiting for the backoff timer before the next attempt.
    Reconnecting,
    /// Polling transport open; streaming is unavailable.
    Degraded,
    /// Every transport gave up.  Recoverable through `connect()`.
    Failed,
}

impl ConnectionState {
    /// True when a transport is open and outbound messages can flow.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected  => f.write_str("disconnected"),
            Self::Connecting(k) => write!(f, "connecting ({k})"),
            Self::Connected     => f.write_str("connected"),
            Self::Reconnecting  => f.write_str("reconnecting"),
            Self::Degraded      => f.write_str("degraded (polling)"),
            Self::Failed        => f.write_str("failed"),
        }
    }
}

/// One fragment of a streamed server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub stream_id: StreamId,
    pub sequence:  u64,
    pub fragment:  String,
    pub is_final:  bool,
}

/// A fully reassembled response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage {
    pub stream_id:    StreamId,
    pub content:      String,
    pub completed_at: DateTime<Utc>,
}

/// What message subscribers receive: a completed response or the failure of
/// one stream.
#[derive(Debug)]
pub enum MessageEvent {
    Complete(LogicalMessage),
    Failed { stream_id: StreamId, error: ChatError },
}

impl MessageEvent {
    pub fn stream_id(&self) -> &StreamId {
        match self {
            Self::Complete(m)            => &m.stream_id,
            Self::Failed { stream_id, .. } => stream_id,
        }
    }
}

/// Outcome of an outbound message.
#[derive(Debug)]
pub enum DeliveryReport {
    Delivered(MessageId),
    Failed { id: MessageId, error: ChatError },
}

impl DeliveryReport {
    pub fn id(&self) -> &MessageId {
        match self {
            Self::Delivered(id)     => id,
            Self::Failed { id, .. } => id,
        }
    }
}
