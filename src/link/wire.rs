//! JSON envelopes exchanged with the chat server.
//!
//! The streaming channel carries one envelope per WebSocket text frame.  The
//! polling endpoint answers `GET` with a [`PollResponse`] and accepts outbound
//! messages as a [`SendRequest`] `POST` body.

use serde::{Deserialize, Serialize};

use super::{InboundFrame, MessageId, StreamId};
use crate::error::Result;

// ── Client → server ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientEnvelope<'a> {
    Message { id: &'a MessageId, payload: &'a str },
    Ping,
}

/// Body of a polling-mode `POST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub id:      MessageId,
    pub payload: String,
}

/// Encode an outbound chat message for the streaming channel.
pub fn encode_message(id: &MessageId, payload: &str) -> Result<String> {
    Ok(serde_json::to_string(&ClientEnvelope::Message { id, payload })?)
}

/// Encode an application-level heartbeat ping.
pub fn encode_ping() -> Result<String> {
    Ok(serde_json::to_string(&ClientEnvelope::Ping)?)
}

// ── Server → client ───────────────────────────────────────────────────────────

/// Envelopes pushed by the server over the streaming channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Frame {
        stream_id: StreamId,
        seq:       u64,
        #[serde(default)]
        fragment:  String,
        #[serde(rename = "final", default)]
        is_final:  bool,
    },
    Ack { id: MessageId },
    Reject { id: MessageId, #[serde(default)] reason: String },
    Pong,
}

/// Decode one server envelope from a text frame.
pub fn decode_server(text: &str) -> Result<ServerEnvelope> {
    Ok(serde_json::from_str(text)?)
}

// ── Polling ───────────────────────────────────────────────────────────────────

/// New content for one stream since the previous poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBatch {
    pub stream_id: StreamId,
    /// Sequence number of `fragments[0]`.
    pub start_seq: u64,
    #[serde(default)]
    pub fragments: Vec<String>,
    /// The server finished this response; the last fragment is final.
    #[serde(default)]
    pub complete:  bool,
}

/// Response to a polling `GET`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    /// Cursor to send with the next poll.
    pub cursor:  u64,
    #[serde(default)]
    pub streams: Vec<PollBatch>,
}

impl PollBatch {
    /// Split the batch into frames.  A complete batch without fragments still
    /// yields one empty final frame so the stream can finish.
    pub fn into_frames(self) -> Vec<InboundFrame> {
        let PollBatch { stream_id, start_seq, fragments, complete } = self;
        if fragments.is_empty() {
            return if complete {
                vec![InboundFrame { stream_id, sequence: start_seq, fragment: String::new(), is_final: true }]
            } else {
                Vec::new()
            };
        }
        let last = fragments.len() - 1;
        fragments
            .into_iter()
            .enumerate()
            .map(|(i, fragment)| InboundFrame {
                stream_id: stream_id.clone(),
                sequence:  start_seq + i as u64,
                fragment,
                is_final:  complete && i == last,
            })
            .collect()
    }
}

impl PollResponse {
    pub fn into_frames(self) -> Vec<InboundFrame> {
        self.streams.into_iter().flat_map(PollBatch::into_frames).collect()
    }
}

/// Decode a polling response body.
pub fn decode_poll(body: &[u8]) -> Result<PollResponse> {
    Ok(serde_json::from_slice(body)?)
}
