//! Error types for the chat link.

use std::time::Duration;

use thiserror::Error;

use crate::link::ids::{MessageId, StreamId};

#[derive(Debug, Error)]
pub enum ChatError {
    // ── Transport ─────────────────────────────────────────────────────────────
    #[error("transport: {0}")]
    Transport(String),

    #[error("heartbeat: no traffic for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("send: {0}")]
    Send(String),

    // ── Reassembly ────────────────────────────────────────────────────────────
    #[error("stream {stream_id}: gap not filled within {waited:?}")]
    GapTimeout { stream_id: StreamId, waited: Duration },

    #[error("stream {stream_id}: buffer limit exceeded ({limit})")]
    BufferOverflow { stream_id: StreamId, limit: String },

    // ── Outbound ──────────────────────────────────────────────────────────────
    #[error("message {id}: gave up after {attempts} attempts")]
    RetryExhausted { id: MessageId, attempts: u32 },

    #[error("session closed")]
    SessionClosed,

    // ── Plumbing ──────────────────────────────────────────────────────────────
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("TLS: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;
