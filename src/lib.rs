//! Resilient chat connection layer.
//!
//! A [`ChatLink`] keeps a session with a chat server alive over a streaming
//! WebSocket and falls back to HTTP polling when streaming is unavailable.
//! Streamed responses are reassembled from numbered fragments, outbound
//! messages are delivered in order with bounded retries, and connection state
//! changes are observable.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod tls;

pub use client::ChatLink;
pub use config::{BackoffConfig, LinkConfig};
pub use error::{ChatError, Result};
pub use link::{
    ConnectionState, DeliveryReport, InboundFrame, LogicalMessage, MessageEvent, MessageId,
    StreamId, TransportKind,
};
