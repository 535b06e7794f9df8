//! Streaming transport: persistent WebSocket to the chat server.
//!
//! Two helper tasks own the socket halves.  The writer drains the outgoing
//! queue and sends an application ping every `heartbeat_interval`; the reader
//! decodes server envelopes and treats `heartbeat_timeout` of silence as a
//! dead connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use super::{EventSink, Transport, SESSION_ID_HEADER};
use crate::error::{ChatError, Result};
use crate::link::queue::OutboundMessage;
use crate::link::wire::{self, ServerEnvelope};
use crate::link::{InboundFrame, TransportKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `close()` waits for the close frame to be written.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

struct Connection {
    outgoing: mpsc::UnboundedSender<Message>,
    sink:     EventSink,
    reader:   JoinHandle<()>,
    writer:   JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

pub struct StreamingTransport {
    url:                String,
    token:              String,
    session_id:         Uuid,
    heartbeat_interval: Duration,
    heartbeat_timeout:  Duration,
    open_timeout:       Duration,
    tls:                Option<Arc<rustls::ClientConfig>>,
    conn:               Option<Connection>,
    finished:           bool,
}

impl StreamingTransport {
    pub fn new(
        url:                String,
        token:              String,
        session_id:         Uuid,
        heartbeat_interval: Duration,
        heartbeat_timeout:  Duration,
        open_timeout:       Duration,
        tls:                Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            url,
            token,
            session_id,
            heartbeat_interval,
            heartbeat_timeout,
            open_timeout,
            tls,
            conn: None,
            finished: false,
        }
    }

    fn header(value: &str) -> Result<HeaderValue> {
        HeaderValue::from_str(value).map_err(|e| ChatError::Transport(format!("bad header value: {e}")))
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn is_open(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.sink.is_closed())
    }

    async fn open(&mut self, events: EventSink) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        if self.finished {
            return Err(ChatError::Transport("streaming transport already closed".into()));
        }

        let mut req = self.url.as_str().into_client_request()?;
        if !self.token.is_empty() {
            req.headers_mut().insert(AUTHORIZATION, Self::header(&format!("Bearer {}", self.token))?);
        }
        req.headers_mut().insert(SESSION_ID_HEADER, Self::header(&self.session_id.to_string())?);

        info!("WS: connecting to {}", self.url);
        let connector = self.tls.clone().map(Connector::Rustls);
        let handshake = connect_async_tls_with_config(req, None, false, connector);
        let (ws, _response) = tokio::time::timeout(self.open_timeout, handshake)
            .await
            .map_err(|_| ChatError::Transport(format!("handshake timed out after {:?}", self.open_timeout)))??;
        info!("WS: connected to {}", self.url);

        let (write, read) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write, rx, self.heartbeat_interval, events.clone()));
        let reader = tokio::spawn(read_loop(read, tx.clone(), self.heartbeat_timeout, events.clone()));

        self.conn = Some(Connection { outgoing: tx, sink: events, reader, writer });
        Ok(())
    }

    async fn send(&mut self, msg: &OutboundMessage) -> Result<()> {
        let conn = match &self.conn {
            Some(c) if !c.sink.is_closed() => c,
            _ => return Err(ChatError::Send("streaming channel not open".into())),
        };
        let text = wire::encode_message(&msg.id, &msg.payload)?;
        conn.outgoing
            .send(Message::Text(text))
            .map_err(|_| ChatError::Send("streaming writer stopped".into()))
    }

    async fn close(&mut self) {
        self.finished = true;
        let Some(mut conn) = self.conn.take() else { return };
        conn.sink.silence();
        if conn.outgoing.send(Message::Close(None)).is_ok() {
            let _ = tokio::time::timeout(CLOSE_GRACE, &mut conn.writer).await;
        }
        debug!("WS: closed {}", self.url);
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut rx:    mpsc::UnboundedReceiver<Message>,
    interval:  Duration,
    sink:      EventSink,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        let msg = tokio::select! {
            next = rx.recv() => match next {
                Some(m) => m,
                None    => break,
            },
            _ = ticker.tick() => match wire::encode_ping() {
                Ok(ping) => Message::Text(ping),
                Err(e)   => { warn!("WS: cannot encode ping: {e}"); continue; }
            },
        };
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = write.send(msg).await {
            sink.closed(Some(e.into()));
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    outgoing: mpsc::UnboundedSender<Message>,
    timeout:  Duration,
    sink:     EventSink,
) {
    loop {
        let next = match tokio::time::timeout(timeout, read.next()).await {
            Ok(n)  => n,
            Err(_) => {
                warn!("WS: no traffic for {timeout:?}, assuming connection dead");
                sink.closed(Some(ChatError::HeartbeatTimeout(timeout)));
                return;
            }
        };
        let data = match next {
            Some(Ok(Message::Text(t)))   => t,
            Some(Ok(Message::Binary(b))) => match String::from_utf8(b) {
                Ok(t)  => t,
                Err(_) => { warn!("WS: non-UTF-8 binary frame ignored"); continue; }
            },
            Some(Ok(Message::Ping(p)))   => { let _ = outgoing.send(Message::Pong(p)); continue; }
            Some(Ok(Message::Close(_)))  => { info!("WS: closed by server"); sink.closed(None); return; }
            Some(Ok(_))                  => continue,
            Some(Err(e))                 => { sink.closed(Some(e.into())); return; }
            None                         => { sink.closed(None); return; }
        };

        let delivered = match wire::decode_server(&data) {
            Ok(ServerEnvelope::Frame { stream_id, seq, fragment, is_final }) => {
                sink.frame(InboundFrame { stream_id, sequence: seq, fragment, is_final })
            }
            Ok(ServerEnvelope::Ack { id })            => sink.ack(id),
            Ok(ServerEnvelope::Reject { id, reason }) => sink.rejected(id, None, reason),
            Ok(ServerEnvelope::Pong)                  => true,
            Err(e) => { warn!("WS: bad envelope: {e}"); true }
        };
        if !delivered {
            return;
        }
    }
}
