//! Polling transport: HTTP request/response fallback.
//!
//! `open` performs the first poll so an unreachable endpoint fails the open.
//! A background task then polls every `interval`, turning each response into
//! frames, followed by a `Cursor` event so a later transport can resume
//! where this one stopped.  Outbound messages are posted individually; each
//! post's outcome becomes an `Ack` or a `Rejected` event tagged with the
//! attempt it answers.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use tokio::task::{JoinHandle, JoinSet};
use url::Url;
use uuid::Uuid;

use super::{EventSink, Transport, SESSION_ID_HEADER};
use crate::error::{ChatError, Result};
use crate::link::queue::OutboundMessage;
use crate::link::wire::{self, PollResponse, SendRequest};
use crate::link::TransportKind;

/// Failed polls in a row before the transport reports itself closed.
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;

#[derive(Debug, thiserror::Error)]
enum PollError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("session expired (HTTP {0})")]
    SessionExpired(u16),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("{0}")]
    Decode(#[from] ChatError),
}

impl From<PollError> for ChatError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::Http(e)   => ChatError::Http(e),
            PollError::Decode(e) => e,
            other                => ChatError::Transport(other.to_string()),
        }
    }
}

/// Connection parameters shared by the poll loop and the senders.
#[derive(Clone)]
struct Endpoint {
    http:       Client,
    url:        Url,
    token:      String,
    session_id: Uuid,
}

impl Endpoint {
    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method, self.url.clone())
            .header(SESSION_ID_HEADER, self.session_id.to_string());
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        req
    }

    async fn poll_once(&self, cursor: u64) -> std::result::Result<Option<PollResponse>, PollError> {
        let response = self
            .request(reqwest::Method::GET)
            .query(&[("session", self.session_id.to_string()), ("cursor", cursor.to_string())])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND {
            return Err(PollError::SessionExpired(status.as_u16()));
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(PollError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(wire::decode_poll(&body)?))
    }

    async fn post(&self, msg: SendRequest, attempt: u32, sink: EventSink) {
        let id = msg.id.clone();
        let result = self
            .request(reqwest::Method::POST)
            .query(&[("session", self.session_id.to_string())])
            .json(&msg)
            .send()
            .await;
        match result {
            // 409: the server already holds a message with this id.
            Ok(r) if r.status().is_success() || r.status() == StatusCode::CONFLICT => {
                sink.ack(id);
            }
            Ok(r) => {
                warn!("HTTP poll: send {id} refused with {}", r.status());
                sink.rejected(id, Some(attempt), format!("HTTP {}", r.status().as_u16()));
            }
            Err(e) => {
                warn!("HTTP poll: send {id} failed: {e}");
                sink.rejected(id, Some(attempt), e.to_string());
            }
        }
    }
}

/// Emit all frames of a response, then its cursor.  Returns false once the
/// sink is closed.
fn deliver(sink: &EventSink, response: PollResponse) -> bool {
    let cursor = response.cursor;
    response.into_frames().into_iter().all(|f| sink.frame(f)) && sink.cursor(cursor)
}

async fn poll_loop(endpoint: Endpoint, mut cursor: u64, interval: Duration, sink: EventSink) {
    info!("HTTP poll: loop started for session {}", endpoint.session_id);
    let mut consecutive_errors = 0u32;

    loop {
        tokio::time::sleep(interval).await;
        if sink.is_closed() {
            break;
        }

        match endpoint.poll_once(cursor).await {
            Ok(Some(response)) => {
                consecutive_errors = 0;
                cursor = response.cursor;
                if !deliver(&sink, response) {
                    break;
                }
            }
            Ok(None) => consecutive_errors = 0,
            Err(e @ PollError::SessionExpired(_)) => {
                error!("HTTP poll: {e}, closing");
                sink.closed(Some(e.into()));
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("HTTP poll: error ({consecutive_errors} in a row): {e}");
                if consecutive_errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                    sink.closed(Some(e.into()));
                    break;
                }
            }
        }
    }
    debug!("HTTP poll: loop exited");
}

struct Connection {
    endpoint: Endpoint,
    sink:     EventSink,
    poller:   JoinHandle<()>,
    senders:  JoinSet<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

pub struct PollingTransport {
    url:        String,
    token:      String,
    session_id: Uuid,
    interval:   Duration,
    /// Cursor the first poll starts from.
    cursor:     u64,
    http:       Client,
    conn:       Option<Connection>,
    finished:   bool,
}

impl PollingTransport {
    pub fn new(
        url:        String,
        token:      String,
        session_id: Uuid,
        interval:   Duration,
        cursor:     u64,
        http:       Client,
    ) -> Self {
        Self { url, token, session_id, interval, cursor, http, conn: None, finished: false }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn is_open(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.sink.is_closed())
    }

    async fn open(&mut self, events: EventSink) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        if self.finished {
            return Err(ChatError::Transport("polling transport already closed".into()));
        }

        let endpoint = Endpoint {
            http:       self.http.clone(),
            url:        Url::parse(&self.url)?,
            token:      self.token.clone(),
            session_id: self.session_id,
        };

        info!("HTTP poll: opening {} at cursor {}", self.url, self.cursor);
        let cursor = match endpoint.poll_once(self.cursor).await? {
            Some(response) => {
                let cursor = response.cursor;
                deliver(&events, response);
                cursor
            }
            None => self.cursor,
        };

        let poller = tokio::spawn(poll_loop(endpoint.clone(), cursor, self.interval, events.clone()));
        self.conn = Some(Connection { endpoint, sink: events, poller, senders: JoinSet::new() });
        Ok(())
    }

    async fn send(&mut self, msg: &OutboundMessage) -> Result<()> {
        let conn = match &mut self.conn {
            Some(c) if !c.sink.is_closed() => c,
            _ => return Err(ChatError::Send("polling channel not open".into())),
        };
        while conn.senders.try_join_next().is_some() {}

        let body = SendRequest { id: msg.id.clone(), payload: msg.payload.clone() };
        let endpoint = conn.endpoint.clone();
        let sink = conn.sink.clone();
        let attempt = msg.attempts;
        conn.senders.spawn(async move { endpoint.post(body, attempt, sink).await });
        Ok(())
    }

    async fn close(&mut self) {
        self.finished = true;
        if let Some(conn) = self.conn.take() {
            conn.sink.silence();
            debug!("HTTP poll: closed {}", self.url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::transport::TransportEvent;
    use crate::link::MessageId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Read one request: the head, then `Content-Length` bytes of body.
    async fn read_request(tcp: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = tcp.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Minimal HTTP/1.1 server: answers every request with the next canned
    /// `(status line, body)` and records the request heads.
    async fn server(replies: Vec<(&'static str, &'static str)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/poll", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (status, body) in replies {
                let (mut tcp, _) = listener.accept().await.unwrap();
                let _ = tx.send(read_request(&mut tcp).await);
                let reply = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                tcp.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        (url, rx)
    }

    fn transport(url: String) -> PollingTransport {
        PollingTransport::new(url, "secret".into(), Uuid::new_v4(), Duration::from_secs(3600), 0, Client::new())
    }

    #[tokio::test]
    async fn open_delivers_first_poll() {
        let body = r#"{"cursor":4,"streams":[{"stream_id":"r1","start_seq":0,"fragments":["Hel","lo"],"complete":true}]}"#;
        let (url, mut requests) = server(vec![("200 OK", body)]).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = transport(url);
        t.open(EventSink::new(1, tx)).await.unwrap();
        assert!(t.is_open());

        let head = requests.recv().await.unwrap();
        assert!(head.starts_with("GET /poll?session="), "{head}");
        assert!(head.contains("cursor=0"));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer secret"));

        let (_, ev) = rx.recv().await.unwrap();
        assert!(matches!(ev, TransportEvent::Frame(f) if f.fragment == "Hel" && !f.is_final));
        let (_, ev) = rx.recv().await.unwrap();
        assert!(matches!(ev, TransportEvent::Frame(f) if f.fragment == "lo" && f.is_final));
        let (_, ev) = rx.recv().await.unwrap();
        assert!(matches!(ev, TransportEvent::Cursor(4)));
        t.close().await;
    }

    #[tokio::test]
    async fn send_posts_and_acks() {
        let (url, mut requests) = server(vec![("204 No Content", ""), ("200 OK", "{}")]).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = transport(url);
        t.open(EventSink::new(3, tx)).await.unwrap();
        requests.recv().await.unwrap();

        let mut msg = OutboundMessage::new("hi");
        msg.id = MessageId::new("m-9");
        t.send(&msg).await.unwrap();

        let head = requests.recv().await.unwrap();
        assert!(head.starts_with("POST /poll?session="), "{head}");
        assert!(head.contains(r#""id":"m-9""#));

        let (generation, ev) = rx.recv().await.unwrap();
        assert_eq!(generation, 3);
        assert!(matches!(ev, TransportEvent::Ack(id) if id.as_str() == "m-9"));
    }

    #[tokio::test]
    async fn expired_session_fails_open() {
        let (url, _requests) = server(vec![("401 Unauthorized", "")]).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut t = transport(url);
        let err = t.open(EventSink::new(1, tx)).await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(ref m) if m.contains("expired")), "{err}");
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let mut t = transport("http://127.0.0.1:9/poll".into());
        let msg = OutboundMessage::new("hi");
        assert!(matches!(t.send(&msg).await, Err(ChatError::Send(_))));
    }

    #[tokio::test]
    async fn reopen_resumes_from_cursor() {
        let (url, mut requests) = server(vec![("204 No Content", "")]).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut t = PollingTransport::new(url, String::new(), Uuid::new_v4(), Duration::from_secs(3600), 7, Client::new());
        t.open(EventSink::new(1, tx)).await.unwrap();

        let head = requests.recv().await.unwrap();
        assert!(head.contains("cursor=7"), "{head}");
        assert!(!head.to_ascii_lowercase().contains("authorization"));
    }

    #[tokio::test]
    async fn refused_post_is_rejected_with_its_attempt() {
        let (url, mut requests) = server(vec![("204 No Content", ""), ("500 Internal Server Error", "")]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = transport(url);
        t.open(EventSink::new(1, tx)).await.unwrap();
        requests.recv().await.unwrap();

        let mut msg = OutboundMessage::new("hi");
        msg.id = MessageId::new("m-2");
        msg.attempts = 2;
        t.send(&msg).await.unwrap();

        let (_, ev) = rx.recv().await.unwrap();
        assert!(matches!(
            ev,
            TransportEvent::Rejected { ref id, attempt: Some(2), ref reason } if id.as_str() == "m-2" && reason == "HTTP 500"
        ));
    }

    fn fast_transport(url: String) -> PollingTransport {
        PollingTransport::new(url, "secret".into(), Uuid::new_v4(), Duration::from_millis(20), 0, Client::new())
    }

    #[tokio::test]
    async fn session_expiry_during_polling_closes() {
        let (url, _requests) = server(vec![("204 No Content", ""), ("404 Not Found", "")]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = fast_transport(url);
        t.open(EventSink::new(1, tx)).await.unwrap();

        let (_, ev) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(ev, TransportEvent::Closed(Some(ChatError::Transport(ref m))) if m.contains("expired")), "{ev:?}");
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn repeated_poll_errors_close_the_channel() {
        let mut replies = vec![("204 No Content", "")];
        replies.extend(std::iter::repeat(("503 Service Unavailable", "")).take(MAX_CONSECUTIVE_POLL_ERRORS as usize));
        let (url, mut requests) = server(replies).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut t = fast_transport(url);
        t.open(EventSink::new(1, tx)).await.unwrap();

        let (_, ev) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(ev, TransportEvent::Closed(Some(ChatError::Transport(ref m))) if m.contains("503")), "{ev:?}");
        let mut polls = 0;
        while requests.try_recv().is_ok() {
            polls += 1;
        }
        assert_eq!(polls, 1 + MAX_CONSECUTIVE_POLL_ERRORS);
    }
}
