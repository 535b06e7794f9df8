//! Public entry point of the library.
//!
//! `ChatLink` is a cheap handle onto the supervisor task.  Every method only
//! enqueues a command, so none of them block and all of them may be called
//! from any task.

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::{validate_config, LinkConfig};
use crate::error::{ChatError, Result};
use crate::link::queue::OutboundMessage;
use crate::link::supervisor::{Command, Supervisor};
use crate::link::transport::{Connector, DefaultConnector};
use crate::link::{ConnectionState, DeliveryReport, MessageEvent, MessageId};

pub struct ChatLink {
    commands:   mpsc::UnboundedSender<Command>,
    status:     watch::Receiver<ConnectionState>,
    supervisor: JoinHandle<()>,
}

impl ChatLink {
    /// Start a link over the given connector.  Must be called inside a tokio
    /// runtime.  Nothing connects until [`connect`](Self::connect) or the
    /// first [`submit`](Self::submit).
    pub fn new(cfg: LinkConfig, connector: Arc<dyn Connector>) -> Self {
        let backoff = Backoff::new(cfg.backoff.clone());
        let (sup, commands, status, inbox) = Supervisor::new(Arc::new(cfg), connector, backoff);
        let supervisor = tokio::spawn(sup.run(inbox));
        ChatLink { commands, status, supervisor }
    }

    /// Validate `cfg` and start a link over the WebSocket and HTTP transports.
    pub fn from_config(cfg: LinkConfig) -> Result<Self> {
        validate_config(&cfg)?;
        let connector = DefaultConnector::new(Arc::new(cfg.clone()))?;
        Ok(Self::new(cfg, Arc::new(connector)))
    }

    fn send(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            warn!("link: supervisor is gone, command dropped");
        }
    }

    /// Queue `text` for delivery and return its id.  Connects if needed.
    pub fn submit(&self, text: impl Into<String>) -> MessageId {
        let msg = OutboundMessage::new(text);
        let id = msg.id.clone();
        self.send(Command::Submit(msg));
        id
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Tear the session down.  Queued messages are reported as failed with
    /// [`ChatError::SessionClosed`].  Closing twice is harmless.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    /// Register a callback for completed and failed inbound messages.
    pub fn on_message(&self, f: impl FnMut(&MessageEvent) + Send + 'static) {
        self.send(Command::OnMessage(Box::new(f)));
    }

    /// Register a callback for every connection state change.
    pub fn on_status(&self, f: impl FnMut(&ConnectionState) + Send + 'static) {
        self.send(Command::OnStatus(Box::new(f)));
    }

    /// Register a callback for delivery outcomes of submitted messages.
    pub fn on_delivery(&self, f: impl FnMut(&DeliveryReport) + Send + 'static) {
        self.send(Command::OnDelivery(Box::new(f)));
    }

    /// Current connection state.
    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Wait until every message submitted so far has a delivery report.
    /// Returns false if that takes longer than `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        self.send(Command::WhenIdle(tx));
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    /// A receiver that observes every state change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Close the session and wait for the supervisor to finish.
    pub async fn shutdown(self) -> Result<()> {
        let ChatLink { commands, supervisor, .. } = self;
        let _ = commands.send(Command::Close);
        drop(commands);
        supervisor
            .await
            .map_err(|e| ChatError::Transport(format!("supervisor task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::link::transport::{EventSink, Transport};
    use crate::link::TransportKind;

    /// Accepts everything; acknowledges every message when `ack` is set.
    struct EchoTransport {
        kind: TransportKind,
        ack:  bool,
        sink: Option<EventSink>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn is_open(&self) -> bool {
            self.sink.is_some()
        }

        async fn open(&mut self, events: EventSink) -> Result<()> {
            self.sink = Some(events);
            Ok(())
        }

        async fn send(&mut self, msg: &OutboundMessage) -> Result<()> {
            let sink = self.sink.as_ref().ok_or_else(|| ChatError::Send("not open".into()))?;
            if self.ack {
                sink.ack(msg.id.clone());
            }
            Ok(())
        }

        async fn close(&mut self) {
            if let Some(sink) = self.sink.take() {
                sink.silence();
            }
        }
    }

    struct EchoConnector {
        ack: bool,
    }

    impl Connector for EchoConnector {
        fn build(&self, kind: TransportKind, _session_id: Uuid, _poll_cursor: u64) -> Box<dyn Transport> {
            Box::new(EchoTransport { kind, ack: self.ack, sink: None })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit_connects_and_reports_delivery() {
        let link = ChatLink::new(LinkConfig::default(), Arc::new(EchoConnector { ack: true }));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let d = Arc::clone(&delivered);
        link.on_delivery(move |r| d.lock().unwrap().push(r.id().clone()));
        assert_eq!(link.status(), ConnectionState::Disconnected);

        let mut watch = link.watch_status();
        let id = link.submit("hello");
        while *watch.borrow_and_update() != ConnectionState::Connected {
            watch.changed().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*delivered.lock().unwrap(), vec![id]);
        link.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_disconnected() {
        let link = ChatLink::new(LinkConfig::default(), Arc::new(EchoConnector { ack: true }));
        link.connect();
        let watch = link.watch_status();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.status(), ConnectionState::Connected);

        link.close();
        link.close();
        link.shutdown().await.unwrap();
        assert_eq!(*watch.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_covers_just_submitted_messages() {
        let link = ChatLink::new(LinkConfig::default(), Arc::new(EchoConnector { ack: true }));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let d = Arc::clone(&delivered);
        link.on_delivery(move |r| d.lock().unwrap().push(r.id().clone()));

        let id = link.submit("bye");
        assert!(link.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(*delivered.lock().unwrap(), vec![id]);
        link.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_gives_up_on_unacknowledged_message() {
        let link = ChatLink::new(LinkConfig::default(), Arc::new(EchoConnector { ack: false }));
        link.submit("nobody listens");
        assert!(!link.wait_idle(Duration::from_secs(1)).await);
        link.shutdown().await.unwrap();
    }

    #[test]
    fn from_config_rejects_missing_endpoints() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let result = rt.block_on(async { ChatLink::from_config(LinkConfig::default()).map(|_| ()) });
        assert!(matches!(result, Err(ChatError::Config(_))));
    }
}
