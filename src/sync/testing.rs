//! In-memory connector, transport and remote API for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::client::RemoteApi;
use crate::api::events::{InboundEvent, OutboundEvent};
use crate::api::models::{ConversationId, Identity, Message, SendRequest, User};
use crate::error::{ChatError, Result};
use crate::sync::transport::{Connector, Transport, TransportKind};

pub(crate) fn user(id: &str) -> User {
    User {
        id: id.into(),
        name: format!("user {id}"),
        pic: None,
    }
}

pub(crate) fn identity(id: &str) -> Identity {
    Identity {
        user: user(id),
        token: format!("token-{id}"),
    }
}

pub(crate) fn message(id: &str, conversation: &str, content: &str) -> Message {
    Message {
        id: id.into(),
        sender: user("u2"),
        content: content.into(),
        conversation_id: conversation.into(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        scheduled_for: None,
        client_id: None,
    }
}

/// The remote half of a [`MemoryTransport`].
pub(crate) struct ServerEnd {
    pub kind: TransportKind,
    to_client: mpsc::UnboundedSender<InboundEvent>,
    from_client: mpsc::UnboundedReceiver<OutboundEvent>,
}

impl ServerEnd {
    pub fn push(&self, event: InboundEvent) {
        self.to_client.send(event).expect("client transport gone");
    }

    pub async fn next_frame(&mut self) -> OutboundEvent {
        self.from_client.recv().await.expect("client transport gone")
    }

    pub fn try_frame(&mut self) -> Option<OutboundEvent> {
        self.from_client.try_recv().ok()
    }
}

struct MemoryTransport {
    kind: TransportKind,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
    outbound: mpsc::UnboundedSender<OutboundEvent>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&mut self, event: &OutboundEvent) -> Result<()> {
        self.outbound
            .send(event.clone())
            .map_err(|_| ChatError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

enum Refusal {
    Unreachable,
    Status(u16),
}

pub(crate) struct MemoryConnector {
    script: Mutex<VecDeque<Refusal>>,
    attempts: Mutex<Vec<TransportKind>>,
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            accepted,
        });
        (connector, rx)
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        let mut script = self.script.lock();
        for _ in 0..n {
            script.push_back(Refusal::Unreachable);
        }
    }

    /// Answer the next attempt with an HTTP status instead of a transport.
    pub fn reject_next(&self, status: u16) {
        self.script.lock().push_back(Refusal::Status(status));
    }

    pub fn attempts(&self) -> Vec<TransportKind> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, kind: TransportKind) -> Result<Box<dyn Transport>> {
        self.attempts.lock().push(kind);
        match self.script.lock().pop_front() {
            Some(Refusal::Unreachable) => {
                return Err(ChatError::Connection(format!("{kind} refused")));
            }
            Some(Refusal::Status(code)) => return Err(ChatError::Status(code)),
            None => {}
        }
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let _ = self.accepted.send(ServerEnd {
            kind,
            to_client,
            from_client,
        });
        Ok(Box::new(MemoryTransport {
            kind,
            inbound,
            outbound,
        }))
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    histories: Mutex<HashMap<ConversationId, Vec<Message>>>,
    history_delays: Mutex<HashMap<ConversationId, Duration>>,
    send_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<SendRequest>>,
    fail_sends: AtomicBool,
    fail_history: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_history(&self, conversation: &str, messages: Vec<Message>) {
        self.histories.lock().insert(conversation.into(), messages);
    }

    /// Hold the history response for `conversation` back by `delay`.
    pub fn delay_history(&self, conversation: &str, delay: Duration) {
        self.history_delays.lock().insert(conversation.into(), delay);
    }

    pub fn delay_sends(&self, delay: Duration) {
        *self.send_delay.lock() = Some(delay);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn history(&self, conversation: &ConversationId) -> Result<Vec<Message>> {
        let delay = self.history_delays.lock().get(conversation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ChatError::Status(500));
        }
        Ok(self
            .histories
            .lock()
            .get(conversation)
            .cloned()
            .unwrap_or_default())
    }

    async fn send(&self, request: &SendRequest) -> Result<Message> {
        self.sent.lock().push(request.clone());
        let delay = *self.send_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Status(503));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Message {
            id: format!("srv-{n}").as_str().into(),
            sender: user("u1"),
            content: request.content.clone(),
            conversation_id: request.conversation_id.clone(),
            created_at: Utc::now(),
            scheduled_for: request.scheduled_for,
            client_id: Some(request.client_id),
        })
    }
}
