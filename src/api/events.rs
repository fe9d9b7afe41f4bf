use serde::{Deserialize, Serialize};

use crate::api::models::{ConversationId, Message, User};
use crate::error::Result;

/// Frames sent to the remote event endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "setup")]
    Setup(User),
    #[serde(rename = "join chat")]
    JoinChat(ConversationId),
    #[serde(rename = "typing")]
    Typing(ConversationId),
    #[serde(rename = "stop typing")]
    StopTyping(ConversationId),
    #[serde(rename = "new message")]
    NewMessage(Message),
}

impl OutboundEvent {
    /// Presence frames are worthless once stale, so they are never buffered offline.
    pub fn is_presence(&self) -> bool {
        matches!(self, OutboundEvent::Typing(_) | OutboundEvent::StopTyping(_))
    }
}

/// Frames pushed by the remote event endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "typing")]
    Typing(ConversationId),
    #[serde(rename = "stop typing")]
    StopTyping(ConversationId),
    #[serde(rename = "message received", alias = "message recieved")]
    MessageReceived(Message),
}

impl InboundEvent {
    /// Decode a text frame. `Ok(None)` means a well-formed frame for an event
    /// this client does not handle.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: serde_json::Value) -> Result<Option<Self>> {
        let name = raw
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        match serde_json::from_value::<InboundEvent>(raw) {
            Ok(event) => Ok(Some(event)),
            Err(_) if !KNOWN_INBOUND.contains(&name.as_str()) => {
                log::debug!("skipping unhandled event {:?}", name);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

const KNOWN_INBOUND: &[&str] = &[
    "connected",
    "typing",
    "stop typing",
    "message received",
    "message recieved",
];

/// Event names a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    ConnectError,
    Disconnected,
    Typing,
    StopTyping,
    MessageReceived,
}

/// Events delivered to subscribers: inbound frames plus the connection's own
/// lifecycle signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    ConnectError { reason: String },
    Disconnected { reason: String, will_retry: bool },
    Typing(ConversationId),
    StopTyping(ConversationId),
    MessageReceived(Message),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connected => EventKind::Connected,
            ChannelEvent::ConnectError { .. } => EventKind::ConnectError,
            ChannelEvent::Disconnected { .. } => EventKind::Disconnected,
            ChannelEvent::Typing(_) => EventKind::Typing,
            ChannelEvent::StopTyping(_) => EventKind::StopTyping,
            ChannelEvent::MessageReceived(_) => EventKind::MessageReceived,
        }
    }
}

impl From<InboundEvent> for ChannelEvent {
    fn from(event: InboundEvent) -> Self {
        match event {
            InboundEvent::Connected => ChannelEvent::Connected,
            InboundEvent::Typing(id) => ChannelEvent::Typing(id),
            InboundEvent::StopTyping(id) => ChannelEvent::StopTyping(id),
            InboundEvent::MessageReceived(msg) => ChannelEvent::MessageReceived(msg),
        }
    }
}
