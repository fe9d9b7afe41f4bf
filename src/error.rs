use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::api::models::ConversationId;

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("connection failure: {0}")]
    Connection(String),

    #[error("gave up connecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("connection closed")]
    Closed,

    #[error("failed to load messages for {conversation}: {reason}")]
    HistoryLoad {
        conversation: ConversationId,
        reason: String,
    },

    #[error("failed to send message: {0}")]
    Send(String),

    #[error("scheduled time {requested} is not after {now}")]
    ScheduleInPast {
        requested: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("message body is empty")]
    EmptyMessage,

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("HTTP {0}")]
    Status(u16),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ChatError {
    /// Whether this failure is worth another connection attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Connection(_)
            | ChatError::Closed
            | ChatError::Http(_)
            | ChatError::WebSocket(_)
            | ChatError::Io(_) => true,
            ChatError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A non-blocking, user-visible signal. The front end shows these as toasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub description: Option<String>,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
