use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Client-generated identifier for a send that the server has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        })*
    };
}

display_inner!(ConversationId, MessageId, UserId);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pic: Option<String>,
}

/// The local user as handed over by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: User,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    #[serde(rename = "_id")]
    pub id: ConversationId,
    #[serde(rename = "isGroupChat", default)]
    pub is_group: bool,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(rename = "chatName", default)]
    pub name: String,
}

impl Conversation {
    /// Title shown for the conversation: the group name, or the other participant.
    pub fn display_name(&self, me: &UserId) -> String {
        if self.is_group {
            return self.name.clone();
        }
        self.users
            .iter()
            .find(|u| &u.id != me)
            .or_else(|| self.users.first())
            .map(|u| u.name.clone())
            .unwrap_or_else(|| self.name.clone())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender: User,
    pub content: String,
    #[serde(rename = "chat", deserialize_with = "chat_ref")]
    pub conversation_id: ConversationId,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "scheduledFor",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<LocalId>,
}

// the server sends either the bare chat id or the populated chat document
fn chat_ref<'de, D>(deserializer: D) -> Result<ConversationId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ChatRef {
        Id(ConversationId),
        Populated {
            #[serde(rename = "_id")]
            id: ConversationId,
        },
    }

    Ok(match ChatRef::deserialize(deserializer)? {
        ChatRef::Id(id) | ChatRef::Populated { id } => id,
    })
}

/// Body of the persistence request.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub content: String,
    #[serde(rename = "chatId")]
    pub conversation_id: ConversationId,
    #[serde(rename = "scheduledFor", skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(rename = "clientId")]
    pub client_id: LocalId,
}
