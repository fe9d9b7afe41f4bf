//! Ordered, deduplicated message timeline for the active conversation.
//!
//! Entries are either a local placeholder keyed by [`LocalId`] or a confirmed
//! message keyed by its server [`MessageId`]. A placeholder is replaced in
//! place when its confirmation arrives, whichever path delivers it first.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::api::models::{ConversationId, LocalId, Message, MessageId, User};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingState {
    /// Scheduled, not yet submitted.
    Queued,
    Sending,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub local_id: LocalId,
    pub conversation_id: ConversationId,
    pub sender: User,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub state: PendingState,
}

impl PendingMessage {
    pub fn is_scheduled(&self) -> bool {
        self.scheduled_for.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Pending(LocalId),
    Confirmed(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Pending(PendingMessage),
    Confirmed(Message),
}

impl TimelineEntry {
    pub fn key(&self) -> EntryKey {
        match self {
            TimelineEntry::Pending(p) => EntryKey::Pending(p.local_id),
            TimelineEntry::Confirmed(m) => EntryKey::Confirmed(m.id.clone()),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, TimelineEntry::Pending(_))
    }

    pub fn content(&self) -> &str {
        match self {
            TimelineEntry::Pending(p) => &p.content,
            TimelineEntry::Confirmed(m) => &m.content,
        }
    }

    pub fn sender(&self) -> &User {
        match self {
            TimelineEntry::Pending(p) => &p.sender,
            TimelineEntry::Confirmed(m) => &m.sender,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            TimelineEntry::Pending(p) => &p.conversation_id,
            TimelineEntry::Confirmed(m) => &m.conversation_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Appended,
    /// A placeholder was swapped for the confirmed message.
    Replaced,
    /// Already present; nothing changed.
    Duplicate,
}

#[derive(Debug, Default, Clone)]
pub struct Timeline {
    conversation: Option<ConversationId>,
    entries: Vec<TimelineEntry>,
    confirmed: HashSet<MessageId>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        self.conversation.as_ref()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.confirmed.contains(id)
    }

    pub fn pending(&self, local_id: LocalId) -> Option<&PendingMessage> {
        self.entries.iter().find_map(|e| match e {
            TimelineEntry::Pending(p) if p.local_id == local_id => Some(p),
            _ => None,
        })
    }

    /// Empty timeline bound to `conversation`, shown while its history loads.
    pub fn reset(&mut self, conversation: Option<ConversationId>) {
        self.conversation = conversation;
        self.entries.clear();
        self.confirmed.clear();
    }

    /// Install a freshly loaded history. Entries for the same conversation that
    /// the history does not cover (pushed during the load, or still pending)
    /// are kept after it.
    pub fn replace_history(&mut self, conversation: ConversationId, history: Vec<Message>) {
        let survivors: Vec<TimelineEntry> = if self.conversation.as_ref() == Some(&conversation) {
            let ids: HashSet<&MessageId> = history.iter().map(|m| &m.id).collect();
            let clients: HashSet<LocalId> = history.iter().filter_map(|m| m.client_id).collect();
            self.entries
                .drain(..)
                .filter(|e| match e {
                    TimelineEntry::Pending(p) => !clients.contains(&p.local_id),
                    TimelineEntry::Confirmed(m) => !ids.contains(&m.id),
                })
                .collect()
        } else {
            Vec::new()
        };

        self.reset(Some(conversation));
        for message in history {
            if self.confirmed.insert(message.id.clone()) {
                self.entries.push(TimelineEntry::Confirmed(message));
            } else {
                log::debug!("history repeats message {}", message.id);
            }
        }
        for entry in survivors {
            if let TimelineEntry::Confirmed(m) = &entry {
                self.confirmed.insert(m.id.clone());
            }
            self.entries.push(entry);
        }
        self.debug_check();
    }

    /// Show a local send immediately. A second append for the same local id,
    /// or one whose confirmed copy is already shown, is ignored.
    pub fn append_optimistic(&mut self, pending: PendingMessage) -> bool {
        debug_assert_eq!(self.conversation.as_ref(), Some(&pending.conversation_id));
        if self.pending(pending.local_id).is_some() {
            log::debug!("placeholder {} already shown", pending.local_id);
            return false;
        }
        let landed = self.entries.iter().any(|e| match e {
            TimelineEntry::Confirmed(m) => m.client_id == Some(pending.local_id),
            TimelineEntry::Pending(_) => false,
        });
        if landed {
            log::debug!("send {} already confirmed", pending.local_id);
            return false;
        }
        self.entries.push(TimelineEntry::Pending(pending));
        true
    }

    /// Merge an authoritative message. Idempotent per server id; a placeholder
    /// carrying the same client id is replaced in place.
    pub fn reconcile(&mut self, message: Message) -> Reconciled {
        debug_assert_eq!(self.conversation.as_ref(), Some(&message.conversation_id));
        if self.confirmed.contains(&message.id) {
            log::debug!("message {} already in timeline", message.id);
            return Reconciled::Duplicate;
        }
        if let Some(local_id) = message.client_id {
            if let Some(index) = self.pending_index(local_id) {
                self.confirmed.insert(message.id.clone());
                self.entries[index] = TimelineEntry::Confirmed(message);
                self.debug_check();
                return Reconciled::Replaced;
            }
        }
        self.confirmed.insert(message.id.clone());
        self.entries.push(TimelineEntry::Confirmed(message));
        self.debug_check();
        Reconciled::Appended
    }

    /// The send for `local_id` was accepted as `message`. If the pushed copy
    /// already arrived the placeholder is dropped instead of duplicated.
    pub fn confirm(&mut self, local_id: LocalId, message: Message) -> Reconciled {
        let Some(index) = self.pending_index(local_id) else {
            return self.reconcile(message);
        };
        if self.confirmed.contains(&message.id) {
            self.entries.remove(index);
            self.debug_check();
            return Reconciled::Duplicate;
        }
        self.confirmed.insert(message.id.clone());
        self.entries[index] = TimelineEntry::Confirmed(message);
        self.debug_check();
        Reconciled::Replaced
    }

    pub fn mark_failed(&mut self, local_id: LocalId, reason: impl Into<String>) -> bool {
        self.set_state(local_id, PendingState::Failed {
            reason: reason.into(),
        })
    }

    pub fn mark_sending(&mut self, local_id: LocalId) -> bool {
        self.set_state(local_id, PendingState::Sending)
    }

    /// Replace a placeholder's body before it is submitted.
    pub fn revise(&mut self, local_id: LocalId, content: impl Into<String>) -> bool {
        let Some(index) = self.pending_index(local_id) else {
            return false;
        };
        if let TimelineEntry::Pending(p) = &mut self.entries[index] {
            p.content = content.into();
        }
        true
    }

    pub fn remove_pending(&mut self, local_id: LocalId) -> Option<PendingMessage> {
        let index = self.pending_index(local_id)?;
        match self.entries.remove(index) {
            TimelineEntry::Pending(p) => Some(p),
            TimelineEntry::Confirmed(_) => None,
        }
    }

    fn set_state(&mut self, local_id: LocalId, state: PendingState) -> bool {
        let Some(index) = self.pending_index(local_id) else {
            return false;
        };
        if let TimelineEntry::Pending(p) = &mut self.entries[index] {
            p.state = state;
        }
        true
    }

    fn pending_index(&self, local_id: LocalId) -> Option<usize> {
        self.entries.iter().position(|e| match e {
            TimelineEntry::Pending(p) => p.local_id == local_id,
            TimelineEntry::Confirmed(_) => false,
        })
    }

    fn debug_check(&self) {
        if cfg!(debug_assertions) {
            let confirmed = self
                .entries
                .iter()
                .filter(|e| !e.is_placeholder())
                .count();
            debug_assert_eq!(confirmed, self.confirmed.len(), "duplicate server id in timeline");
        }
    }
}
