//! Decides whether an inbound message belongs to the open conversation or to
//! the cross-conversation notification feed.

use std::collections::{HashMap, VecDeque};

use crate::api::models::{ConversationId, Message};
use crate::sync::timeline::{Reconciled, Timeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Timeline(Reconciled),
    Notified,
    /// Already in the feed.
    Ignored,
}

/// Most recent first, bounded.
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    capacity: usize,
    items: VecDeque<Message>,
}

impl NotificationFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
        }
    }

    pub fn items(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unread messages per conversation. Conversations with none are absent.
    pub fn unread_counts(&self) -> HashMap<ConversationId, usize> {
        let mut counts = HashMap::new();
        for message in &self.items {
            *counts.entry(message.conversation_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn push_front(&mut self, message: Message) -> bool {
        if self.items.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.items.push_front(message);
        self.items.truncate(self.capacity);
        true
    }

    /// Drop everything for a conversation the user just opened.
    pub fn dismiss_conversation(&mut self, conversation: &ConversationId) -> usize {
        let before = self.items.len();
        self.items.retain(|m| &m.conversation_id != conversation);
        before - self.items.len()
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRouter {
    feed: NotificationFeed,
    list_revision: u64,
}

impl NotificationRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            feed: NotificationFeed::new(capacity),
            list_revision: 0,
        }
    }

    pub fn feed(&self) -> &NotificationFeed {
        &self.feed
    }

    /// Bumped whenever the conversation list needs refreshing.
    pub fn list_revision(&self) -> u64 {
        self.list_revision
    }

    /// Evaluated per message against the conversation open right now.
    pub fn route(
        &mut self,
        message: Message,
        active: Option<&ConversationId>,
        timeline: &mut Timeline,
    ) -> Routed {
        if active == Some(&message.conversation_id) {
            return Routed::Timeline(timeline.reconcile(message));
        }
        log::debug!(
            "message {} for inactive conversation {}",
            message.id,
            message.conversation_id
        );
        if !self.feed.push_front(message) {
            return Routed::Ignored;
        }
        self.list_revision += 1;
        Routed::Notified
    }

    pub fn dismiss_conversation(&mut self, conversation: &ConversationId) {
        let removed = self.feed.dismiss_conversation(conversation);
        if removed > 0 {
            log::debug!("dismissed {} notifications for {}", removed, conversation);
        }
    }
}
