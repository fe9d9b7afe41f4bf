//! Typing presence as a small state machine.
//!
//! Locally, an episode starts at the first keystroke after idling and ends one
//! quiet interval after the last keystroke. Each episode produces exactly one
//! `typing` and one `stop typing`. Remote indicators expire on their own so a
//! lost `stop typing` cannot leave them stuck.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::api::events::OutboundEvent;
use crate::api::models::ConversationId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingSignal {
    Start(ConversationId),
    Stop(ConversationId),
}

impl From<TypingSignal> for OutboundEvent {
    fn from(signal: TypingSignal) -> Self {
        match signal {
            TypingSignal::Start(id) => OutboundEvent::Typing(id),
            TypingSignal::Stop(id) => OutboundEvent::StopTyping(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LocalTyping {
    Idle,
    Active {
        conversation: ConversationId,
        deadline: Instant,
    },
}

/// Result of advancing the coordinator's clock.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TypingTick {
    pub stop: Option<TypingSignal>,
    pub remote_changed: bool,
}

#[derive(Debug)]
pub struct TypingCoordinator {
    quiet_interval: Duration,
    remote_timeout: Duration,
    local: LocalTyping,
    remote: HashMap<ConversationId, Instant>,
}

impl TypingCoordinator {
    pub fn new(quiet_interval: Duration, remote_timeout: Duration) -> Self {
        Self {
            quiet_interval,
            remote_timeout,
            local: LocalTyping::Idle,
            remote: HashMap::new(),
        }
    }

    pub fn is_local_typing(&self) -> bool {
        matches!(self.local, LocalTyping::Active { .. })
    }

    pub fn is_remote_typing(&self, conversation: &ConversationId) -> bool {
        self.remote.contains_key(conversation)
    }

    /// Record a keystroke. Starting an episode requires a live connection;
    /// keystrokes inside an episode only push its deadline back.
    pub fn on_local_keystroke(
        &mut self,
        conversation: &ConversationId,
        now: Instant,
        connected: bool,
    ) -> Vec<TypingSignal> {
        let deadline = now + self.quiet_interval;
        if let LocalTyping::Active {
            conversation: current,
            deadline: current_deadline,
        } = &mut self.local
        {
            if current == conversation {
                *current_deadline = deadline;
                return Vec::new();
            }
        }

        let mut signals: Vec<TypingSignal> = self.end_episode().into_iter().collect();
        if !connected {
            log::debug!("not connected; typing in {} not announced", conversation);
            return signals;
        }
        self.local = LocalTyping::Active {
            conversation: conversation.clone(),
            deadline,
        };
        signals.push(TypingSignal::Start(conversation.clone()));
        signals
    }

    /// End the current episode early, e.g. on send or conversation switch.
    pub fn end_episode(&mut self) -> Option<TypingSignal> {
        match std::mem::replace(&mut self.local, LocalTyping::Idle) {
            LocalTyping::Active { conversation, .. } => Some(TypingSignal::Stop(conversation)),
            LocalTyping::Idle => None,
        }
    }

    /// Returns true if the indicator for `conversation` was off.
    pub fn on_remote_typing(&mut self, conversation: ConversationId, now: Instant) -> bool {
        self.remote
            .insert(conversation, now + self.remote_timeout)
            .is_none()
    }

    pub fn on_remote_stop_typing(&mut self, conversation: &ConversationId) -> bool {
        self.remote.remove(conversation).is_some()
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }

    /// Expire whatever is due at `now`.
    pub fn poll(&mut self, now: Instant) -> TypingTick {
        let mut tick = TypingTick::default();
        if let LocalTyping::Active { deadline, .. } = &self.local {
            if *deadline <= now {
                tick.stop = self.end_episode();
            }
        }
        let before = self.remote.len();
        self.remote.retain(|conversation, expires| {
            let keep = *expires > now;
            if !keep {
                log::debug!("remote typing in {} expired", conversation);
            }
            keep
        });
        tick.remote_changed = self.remote.len() != before;
        tick
    }

    /// The single timer the owner needs to arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        let local = match &self.local {
            LocalTyping::Active { deadline, .. } => Some(*deadline),
            LocalTyping::Idle => None,
        };
        self.remote.values().copied().chain(local).min()
    }
}
