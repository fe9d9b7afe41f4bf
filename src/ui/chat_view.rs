use std::collections::HashMap;

use chat_sync::api::models::ConversationId;
use chat_sync::sync::timeline::{EntryKey, PendingState, TimelineEntry};
use chat_sync::{ConnectionState, SessionSnapshot};

pub fn render_entry(entry: &TimelineEntry) -> String {
    match entry {
        TimelineEntry::Confirmed(message) => format!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M"),
            message.sender.name,
            message.content
        ),
        TimelineEntry::Pending(pending) => {
            let status = match (&pending.state, pending.scheduled_for) {
                (PendingState::Failed { reason }, _) => format!("failed: {reason}, /resend to retry"),
                (_, Some(when)) => format!("scheduled for {}", when.format("%Y-%m-%d %H:%M UTC")),
                (PendingState::Sending, None) => "sending".to_string(),
                (PendingState::Queued, None) => "queued".to_string(),
            };
            format!("[--:--] {}: {} ({status})", pending.sender.name, pending.content)
        }
    }
}

/// Turns successive snapshots into console lines, printing only what changed.
#[derive(Default)]
pub struct ChatView {
    conversation: Option<ConversationId>,
    rendered: HashMap<EntryKey, String>,
    remote_typing: bool,
    connection: Option<ConnectionState>,
}

impl ChatView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
        let mut lines = Vec::new();

        if self.connection != Some(snapshot.connection) {
            self.connection = Some(snapshot.connection);
            lines.push(format!("-- connection: {:?}", snapshot.connection));
        }

        if self.conversation != snapshot.conversation {
            self.conversation = snapshot.conversation.clone();
            self.rendered.clear();
            self.remote_typing = false;
            match &snapshot.conversation {
                Some(id) => lines.push(format!("== {id} ==")),
                None => lines.push("== no conversation open ==".to_string()),
            }
        }
        if snapshot.loading && self.rendered.is_empty() {
            lines.push("   loading...".to_string());
        }

        for entry in &snapshot.entries {
            let line = render_entry(entry);
            let key = entry.key();
            if self.rendered.get(&key) != Some(&line) {
                lines.push(line.clone());
                self.rendered.insert(key, line);
            }
        }
        // forget entries that left the timeline so a re-added one prints again
        self.rendered
            .retain(|key, _| snapshot.entries.iter().any(|e| &e.key() == key));

        if snapshot.remote_typing != self.remote_typing {
            self.remote_typing = snapshot.remote_typing;
            if snapshot.remote_typing {
                lines.push("   typing...".to_string());
            }
        }
        lines
    }
}
