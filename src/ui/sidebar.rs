use chat_sync::SessionSnapshot;
use chat_sync::api::models::{Conversation, UserId};

/// Conversation list with unread badges. The open conversation is starred.
pub fn render_conversations(
    conversations: &[Conversation],
    me: &UserId,
    snapshot: &SessionSnapshot,
) -> Vec<String> {
    if conversations.is_empty() {
        return vec!["(no conversations)".to_string()];
    }
    conversations
        .iter()
        .map(|conversation| {
            let marker = if snapshot.conversation.as_ref() == Some(&conversation.id) {
                '*'
            } else {
                ' '
            };
            let unread = snapshot.unread_count(&conversation.id);
            let badge = if unread > 0 {
                format!(" ({unread} new)")
            } else {
                String::new()
            };
            format!(
                "{marker} {}  {}{badge}",
                conversation.id,
                conversation.display_name(me)
            )
        })
        .collect()
}
