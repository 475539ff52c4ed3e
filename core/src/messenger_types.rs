/// Shared types for the messaging layer
use crate::identity::Role;
use serde::{Deserialize, Serialize};

/// Server-assigned id of a message, unique and increasing within a conversation
pub type MessageId = u64;

/// The single thread between two identities, plus its last-message projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Canonical ID derived from the sorted participant pair
    pub id: String,
    /// Lower of the two participant ids
    pub participant_a_id: String,
    /// Higher of the two participant ids
    pub participant_b_id: String,
    pub participant_a_name: String,
    pub participant_b_name: String,
    pub participant_a_role: Role,
    pub participant_b_role: Role,
    /// Server time (ms) at creation
    pub created_at: i64,
    pub last_message_text: String,
    pub last_message_timestamp: Option<i64>,
    pub last_message_sender_id: String,
    /// Id of the message the summary was built from
    pub last_message_id: Option<MessageId>,
}

/// `Empty` until the first successful append, `Active` afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Empty,
    Active,
}

impl Conversation {
    pub fn involves(&self, identity_id: &str) -> bool {
        self.participant_a_id == identity_id || self.participant_b_id == identity_id
    }

    /// The other participant's `(id, display_name)` as seen by `viewer_id`
    pub fn counterpart_of(&self, viewer_id: &str) -> Option<(&str, &str)> {
        if self.participant_a_id == viewer_id {
            Some((&self.participant_b_id, &self.participant_b_name))
        } else if self.participant_b_id == viewer_id {
            Some((&self.participant_a_id, &self.participant_a_name))
        } else {
            None
        }
    }

    /// List-view preview text, prefixed with "You: " for the viewer's own messages
    pub fn preview_for(&self, viewer_id: &str) -> Option<String> {
        if self.last_message_id.is_none() {
            return None;
        }
        if self.last_message_sender_id == viewer_id {
            Some(format!("You: {}", self.last_message_text))
        } else {
            Some(self.last_message_text.clone())
        }
    }

    pub fn state(&self) -> ConversationState {
        match self.last_message_id {
            Some(_) => ConversationState::Active,
            None => ConversationState::Empty,
        }
    }

    /// Timestamp used for list ordering (last message, else creation)
    pub fn activity_timestamp(&self) -> i64 {
        self.last_message_timestamp.unwrap_or(self.created_at)
    }

    /// True when `message` is newer than what the summary currently reflects
    pub(crate) fn summary_is_behind(&self, message: &Message) -> bool {
        match self.last_message_id {
            Some(id) => message.id > id,
            None => true,
        }
    }

    pub(crate) fn apply_summary(&mut self, message: &Message) {
        self.last_message_text = message.text.clone();
        self.last_message_timestamp = Some(message.timestamp);
        self.last_message_sender_id = message.sender_id.clone();
        self.last_message_id = Some(message.id);
    }
}

/// One immutable entry in a conversation's log. Only `read` ever changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    /// Server time (ms); never taken from the sender's clock
    pub timestamp: i64,
    pub read: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Conversation {
        Conversation {
            id: "dm-test".to_string(),
            participant_a_id: "h1".to_string(),
            participant_b_id: "p1".to_string(),
            participant_a_name: "City Hospital".to_string(),
            participant_b_name: "Asha".to_string(),
            participant_a_role: Role::Provider,
            participant_b_role: Role::Patient,
            created_at: 1_000,
            last_message_text: String::new(),
            last_message_timestamp: None,
            last_message_sender_id: String::new(),
            last_message_id: None,
        }
    }

    fn message(id: MessageId, sender: &str, text: &str) -> Message {
        Message {
            id,
            conversation_id: "dm-test".to_string(),
            sender_id: sender.to_string(),
            text: text.to_string(),
            timestamp: 2_000 + id as i64,
            read: false,
        }
    }

    #[test]
    fn test_counterpart_and_preview() {
        let mut conv = conversation();
        assert_eq!(conv.counterpart_of("p1"), Some(("h1", "City Hospital")));
        assert_eq!(conv.counterpart_of("h1"), Some(("p1", "Asha")));
        assert_eq!(conv.counterpart_of("x"), None);
        assert_eq!(conv.preview_for("p1"), None);
        assert_eq!(conv.state(), ConversationState::Empty);

        conv.apply_summary(&message(1, "p1", "Hello"));
        assert_eq!(conv.preview_for("p1").as_deref(), Some("You: Hello"));
        assert_eq!(conv.preview_for("h1").as_deref(), Some("Hello"));
        assert_eq!(conv.state(), ConversationState::Active);
        assert_eq!(conv.activity_timestamp(), 2_001);
    }

    #[test]
    fn test_summary_ordering() {
        let mut conv = conversation();
        let older = message(3, "p1", "first");
        let newer = message(7, "h1", "second");

        assert!(conv.summary_is_behind(&older));
        conv.apply_summary(&newer);
        assert!(!conv.summary_is_behind(&older));
        assert!(!conv.summary_is_behind(&newer));
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(message(1, "p1", "hi")).unwrap();
        assert_eq!(json["senderId"], "p1");
        assert_eq!(json["conversationId"], "dm-test");
    }
}
