/// Layout of messaging records in the store
///
/// ```text
/// <root>/conversations/<conversation_id>                 Conversation
/// <root>/participants/<identity_id>/<conversation_id>    index entry (value: counterpart id)
/// <root>/chatMessages/<conversation_id>/<message_key>    Message
/// ```
use crate::messenger_types::MessageId;
use crate::store::{child_key, child_path};

/// Escape an identity id so it always occupies exactly one path segment
fn segment(id: &str) -> String {
    id.replace('%', "%25").replace('/', "%2F")
}

#[derive(Debug, Clone)]
pub struct StorePaths {
    root: String,
}

impl StorePaths {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn conversations(&self) -> String {
        format!("{}/conversations", self.root)
    }

    pub fn conversation(&self, conversation_id: &str) -> String {
        child_path(&self.conversations(), conversation_id)
    }

    pub fn participant_index(&self, identity_id: &str) -> String {
        format!("{}/participants/{}", self.root, segment(identity_id))
    }

    pub fn participant_entry(&self, identity_id: &str, conversation_id: &str) -> String {
        child_path(&self.participant_index(identity_id), conversation_id)
    }

    pub fn messages(&self, conversation_id: &str) -> String {
        format!("{}/chatMessages/{}", self.root, conversation_id)
    }

    pub fn message(&self, conversation_id: &str, message_id: MessageId) -> String {
        child_path(&self.messages(conversation_id), &child_key(message_id))
    }

    /// `(conversation_id, message_key)` when `path` is a message record
    pub fn parse_message<'a>(&self, path: &'a str) -> Option<(&'a str, &'a str)> {
        let rest = path
            .strip_prefix(self.root.as_str())?
            .strip_prefix("/chatMessages/")?;
        let (conversation_id, key) = rest.split_once('/')?;
        if conversation_id.is_empty() || key.is_empty() || key.contains('/') {
            return None;
        }
        Some((conversation_id, key))
    }
}
