/// Per-conversation message log: ordered, append-only, server-stamped
use crate::conversation_store::{decode_message, ConversationStore};
use crate::error::{ChatError, Result};
use crate::identity::{Identity, Session};
use crate::messenger_types::{Conversation, Message, MessageId};
use crate::paths::StorePaths;
use crate::store::{child_key, PushStamp, Store};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts at a contended read-flag write
const MAX_MARK_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct MessageStream {
    store: Arc<dyn Store>,
    paths: StorePaths,
    conversations: ConversationStore,
}

impl MessageStream {
    pub fn new(store: Arc<dyn Store>, paths: StorePaths, conversations: ConversationStore) -> Self {
        Self {
            store,
            paths,
            conversations,
        }
    }

    /// Conversation the actor may write to or read from
    fn participating(&self, actor: &Identity, conversation_id: &str) -> Result<Conversation> {
        let conversation = self.conversations.load(conversation_id)?;
        if !conversation.involves(&actor.id) {
            return Err(ChatError::NotParticipant {
                identity: actor.id.clone(),
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(conversation)
    }

    /// Append a message from the session's actor. The store assigns id and timestamp;
    /// the conversation summary follows once the message is durable.
    pub fn append(&self, session: &Session, conversation_id: &str, text: &str) -> Result<Message> {
        let sender = session.require()?;
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.participating(sender, conversation_id)?;

        let build = |stamp: PushStamp| -> Result<Vec<u8>> {
            let message = Message {
                id: stamp.seq,
                conversation_id: conversation_id.to_string(),
                sender_id: sender.id.clone(),
                text: text.to_string(),
                timestamp: stamp.timestamp,
                read: false,
            };
            Ok(serde_json::to_vec(&message)?)
        };

        let stamp = self
            .store
            .push(&self.paths.messages(conversation_id), &build)
            .map_err(|e| {
                warn!("Append to {} failed: {}", conversation_id, e);
                ChatError::AppendFailed(e.to_string())
            })?;

        let message = Message {
            id: stamp.seq,
            conversation_id: conversation_id.to_string(),
            sender_id: sender.id.clone(),
            text: text.to_string(),
            timestamp: stamp.timestamp,
            read: false,
        };
        info!(
            "Message {} appended to {} by {}",
            message.id, conversation_id, sender.id
        );

        // The message is already durable; a lagging summary is repaired on next read
        if let Err(e) = self.conversations.update_summary(&message) {
            warn!(
                "Summary update for {} after message {} failed: {}",
                conversation_id, message.id, e
            );
        }

        Ok(message)
    }

    /// Every message of the conversation, ascending by id
    pub fn history(&self, session: &Session, conversation_id: &str) -> Result<Vec<Message>> {
        let actor = session.require()?;
        self.participating(actor, conversation_id)?;
        self.read_after(conversation_id, None)
    }

    /// Messages with id greater than `after`, ascending. No access check.
    pub(crate) fn read_after(
        &self,
        conversation_id: &str,
        after: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let after_key = after.map(child_key);
        let entries = self
            .store
            .children(&self.paths.messages(conversation_id), after_key.as_deref())?;

        let mut messages = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            match decode_message(&raw) {
                Ok(message) => messages.push(message),
                Err(e) => warn!("Skipping undecodable message {} in {}: {}", key, conversation_id, e),
            }
        }
        Ok(messages)
    }

    /// Flag a received message as read. Marking one's own message is a no-op.
    pub fn mark_read(
        &self,
        session: &Session,
        conversation_id: &str,
        message_id: MessageId,
    ) -> Result<Message> {
        let actor = session.require()?;
        self.participating(actor, conversation_id)?;
        let path = self.paths.message(conversation_id, message_id);

        for _ in 0..MAX_MARK_ATTEMPTS {
            let raw = self
                .store
                .get(&path)?
                .ok_or_else(|| ChatError::MessageNotFound(format!("{}/{}", conversation_id, message_id)))?;
            let mut message = decode_message(&raw)?;
            if message.read || message.sender_id == actor.id {
                return Ok(message);
            }

            message.read = true;
            if self
                .store
                .compare_and_swap(&path, Some(raw.as_slice()), serde_json::to_vec(&message)?)?
            {
                debug!("Message {} in {} read by {}", message_id, conversation_id, actor.id);
                return Ok(message);
            }
        }
        Err(ChatError::Storage(format!(
            "read flag of {}/{} stayed contended",
            conversation_id, message_id
        )))
    }

    /// Messages from the counterpart the actor has not read yet
    pub fn unread_count(&self, session: &Session, conversation_id: &str) -> Result<usize> {
        let actor = session.require()?;
        self.participating(actor, conversation_id)?;
        Ok(self
            .read_after(conversation_id, None)?
            .iter()
            .filter(|m| !m.read && m.sender_id != actor.id)
            .count())
    }
}
