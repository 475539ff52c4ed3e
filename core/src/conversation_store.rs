/// Conversation records and their last-message projection
use crate::error::{ChatError, Result};
use crate::identity::Session;
use crate::messenger_types::{Conversation, Message};
use crate::paths::StorePaths;
use crate::store::Store;
use std::sync::Arc;
use tracing::{debug, warn};

/// Attempts at a contended summary write before giving up
const MAX_SUMMARY_ATTEMPTS: usize = 16;

pub(crate) fn decode_conversation(raw: &[u8]) -> Result<Conversation> {
    Ok(serde_json::from_slice::<Conversation>(raw)?)
}

pub(crate) fn decode_message(raw: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice::<Message>(raw)?)
}

#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn Store>,
    paths: StorePaths,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn Store>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    /// Raw record plus decoded value, or `ConversationNotFound`
    fn load_raw(&self, conversation_id: &str) -> Result<(Vec<u8>, Conversation)> {
        let raw = self
            .store
            .get(&self.paths.conversation(conversation_id))?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        let conversation = decode_conversation(&raw)?;
        Ok((raw, conversation))
    }

    /// Stored record as-is, without consulting the message log
    pub(crate) fn load(&self, conversation_id: &str) -> Result<Conversation> {
        self.load_raw(conversation_id).map(|(_, c)| c)
    }

    /// A conversation the session's actor takes part in
    pub fn get(&self, session: &Session, conversation_id: &str) -> Result<Conversation> {
        let actor = session.require()?;
        let conversation = self.load(conversation_id)?;
        if !conversation.involves(&actor.id) {
            return Err(ChatError::NotParticipant {
                identity: actor.id.clone(),
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(self.heal(conversation))
    }

    /// All conversations of `identity_id`, most recent activity first
    pub fn list_for(&self, session: &Session, identity_id: &str) -> Result<Vec<Conversation>> {
        let actor = session.require()?;
        if actor.id != identity_id {
            return Err(ChatError::NotAuthenticated(format!(
                "{} cannot list conversations of {}",
                actor.id, identity_id
            )));
        }
        self.list_for_identity(identity_id)
    }

    pub(crate) fn list_for_identity(&self, identity_id: &str) -> Result<Vec<Conversation>> {
        let entries = self
            .store
            .children(&self.paths.participant_index(identity_id), None)?;

        let mut out = Vec::with_capacity(entries.len());
        for (conversation_id, _) in entries {
            // Index entries are written before the record; a missing record means
            // creation never completed.
            match self.load(&conversation_id) {
                Ok(conversation) if conversation.involves(identity_id) => {
                    out.push(self.heal(conversation))
                }
                Ok(_) => warn!("Index entry {} does not involve {}", conversation_id, identity_id),
                Err(ChatError::ConversationNotFound(_)) => {
                    debug!("Skipping unfinished conversation {}", conversation_id)
                }
                Err(e) => return Err(e),
            }
        }

        out.sort_by(|a, b| {
            b.activity_timestamp()
                .cmp(&a.activity_timestamp())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    /// Overwrite the summary with `message` unless a newer message is already reflected.
    /// Concurrent writers resolve by message id, so the projection always ends on the
    /// latest appended message.
    pub fn update_summary(&self, message: &Message) -> Result<Conversation> {
        for _ in 0..MAX_SUMMARY_ATTEMPTS {
            let (raw, mut conversation) = self.load_raw(&message.conversation_id)?;
            if !conversation.summary_is_behind(message) {
                return Ok(conversation);
            }
            conversation.apply_summary(message);

            let updated = serde_json::to_vec(&conversation)?;
            if self.store.compare_and_swap(
                &self.paths.conversation(&conversation.id),
                Some(raw.as_slice()),
                updated,
            )? {
                debug!(
                    "Summary of {} now at message {}",
                    conversation.id, message.id
                );
                return Ok(conversation);
            }
        }
        Err(ChatError::Storage(format!(
            "summary of {} stayed contended",
            message.conversation_id
        )))
    }

    /// Bring a stale summary up to the newest message in the log. Reads always see the
    /// healed value; the write-back is best-effort.
    fn heal(&self, conversation: Conversation) -> Conversation {
        let latest = match self.store.last_child(&self.paths.messages(&conversation.id)) {
            Ok(Some((_, raw))) => match decode_message(&raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Undecodable message in {}: {}", conversation.id, e);
                    return conversation;
                }
            },
            Ok(None) => return conversation,
            Err(e) => {
                debug!("Could not check summary of {}: {}", conversation.id, e);
                return conversation;
            }
        };

        if !conversation.summary_is_behind(&latest) {
            return conversation;
        }

        warn!(
            "Summary of {} lagged behind message {}; repairing",
            conversation.id, latest.id
        );
        match self.update_summary(&latest) {
            Ok(healed) => healed,
            Err(e) => {
                debug!("Summary repair for {} deferred: {}", conversation.id, e);
                let mut healed = conversation;
                healed.apply_summary(&latest);
                healed
            }
        }
    }
}
