/// Messenger facade: one entry point over resolver, stores and sync
///
/// Operations:
///   open_conversation(session, counterpart)     find or create the pair's conversation
///   send(session, counterpart, text)            resolve + append
///   conversations(session)                      actor's list, most recent first
///   history(session, conversation_id)           one-shot log read
///   subscribe / subscribe_from                  live log
///   subscribe_conversations(session)            live list snapshots
///   mark_read / unread_count                    read flag
use crate::config::Config;
use crate::conversation_resolver::ConversationResolver;
use crate::conversation_store::ConversationStore;
use crate::error::{ChatError, Result};
use crate::identity::{Identity, Session};
use crate::message_stream::MessageStream;
use crate::messenger_types::{Conversation, Message, MessageId};
use crate::paths::StorePaths;
use crate::store::{MemoryStore, SledStore, Store};
use crate::sync::{ConversationListSubscription, MessageSubscription, MessageSync};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct MessengerApi {
    resolver: ConversationResolver,
    conversations: ConversationStore,
    stream: MessageStream,
    sync: MessageSync,
}

impl MessengerApi {
    /// Wire every component over one shared store
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        let paths = StorePaths::new(&config.root_path);
        let conversations = ConversationStore::new(store.clone(), paths.clone());
        let stream = MessageStream::new(store.clone(), paths.clone(), conversations.clone());
        let sync = MessageSync::new(
            store.clone(),
            paths.clone(),
            conversations.clone(),
            stream.clone(),
            config,
        );

        Self {
            resolver: ConversationResolver::new(store, paths),
            conversations,
            stream,
            sync,
        }
    }

    /// Open the store described by `config`: sled under `data_dir`, memory otherwise
    pub fn open(config: &Config) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.data_dir {
            Some(dir) => {
                info!("Using persistent store at {:?}", dir);
                Arc::new(SledStore::new(dir)?)
            }
            None => {
                info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(store, config))
    }

    pub fn resolver(&self) -> &ConversationResolver {
        &self.resolver
    }

    pub fn conversation_store(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn message_stream(&self) -> &MessageStream {
        &self.stream
    }

    pub fn sync(&self) -> &MessageSync {
        &self.sync
    }

    pub fn open_conversation(&self, session: &Session, counterpart: &Identity) -> Result<Conversation> {
        self.resolver.open(session, counterpart)
    }

    /// Send `text` to `counterpart`, creating the conversation on first contact
    pub fn send(&self, session: &Session, counterpart: &Identity, text: &str) -> Result<Message> {
        // Nothing is created for a message that would be refused anyway
        session.require()?;
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let conversation = self.resolver.open(session, counterpart)?;
        self.stream.append(session, &conversation.id, text)
    }

    /// The actor's conversations, most recent activity first
    pub fn conversations(&self, session: &Session) -> Result<Vec<Conversation>> {
        let actor = session.require()?;
        self.conversations.list_for(session, &actor.id)
    }

    pub fn history(&self, session: &Session, conversation_id: &str) -> Result<Vec<Message>> {
        self.stream.history(session, conversation_id)
    }

    pub fn subscribe(&self, session: &Session, conversation_id: &str) -> Result<MessageSubscription> {
        self.sync.subscribe(session, conversation_id)
    }

    pub fn subscribe_from(
        &self,
        session: &Session,
        conversation_id: &str,
        after: Option<MessageId>,
    ) -> Result<MessageSubscription> {
        self.sync.subscribe_from(session, conversation_id, after)
    }

    pub fn subscribe_conversations(&self, session: &Session) -> Result<ConversationListSubscription> {
        let actor = session.require()?;
        self.sync.subscribe_conversations(session, &actor.id)
    }

    pub fn mark_read(
        &self,
        session: &Session,
        conversation_id: &str,
        message_id: MessageId,
    ) -> Result<Message> {
        self.stream.mark_read(session, conversation_id, message_id)
    }

    pub fn unread_count(&self, session: &Session, conversation_id: &str) -> Result<usize> {
        self.stream.unread_count(session, conversation_id)
    }
}
