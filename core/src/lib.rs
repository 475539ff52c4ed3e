/// CareLink - Patient/provider direct messaging core
///
/// Deduplicated two-party conversations, an ordered server-stamped message log,
/// a self-healing last-message summary and resumable live subscriptions over a
/// hierarchical key-value store.

pub mod config;
pub mod conversation_resolver;
pub mod conversation_store;
pub mod error;
pub mod identity;
pub mod message_stream;
pub mod messenger_api;
pub mod messenger_types;
pub mod paths;
pub mod store;
pub mod sync;

pub use config::{Config, ResumePolicy};
pub use conversation_resolver::{conversation_id_for, ConversationResolver};
pub use conversation_store::ConversationStore;
pub use error::{ChatError, Result};
pub use identity::{Identity, Role, Session};
pub use message_stream::MessageStream;
pub use messenger_api::MessengerApi;
pub use messenger_types::{Conversation, ConversationState, Message, MessageId};
pub use store::{MemoryStore, SledStore, Store};
pub use sync::{ConversationListSubscription, MessageSubscription, MessageSync, Subscription, SyncStatus};
