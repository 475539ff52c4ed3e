/// Maps an unordered pair of identities to its single conversation
use crate::conversation_store::decode_conversation;
use crate::error::{ChatError, Result};
use crate::identity::{Identity, Session};
use crate::messenger_types::Conversation;
use crate::paths::StorePaths;
use crate::store::Store;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Canonical conversation id: base58 of a hash over the sorted pair.
/// Length-prefixed so `("ab", "c")` and `("a", "bc")` never collide.
pub fn conversation_id_for(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

    let mut hasher = Sha256::new();
    for id in [lo, hi] {
        hasher.update((id.len() as u64).to_be_bytes());
        hasher.update(id.as_bytes());
    }
    let hash = hasher.finalize();

    format!("dm-{}", bs58::encode(&hash[..]).into_string())
}

fn present(identity: Option<&Identity>) -> Result<&Identity> {
    identity
        .filter(|i| !i.id.trim().is_empty())
        .ok_or_else(|| ChatError::NotAuthenticated("identity missing".to_string()))
}

#[derive(Clone)]
pub struct ConversationResolver {
    store: Arc<dyn Store>,
    paths: StorePaths,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn Store>, paths: StorePaths) -> Self {
        Self { store, paths }
    }

    /// Conversation between the session's actor and `counterpart`
    pub fn open(&self, session: &Session, counterpart: &Identity) -> Result<Conversation> {
        self.find_or_create(session.actor(), Some(counterpart))
    }

    /// Existing conversation for the pair, or a new empty one. Creation is a
    /// create-if-absent write at the pair's canonical key, so racing callers all end
    /// up holding the same record.
    pub fn find_or_create(
        &self,
        identity_a: Option<&Identity>,
        identity_b: Option<&Identity>,
    ) -> Result<Conversation> {
        let a = present(identity_a)?;
        let b = present(identity_b)?;
        if a.id == b.id {
            return Err(ChatError::InvalidPair(a.id.clone()));
        }

        let id = conversation_id_for(&a.id, &b.id);
        let path = self.paths.conversation(&id);

        if let Some(raw) = self.store.get(&path)? {
            debug!("Resolved existing conversation {}", id);
            return decode_conversation(&raw);
        }

        let (lo, hi) = if a.id <= b.id { (a, b) } else { (b, a) };

        // Index first: a record that exists is always listed for both sides
        self.store
            .put(&self.paths.participant_entry(&lo.id, &id), hi.id.as_bytes().to_vec())?;
        self.store
            .put(&self.paths.participant_entry(&hi.id, &id), lo.id.as_bytes().to_vec())?;

        let conversation = Conversation {
            id: id.clone(),
            participant_a_id: lo.id.clone(),
            participant_b_id: hi.id.clone(),
            participant_a_name: lo.display_name.clone(),
            participant_b_name: hi.display_name.clone(),
            participant_a_role: lo.role,
            participant_b_role: hi.role,
            created_at: self.store.server_time()?,
            last_message_text: String::new(),
            last_message_timestamp: None,
            last_message_sender_id: String::new(),
            last_message_id: None,
        };

        if self
            .store
            .compare_and_swap(&path, None, serde_json::to_vec(&conversation)?)?
        {
            info!(
                "Created conversation {} between {} and {}",
                id, lo.id, hi.id
            );
            return Ok(conversation);
        }

        // Lost the race; the winner's record is authoritative
        debug!("Conversation {} created concurrently", id);
        let raw = self
            .store
            .get(&path)?
            .ok_or_else(|| ChatError::Storage(format!("conversation {} vanished", id)))?;
        decode_conversation(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn resolver() -> (MemoryStore, ConversationResolver) {
        let store = MemoryStore::new();
        let resolver = ConversationResolver::new(Arc::new(store.clone()), StorePaths::new("root"));
        (store, resolver)
    }

    #[test]
    fn test_id_is_order_independent() {
        assert_eq!(conversation_id_for("p1", "h1"), conversation_id_for("h1", "p1"));
        assert_ne!(conversation_id_for("ab", "c"), conversation_id_for("a", "bc"));
        assert!(conversation_id_for("p1", "h1").starts_with("dm-"));
    }

    #[test]
    fn test_find_or_create_both_directions() {
        let (store, resolver) = resolver();
        let p1 = Identity::patient("p1", "Asha");
        let h1 = Identity::provider("h1", "City Hospital");

        let first = resolver.find_or_create(Some(&p1), Some(&h1)).unwrap();
        let second = resolver.find_or_create(Some(&h1), Some(&p1)).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.participant_a_id, "h1");
        assert_eq!(first.participant_b_name, "Asha");
        assert_eq!(store.paths("root/conversations/").len(), 1);
    }

    #[test]
    fn test_rejects_missing_and_self() {
        let (_, resolver) = resolver();
        let p1 = Identity::patient("p1", "Asha");

        assert!(matches!(
            resolver.find_or_create(None, Some(&p1)),
            Err(ChatError::NotAuthenticated(_))
        ));
        assert!(matches!(
            resolver.find_or_create(Some(&p1), None),
            Err(ChatError::NotAuthenticated(_))
        ));
        assert!(matches!(
            resolver.find_or_create(Some(&p1), Some(&p1.clone())),
            Err(ChatError::InvalidPair(_))
        ));
        assert!(matches!(
            resolver.open(&Session::anonymous(), &p1),
            Err(ChatError::NotAuthenticated(_))
        ));
    }

    #[test]
    fn test_existing_record_is_returned_unchanged() {
        let (store, resolver) = resolver();
        let p1 = Identity::patient("p1", "Asha");
        let h1 = Identity::provider("h1", "City Hospital");

        let created = resolver.find_or_create(Some(&p1), Some(&h1)).unwrap();
        let before = store.get(&format!("root/conversations/{}", created.id)).unwrap();

        // Display names changing later does not rewrite the record
        let renamed = Identity::patient("p1", "Asha R.");
        let again = resolver.find_or_create(Some(&renamed), Some(&h1)).unwrap();
        assert_eq!(again.participant_b_name, "Asha");
        assert_eq!(
            store.get(&format!("root/conversations/{}", created.id)).unwrap(),
            before
        );
    }
}
