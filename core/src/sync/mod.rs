/// Live delivery of message logs and conversation lists
///
/// Every subscription runs as its own task: it registers with the store first, then
/// catches up from its last delivered position, then re-reads from that position on
/// each relevant push. A dropped store connection is resumed the same way, so the
/// subscriber sees no gaps and no duplicates.
pub mod resume;
pub mod subscription;

pub use subscription::{ConversationListSubscription, MessageSubscription, Subscription, SyncStatus};

use crate::config::{Config, ResumePolicy};
use crate::conversation_store::{decode_conversation, ConversationStore};
use crate::error::{ChatError, Result};
use crate::identity::Session;
use crate::message_stream::MessageStream;
use crate::messenger_types::{Conversation, Message, MessageId};
use crate::paths::StorePaths;
use crate::store::{child_key, is_direct_child, leaf, Store, StoreEvent, StoreSubscription};
use resume::ResumeState;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Source of items for one subscription
trait Feed: Send + 'static {
    type Item: Send + 'static;

    /// Store path whose pushes drive this feed
    fn watch_path(&self) -> String;

    /// Items owed since the last delivered position; advances that position
    fn catch_up(&mut self) -> Result<Vec<Self::Item>>;

    /// Whether a change at `path` can produce anything new
    fn is_relevant(&self, path: &str, value: &[u8]) -> bool;
}

/// One conversation's log, delivered in id order
struct MessageFeed {
    stream: MessageStream,
    conversation_id: String,
    messages_path: String,
    last: Option<MessageId>,
}

impl Feed for MessageFeed {
    type Item = Message;

    fn watch_path(&self) -> String {
        self.messages_path.clone()
    }

    fn catch_up(&mut self) -> Result<Vec<Message>> {
        let messages = self.stream.read_after(&self.conversation_id, self.last)?;
        if let Some(newest) = messages.last() {
            self.last = Some(newest.id);
        }
        Ok(messages)
    }

    fn is_relevant(&self, path: &str, _value: &[u8]) -> bool {
        if !is_direct_child(&self.messages_path, path) {
            return false;
        }
        match self.last {
            Some(last) => leaf(path) > child_key(last).as_str(),
            None => true,
        }
    }
}

/// An identity's conversation list, delivered as whole snapshots. Wakes on record
/// writes and on message pushes newer than a listed summary, so a summary whose write
/// was lost is healed by the next snapshot.
struct ConversationListFeed {
    conversations: ConversationStore,
    paths: StorePaths,
    identity_id: String,
    conversations_path: String,
    last: Option<Vec<Conversation>>,
}

impl ConversationListFeed {
    /// Whether a pushed message is newer than what the last snapshot shows for it
    fn is_unsummarized(&self, conversation_id: &str, key: &str) -> bool {
        let listed = self
            .last
            .as_ref()
            .and_then(|list| list.iter().find(|c| c.id == conversation_id));
        match listed {
            Some(conversation) => match conversation.last_message_id {
                Some(id) => key > child_key(id).as_str(),
                None => true,
            },
            None => false,
        }
    }
}

impl Feed for ConversationListFeed {
    type Item = Vec<Conversation>;

    fn watch_path(&self) -> String {
        self.paths.root().to_string()
    }

    fn catch_up(&mut self) -> Result<Vec<Vec<Conversation>>> {
        let snapshot = self.conversations.list_for_identity(&self.identity_id)?;
        if self.last.as_ref() == Some(&snapshot) {
            return Ok(Vec::new());
        }
        self.last = Some(snapshot.clone());
        Ok(vec![snapshot])
    }

    fn is_relevant(&self, path: &str, value: &[u8]) -> bool {
        if is_direct_child(&self.conversations_path, path) {
            return decode_conversation(value)
                .map(|c| c.involves(&self.identity_id))
                .unwrap_or(false);
        }
        match self.paths.parse_message(path) {
            Some((conversation_id, key)) => self.is_unsummarized(conversation_id, key),
            None => false,
        }
    }
}

/// Forward `items`; false once the subscriber is gone
async fn deliver<T>(tx: &mpsc::Sender<Result<T>>, items: Vec<T>) -> bool {
    for item in items {
        if tx.send(Ok(item)).await.is_err() {
            return false;
        }
    }
    true
}

enum Detach {
    /// Subscriber went away
    Closed,
    /// Store connection dropped or a catch-up read failed
    Lost(String),
}

/// Pump store pushes into the feed until the registration breaks
async fn pump<F: Feed>(
    store: &dyn Store,
    feed: &mut F,
    path: &str,
    tx: &mpsc::Sender<Result<F::Item>>,
) -> Result<Detach> {
    // Register before reading so writes landing during catch-up are not missed
    let mut registration = store.subscribe(path)?;
    let backlog = feed.catch_up()?;
    if !deliver(tx, backlog).await {
        return Ok(Detach::Closed);
    }
    Ok(follow(&mut registration, feed, tx).await)
}

async fn follow<F: Feed>(
    registration: &mut StoreSubscription,
    feed: &mut F,
    tx: &mpsc::Sender<Result<F::Item>>,
) -> Detach {
    loop {
        tokio::select! {
            _ = tx.closed() => return Detach::Closed,
            event = registration.next() => match event {
                Some(StoreEvent::Changed { path, value }) => {
                    if !feed.is_relevant(&path, &value) {
                        continue;
                    }
                    match feed.catch_up() {
                        Ok(items) => {
                            if !deliver(tx, items).await {
                                return Detach::Closed;
                            }
                        }
                        Err(e) => return Detach::Lost(e.to_string()),
                    }
                }
                Some(StoreEvent::Removed { .. }) => continue,
                Some(StoreEvent::Lost(reason)) => return Detach::Lost(reason),
                None => return Detach::Lost("store registration closed".to_string()),
            }
        }
    }
}

/// Subscription task: attach, follow, and reattach with backoff until the subscriber
/// goes away
async fn run_feed<F: Feed>(
    store: Arc<dyn Store>,
    mut feed: F,
    policy: ResumePolicy,
    tx: mpsc::Sender<Result<F::Item>>,
    status: watch::Sender<SyncStatus>,
) {
    let path = feed.watch_path();
    let mut resume = ResumeState::new(policy);

    loop {
        match pump(&*store, &mut feed, &path, &tx).await {
            Ok(Detach::Closed) => {
                debug!("Subscriber of {} went away", path);
                return;
            }
            Ok(Detach::Lost(reason)) => {
                // Was live until now; start a fresh resume sequence
                resume.reset();
                warn!("Subscription to {} lost: {}", path, reason);
                let _ = status.send(SyncStatus::Resuming {
                    attempt: resume.attempt(),
                });
            }
            Err(e) => {
                let crossed = resume.fail();
                if resume.is_degraded() {
                    let _ = status.send(SyncStatus::Degraded {
                        attempts: resume.failures(),
                    });
                } else {
                    let _ = status.send(SyncStatus::Resuming {
                        attempt: resume.attempt(),
                    });
                }
                if crossed {
                    warn!(
                        "Subscription to {} degraded after {} attempts: {}",
                        path,
                        resume.failures(),
                        e
                    );
                    let lost = ChatError::SubscriptionLost(format!(
                        "{} unavailable after {} attempts: {}",
                        path,
                        resume.failures(),
                        e
                    ));
                    if tx.send(Err(lost)).await.is_err() {
                        return;
                    }
                } else {
                    debug!("Resume of {} failed: {}", path, e);
                }
            }
        }

        tokio::select! {
            _ = tx.closed() => return,
            _ = tokio::time::sleep(resume.delay()) => {}
        }
    }
}

/// Marks the subscription live once its first catch-up has been read
struct LiveMarker<F: Feed> {
    inner: F,
    status: watch::Sender<SyncStatus>,
    path: String,
}

impl<F: Feed> Feed for LiveMarker<F> {
    type Item = F::Item;

    fn watch_path(&self) -> String {
        self.inner.watch_path()
    }

    fn catch_up(&mut self) -> Result<Vec<F::Item>> {
        let items = self.inner.catch_up()?;
        if !self.status.borrow().is_live() {
            info!("Subscription to {} is live", self.path);
            let _ = self.status.send(SyncStatus::Live);
        }
        Ok(items)
    }

    fn is_relevant(&self, path: &str, value: &[u8]) -> bool {
        self.inner.is_relevant(path, value)
    }
}

/// Entry point for live views. Subscriptions must be opened inside a Tokio runtime.
#[derive(Clone)]
pub struct MessageSync {
    store: Arc<dyn Store>,
    paths: StorePaths,
    conversations: ConversationStore,
    stream: MessageStream,
    buffer: usize,
    policy: ResumePolicy,
}

impl MessageSync {
    pub fn new(
        store: Arc<dyn Store>,
        paths: StorePaths,
        conversations: ConversationStore,
        stream: MessageStream,
        config: &Config,
    ) -> Self {
        Self {
            store,
            paths,
            conversations,
            stream,
            buffer: config.subscription_buffer.max(1),
            policy: config.resume.clone(),
        }
    }

    /// Full history of the conversation, then every later message as it is appended
    pub fn subscribe(&self, session: &Session, conversation_id: &str) -> Result<MessageSubscription> {
        self.subscribe_from(session, conversation_id, None)
    }

    /// Messages after `after` (all of them when `None`), then live ones
    pub fn subscribe_from(
        &self,
        session: &Session,
        conversation_id: &str,
        after: Option<MessageId>,
    ) -> Result<MessageSubscription> {
        // Access errors are the caller's and surface here, never through resume
        self.conversations.get(session, conversation_id)?;

        info!(
            "Subscribing {} to {} after {:?}",
            session.require()?.id,
            conversation_id,
            after
        );
        let feed = MessageFeed {
            stream: self.stream.clone(),
            conversation_id: conversation_id.to_string(),
            messages_path: self.paths.messages(conversation_id),
            last: after,
        };
        Ok(self.spawn(feed))
    }

    /// Snapshots of the identity's conversation list, re-sent whenever it changes
    pub fn subscribe_conversations(
        &self,
        session: &Session,
        identity_id: &str,
    ) -> Result<ConversationListSubscription> {
        // Same authorization as a one-shot list, without reading anything
        let actor = session.require()?;
        if actor.id != identity_id {
            return Err(ChatError::NotAuthenticated(format!(
                "{} cannot watch conversations of {}",
                actor.id, identity_id
            )));
        }

        info!("Subscribing {} to its conversation list", identity_id);
        let feed = ConversationListFeed {
            conversations: self.conversations.clone(),
            paths: self.paths.clone(),
            identity_id: identity_id.to_string(),
            conversations_path: self.paths.conversations(),
            last: None,
        };
        Ok(self.spawn(feed))
    }

    fn spawn<F: Feed>(&self, feed: F) -> Subscription<F::Item> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let (status_tx, status_rx) = watch::channel(SyncStatus::Connecting);
        let feed = LiveMarker {
            path: feed.watch_path(),
            inner: feed,
            status: status_tx.clone(),
        };
        let task = tokio::spawn(run_feed(
            self.store.clone(),
            feed,
            self.policy.clone(),
            tx,
            status_tx,
        ));
        Subscription::new(rx, status_rx, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation_resolver::ConversationResolver;
    use crate::identity::Identity;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        store: MemoryStore,
        resolver: ConversationResolver,
        conversations: ConversationStore,
        stream: MessageStream,
        sync: MessageSync,
        conversation_id: String,
        patient: Session,
        provider: Session,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let paths = StorePaths::new("root");
        let mut config = Config::default();
        config.resume = ResumePolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            degraded_after: 3,
        };

        let conversations = ConversationStore::new(shared.clone(), paths.clone());
        let stream = MessageStream::new(shared.clone(), paths.clone(), conversations.clone());
        let sync = MessageSync::new(
            shared.clone(),
            paths.clone(),
            conversations.clone(),
            stream.clone(),
            &config,
        );

        let p1 = Identity::patient("p1", "Asha");
        let h1 = Identity::provider("h1", "City Hospital");
        let resolver = ConversationResolver::new(shared, paths);
        let conversation = resolver.find_or_create(Some(&p1), Some(&h1)).unwrap();

        Fixture {
            store,
            resolver,
            conversations,
            stream,
            sync,
            conversation_id: conversation.id,
            patient: Session::authenticated(p1),
            provider: Session::authenticated(h1),
        }
    }

    async fn next<T: Send + 'static>(sub: &mut Subscription<T>) -> Result<T> {
        timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timed out waiting for item")
            .expect("subscription ended")
    }

    async fn wait_for<T: Send + 'static>(sub: &mut Subscription<T>, wanted: SyncStatus) {
        timeout(Duration::from_secs(2), async {
            while sub.status() != wanted {
                if sub.status_changed().await.is_none() {
                    break;
                }
            }
        })
        .await
        .expect("status never reached");
        assert_eq!(sub.status(), wanted);
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let f = fixture();
        let id = &f.conversation_id;
        f.stream.append(&f.patient, id, "one").unwrap();

        let mut sub = f.sync.subscribe(&f.provider, id).unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "one");

        f.stream.append(&f.provider, id, "two").unwrap();
        f.stream.append(&f.patient, id, "three").unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "two");
        assert_eq!(next(&mut sub).await.unwrap().text, "three");
        assert!(sub.status().is_live());
    }

    #[tokio::test]
    async fn test_read_flag_change_is_not_redelivered() {
        let f = fixture();
        let id = &f.conversation_id;
        let first = f.stream.append(&f.provider, id, "one").unwrap();

        let mut sub = f.sync.subscribe(&f.patient, id).unwrap();
        assert_eq!(next(&mut sub).await.unwrap().id, first.id);

        f.stream.mark_read(&f.patient, id, first.id).unwrap();
        f.stream.append(&f.provider, id, "two").unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "two");
    }

    #[tokio::test]
    async fn test_subscribe_from_cursor() {
        let f = fixture();
        let id = &f.conversation_id;
        let first = f.stream.append(&f.patient, id, "one").unwrap();
        f.stream.append(&f.patient, id, "two").unwrap();

        let mut sub = f.sync.subscribe_from(&f.provider, id, Some(first.id)).unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "two");
    }

    #[tokio::test]
    async fn test_caller_errors_surface_immediately() {
        let f = fixture();
        assert!(matches!(
            f.sync.subscribe(&Session::anonymous(), &f.conversation_id),
            Err(ChatError::NotAuthenticated(_))
        ));
        assert!(matches!(
            f.sync.subscribe(&f.patient, "dm-missing"),
            Err(ChatError::ConversationNotFound(_))
        ));
        let outsider = Session::authenticated(Identity::patient("p2", "Other"));
        assert!(matches!(
            f.sync.subscribe(&outsider, &f.conversation_id),
            Err(ChatError::NotParticipant { .. })
        ));
        assert!(matches!(
            f.sync.subscribe_conversations(&f.patient, "h1"),
            Err(ChatError::NotAuthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_after_dropped_connection() {
        let f = fixture();
        let id = &f.conversation_id;
        f.stream.append(&f.patient, id, "one").unwrap();

        let mut sub = f.sync.subscribe(&f.provider, id).unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "one");
        wait_for(&mut sub, SyncStatus::Live).await;

        f.store.drop_subscriptions();
        f.stream.append(&f.patient, id, "two").unwrap();

        // Redelivered from the cursor, not from the start
        assert_eq!(next(&mut sub).await.unwrap().text, "two");
        f.stream.append(&f.patient, id, "three").unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "three");
    }

    #[tokio::test]
    async fn test_degraded_then_recovered() {
        let f = fixture();
        let id = &f.conversation_id;
        f.stream.append(&f.patient, id, "one").unwrap();

        let mut sub = f.sync.subscribe(&f.provider, id).unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "one");
        wait_for(&mut sub, SyncStatus::Live).await;

        f.store.set_offline(true);
        assert!(matches!(
            next(&mut sub).await,
            Err(ChatError::SubscriptionLost(_))
        ));
        assert!(matches!(sub.status(), SyncStatus::Degraded { .. }));

        f.store.set_offline(false);
        f.stream.append(&f.patient, id, "two").unwrap();
        assert_eq!(next(&mut sub).await.unwrap().text, "two");
        wait_for(&mut sub, SyncStatus::Live).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_registration() {
        let f = fixture();
        let sub = f.sync.subscribe(&f.patient, &f.conversation_id).unwrap();

        timeout(Duration::from_secs(2), async {
            while f.store.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        sub.unsubscribe();
        timeout(Duration::from_secs(2), async {
            while f.store.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Stored data is untouched
        assert!(f.stream.history(&f.patient, &f.conversation_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_list_snapshots() {
        let f = fixture();
        let mut list = f.sync.subscribe_conversations(&f.provider, "h1").unwrap();

        let initial = next(&mut list).await.unwrap();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].last_message_id, None);

        f.stream
            .append(&f.patient, &f.conversation_id, "Hello")
            .unwrap();
        let updated = next(&mut list).await.unwrap();
        assert_eq!(updated[0].last_message_text, "Hello");
        assert_eq!(updated[0].preview_for("h1").as_deref(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_list_heals_lost_summary_write() {
        let f = fixture();
        let mut list = f.sync.subscribe_conversations(&f.provider, "h1").unwrap();
        assert_eq!(next(&mut list).await.unwrap()[0].last_message_id, None);

        // Message lands, its summary write does not; nobody reads one-shot afterwards
        f.store.fail_next_writes_under("root/conversations/", 1);
        let sent = f
            .stream
            .append(&f.patient, &f.conversation_id, "Is this normal?")
            .unwrap();

        let snapshot = next(&mut list).await.unwrap();
        assert_eq!(snapshot[0].last_message_id, Some(sent.id));
        assert_eq!(snapshot[0].last_message_text, "Is this normal?");
        assert_eq!(
            f.conversations.load(&f.conversation_id).unwrap().last_message_id,
            Some(sent.id)
        );
    }

    #[tokio::test]
    async fn test_list_resumes_without_duplicates() {
        let f = fixture();
        let mut list = f.sync.subscribe_conversations(&f.provider, "h1").unwrap();
        assert_eq!(next(&mut list).await.unwrap().len(), 1);
        wait_for(&mut list, SyncStatus::Live).await;

        f.store.drop_subscriptions();
        let p2 = Identity::patient("p2", "Meera");
        let h1 = Identity::provider("h1", "City Hospital");
        f.resolver.find_or_create(Some(&p2), Some(&h1)).unwrap();

        let snapshot = next(&mut list).await.unwrap();
        assert_eq!(snapshot.len(), 2);

        // After the reattach the same list is not sent again
        assert!(timeout(Duration::from_millis(150), list.next()).await.is_err());

        f.stream
            .append(&f.patient, &f.conversation_id, "Hello")
            .unwrap();
        let snapshot = next(&mut list).await.unwrap();
        let updated = snapshot
            .iter()
            .find(|c| c.id == f.conversation_id)
            .unwrap();
        assert_eq!(updated.last_message_text, "Hello");
        assert!(timeout(Duration::from_millis(150), list.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_list_degraded_then_recovered() {
        let f = fixture();
        let mut list = f.sync.subscribe_conversations(&f.patient, "p1").unwrap();
        assert_eq!(next(&mut list).await.unwrap().len(), 1);
        wait_for(&mut list, SyncStatus::Live).await;

        f.store.set_offline(true);
        assert!(matches!(
            next(&mut list).await,
            Err(ChatError::SubscriptionLost(_))
        ));

        f.store.set_offline(false);
        f.stream
            .append(&f.provider, &f.conversation_id, "Scan booked")
            .unwrap();
        let snapshot = next(&mut list).await.unwrap();
        assert_eq!(snapshot[0].preview_for("p1").as_deref(), Some("Scan booked"));
        wait_for(&mut list, SyncStatus::Live).await;
    }

    #[tokio::test]
    async fn test_list_access_check_reads_nothing() {
        let f = fixture();
        f.store.set_offline(true);

        // Authorization needs no store access; the feed itself waits for the store
        let list = f.sync.subscribe_conversations(&f.patient, "p1");
        assert!(list.is_ok());
        assert!(matches!(
            f.sync.subscribe_conversations(&f.patient, "h1"),
            Err(ChatError::NotAuthenticated(_))
        ));
        f.store.set_offline(false);
    }
}
