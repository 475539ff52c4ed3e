/// Subscriber-side handle: owned receiver, watchable status and cancellation
use crate::error::Result;
use crate::messenger_types::{Conversation, Message};
use futures_util::stream::{unfold, Stream};
use serde::Serialize;
use std::fmt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Connection state of a live subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    /// Attaching to the store for the first time
    Connecting,
    /// Caught up and receiving pushes
    Live,
    /// Store connection dropped; reattaching
    Resuming { attempt: u32 },
    /// Reattaching keeps failing; delivery is paused until it succeeds
    Degraded { attempts: u32 },
}

impl SyncStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, SyncStatus::Live)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Connecting => write!(f, "connecting"),
            SyncStatus::Live => write!(f, "live"),
            SyncStatus::Resuming { attempt } => write!(f, "resuming (attempt {})", attempt),
            SyncStatus::Degraded { attempts } => write!(f, "degraded after {} attempts", attempts),
        }
    }
}

/// Live, restartable sequence of `T`. Dropping it is the same as `unsubscribe`.
pub struct Subscription<T> {
    rx: mpsc::Receiver<Result<T>>,
    status: watch::Receiver<SyncStatus>,
    task: Option<JoinHandle<()>>,
}

pub type MessageSubscription = Subscription<Message>;
pub type ConversationListSubscription = Subscription<Vec<Conversation>>;

impl<T: Send + 'static> Subscription<T> {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<T>>,
        status: watch::Receiver<SyncStatus>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            status,
            task: Some(task),
        }
    }

    /// Next item. `Err(SubscriptionLost)` signals the degraded transition; the
    /// subscription keeps resuming after it. `None` once unsubscribed.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Wait for the status to change and return the new value
    pub async fn status_changed(&mut self) -> Option<SyncStatus> {
        self.status.changed().await.ok()?;
        Some(*self.status.borrow())
    }

    /// Stop delivery and release the store registration. Already delivered items stay
    /// with the caller.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        unfold(self, |mut sub| async move {
            let item = sub.next().await?;
            Some((item, sub))
        })
    }
}

impl<T> Subscription<T> {
    fn release(&mut self) {
        self.rx.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}
