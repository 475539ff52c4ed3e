/// Error types for the messaging core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Invalid pair: {0} cannot start a conversation with itself")]
    InvalidPair(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("{identity} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        identity: String,
        conversation_id: String,
    },

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("Append failed: {0}")]
    AppendFailed(String),

    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChatError {
    /// Errors caused by the caller's input. Surfaced as-is, never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ChatError::NotAuthenticated(_)
                | ChatError::InvalidPair(_)
                | ChatError::ConversationNotFound(_)
                | ChatError::MessageNotFound(_)
                | ChatError::NotParticipant { .. }
                | ChatError::EmptyMessage
        )
    }

    /// Errors that may succeed if the same operation is issued again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::AppendFailed(_) | ChatError::SubscriptionLost(_) | ChatError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChatError::InvalidPair("p1".into()).is_caller_error());
        assert!(ChatError::EmptyMessage.is_caller_error());
        assert!(!ChatError::AppendFailed("disk".into()).is_caller_error());

        assert!(ChatError::AppendFailed("disk".into()).is_transient());
        assert!(ChatError::SubscriptionLost("reset".into()).is_transient());
        assert!(!ChatError::ConversationNotFound("dm-x".into()).is_transient());
    }
}
