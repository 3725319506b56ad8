use std::time::Duration;

use domain::{ConnectionId, ConversationId, DomainError, RepositoryError, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("authentication failed")]
    Authentication,
    #[error("user {user_id} may not access conversation {conversation_id}")]
    Authorization {
        user_id: UserId,
        conversation_id: ConversationId,
    },
    #[error("validation failed: {0}")]
    Validation(#[from] DomainError),
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("store error: {0}")]
    Persistence(RepositoryError),
    #[error("store did not answer within {0:?}")]
    StoreTimeout(Duration),
}

impl ApplicationError {
    pub fn authorization(user_id: UserId, conversation_id: ConversationId) -> Self {
        Self::Authorization {
            user_id,
            conversation_id,
        }
    }

    /// 客户端可以原样重试的错误：存储暂时不可用或超时。
    ///
    /// `Storage` 携带约束和不变量违例，重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreTimeout(_) | Self::Persistence(RepositoryError::Unavailable { .. })
        )
    }

    /// 推送给客户端的错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication => "AUTHENTICATION_FAILED",
            Self::Authorization { .. } => "NOT_PARTICIPANT",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            Self::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Self::Persistence(_) => "PERSISTENCE_FAILED",
            Self::StoreTimeout(_) => "STORE_TIMEOUT",
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Persistence(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(ApplicationError::StoreTimeout(Duration::from_secs(1)).is_retryable());
        assert!(ApplicationError::from(RepositoryError::unavailable("pool closed")).is_retryable());
        assert!(!ApplicationError::from(RepositoryError::NotFound).is_retryable());
        assert!(
            !ApplicationError::from(RepositoryError::storage("sequence gap in conversation"))
                .is_retryable()
        );
        assert!(!ApplicationError::Authentication.is_retryable());
        assert!(
            !ApplicationError::from(DomainError::invalid_argument("content", "empty"))
                .is_retryable()
        );
    }
}
