//! 领域模型错误定义
//!
//! 区分两类错误：领域规则被违反（`DomainError`），以及存储层故障（`RepositoryError`）。

use thiserror::Error;

use crate::value_objects::UserId;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数校验失败
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 消息内容超过上限
    #[error("content is {len} bytes, limit is {max}")]
    ContentTooLong { len: usize, max: usize },

    /// 不能和自己建立会话
    #[error("a conversation needs two distinct participants")]
    SelfConversation,

    /// 用户不是会话参与者
    #[error("user {user_id} is not a participant of this conversation")]
    NotParticipant { user_id: UserId },

    /// 消息序号与会话当前序号不连续
    #[error("sequence {got} does not follow {last}")]
    SequenceGap { last: u64, got: u64 },
}

impl DomainError {
    /// 创建参数校验错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 存储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    #[error("record already exists")]
    Conflict,

    /// 存储层返回了错误（约束、数据损坏等）
    #[error("storage error: {message}")]
    Storage { message: String },

    /// 存储不可达（连接失败、连接池耗尽），调用方可以重试
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
