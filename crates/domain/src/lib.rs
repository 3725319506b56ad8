//! 实时消息与在线状态子系统的领域模型
//!
//! 包含会话、消息及其不变量，以及推送给客户端的事件类型。

pub mod conversation;
pub mod errors;
pub mod events;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::{Conversation, LastMessage, ParticipantState};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use events::ServerEvent;
pub use message::{Message, MessageDraft, Receipt};
pub use value_objects::{
    truncate_to_micros, AttachmentUrl, ConnectionId, ConversationId, MessageContent, MessageId,
    ParticipantPair, Timestamp, UserId,
};
