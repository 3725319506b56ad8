//! 服务端推送给长连接客户端的事件
//!
//! 所有事件都是尽力投递的：丢失的事件由客户端通过对账接口补齐。

use serde::{Deserialize, Serialize};

use crate::conversation::Conversation;
use crate::message::Message;
use crate::value_objects::{ConnectionId, ConversationId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// 认证成功，连接已建立
    Authenticated {
        user_id: UserId,
        connection_id: ConnectionId,
        heartbeat_interval_secs: u64,
    },
    Subscribed {
        conversation_id: ConversationId,
    },
    Unsubscribed {
        conversation_id: ConversationId,
    },
    /// 仅发给发起发送的那条连接
    SendAccepted {
        client_ref: Option<String>,
        message: Message,
    },
    /// 发给订阅了该会话的对方连接
    NewMessage {
        message: Message,
        conversation: Conversation,
    },
    /// 发给发送者的其他设备
    MessageSent {
        message: Message,
    },
    /// 会话摘要变化（未订阅该会话的连接用来刷新角标）
    ConversationUpdated {
        conversation: Conversation,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        #[serde(with = "time::serde::rfc3339")]
        read_at: Timestamp,
    },
    TypingUpdate {
        conversation_id: ConversationId,
        typing_user_ids: Vec<UserId>,
    },
    Presence {
        user_id: UserId,
        is_online: bool,
    },
    HeartbeatAck,
    Error {
        code: String,
        message: String,
        conversation_id: Option<ConversationId>,
        client_ref: Option<String>,
        retryable: bool,
    },
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            conversation_id: None,
            client_ref: None,
            retryable: false,
        }
    }

    /// 事件名，用于日志字段
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::SendAccepted { .. } => "sendAccepted",
            Self::NewMessage { .. } => "newMessage",
            Self::MessageSent { .. } => "messageSent",
            Self::ConversationUpdated { .. } => "conversationUpdated",
            Self::MessagesRead { .. } => "messagesRead",
            Self::TypingUpdate { .. } => "typingUpdate",
            Self::Presence { .. } => "presence",
            Self::HeartbeatAck => "heartbeatAck",
            Self::Error { .. } => "error",
        }
    }
}
