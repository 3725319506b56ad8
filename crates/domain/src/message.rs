use serde::{Deserialize, Serialize};

use crate::value_objects::{
    AttachmentUrl, ConversationId, MessageContent, MessageId, Timestamp, UserId,
};

/// 接收方的送达 / 已读状态。
///
/// 会话只有两个参与者，因此每条消息只有一个接收方。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub recipient_id: UserId,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<Timestamp>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub read_at: Option<Timestamp>,
}

impl Receipt {
    pub fn pending(recipient_id: UserId) -> Self {
        Self {
            recipient_id,
            delivered_at: None,
            read_at: None,
        }
    }
}

/// 待写入的消息。序号与创建时间由存储层在写入时分配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub attachments: Vec<AttachmentUrl>,
    /// 服务层观察到的当前时间，存储层据此生成单调递增的创建时间
    pub requested_at: Timestamp,
}

/// 已持久化的消息，写入后只允许变更回执状态。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub attachments: Vec<AttachmentUrl>,
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
    pub receipt: Receipt,
}

impl Message {
    pub fn recipient_id(&self) -> UserId {
        self.receipt.recipient_id
    }

    pub fn is_read(&self) -> bool {
        self.receipt.read_at.is_some()
    }

    pub fn is_delivered(&self) -> bool {
        self.receipt.delivered_at.is_some()
    }

    /// 标记已送达。已有送达时间时保持不变，返回是否发生了变化。
    pub fn mark_delivered(&mut self, at: Timestamp) -> bool {
        if self.receipt.delivered_at.is_some() {
            return false;
        }
        self.receipt.delivered_at = Some(at);
        true
    }

    /// 标记已读，已读意味着已送达。已读时间一旦写入不再改变。
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        if self.receipt.read_at.is_some() {
            return false;
        }
        self.receipt.delivered_at.get_or_insert(at);
        self.receipt.read_at = Some(at);
        true
    }
}
