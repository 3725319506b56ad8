use async_trait::async_trait;
use domain::{Conversation, Message, UserId};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("notification delivery failed: {0}")]
pub struct NotificationError(pub String);

/// 接收方完全离线时的通知出口（移动推送、邮件等由外部系统实现）
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_offline(
        &self,
        recipient_id: UserId,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<(), NotificationError>;
}

/// 默认实现：只记录日志
#[derive(Debug, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify_offline(
        &self,
        recipient_id: UserId,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<(), NotificationError> {
        info!(
            recipient_id = %recipient_id,
            conversation_id = %conversation.id,
            message_id = %message.id,
            sequence = message.sequence,
            "接收方离线，转交离线通知"
        );
        Ok(())
    }
}
