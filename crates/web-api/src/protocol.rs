//! 客户端通过长连接发送的指令帧
//!
//! 帧格式为带 `type` 标签的 JSON，字段使用 camelCase。
//! 服务端推送的事件见 `domain::ServerEvent`。

use application::SendTarget;
use domain::{ConversationId, DomainError, UserId};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Authenticate {
        credential: String,
    },
    Subscribe {
        conversation_id: ConversationId,
    },
    Unsubscribe {
        conversation_id: ConversationId,
    },
    /// `conversationId` 与 `recipientId` 二选一
    Send {
        conversation_id: Option<ConversationId>,
        recipient_id: Option<UserId>,
        content: String,
        #[serde(default)]
        attachments: Vec<String>,
        client_ref: Option<String>,
    },
    TypingStart {
        conversation_id: ConversationId,
    },
    TypingStop {
        conversation_id: ConversationId,
    },
    MarkRead {
        conversation_id: ConversationId,
    },
    AckDelivered {
        conversation_id: ConversationId,
        up_to_sequence: u64,
    },
    Heartbeat,
}

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// 指令涉及的会话，出错时带回给客户端
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::Subscribe { conversation_id }
            | Self::Unsubscribe { conversation_id }
            | Self::TypingStart { conversation_id }
            | Self::TypingStop { conversation_id }
            | Self::MarkRead { conversation_id }
            | Self::AckDelivered {
                conversation_id, ..
            } => Some(*conversation_id),
            Self::Send {
                conversation_id, ..
            } => *conversation_id,
            Self::Authenticate { .. } | Self::Heartbeat => None,
        }
    }

    pub fn client_ref(&self) -> Option<&str> {
        match self {
            Self::Send { client_ref, .. } => client_ref.as_deref(),
            _ => None,
        }
    }
}

/// 解析发送目标，两者必须恰好给出一个
pub fn send_target(
    conversation_id: Option<ConversationId>,
    recipient_id: Option<UserId>,
) -> Result<SendTarget, DomainError> {
    match (conversation_id, recipient_id) {
        (Some(conversation_id), None) => Ok(SendTarget::Conversation(conversation_id)),
        (None, Some(recipient_id)) => Ok(SendTarget::Recipient(recipient_id)),
        _ => Err(DomainError::invalid_argument(
            "target",
            "exactly one of conversationId and recipientId is required",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_frame_with_optional_fields() {
        let recipient = UserId::generate();
        let frame = format!(
            r#"{{"type":"send","recipientId":"{recipient}","content":"hello","clientRef":"c-1"}}"#
        );

        let command = ClientCommand::parse(&frame).unwrap();
        assert_eq!(
            command,
            ClientCommand::Send {
                conversation_id: None,
                recipient_id: Some(recipient),
                content: "hello".to_string(),
                attachments: vec![],
                client_ref: Some("c-1".to_string()),
            }
        );
        assert_eq!(command.client_ref(), Some("c-1"));
        assert_eq!(command.conversation_id(), None);
    }

    #[test]
    fn parses_tagged_frames() {
        let conversation_id = ConversationId::generate();
        let ack = ClientCommand::parse(&format!(
            r#"{{"type":"ackDelivered","conversationId":"{conversation_id}","upToSequence":7}}"#
        ))
        .unwrap();
        assert_eq!(
            ack,
            ClientCommand::AckDelivered {
                conversation_id,
                up_to_sequence: 7
            }
        );
        assert_eq!(
            ClientCommand::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientCommand::Heartbeat
        );
        assert!(ClientCommand::parse(r#"{"type":"shout"}"#).is_err());
        assert!(ClientCommand::parse(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn send_target_requires_exactly_one() {
        let conversation_id = ConversationId::generate();
        let user_id = UserId::generate();

        assert_eq!(
            send_target(Some(conversation_id), None).unwrap(),
            SendTarget::Conversation(conversation_id)
        );
        assert_eq!(
            send_target(None, Some(user_id)).unwrap(),
            SendTarget::Recipient(user_id)
        );
        assert!(send_target(None, None).is_err());
        assert!(send_target(Some(conversation_id), Some(user_id)).is_err());
    }
}
