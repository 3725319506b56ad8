use serde::{Deserialize, Serialize};
use time::Duration;

use crate::errors::DomainError;
use crate::message::{Message, MessageDraft, Receipt};
use crate::value_objects::{
    truncate_to_micros, ConversationId, MessageContent, MessageId, ParticipantPair, Timestamp,
    UserId,
};

/// 最近一条消息的冗余快照，用于会话列表展示。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

/// 参与者在会话中的个人状态。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantState {
    pub user_id: UserId,
    pub unread_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_read_at: Option<Timestamp>,
}

impl ParticipantState {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            unread_count: 0,
            last_read_at: None,
        }
    }
}

/// 两人会话。
///
/// 只有消息服务会修改会话；所有修改都经由本类型的方法完成，
/// 存储实现（内存或 PostgreSQL）只负责把结果原样落盘。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    /// 与 `ParticipantPair` 的顺序一致
    pub participants: [ParticipantState; 2],
    pub last_message: Option<LastMessage>,
    pub last_sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: Timestamp,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: Timestamp,
}

impl Conversation {
    pub fn start(id: ConversationId, pair: ParticipantPair, now: Timestamp) -> Self {
        let now = truncate_to_micros(now);
        Self {
            id,
            participants: [
                ParticipantState::new(pair.first()),
                ParticipantState::new(pair.second()),
            ],
            last_message: None,
            last_sequence: 0,
            last_activity: now,
            created_at: now,
        }
    }

    pub fn pair(&self) -> ParticipantPair {
        // participants 在构造时来自合法的 ParticipantPair
        ParticipantPair::new(self.participants[0].user_id, self.participants[1].user_id)
            .unwrap_or_else(|_| unreachable!("conversation participants are distinct"))
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn ensure_participant(&self, user_id: UserId) -> Result<(), DomainError> {
        if self.is_participant(user_id) {
            Ok(())
        } else {
            Err(DomainError::NotParticipant { user_id })
        }
    }

    /// 会话的另一方。
    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        self.pair().other(user_id)
    }

    pub fn participant(&self, user_id: UserId) -> Option<&ParticipantState> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    fn participant_mut(&mut self, user_id: UserId) -> Option<&mut ParticipantState> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn unread_count(&self, user_id: UserId) -> u32 {
        self.participant(user_id).map_or(0, |p| p.unread_count)
    }

    /// 为下一条消息分配序号与创建时间。
    ///
    /// 创建时间严格大于上一条消息：时钟回拨或同一微秒内的并发写入
    /// 都会被推到上一条之后 1 微秒。
    pub fn next_stamp(&self, now: Timestamp) -> (u64, Timestamp) {
        let mut created_at = truncate_to_micros(now);
        if let Some(last) = &self.last_message {
            if created_at <= last.created_at {
                created_at = last.created_at + Duration::microseconds(1);
            }
        }
        (self.last_sequence + 1, created_at)
    }

    /// 接收一条新消息：分配序号和时间戳，更新摘要字段和接收方未读数。
    ///
    /// 调用方必须保证同一会话的 `accept` 是串行执行的。
    pub fn accept(&mut self, draft: MessageDraft) -> Result<Message, DomainError> {
        self.ensure_participant(draft.sender_id)?;
        let recipient_id = self
            .counterpart(draft.sender_id)
            .ok_or(DomainError::NotParticipant {
                user_id: draft.sender_id,
            })?;
        let (sequence, created_at) = self.next_stamp(draft.requested_at);

        let message = Message {
            id: draft.id,
            conversation_id: self.id,
            sender_id: draft.sender_id,
            content: draft.content,
            attachments: draft.attachments,
            sequence,
            created_at,
            receipt: Receipt::pending(recipient_id),
        };
        self.record(&message)?;
        Ok(message)
    }

    /// 把一条已分配序号的消息计入会话摘要。
    pub fn record(&mut self, message: &Message) -> Result<(), DomainError> {
        self.ensure_participant(message.sender_id)?;
        if message.sequence != self.last_sequence + 1 {
            return Err(DomainError::SequenceGap {
                last: self.last_sequence,
                got: message.sequence,
            });
        }

        self.last_sequence = message.sequence;
        self.last_message = Some(LastMessage {
            message_id: message.id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            sequence: message.sequence,
            created_at: message.created_at,
        });
        if message.created_at > self.last_activity {
            self.last_activity = message.created_at;
        }
        if let Some(recipient) = self.participant_mut(message.recipient_id()) {
            recipient.unread_count = recipient.unread_count.saturating_add(1);
        }
        Ok(())
    }

    /// 清零未读数。未读数已经为零时不做任何修改，返回是否发生了变化。
    pub fn mark_read(&mut self, user_id: UserId, at: Timestamp) -> Result<bool, DomainError> {
        let participant = self
            .participant_mut(user_id)
            .ok_or(DomainError::NotParticipant { user_id })?;
        if participant.unread_count == 0 {
            return Ok(false);
        }
        participant.unread_count = 0;
        participant.last_read_at = Some(at);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn setup() -> (Conversation, UserId, UserId) {
        let a = UserId::generate();
        let b = UserId::generate();
        let pair = ParticipantPair::new(a, b).unwrap();
        let conversation = Conversation::start(
            ConversationId::generate(),
            pair,
            datetime!(2024-05-01 08:00 UTC),
        );
        (conversation, a, b)
    }

    fn draft(conversation: &Conversation, sender: UserId, text: &str, at: Timestamp) -> MessageDraft {
        MessageDraft {
            id: MessageId::generate(),
            conversation_id: conversation.id,
            sender_id: sender,
            content: MessageContent::parse(text, 100).unwrap(),
            attachments: vec![],
            requested_at: at,
        }
    }

    #[test]
    fn accept_updates_summary_and_recipient_unread() {
        let (mut conversation, a, b) = setup();
        let at = datetime!(2024-05-01 08:01 UTC);

        let message = conversation
            .accept(draft(&conversation, a, "hello", at))
            .unwrap();

        assert_eq!(message.sequence, 1);
        assert_eq!(message.recipient_id(), b);
        assert_eq!(conversation.last_sequence, 1);
        assert_eq!(
            conversation.last_message.as_ref().unwrap().content.as_str(),
            "hello"
        );
        assert_eq!(conversation.last_activity, at);
        assert_eq!(conversation.unread_count(b), 1);
        assert_eq!(conversation.unread_count(a), 0);
    }

    #[test]
    fn identical_clock_readings_still_produce_strict_order() {
        let (mut conversation, a, b) = setup();
        let at = datetime!(2024-05-01 08:01 UTC);

        let first = conversation.accept(draft(&conversation, a, "1", at)).unwrap();
        let second = conversation.accept(draft(&conversation, b, "2", at)).unwrap();
        // 时钟回拨
        let third = conversation
            .accept(draft(&conversation, a, "3", at - Duration::seconds(5)))
            .unwrap();

        assert!(first.created_at < second.created_at);
        assert!(second.created_at < third.created_at);
        assert_eq!(third.sequence, 3);
        assert_eq!(conversation.last_activity, third.created_at);
    }

    #[test]
    fn outsider_cannot_post() {
        let (mut conversation, _, _) = setup();
        let outsider = UserId::generate();
        let result = conversation.accept(draft(
            &conversation,
            outsider,
            "hi",
            datetime!(2024-05-01 08:01 UTC),
        ));
        assert_eq!(
            result.unwrap_err(),
            DomainError::NotParticipant { user_id: outsider }
        );
        assert_eq!(conversation.last_sequence, 0);
    }

    #[test]
    fn record_rejects_sequence_gaps() {
        let (mut conversation, a, _) = setup();
        let mut message = conversation
            .clone()
            .accept(draft(&conversation, a, "x", datetime!(2024-05-01 08:01 UTC)))
            .unwrap();
        message.sequence = 5;
        assert_eq!(
            conversation.record(&message).unwrap_err(),
            DomainError::SequenceGap { last: 0, got: 5 }
        );
    }

    #[test]
    fn mark_read_is_idempotent() {
        let (mut conversation, a, b) = setup();
        conversation
            .accept(draft(&conversation, a, "hey", datetime!(2024-05-01 08:01 UTC)))
            .unwrap();

        let first_read = datetime!(2024-05-01 09:00 UTC);
        assert!(conversation.mark_read(b, first_read).unwrap());
        assert!(!conversation
            .mark_read(b, datetime!(2024-05-01 10:00 UTC))
            .unwrap());

        let state = conversation.participant(b).unwrap();
        assert_eq!(state.unread_count, 0);
        assert_eq!(state.last_read_at, Some(first_read));
    }
}
