use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, Message, MessageDraft, ParticipantPair, RepositoryError,
    Timestamp, UserId,
};

use crate::error::ApplicationError;

/// 标记已读的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub conversation: Conversation,
    /// 本次新标记为已读的消息数
    pub messages_marked: u64,
    /// 未读数或任一消息回执是否发生了变化
    pub changed: bool,
}

/// 会话与消息的持久化存储。
///
/// 实现必须保证：同一参与者二元组最多只有一个会话；
/// `append_message` 在同一会话内原子地分配连续序号并同步更新会话摘要。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn find_by_participants(
        &self,
        pair: ParticipantPair,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// 二元组已有会话时返回已有会话，否则写入 `candidate`。第二个返回值表示是否新建。
    async fn get_or_create_conversation(
        &self,
        candidate: Conversation,
    ) -> Result<(Conversation, bool), RepositoryError>;

    /// 按最近活动时间倒序
    async fn list_conversations_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, RepositoryError>;

    /// 写入消息并返回分配了序号的消息和更新后的会话
    async fn append_message(
        &self,
        draft: MessageDraft,
    ) -> Result<(Message, Conversation), RepositoryError>;

    /// 按序号升序，最多 `limit` 条。
    ///
    /// 给出 `after_sequence` 时返回其后的消息；否则返回最新的 `limit` 条。
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        after_sequence: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        at: Timestamp,
    ) -> Result<ReadOutcome, RepositoryError>;

    /// 把接收方序号不超过 `up_to_sequence` 的消息标记为已送达，返回变化条数
    async fn mark_delivered(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
        up_to_sequence: u64,
        at: Timestamp,
    ) -> Result<u64, RepositoryError>;
}

/// 给存储调用加上超时
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, ApplicationError>
where
    F: Future<Output = Result<T, RepositoryError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(ApplicationError::from),
        Err(_) => Err(ApplicationError::StoreTimeout(limit)),
    }
}

pub mod memory {
    //! 进程内存储，用于开发环境和测试

    use std::collections::HashMap;

    use tokio::sync::RwLock;

    use super::*;

    #[derive(Default)]
    struct State {
        conversations: HashMap<ConversationId, Conversation>,
        by_pair: HashMap<ParticipantPair, ConversationId>,
        messages: HashMap<ConversationId, Vec<Message>>,
    }

    #[derive(Default)]
    pub struct MemoryConversationStore {
        state: RwLock<State>,
    }

    impl MemoryConversationStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ConversationStore for MemoryConversationStore {
        async fn find_conversation(
            &self,
            id: ConversationId,
        ) -> Result<Option<Conversation>, RepositoryError> {
            Ok(self.state.read().await.conversations.get(&id).cloned())
        }

        async fn find_by_participants(
            &self,
            pair: ParticipantPair,
        ) -> Result<Option<Conversation>, RepositoryError> {
            let state = self.state.read().await;
            Ok(state
                .by_pair
                .get(&pair)
                .and_then(|id| state.conversations.get(id))
                .cloned())
        }

        async fn get_or_create_conversation(
            &self,
            candidate: Conversation,
        ) -> Result<(Conversation, bool), RepositoryError> {
            let mut state = self.state.write().await;
            let pair = candidate.pair();
            if let Some(id) = state.by_pair.get(&pair) {
                let existing = state
                    .conversations
                    .get(id)
                    .cloned()
                    .ok_or_else(|| RepositoryError::storage("participant index out of sync"))?;
                return Ok((existing, false));
            }

            state.by_pair.insert(pair, candidate.id);
            state.messages.insert(candidate.id, Vec::new());
            state.conversations.insert(candidate.id, candidate.clone());
            Ok((candidate, true))
        }

        async fn list_conversations_for(
            &self,
            user_id: UserId,
        ) -> Result<Vec<Conversation>, RepositoryError> {
            let state = self.state.read().await;
            let mut conversations: Vec<Conversation> = state
                .conversations
                .values()
                .filter(|c| c.is_participant(user_id))
                .cloned()
                .collect();
            conversations.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
            Ok(conversations)
        }

        async fn append_message(
            &self,
            draft: MessageDraft,
        ) -> Result<(Message, Conversation), RepositoryError> {
            let mut state = self.state.write().await;
            let State {
                conversations,
                messages,
                ..
            } = &mut *state;

            let stored = conversations
                .get_mut(&draft.conversation_id)
                .ok_or(RepositoryError::NotFound)?;
            // 先在副本上修改，失败时不影响已存状态
            let mut updated = stored.clone();
            let message = updated
                .accept(draft)
                .map_err(|err| RepositoryError::storage(err.to_string()))?;
            *stored = updated.clone();
            messages
                .entry(updated.id)
                .or_default()
                .push(message.clone());
            Ok((message, updated))
        }

        async fn list_messages(
            &self,
            conversation_id: ConversationId,
            after_sequence: Option<u64>,
            limit: usize,
        ) -> Result<Vec<Message>, RepositoryError> {
            let state = self.state.read().await;
            let Some(messages) = state.messages.get(&conversation_id) else {
                return Ok(Vec::new());
            };
            let page = match after_sequence {
                Some(after) => messages
                    .iter()
                    .filter(|m| m.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect(),
                None => messages[messages.len().saturating_sub(limit)..].to_vec(),
            };
            Ok(page)
        }

        async fn mark_read(
            &self,
            conversation_id: ConversationId,
            reader_id: UserId,
            at: Timestamp,
        ) -> Result<ReadOutcome, RepositoryError> {
            let mut state = self.state.write().await;
            let State {
                conversations,
                messages,
                ..
            } = &mut *state;

            let conversation = conversations
                .get_mut(&conversation_id)
                .ok_or(RepositoryError::NotFound)?;
            let unread_cleared = conversation
                .mark_read(reader_id, at)
                .map_err(|err| RepositoryError::storage(err.to_string()))?;

            let mut messages_marked = 0;
            for message in messages.entry(conversation_id).or_default().iter_mut() {
                if message.recipient_id() == reader_id && message.mark_read(at) {
                    messages_marked += 1;
                }
            }

            Ok(ReadOutcome {
                conversation: conversation.clone(),
                messages_marked,
                changed: unread_cleared || messages_marked > 0,
            })
        }

        async fn mark_delivered(
            &self,
            conversation_id: ConversationId,
            recipient_id: UserId,
            up_to_sequence: u64,
            at: Timestamp,
        ) -> Result<u64, RepositoryError> {
            let mut state = self.state.write().await;
            if !state.conversations.contains_key(&conversation_id) {
                return Err(RepositoryError::NotFound);
            }

            let mut changed = 0;
            for message in state
                .messages
                .entry(conversation_id)
                .or_default()
                .iter_mut()
            {
                if message.sequence > up_to_sequence {
                    break;
                }
                if message.recipient_id() == recipient_id && message.mark_delivered(at) {
                    changed += 1;
                }
            }
            Ok(changed)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use domain::{MessageContent, MessageId};
        use time::macros::datetime;

        fn draft(conversation_id: ConversationId, sender_id: UserId, text: &str) -> MessageDraft {
            MessageDraft {
                id: MessageId::generate(),
                conversation_id,
                sender_id,
                content: MessageContent::parse(text, 100).unwrap(),
                attachments: vec![],
                requested_at: datetime!(2024-06-01 12:00 UTC),
            }
        }

        async fn seeded() -> (MemoryConversationStore, Conversation, UserId, UserId) {
            let store = MemoryConversationStore::new();
            let (a, b) = (UserId::generate(), UserId::generate());
            let candidate = Conversation::start(
                ConversationId::generate(),
                ParticipantPair::new(a, b).unwrap(),
                datetime!(2024-06-01 11:00 UTC),
            );
            let (conversation, created) = store.get_or_create_conversation(candidate).await.unwrap();
            assert!(created);
            (store, conversation, a, b)
        }

        #[tokio::test]
        async fn pair_maps_to_single_conversation() {
            let (store, conversation, a, b) = seeded().await;
            let again = Conversation::start(
                ConversationId::generate(),
                ParticipantPair::new(b, a).unwrap(),
                datetime!(2024-06-01 11:30 UTC),
            );

            let (existing, created) = store.get_or_create_conversation(again).await.unwrap();
            assert!(!created);
            assert_eq!(existing.id, conversation.id);
            assert_eq!(store.list_conversations_for(a).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn append_assigns_consecutive_sequences() {
            let (store, conversation, a, b) = seeded().await;

            let (first, _) = store.append_message(draft(conversation.id, a, "one")).await.unwrap();
            let (second, updated) = store
                .append_message(draft(conversation.id, b, "two"))
                .await
                .unwrap();

            assert_eq!((first.sequence, second.sequence), (1, 2));
            assert!(first.created_at < second.created_at);
            assert_eq!(updated.last_sequence, 2);
            assert_eq!(updated.unread_count(a), 1);
            assert_eq!(updated.unread_count(b), 1);

            let page = store.list_messages(conversation.id, Some(1), 10).await.unwrap();
            assert_eq!(page.len(), 1);
            assert_eq!(page[0].id, second.id);
        }

        #[tokio::test]
        async fn without_cursor_the_newest_page_is_returned() {
            let (store, conversation, a, _) = seeded().await;
            for text in ["1", "2", "3", "4"] {
                store.append_message(draft(conversation.id, a, text)).await.unwrap();
            }

            let newest = store.list_messages(conversation.id, None, 2).await.unwrap();
            assert_eq!(
                newest.iter().map(|m| m.sequence).collect::<Vec<_>>(),
                vec![3, 4]
            );

            let from_start = store.list_messages(conversation.id, Some(0), 2).await.unwrap();
            assert_eq!(
                from_start.iter().map(|m| m.sequence).collect::<Vec<_>>(),
                vec![1, 2]
            );
        }

        #[tokio::test]
        async fn append_to_unknown_conversation_is_not_found() {
            let store = MemoryConversationStore::new();
            let result = store
                .append_message(draft(ConversationId::generate(), UserId::generate(), "x"))
                .await;
            assert_eq!(result.unwrap_err(), RepositoryError::NotFound);
        }

        #[tokio::test]
        async fn mark_read_only_touches_reader_side() {
            let (store, conversation, a, b) = seeded().await;
            store.append_message(draft(conversation.id, a, "to b")).await.unwrap();
            store.append_message(draft(conversation.id, b, "to a")).await.unwrap();

            let at = datetime!(2024-06-01 13:00 UTC);
            let outcome = store.mark_read(conversation.id, b, at).await.unwrap();
            assert!(outcome.changed);
            assert_eq!(outcome.messages_marked, 1);
            assert_eq!(outcome.conversation.unread_count(b), 0);
            assert_eq!(outcome.conversation.unread_count(a), 1);

            let messages = store.list_messages(conversation.id, None, 10).await.unwrap();
            assert_eq!(messages[0].receipt.read_at, Some(at));
            assert_eq!(messages[1].receipt.read_at, None);

            let repeat = store
                .mark_read(conversation.id, b, datetime!(2024-06-01 14:00 UTC))
                .await
                .unwrap();
            assert!(!repeat.changed);
        }

        #[tokio::test]
        async fn mark_delivered_respects_upper_bound() {
            let (store, conversation, a, b) = seeded().await;
            for text in ["1", "2", "3"] {
                store.append_message(draft(conversation.id, a, text)).await.unwrap();
            }

            let at = datetime!(2024-06-01 12:30 UTC);
            assert_eq!(store.mark_delivered(conversation.id, b, 2, at).await.unwrap(), 2);
            assert_eq!(store.mark_delivered(conversation.id, b, 2, at).await.unwrap(), 0);

            let messages = store.list_messages(conversation.id, None, 10).await.unwrap();
            assert!(messages[1].is_delivered());
            assert!(!messages[2].is_delivered());
        }
    }
}
