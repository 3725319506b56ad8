use std::sync::Arc;
use std::time::Duration;

use domain::{Conversation, ConversationId, Message, UserId};
use serde::Serialize;
use tracing::warn;

use crate::error::ApplicationError;
use crate::profile::ProfileDirectory;
use crate::repository::{bounded, ConversationStore};

/// 会话列表中的一项：会话本身加上从请求者视角计算的字段
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub counterpart_id: UserId,
    /// 资料服务不可用时为空
    pub counterpart_name: Option<String>,
    pub unread_count: u32,
}

/// 历史消息分页参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub after_sequence: Option<u64>,
    pub limit: Option<usize>,
}

pub struct ReconciliationDependencies {
    pub store: Arc<dyn ConversationStore>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub page_limit: usize,
    pub store_timeout: Duration,
}

/// 无状态的对账查询，客户端重连后据此补齐错过的事件
pub struct ReconciliationService {
    deps: ReconciliationDependencies,
}

impl ReconciliationService {
    pub fn new(deps: ReconciliationDependencies) -> Self {
        Self { deps }
    }

    /// 用户参与的所有会话，最近活动的在前
    pub async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationSummary>, ApplicationError> {
        let mut conversations = bounded(
            self.deps.store_timeout,
            self.deps.store.list_conversations_for(user_id),
        )
        .await?;
        conversations.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            if let Some(summary) = self.summarize(user_id, conversation).await {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    pub async fn get_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<ConversationSummary, ApplicationError> {
        let conversation = self.load_for(user_id, conversation_id).await?;
        self.summarize(user_id, conversation)
            .await
            .ok_or(ApplicationError::authorization(user_id, conversation_id))
    }

    /// 按序号升序返回消息，条数不超过分页上限。
    ///
    /// 带游标时从 `after_sequence` 之后开始；不带游标时返回最新的一页，
    /// 重连后的补齐拉取因此总能看到最新消息。
    pub async fn list_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> Result<Vec<Message>, ApplicationError> {
        self.load_for(user_id, conversation_id).await?;
        let page_limit = self.deps.page_limit;
        let limit = query.limit.unwrap_or(page_limit).clamp(1, page_limit);

        bounded(
            self.deps.store_timeout,
            self.deps
                .store
                .list_messages(conversation_id, query.after_sequence, limit),
        )
        .await
    }

    async fn load_for(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = bounded(
            self.deps.store_timeout,
            self.deps.store.find_conversation(conversation_id),
        )
        .await?
        .ok_or(ApplicationError::ConversationNotFound(conversation_id))?;
        if !conversation.is_participant(user_id) {
            return Err(ApplicationError::authorization(user_id, conversation_id));
        }
        Ok(conversation)
    }

    async fn summarize(
        &self,
        user_id: UserId,
        conversation: Conversation,
    ) -> Option<ConversationSummary> {
        let counterpart_id = conversation.counterpart(user_id)?;
        let counterpart_name = match tokio::time::timeout(
            self.deps.store_timeout,
            self.deps.profiles.display_name(counterpart_id),
        )
        .await
        {
            Ok(Ok(name)) => name,
            Ok(Err(err)) => {
                warn!(user_id = %counterpart_id, error = %err, "查询显示名失败");
                None
            }
            Err(_) => {
                warn!(user_id = %counterpart_id, "查询显示名超时");
                None
            }
        };
        Some(ConversationSummary {
            unread_count: conversation.unread_count(user_id),
            conversation,
            counterpart_id,
            counterpart_name,
        })
    }
}
