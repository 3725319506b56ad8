use std::sync::Arc;
use std::time::Duration;

use config::MessagingConfig;
use domain::{
    truncate_to_micros, AttachmentUrl, ConnectionId, Conversation, ConversationId, DomainError,
    Message, MessageContent, MessageDraft, MessageId, ParticipantPair, ServerEvent, UserId,
};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::gateway::{Audience, Gateway};
use crate::keyed_lock::KeyedLocks;
use crate::notifier::NotificationSink;
use crate::repository::{bounded, ConversationStore};

#[derive(Debug, Clone)]
pub struct MessagingLimits {
    pub max_content_bytes: usize,
    pub max_attachments: usize,
    pub store_timeout: Duration,
}

impl MessagingLimits {
    pub fn from_config(config: &MessagingConfig) -> Self {
        Self {
            max_content_bytes: config.max_content_bytes,
            max_attachments: config.max_attachments,
            store_timeout: config.store_timeout(),
        }
    }
}

/// 发送目标：已有会话，或者对方用户（没有会话时自动创建）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Conversation(ConversationId),
    Recipient(UserId),
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub target: SendTarget,
    pub content: String,
    pub attachments: Vec<String>,
    /// 客户端自带的请求标识，原样回传
    pub client_ref: Option<String>,
    /// 发起发送的连接；HTTP 发送时为空
    pub origin: Option<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub conversation: Conversation,
    pub created_conversation: bool,
}

pub struct MessageServiceDependencies {
    pub store: Arc<dyn ConversationStore>,
    pub gateway: Arc<Gateway>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
    pub limits: MessagingLimits,
}

pub struct MessageService {
    deps: MessageServiceDependencies,
    locks: KeyedLocks<ConversationId>,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self {
            deps,
            locks: KeyedLocks::new(),
        }
    }

    /// 发送消息。
    ///
    /// 同一会话的写入和事件入队在会话锁内完成，订阅者看到的顺序与序号一致。
    /// 写入失败时不产生任何事件。
    pub async fn send(&self, request: SendMessageRequest) -> Result<SendOutcome, ApplicationError> {
        let content = MessageContent::parse(request.content, self.deps.limits.max_content_bytes)?;
        let attachments = self.parse_attachments(request.attachments)?;

        let (conversation, created_conversation) =
            self.resolve(request.sender_id, request.target).await?;
        if !conversation.is_participant(request.sender_id) {
            warn!(
                sender_id = %request.sender_id,
                conversation_id = %conversation.id,
                "非参与者尝试发送消息"
            );
            return Err(ApplicationError::authorization(
                request.sender_id,
                conversation.id,
            ));
        }

        let guard = self.locks.lock(conversation.id).await;
        let draft = MessageDraft {
            id: MessageId::generate(),
            conversation_id: conversation.id,
            sender_id: request.sender_id,
            content,
            attachments,
            requested_at: self.deps.clock.now(),
        };
        let (message, conversation) = bounded(
            self.deps.limits.store_timeout,
            self.deps.store.append_message(draft),
        )
        .await
        .map_err(|err| {
            error!(
                conversation_id = %conversation.id,
                sender_id = %request.sender_id,
                error = %err,
                "消息写入失败"
            );
            err
        })?;
        self.fan_out(&conversation, &message, request.origin, request.client_ref);
        drop(guard);

        info!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            sequence = message.sequence,
            "消息已发送"
        );

        let recipient_id = message.recipient_id();
        if !self.deps.gateway.is_online(recipient_id) {
            self.notify_offline(recipient_id, &conversation, &message)
                .await;
        }

        Ok(SendOutcome {
            message,
            conversation,
            created_conversation,
        })
    }

    /// 查找或创建与对方的会话
    pub async fn start_conversation(
        &self,
        user_id: UserId,
        counterpart_id: UserId,
    ) -> Result<(Conversation, bool), ApplicationError> {
        self.resolve(user_id, SendTarget::Recipient(counterpart_id))
            .await
    }

    /// 清零读者的未读数，并通知对方与读者的其他设备
    pub async fn mark_read(
        &self,
        reader_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        self.load_for(reader_id, conversation_id).await?;

        let _guard = self.locks.lock(conversation_id).await;
        let read_at = truncate_to_micros(self.deps.clock.now());
        let outcome = bounded(
            self.deps.limits.store_timeout,
            self.deps.store.mark_read(conversation_id, reader_id, read_at),
        )
        .await?;

        if outcome.changed {
            debug!(
                conversation_id = %conversation_id,
                reader_id = %reader_id,
                messages_marked = outcome.messages_marked,
                "消息已读"
            );
            let gateway = &self.deps.gateway;
            gateway.dispatch(
                Audience::ConversationExcept {
                    conversation_id,
                    user_id: reader_id,
                },
                ServerEvent::MessagesRead {
                    conversation_id,
                    reader_id,
                    read_at,
                },
            );
            gateway.dispatch(
                Audience::User {
                    user_id: reader_id,
                    except: None,
                },
                ServerEvent::ConversationUpdated {
                    conversation: outcome.conversation.clone(),
                },
            );
        }
        Ok(outcome.conversation)
    }

    /// 接收方确认已送达，返回本次变化的消息数
    pub async fn mark_delivered(
        &self,
        recipient_id: UserId,
        conversation_id: ConversationId,
        up_to_sequence: u64,
    ) -> Result<u64, ApplicationError> {
        self.load_for(recipient_id, conversation_id).await?;
        let delivered_at = truncate_to_micros(self.deps.clock.now());
        let changed = bounded(
            self.deps.limits.store_timeout,
            self.deps.store.mark_delivered(
                conversation_id,
                recipient_id,
                up_to_sequence,
                delivered_at,
            ),
        )
        .await?;
        debug!(
            conversation_id = %conversation_id,
            recipient_id = %recipient_id,
            up_to_sequence,
            changed,
            "送达回执"
        );
        Ok(changed)
    }

    fn parse_attachments(&self, raw: Vec<String>) -> Result<Vec<AttachmentUrl>, DomainError> {
        if raw.len() > self.deps.limits.max_attachments {
            return Err(DomainError::invalid_argument(
                "attachments",
                format!("at most {} attachments", self.deps.limits.max_attachments),
            ));
        }
        raw.into_iter().map(AttachmentUrl::parse).collect()
    }

    async fn resolve(
        &self,
        sender_id: UserId,
        target: SendTarget,
    ) -> Result<(Conversation, bool), ApplicationError> {
        let timeout = self.deps.limits.store_timeout;
        match target {
            SendTarget::Conversation(conversation_id) => {
                let conversation = bounded(timeout, self.deps.store.find_conversation(conversation_id))
                    .await?
                    .ok_or(ApplicationError::ConversationNotFound(conversation_id))?;
                Ok((conversation, false))
            }
            SendTarget::Recipient(recipient_id) => {
                let pair = ParticipantPair::new(sender_id, recipient_id)?;
                if let Some(existing) =
                    bounded(timeout, self.deps.store.find_by_participants(pair)).await?
                {
                    return Ok((existing, false));
                }

                let candidate =
                    Conversation::start(ConversationId::generate(), pair, self.deps.clock.now());
                let (conversation, created) = bounded(
                    timeout,
                    self.deps.store.get_or_create_conversation(candidate),
                )
                .await?;
                if created {
                    info!(
                        conversation_id = %conversation.id,
                        initiator_id = %sender_id,
                        "新建会话"
                    );
                }
                Ok((conversation, created))
            }
        }
    }

    async fn load_for(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = bounded(
            self.deps.limits.store_timeout,
            self.deps.store.find_conversation(conversation_id),
        )
        .await?
        .ok_or(ApplicationError::ConversationNotFound(conversation_id))?;
        if !conversation.is_participant(user_id) {
            return Err(ApplicationError::authorization(user_id, conversation_id));
        }
        Ok(conversation)
    }

    fn fan_out(
        &self,
        conversation: &Conversation,
        message: &Message,
        origin: Option<ConnectionId>,
        client_ref: Option<String>,
    ) {
        let gateway = &self.deps.gateway;
        let conversation_id = conversation.id;
        let sender_id = message.sender_id;

        gateway.dispatch(
            Audience::ConversationExcept {
                conversation_id,
                user_id: sender_id,
            },
            ServerEvent::NewMessage {
                message: message.clone(),
                conversation: conversation.clone(),
            },
        );
        gateway.dispatch(
            Audience::UserOutside {
                user_id: message.recipient_id(),
                conversation_id,
            },
            ServerEvent::ConversationUpdated {
                conversation: conversation.clone(),
            },
        );
        gateway.dispatch(
            Audience::User {
                user_id: sender_id,
                except: origin,
            },
            ServerEvent::MessageSent {
                message: message.clone(),
            },
        );
        if let Some(origin) = origin {
            gateway.dispatch(
                Audience::Connection(origin),
                ServerEvent::SendAccepted {
                    client_ref,
                    message: message.clone(),
                },
            );
        }
        gateway.clear_typing(conversation_id, sender_id);
    }

    async fn notify_offline(&self, recipient_id: UserId, conversation: &Conversation, message: &Message) {
        let delivery = self
            .deps
            .notifier
            .notify_offline(recipient_id, conversation, message);
        match tokio::time::timeout(self.deps.limits.store_timeout, delivery).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(recipient_id = %recipient_id, error = %err, "离线通知失败");
            }
            Err(_) => {
                warn!(recipient_id = %recipient_id, "离线通知超时");
            }
        }
    }
}
