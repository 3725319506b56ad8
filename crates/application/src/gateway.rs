//! 长连接网关
//!
//! 负责连接认证、会话订阅、事件投递、心跳与断线清理。
//! 每条连接有一个有界的出站队列，队列满时新事件直接丢弃，
//! 慢客户端之后通过对账接口补齐，不会拖慢其他连接或消息写入。
//!
//! 加锁顺序固定为 connections -> channels；任何锁都不会跨越 await。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use config::AppConfig;
use dashmap::DashMap;
use domain::{ConnectionId, ConversationId, ServerEvent, Timestamp, UserId};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::identity::IdentityVerifier;
use crate::presence::{PresenceChange, PresenceRegistry};
use crate::repository::{bounded, ConversationStore};
use crate::typing::TypingCoordinator;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub outbound_buffer: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub typing_ttl: Duration,
    pub store_timeout: Duration,
}

impl GatewaySettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            outbound_buffer: config.messaging.outbound_buffer,
            heartbeat_interval: config.presence.heartbeat_interval(),
            heartbeat_timeout: config.presence.heartbeat_timeout(),
            typing_ttl: config.typing.ttl(),
            store_timeout: config.messaging.store_timeout(),
        }
    }
}

pub struct GatewayDependencies {
    pub identity: Arc<dyn IdentityVerifier>,
    pub store: Arc<dyn ConversationStore>,
    pub clock: Arc<dyn Clock>,
    pub settings: GatewaySettings,
}

/// 事件的投递范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Connection(ConnectionId),
    /// 订阅了会话的所有连接
    Conversation(ConversationId),
    /// 订阅了会话、且不属于指定用户的连接
    ConversationExcept {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    /// 用户的所有连接，可排除其中一条
    User {
        user_id: UserId,
        except: Option<ConnectionId>,
    },
    /// 用户未订阅该会话的连接
    UserOutside {
        user_id: UserId,
        conversation_id: ConversationId,
    },
}

/// 认证成功后交给传输层的连接句柄
#[derive(Debug)]
pub struct ConnectionSession {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    /// 出站事件，网关释放连接后流结束
    pub events: mpsc::Receiver<ServerEvent>,
}

#[derive(Debug)]
struct ConnectionEntry {
    user_id: UserId,
    outbound: mpsc::Sender<ServerEvent>,
    subscriptions: HashSet<ConversationId>,
    last_seen: Timestamp,
}

pub struct Gateway {
    deps: GatewayDependencies,
    presence: PresenceRegistry,
    typing: TypingCoordinator,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    channels: DashMap<ConversationId, HashSet<ConnectionId>>,
}

impl Gateway {
    pub fn new(deps: GatewayDependencies) -> Self {
        let typing = TypingCoordinator::new(deps.settings.typing_ttl);
        Self {
            deps,
            presence: PresenceRegistry::new(),
            typing,
            connections: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.deps.settings.heartbeat_interval
    }

    /// 校验凭证并登记连接。第一条出站事件总是 `authenticated`。
    pub async fn connect(&self, credential: &str) -> Result<ConnectionSession, ApplicationError> {
        let user_id = self
            .deps
            .identity
            .verify(credential)
            .await
            .map_err(|err| {
                warn!(error = %err, "连接认证失败");
                ApplicationError::Authentication
            })?;

        let connection_id = ConnectionId::generate();
        let (outbound, events) = mpsc::channel(self.deps.settings.outbound_buffer);
        let _ = outbound.try_send(ServerEvent::Authenticated {
            user_id,
            connection_id,
            heartbeat_interval_secs: self.deps.settings.heartbeat_interval.as_secs(),
        });

        let now = self.deps.clock.now();
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                outbound,
                subscriptions: HashSet::new(),
                last_seen: now,
            },
        );
        let change = self.presence.register(user_id, connection_id, now);
        info!(
            user_id = %user_id,
            connection_id = %connection_id,
            came_online = change == PresenceChange::CameOnline,
            "连接已建立"
        );

        if change == PresenceChange::CameOnline {
            self.broadcast_presence(user_id).await;
        }

        Ok(ConnectionSession {
            connection_id,
            user_id,
            events,
        })
    }

    /// 订阅会话。订阅成功后立即推送对方在线状态和当前输入者。
    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError> {
        let user_id = self
            .user_of(connection_id)
            .ok_or(ApplicationError::ConnectionClosed(connection_id))?;

        let conversation = bounded(
            self.deps.settings.store_timeout,
            self.deps.store.find_conversation(conversation_id),
        )
        .await?
        .ok_or(ApplicationError::ConversationNotFound(conversation_id))?;

        if !conversation.is_participant(user_id) {
            warn!(
                user_id = %user_id,
                conversation_id = %conversation_id,
                "非参与者尝试订阅会话"
            );
            return Err(ApplicationError::authorization(user_id, conversation_id));
        }

        {
            let mut entry = self
                .connections
                .get_mut(&connection_id)
                .ok_or(ApplicationError::ConnectionClosed(connection_id))?;
            entry.subscriptions.insert(conversation_id);
            self.channels
                .entry(conversation_id)
                .or_default()
                .insert(connection_id);
        }
        debug!(connection_id = %connection_id, conversation_id = %conversation_id, "已订阅会话");

        self.deliver(connection_id, ServerEvent::Subscribed { conversation_id });
        if let Some(counterpart) = conversation.counterpart(user_id) {
            self.deliver(
                connection_id,
                ServerEvent::Presence {
                    user_id: counterpart,
                    is_online: self.presence.is_online(counterpart),
                },
            );
        }
        let typing_user_ids = self.typing.current(conversation_id, self.deps.clock.now());
        if !typing_user_ids.is_empty() {
            self.deliver(
                connection_id,
                ServerEvent::TypingUpdate {
                    conversation_id,
                    typing_user_ids,
                },
            );
        }
        Ok(())
    }

    pub fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError> {
        {
            let mut entry = self
                .connections
                .get_mut(&connection_id)
                .ok_or(ApplicationError::ConnectionClosed(connection_id))?;
            entry.subscriptions.remove(&conversation_id);
            if let Some(mut subscribers) = self.channels.get_mut(&conversation_id) {
                subscribers.remove(&connection_id);
            }
        }
        self.channels
            .remove_if(&conversation_id, |_, subscribers| subscribers.is_empty());

        self.deliver(connection_id, ServerEvent::Unsubscribed { conversation_id });
        Ok(())
    }

    /// 向会话的所有订阅者推送事件，返回成功入队的连接数
    pub fn publish(&self, conversation_id: ConversationId, event: ServerEvent) -> usize {
        self.dispatch(Audience::Conversation(conversation_id), event)
    }

    pub fn dispatch(&self, audience: Audience, event: ServerEvent) -> usize {
        let mut delivered = 0;
        match audience {
            Audience::Connection(connection_id) => {
                delivered += usize::from(self.deliver(connection_id, event));
            }
            Audience::Conversation(conversation_id) => {
                for connection_id in self.subscribers(conversation_id) {
                    delivered += usize::from(self.deliver(connection_id, event.clone()));
                }
            }
            Audience::ConversationExcept {
                conversation_id,
                user_id,
            } => {
                for connection_id in self.subscribers(conversation_id) {
                    delivered += usize::from(self.deliver_where(connection_id, &event, |entry| {
                        entry.user_id != user_id
                    }));
                }
            }
            Audience::User { user_id, except } => {
                for connection_id in self.presence.connections(user_id) {
                    if Some(connection_id) == except {
                        continue;
                    }
                    delivered += usize::from(self.deliver_where(connection_id, &event, |entry| {
                        entry.user_id == user_id
                    }));
                }
            }
            Audience::UserOutside {
                user_id,
                conversation_id,
            } => {
                for connection_id in self.presence.connections(user_id) {
                    delivered += usize::from(self.deliver_where(connection_id, &event, |entry| {
                        entry.user_id == user_id && !entry.subscriptions.contains(&conversation_id)
                    }));
                }
            }
        }
        delivered
    }

    /// 非阻塞地放入连接的出站队列
    pub fn deliver(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        self.deliver_where(connection_id, &event, |_| true)
    }

    fn deliver_where(
        &self,
        connection_id: ConnectionId,
        event: &ServerEvent,
        accept: impl Fn(&ConnectionEntry) -> bool,
    ) -> bool {
        let Some(entry) = self.connections.get(&connection_id) else {
            return false;
        };
        if !accept(entry.value()) {
            return false;
        }
        match entry.outbound.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(
                    connection_id = %connection_id,
                    event = event.kind(),
                    "出站队列已满，丢弃事件"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// 只刷新存活时间，不回复
    pub fn touch(&self, connection_id: ConnectionId) -> Result<(), ApplicationError> {
        let now = self.deps.clock.now();
        let user_id = {
            let mut entry = self
                .connections
                .get_mut(&connection_id)
                .ok_or(ApplicationError::ConnectionClosed(connection_id))?;
            entry.last_seen = now;
            entry.user_id
        };
        self.presence.touch(user_id, now);
        Ok(())
    }

    pub fn heartbeat(&self, connection_id: ConnectionId) -> Result<(), ApplicationError> {
        self.touch(connection_id)?;
        self.deliver(connection_id, ServerEvent::HeartbeatAck);
        Ok(())
    }

    pub fn typing_start(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError> {
        let user_id = self.subscribed_user(connection_id, conversation_id)?;
        if let Some(typists) = self
            .typing
            .start(conversation_id, user_id, self.deps.clock.now())
        {
            self.publish_typing(conversation_id, typists);
        }
        Ok(())
    }

    pub fn typing_stop(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError> {
        let user_id = self.subscribed_user(connection_id, conversation_id)?;
        self.clear_typing(conversation_id, user_id);
        Ok(())
    }

    /// 用户发出消息后清除其输入状态
    pub fn clear_typing(&self, conversation_id: ConversationId, user_id: UserId) {
        if let Some(typists) = self
            .typing
            .stop(conversation_id, user_id, self.deps.clock.now())
        {
            self.publish_typing(conversation_id, typists);
        }
    }

    /// 清理过期的输入状态并广播变化，返回发生变化的会话数
    pub fn expire_typing(&self) -> usize {
        let changes = self.typing.sweep(self.deps.clock.now());
        let count = changes.len();
        for (conversation_id, typists) in changes {
            self.publish_typing(conversation_id, typists);
        }
        count
    }

    fn publish_typing(&self, conversation_id: ConversationId, typing_user_ids: Vec<UserId>) {
        self.publish(
            conversation_id,
            ServerEvent::TypingUpdate {
                conversation_id,
                typing_user_ids,
            },
        );
    }

    /// 释放连接。重复调用无副作用，返回本次是否真正释放。
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some((_, entry)) = self.connections.remove(&connection_id) else {
            return false;
        };
        for conversation_id in &entry.subscriptions {
            if let Some(mut subscribers) = self.channels.get_mut(conversation_id) {
                subscribers.remove(&connection_id);
            }
            self.channels
                .remove_if(conversation_id, |_, subscribers| subscribers.is_empty());
        }
        let user_id = entry.user_id;
        // 发送端随 entry 一起释放，传输层的出站流随之结束
        drop(entry);

        let now = self.deps.clock.now();
        let change = self.presence.unregister(user_id, connection_id, now);
        info!(
            user_id = %user_id,
            connection_id = %connection_id,
            went_offline = change == PresenceChange::WentOffline,
            "连接已释放"
        );

        if change == PresenceChange::WentOffline {
            for (conversation_id, typists) in self.typing.clear_user(user_id, now) {
                self.publish_typing(conversation_id, typists);
            }
            self.broadcast_presence(user_id).await;
        }
        true
    }

    /// 释放超过心跳超时没有任何活动的连接
    pub async fn reap_idle(&self) -> Vec<ConnectionId> {
        let deadline = self.deps.clock.now() - self.deps.settings.heartbeat_timeout;
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.last_seen < deadline)
            .map(|entry| *entry.key())
            .collect();

        for connection_id in &stale {
            warn!(connection_id = %connection_id, "心跳超时，释放连接");
            self.disconnect(*connection_id).await;
        }
        stale
    }

    /// 把用户的当前在线状态推给所有与其有会话的用户。
    ///
    /// 状态在投递前才读取，并发的上下线即使乱序完成，最后一次推送也反映最新状态。
    async fn broadcast_presence(&self, user_id: UserId) {
        let conversations = match bounded(
            self.deps.settings.store_timeout,
            self.deps.store.list_conversations_for(user_id),
        )
        .await
        {
            Ok(conversations) => conversations,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "查询会话失败，跳过在线状态广播");
                return;
            }
        };

        let counterparts: HashSet<UserId> = conversations
            .iter()
            .filter_map(|conversation| conversation.counterpart(user_id))
            .collect();
        let event = ServerEvent::Presence {
            user_id,
            is_online: self.presence.is_online(user_id),
        };
        for counterpart in counterparts {
            self.dispatch(
                Audience::User {
                    user_id: counterpart,
                    except: None,
                },
                event.clone(),
            );
        }
    }

    fn subscribed_user(
        &self,
        connection_id: ConnectionId,
        conversation_id: ConversationId,
    ) -> Result<UserId, ApplicationError> {
        let entry = self
            .connections
            .get(&connection_id)
            .ok_or(ApplicationError::ConnectionClosed(connection_id))?;
        if !entry.subscriptions.contains(&conversation_id) {
            return Err(ApplicationError::authorization(entry.user_id, conversation_id));
        }
        Ok(entry.user_id)
    }

    fn subscribers(&self, conversation_id: ConversationId) -> Vec<ConnectionId> {
        self.channels
            .get(&conversation_id)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections.get(&connection_id).map(|entry| entry.user_id)
    }

    pub fn is_subscribed(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        self.connections
            .get(&connection_id)
            .is_some_and(|entry| entry.subscriptions.contains(&conversation_id))
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.channels
            .get(&conversation_id)
            .map_or(0, |subscribers| subscribers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{IdentityError, MockIdentityVerifier};
    use crate::repository::memory::MemoryConversationStore;
    use domain::{Conversation, ParticipantPair};
    use time::macros::datetime;

    struct Fixture {
        gateway: Gateway,
        store: Arc<MemoryConversationStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture(outbound_buffer: usize) -> Fixture {
        let mut identity = MockIdentityVerifier::new();
        identity.expect_verify().returning(|credential| {
            credential
                .parse::<UserId>()
                .map_err(|_| IdentityError::rejected("unknown credential"))
        });
        let store = Arc::new(MemoryConversationStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2024-08-01 12:00 UTC)));
        let gateway = Gateway::new(GatewayDependencies {
            identity: Arc::new(identity),
            store: store.clone(),
            clock: clock.clone(),
            settings: GatewaySettings {
                outbound_buffer,
                heartbeat_interval: Duration::from_secs(10),
                heartbeat_timeout: Duration::from_secs(30),
                typing_ttl: Duration::from_secs(5),
                store_timeout: Duration::from_secs(1),
            },
        });
        Fixture {
            gateway,
            store,
            clock,
        }
    }

    async fn conversation(store: &MemoryConversationStore, a: UserId, b: UserId) -> Conversation {
        let candidate = Conversation::start(
            ConversationId::generate(),
            ParticipantPair::new(a, b).unwrap(),
            datetime!(2024-08-01 11:00 UTC),
        );
        store.get_or_create_conversation(candidate).await.unwrap().0
    }

    fn drain(session: &mut ConnectionSession) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = session.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn rejects_invalid_credentials_without_side_effects() {
        let f = fixture(8);
        let result = f.gateway.connect("not-a-user").await;
        assert!(matches!(result, Err(ApplicationError::Authentication)));
        assert_eq!(f.gateway.connection_count(), 0);
        assert_eq!(f.gateway.presence().online_users(), 0);
    }

    #[tokio::test]
    async fn first_event_is_authenticated() {
        let f = fixture(8);
        let user = UserId::generate();
        let mut session = f.gateway.connect(&user.to_string()).await.unwrap();

        let events = drain(&mut session);
        assert_eq!(
            events[0],
            ServerEvent::Authenticated {
                user_id: user,
                connection_id: session.connection_id,
                heartbeat_interval_secs: 10,
            }
        );
        assert!(f.gateway.is_online(user));
    }

    #[tokio::test]
    async fn outsider_cannot_subscribe() {
        let f = fixture(8);
        let (a, b) = (UserId::generate(), UserId::generate());
        let conversation = conversation(&f.store, a, b).await;
        let outsider = f.gateway.connect(&UserId::generate().to_string()).await.unwrap();

        let result = f
            .gateway
            .subscribe(outsider.connection_id, conversation.id)
            .await;
        assert!(matches!(result, Err(ApplicationError::Authorization { .. })));
        assert_eq!(f.gateway.subscriber_count(conversation.id), 0);
    }

    #[tokio::test]
    async fn subscribe_sends_initial_view() {
        let f = fixture(8);
        let (a, b) = (UserId::generate(), UserId::generate());
        let conversation = conversation(&f.store, a, b).await;
        let _b_session = f.gateway.connect(&b.to_string()).await.unwrap();
        let mut a_session = f.gateway.connect(&a.to_string()).await.unwrap();
        drain(&mut a_session);

        f.gateway
            .subscribe(a_session.connection_id, conversation.id)
            .await
            .unwrap();

        let events = drain(&mut a_session);
        assert_eq!(
            events,
            vec![
                ServerEvent::Subscribed {
                    conversation_id: conversation.id
                },
                ServerEvent::Presence {
                    user_id: b,
                    is_online: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn full_outbound_buffer_drops_events() {
        let f = fixture(2);
        let (a, b) = (UserId::generate(), UserId::generate());
        let conversation = conversation(&f.store, a, b).await;
        let mut session = f.gateway.connect(&a.to_string()).await.unwrap();
        drain(&mut session);
        f.gateway
            .subscribe(session.connection_id, conversation.id)
            .await
            .unwrap();
        // Subscribed 与 Presence 已占满队列

        let delivered = f.gateway.publish(conversation.id, ServerEvent::HeartbeatAck);
        assert_eq!(delivered, 0);
        assert_eq!(drain(&mut session).len(), 2);
        assert_eq!(f.gateway.publish(conversation.id, ServerEvent::HeartbeatAck), 1);
    }

    #[tokio::test]
    async fn offline_broadcast_waits_for_last_connection() {
        let f = fixture(16);
        let (a, b) = (UserId::generate(), UserId::generate());
        conversation(&f.store, a, b).await;
        let mut watcher = f.gateway.connect(&b.to_string()).await.unwrap();
        let phone = f.gateway.connect(&a.to_string()).await.unwrap();
        let laptop = f.gateway.connect(&a.to_string()).await.unwrap();
        drain(&mut watcher);

        assert!(f.gateway.disconnect(phone.connection_id).await);
        assert!(drain(&mut watcher).is_empty());

        assert!(f.gateway.disconnect(laptop.connection_id).await);
        assert!(!f.gateway.disconnect(laptop.connection_id).await);
        assert_eq!(
            drain(&mut watcher),
            vec![ServerEvent::Presence {
                user_id: a,
                is_online: false
            }]
        );
    }

    #[tokio::test]
    async fn disconnect_closes_outbound_stream() {
        let f = fixture(8);
        let mut session = f.gateway.connect(&UserId::generate().to_string()).await.unwrap();
        drain(&mut session);

        f.gateway.disconnect(session.connection_id).await;
        assert!(session.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn idle_connections_are_reaped() {
        let f = fixture(8);
        let quiet = f.gateway.connect(&UserId::generate().to_string()).await.unwrap();
        let chatty = f.gateway.connect(&UserId::generate().to_string()).await.unwrap();

        f.clock.advance(Duration::from_secs(20));
        f.gateway.heartbeat(chatty.connection_id).unwrap();
        f.clock.advance(Duration::from_secs(15));

        let reaped = f.gateway.reap_idle().await;
        assert_eq!(reaped, vec![quiet.connection_id]);
        assert!(!f.gateway.is_online(quiet.user_id));
        assert!(f.gateway.is_online(chatty.user_id));
    }

    #[tokio::test]
    async fn typing_requires_subscription_and_expires() {
        let f = fixture(16);
        let (a, b) = (UserId::generate(), UserId::generate());
        let conversation = conversation(&f.store, a, b).await;
        let a_session = f.gateway.connect(&a.to_string()).await.unwrap();
        let mut b_session = f.gateway.connect(&b.to_string()).await.unwrap();

        assert!(matches!(
            f.gateway.typing_start(a_session.connection_id, conversation.id),
            Err(ApplicationError::Authorization { .. })
        ));

        f.gateway
            .subscribe(a_session.connection_id, conversation.id)
            .await
            .unwrap();
        f.gateway
            .subscribe(b_session.connection_id, conversation.id)
            .await
            .unwrap();
        drain(&mut b_session);

        f.gateway
            .typing_start(a_session.connection_id, conversation.id)
            .unwrap();
        f.gateway
            .typing_start(a_session.connection_id, conversation.id)
            .unwrap();
        assert_eq!(
            drain(&mut b_session),
            vec![ServerEvent::TypingUpdate {
                conversation_id: conversation.id,
                typing_user_ids: vec![a],
            }]
        );

        f.clock.advance(Duration::from_secs(6));
        assert_eq!(f.gateway.expire_typing(), 1);
        assert_eq!(
            drain(&mut b_session),
            vec![ServerEvent::TypingUpdate {
                conversation_id: conversation.id,
                typing_user_ids: vec![],
            }]
        );
    }
}
