//! 正在输入状态
//!
//! 每个会话维护一组带过期时间的输入者。只有对外可见的集合发生变化时
//! 才返回新的集合，调用方据此决定是否广播，避免重复事件。

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use dashmap::DashMap;
use domain::{ConversationId, Timestamp, UserId};

#[derive(Debug, Default)]
struct TypingRoom {
    expiries: HashMap<UserId, Timestamp>,
    /// 最近一次广播出去的集合
    announced: BTreeSet<UserId>,
}

impl TypingRoom {
    fn live(&self, now: Timestamp) -> BTreeSet<UserId> {
        self.expiries
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(user_id, _)| *user_id)
            .collect()
    }

    /// 清理过期项，集合有变化时返回新集合
    fn reconcile(&mut self, now: Timestamp) -> Option<Vec<UserId>> {
        self.expiries.retain(|_, expires_at| *expires_at > now);
        let live = self.live(now);
        if live == self.announced {
            return None;
        }
        self.announced = live;
        Some(self.announced.iter().copied().collect())
    }

    fn is_idle(&self) -> bool {
        self.expiries.is_empty() && self.announced.is_empty()
    }
}

#[derive(Debug)]
pub struct TypingCoordinator {
    ttl: Duration,
    rooms: DashMap<ConversationId, TypingRoom>,
}

impl TypingCoordinator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            rooms: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 开始或续期输入状态。续期不会产生新的广播。
    pub fn start(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        now: Timestamp,
    ) -> Option<Vec<UserId>> {
        let mut room = self.rooms.entry(conversation_id).or_default();
        room.expiries.insert(user_id, now + self.ttl);
        room.reconcile(now)
    }

    pub fn stop(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        now: Timestamp,
    ) -> Option<Vec<UserId>> {
        let changed = {
            let mut room = self.rooms.get_mut(&conversation_id)?;
            room.expiries.remove(&user_id);
            room.reconcile(now)
        };
        self.rooms.remove_if(&conversation_id, |_, room| room.is_idle());
        changed
    }

    /// 当前未过期的输入者，按用户 ID 排序
    pub fn current(&self, conversation_id: ConversationId, now: Timestamp) -> Vec<UserId> {
        self.rooms
            .get(&conversation_id)
            .map(|room| room.live(now).into_iter().collect())
            .unwrap_or_default()
    }

    /// 清理所有会话中的过期项，返回集合发生变化的会话
    pub fn sweep(&self, now: Timestamp) -> Vec<(ConversationId, Vec<UserId>)> {
        let mut changes = Vec::new();
        for mut room in self.rooms.iter_mut() {
            if let Some(typists) = room.reconcile(now) {
                changes.push((*room.key(), typists));
            }
        }
        self.rooms.retain(|_, room| !room.is_idle());
        changes
    }

    /// 用户最后一条连接断开时，清除其在所有会话中的输入状态
    pub fn clear_user(&self, user_id: UserId, now: Timestamp) -> Vec<(ConversationId, Vec<UserId>)> {
        let mut changes = Vec::new();
        for mut room in self.rooms.iter_mut() {
            if room.expiries.remove(&user_id).is_none() {
                continue;
            }
            if let Some(typists) = room.reconcile(now) {
                changes.push((*room.key(), typists));
            }
        }
        self.rooms.retain(|_, room| !room.is_idle());
        changes
    }

    pub fn active_conversations(&self) -> usize {
        self.rooms.len()
    }
}
