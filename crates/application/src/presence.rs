//! 在线状态登记表
//!
//! 用户只要还有一条存活的连接就算在线。每个用户一把锁（DashMap 分片），
//! 不同用户的上下线互不阻塞。

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{ConnectionId, Timestamp, UserId};

/// 登记或注销连接后用户在线状态的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    /// 第一条连接，用户从离线变为在线
    CameOnline,
    AlreadyOnline,
    /// 最后一条连接断开
    WentOffline,
    StillOnline,
    /// 连接不在登记表中（重复注销）
    Unknown,
}

impl PresenceChange {
    pub fn is_transition(self) -> bool {
        matches!(self, Self::CameOnline | Self::WentOffline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub connection_count: usize,
    pub last_seen: Timestamp,
}

#[derive(Debug)]
struct PresenceEntry {
    connections: HashSet<ConnectionId>,
    last_seen: Timestamp,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<UserId, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        now: Timestamp,
    ) -> PresenceChange {
        match self.entries.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.connections.insert(connection_id);
                entry.last_seen = now;
                PresenceChange::AlreadyOnline
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PresenceEntry {
                    connections: HashSet::from([connection_id]),
                    last_seen: now,
                });
                PresenceChange::CameOnline
            }
        }
    }

    /// 注销连接。最后一条连接移除时整条记录一并删除。
    pub fn unregister(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        now: Timestamp,
    ) -> PresenceChange {
        let Entry::Occupied(mut occupied) = self.entries.entry(user_id) else {
            return PresenceChange::Unknown;
        };

        if !occupied.get_mut().connections.remove(&connection_id) {
            return PresenceChange::Unknown;
        }
        if occupied.get().connections.is_empty() {
            occupied.remove();
            PresenceChange::WentOffline
        } else {
            occupied.get_mut().last_seen = now;
            PresenceChange::StillOnline
        }
    }

    /// 记录一次心跳
    pub fn touch(&self, user_id: UserId, now: Timestamp) {
        if let Some(mut entry) = self.entries.get_mut(&user_id) {
            if now > entry.last_seen {
                entry.last_seen = now;
            }
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.entries.contains_key(&user_id)
    }

    pub fn connections(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.entries
            .get(&user_id)
            .map(|entry| entry.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, user_id: UserId) -> Option<PresenceSnapshot> {
        self.entries.get(&user_id).map(|entry| PresenceSnapshot {
            user_id,
            connection_count: entry.connections.len(),
            last_seen: entry.last_seen,
        })
    }

    pub fn online_users(&self) -> usize {
        self.entries.len()
    }
}
