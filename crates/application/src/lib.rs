//! 应用层实现。
//!
//! 在线状态、输入状态、长连接网关，以及消息发送与对账两个用例服务。
//! 身份校验、离线通知、用户资料、持久化都以 trait 的形式注入。

pub mod clock;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod keyed_lock;
pub mod notifier;
pub mod presence;
pub mod profile;
pub mod repository;
pub mod services;
pub mod sweeper;
pub mod typing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ApplicationError;
pub use gateway::{
    Audience, ConnectionSession, Gateway, GatewayDependencies, GatewaySettings,
};
pub use identity::{IdentityError, IdentityVerifier};
pub use notifier::{LoggingNotificationSink, NotificationError, NotificationSink};
pub use presence::{PresenceChange, PresenceRegistry, PresenceSnapshot};
pub use profile::{NoProfiles, ProfileDirectory, ProfileError};
pub use repository::{memory::MemoryConversationStore, ConversationStore, ReadOutcome};
pub use services::{
    ConversationSummary, HistoryQuery, MessageService, MessageServiceDependencies,
    MessagingLimits, ReconciliationDependencies, ReconciliationService, SendMessageRequest,
    SendOutcome, SendTarget,
};
pub use sweeper::{spawn_heartbeat_reaper, spawn_typing_sweeper};
pub use typing::TypingCoordinator;
