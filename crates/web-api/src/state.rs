use std::sync::Arc;
use std::time::Duration;

use application::{
    Clock, ConversationStore, Gateway, GatewayDependencies, GatewaySettings, IdentityVerifier,
    MessageService, MessageServiceDependencies, MessagingLimits, NotificationSink,
    ProfileDirectory, ReconciliationDependencies, ReconciliationService,
};
use config::AppConfig;

/// 组装应用状态所需的外部协作方
pub struct StateDependencies {
    pub store: Arc<dyn ConversationStore>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub notifier: Arc<dyn NotificationSink>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub messages: Arc<MessageService>,
    pub reconciliation: Arc<ReconciliationService>,
    pub identity: Arc<dyn IdentityVerifier>,
    /// 未在升级请求中携带 token 时，等待 `authenticate` 帧的时长
    pub auth_timeout: Duration,
}

impl AppState {
    pub fn new(config: &AppConfig, deps: StateDependencies) -> Self {
        let gateway = Arc::new(Gateway::new(GatewayDependencies {
            identity: deps.identity.clone(),
            store: deps.store.clone(),
            clock: deps.clock.clone(),
            settings: GatewaySettings::from_config(config),
        }));

        let messages = Arc::new(MessageService::new(MessageServiceDependencies {
            store: deps.store.clone(),
            gateway: gateway.clone(),
            notifier: deps.notifier,
            clock: deps.clock,
            limits: MessagingLimits::from_config(&config.messaging),
        }));

        let reconciliation = Arc::new(ReconciliationService::new(ReconciliationDependencies {
            store: deps.store,
            profiles: deps.profiles,
            page_limit: config.messaging.history_page_limit,
            store_timeout: config.messaging.store_timeout(),
        }));

        Self {
            gateway,
            messages,
            reconciliation,
            identity: deps.identity,
            auth_timeout: config.presence.auth_timeout(),
        }
    }
}
