pub mod message_service;
pub mod reconciliation_service;

pub use message_service::{
    MessageService, MessageServiceDependencies, MessagingLimits, SendMessageRequest, SendOutcome,
    SendTarget,
};
pub use reconciliation_service::{
    ConversationSummary, HistoryQuery, ReconciliationDependencies, ReconciliationService,
};
