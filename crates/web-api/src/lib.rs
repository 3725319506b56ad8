//! Web API 层。
//!
//! 提供 Axum 路由：对账用的 HTTP 接口和实时事件用的 WebSocket 入口，
//! 请求都委托给应用层的网关与用例服务。

mod auth;
mod error;
mod protocol;
mod routes;
mod state;
mod ws_connection;

pub use auth::{AuthUser, Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use protocol::ClientCommand;
pub use routes::{request_span, router};
pub use state::{AppState, StateDependencies};
