//! 主应用程序入口
//!
//! 加载配置，组装存储与服务，启动后台任务和 Axum Web 服务。

use std::sync::Arc;

use application::{
    spawn_heartbeat_reaper, spawn_typing_sweeper, ConversationStore, LoggingNotificationSink,
    MemoryConversationStore, NoProfiles, SystemClock,
};
use axum::body::Body;
use config::{AppConfig, StoreBackend};
use infrastructure::Infrastructure;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;
use web_api::{request_span, router, AppState, JwtService, StateDependencies};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config);

    let store: Arc<dyn ConversationStore> = match config.store.backend {
        StoreBackend::Postgres => {
            tracing::info!(
                database = config.database.url.split('@').next_back().unwrap_or("unknown"),
                "连接数据库"
            );
            Infrastructure::connect(&config.database).await?.store
        }
        StoreBackend::Memory => {
            tracing::warn!("使用进程内存储，重启后数据丢失");
            Arc::new(MemoryConversationStore::new())
        }
    };

    let state = AppState::new(
        &config,
        StateDependencies {
            store,
            identity: Arc::new(JwtService::new(config.jwt.clone())),
            notifier: Arc::new(LoggingNotificationSink),
            profiles: Arc::new(NoProfiles),
            clock: Arc::new(SystemClock),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = spawn_heartbeat_reaper(
        state.gateway.clone(),
        config.presence.heartbeat_interval(),
        shutdown_rx.clone(),
    );
    let sweeper = spawn_typing_sweeper(
        state.gateway.clone(),
        config.typing.sweep_interval(),
        shutdown_rx,
    );

    let app = router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http().make_span_with(request_span::<Body>))
            .layer(CorsLayer::permissive()),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    tracing::info!("聊天服务启动在 http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "监听退出信号失败");
            }
            tracing::info!("收到退出信号，开始关闭");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(reaper, sweeper);
    tracing::info!("服务已关闭");

    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
