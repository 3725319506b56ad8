#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::{LoggingNotificationSink, MemoryConversationStore, NoProfiles, SystemClock};
use config::{AppConfig, JwtConfig};
use domain::UserId;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use web_api::{router, AppState, JwtService, StateDependencies};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// 使用内存存储启动的测试服务器，离开作用域时关闭
pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: JwtService,
    pub client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let mut config = AppConfig::default();
        config.jwt = JwtConfig {
            secret: "web-api-test-secret-with-at-least-32-chars".to_string(),
            issuer: None,
        };
        config.presence.auth_timeout_secs = 1;

        let jwt = JwtService::new(config.jwt.clone());
        let state = AppState::new(
            &config,
            StateDependencies {
                store: Arc::new(MemoryConversationStore::new()),
                identity: Arc::new(jwt.clone()),
                notifier: Arc::new(LoggingNotificationSink),
                profiles: Arc::new(NoProfiles),
                clock: Arc::new(SystemClock),
            },
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            jwt,
            client: reqwest::Client::new(),
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.jwt
            .issue_token(user_id, time::Duration::minutes(10))
            .expect("issue token")
    }

    pub fn get(&self, user_id: UserId, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.url(path))
            .bearer_auth(self.token(user_id))
    }

    pub fn post(&self, user_id: UserId, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(self.token(user_id))
    }

    /// 通过 HTTP 建立两人会话，返回会话 ID
    pub async fn start_conversation(&self, user_id: UserId, recipient_id: UserId) -> String {
        let body: Value = self
            .post(user_id, "/api/v1/conversations")
            .json(&serde_json::json!({ "recipientId": recipient_id }))
            .send()
            .await
            .expect("start conversation")
            .json()
            .await
            .expect("conversation json");
        body["id"].as_str().expect("conversation id").to_string()
    }

    /// 带 token 连接并等到 authenticated 事件
    pub async fn connect(&self, user_id: UserId) -> WsClient {
        let url = format!("ws://{}/api/v1/ws?token={}", self.addr, self.token(user_id));
        let (mut ws, _) = connect_async(url).await.expect("websocket connect");
        expect_event(&mut ws, "authenticated").await;
        ws
    }

    /// 不带 token 连接，认证需要通过第一帧完成
    pub async fn connect_anonymous(&self) -> WsClient {
        let url = format!("ws://{}/api/v1/ws", self.addr);
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub async fn send_json(ws: &mut WsClient, frame: Value) {
    ws.send(TungsteniteMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// 下一个 JSON 事件；连接关闭时返回 None
pub async fn next_event(ws: &mut WsClient) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(EVENT_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for websocket frame");
        match frame {
            Some(Ok(TungsteniteMessage::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).expect("event json"));
            }
            Some(Ok(TungsteniteMessage::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// 跳过其他事件，直到收到指定类型的事件
pub async fn expect_event(ws: &mut WsClient, kind: &str) -> Value {
    loop {
        let event = next_event(ws)
            .await
            .unwrap_or_else(|| panic!("connection closed while waiting for {kind}"));
        if event["type"] == kind {
            return event;
        }
    }
}

/// 在给定时间内确认没有指定类型的事件
pub async fn assert_no_event(ws: &mut WsClient, kind: &str, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(TungsteniteMessage::Text(text)))) => {
                let event: Value = serde_json::from_str(text.as_str()).expect("event json");
                assert_ne!(event["type"], kind, "unexpected event {event}");
            }
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return,
        }
    }
}
