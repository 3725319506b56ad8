//! 单条长连接的生命周期
//!
//! 认证成功后拆成两个任务：发送任务把网关出站队列里的事件写到 socket，
//! 接收任务解析客户端指令并交给网关或消息服务。任一任务结束即释放连接。

use std::ops::ControlFlow;

use application::{ApplicationError, ConnectionSession, SendMessageRequest};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ConnectionId, ServerEvent, UserId};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{send_target, ClientCommand};
use crate::state::AppState;

type WsSink = SplitSink<WebSocket, WsMessage>;
type WsStream = SplitStream<WebSocket>;

/// 处理一次 WebSocket 升级。
///
/// 升级请求带了 `token` 时直接认证，否则第一帧必须是 `authenticate`。
/// 认证失败时回一个 error 帧后关闭，不在网关留下任何状态。
pub async fn serve(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    let credential = match token {
        Some(token) => Some(token),
        None => tokio::time::timeout(state.auth_timeout, read_credential(&mut stream))
            .await
            .unwrap_or_else(|_| {
                debug!("等待认证帧超时");
                None
            }),
    };
    let Some(credential) = credential else {
        reject(
            &mut sink,
            ServerEvent::error("AUTHENTICATION_REQUIRED", "first frame must be authenticate"),
        )
        .await;
        return;
    };

    let session = match state.gateway.connect(&credential).await {
        Ok(session) => session,
        Err(err) => {
            reject(&mut sink, ServerEvent::error(err.code(), err.to_string())).await;
            return;
        }
    };

    WebSocketConnection::new(state, &session)
        .run(sink, stream, session.events)
        .await;
}

async fn read_credential(stream: &mut WsStream) -> Option<String> {
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => {
                return match ClientCommand::parse(text.as_str()) {
                    Ok(ClientCommand::Authenticate { credential }) => Some(credential),
                    _ => None,
                };
            }
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn reject(sink: &mut WsSink, event: ServerEvent) {
    if let Ok(payload) = serde_json::to_string(&event) {
        let _ = sink.send(WsMessage::Text(payload.into())).await;
    }
    let _ = sink.close().await;
}

/// 已认证的连接
pub struct WebSocketConnection {
    state: AppState,
    connection_id: ConnectionId,
    user_id: UserId,
}

impl WebSocketConnection {
    fn new(state: AppState, session: &ConnectionSession) -> Self {
        Self {
            state,
            connection_id: session.connection_id,
            user_id: session.user_id,
        }
    }

    async fn run(self, mut sink: WsSink, mut stream: WsStream, mut events: mpsc::Receiver<ServerEvent>) {
        let gateway = self.state.gateway.clone();
        let connection_id = self.connection_id;
        let user_id = self.user_id;

        // 网关释放连接时发送端随之关闭，队列耗尽后这里退出
        let mut send_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let payload = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(error = %err, event = event.kind(), "事件序列化失败");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut recv_task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(connection_id = %self.connection_id, error = %err, "读取帧失败");
                        break;
                    }
                };
                if self.handle_frame(frame).await.is_break() {
                    break;
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => {
                recv_task.abort();
            }
            _ = &mut recv_task => {}
        }

        gateway.disconnect(connection_id).await;
        info!(user_id = %user_id, connection_id = %connection_id, "WebSocket 连接已断开");
    }

    async fn handle_frame(&self, frame: WsMessage) -> ControlFlow<()> {
        // 任何入站帧都算作心跳；连接已被回收时结束读取
        if self.state.gateway.touch(self.connection_id).is_err() {
            return ControlFlow::Break(());
        }

        match frame {
            WsMessage::Text(text) => self.handle_text(text.as_str()).await,
            WsMessage::Binary(_) => {
                self.push(ServerEvent::error(
                    "INVALID_FRAME",
                    "binary frames are not supported",
                ));
            }
            // ping 由 axum 自动回复 pong
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Close(_) => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    async fn handle_text(&self, text: &str) {
        let command = match ClientCommand::parse(text) {
            Ok(command) => command,
            Err(err) => {
                self.push(ServerEvent::error("INVALID_FRAME", err.to_string()));
                return;
            }
        };

        if matches!(command, ClientCommand::Authenticate { .. }) {
            self.push(ServerEvent::error(
                "ALREADY_AUTHENTICATED",
                "connection is already authenticated",
            ));
            return;
        }

        let conversation_id = command.conversation_id();
        let client_ref = command.client_ref().map(str::to_string);
        if let Err(err) = self.execute(command).await {
            debug!(
                connection_id = %self.connection_id,
                user_id = %self.user_id,
                code = err.code(),
                error = %err,
                "指令执行失败"
            );
            self.push(ServerEvent::Error {
                code: err.code().to_string(),
                message: err.to_string(),
                conversation_id,
                client_ref,
                retryable: err.is_retryable(),
            });
        }
    }

    async fn execute(&self, command: ClientCommand) -> Result<(), ApplicationError> {
        let gateway = &self.state.gateway;
        let connection_id = self.connection_id;

        match command {
            ClientCommand::Subscribe { conversation_id } => {
                gateway.subscribe(connection_id, conversation_id).await
            }
            ClientCommand::Unsubscribe { conversation_id } => {
                gateway.unsubscribe(connection_id, conversation_id)
            }
            ClientCommand::Send {
                conversation_id,
                recipient_id,
                content,
                attachments,
                client_ref,
            } => {
                let target = send_target(conversation_id, recipient_id)?;
                self.state
                    .messages
                    .send(SendMessageRequest {
                        sender_id: self.user_id,
                        target,
                        content,
                        attachments,
                        client_ref,
                        origin: Some(connection_id),
                    })
                    .await
                    .map(|_| ())
            }
            ClientCommand::TypingStart { conversation_id } => {
                gateway.typing_start(connection_id, conversation_id)
            }
            ClientCommand::TypingStop { conversation_id } => {
                gateway.typing_stop(connection_id, conversation_id)
            }
            ClientCommand::MarkRead { conversation_id } => self
                .state
                .messages
                .mark_read(self.user_id, conversation_id)
                .await
                .map(|_| ()),
            ClientCommand::AckDelivered {
                conversation_id,
                up_to_sequence,
            } => self
                .state
                .messages
                .mark_delivered(self.user_id, conversation_id, up_to_sequence)
                .await
                .map(|_| ()),
            ClientCommand::Heartbeat => gateway.heartbeat(connection_id),
            ClientCommand::Authenticate { .. } => Ok(()),
        }
    }

    /// 直接回给本连接，与其他事件共用出站队列
    fn push(&self, event: ServerEvent) {
        self.state.gateway.deliver(self.connection_id, event);
    }
}
