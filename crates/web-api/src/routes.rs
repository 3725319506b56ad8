use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{Request, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use application::{ConversationSummary, HistoryQuery, SendMessageRequest, SendTarget};
use domain::{Conversation, ConversationId, Message, UserId};

use crate::{auth::AuthUser, error::ApiError, state::AppState, ws_connection};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartConversationPayload {
    recipient_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagePayload {
    content: String,
    #[serde(default)]
    attachments: Vec<String>,
    client_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    after: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// 请求日志的 span，只记录路径。
///
/// WebSocket 入口把 token 放在查询串里，完整 URI 不能进日志。
pub fn request_span<B>(request: &Request<B>) -> tracing::Span {
    tracing::info_span!(
        "http",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(start_conversation),
        )
        .route("/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/conversations/{conversation_id}/read", post(mark_read))
        .route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let items = state.reconciliation.list_conversations(user_id).await?;
    Ok(Json(items))
}

/// 已存在时返回 200，新建时返回 201
async fn start_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<StartConversationPayload>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let (conversation, created) = state
        .messages
        .start_conversation(user_id, payload.recipient_id)
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}

async fn get_conversation(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<ConversationSummary>, ApiError> {
    let summary = state
        .reconciliation
        .get_conversation(user_id, conversation_id)
        .await?;
    Ok(Json(summary))
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let items = state
        .reconciliation
        .list_messages(
            user_id,
            conversation_id,
            HistoryQuery {
                after_sequence: query.after,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(items))
}

async fn send_message(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
    Json(payload): Json<SendMessagePayload>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let outcome = state
        .messages
        .send(SendMessageRequest {
            sender_id: user_id,
            target: SendTarget::Conversation(conversation_id),
            content: payload.content,
            attachments: payload.attachments,
            client_ref: payload.client_ref,
            origin: None,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(outcome.message)))
}

async fn mark_read(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state.messages.mark_read(user_id, conversation_id).await?;
    Ok(Json(conversation))
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| ws_connection::serve(socket, state, query.token))
}
