use crate::error::AppError;
use crate::middleware::guards::{client_ip, User};
use crate::models::message::base64_payload;
use crate::models::{ContentKind, Message, ReceiverKind};
use crate::state::AppState;
use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_kind: ReceiverKind,
    pub receiver_id: Uuid,
    pub content_kind: ContentKind,
    /// Opaque bytes, base64 encoded.
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct OfflineMessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub count: u64,
}

/// POST /api/v1/messages
#[post("/api/v1/messages")]
pub async fn send_message(
    req: HttpRequest,
    state: web::Data<AppState>,
    user: User,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let body = body.into_inner();
    let receipt = state
        .chat
        .send_message(
            user.id,
            &client_ip(&req),
            body.receiver_kind,
            body.receiver_id,
            body.content_kind,
            body.payload,
        )
        .await?;
    Ok(HttpResponse::Created().json(receipt))
}

/// POST /api/v1/messages/{id}/recall
#[post("/api/v1/messages/{id}/recall")]
pub async fn recall_message(
    state: web::Data<AppState>,
    user: User,
    msg_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let message = state
        .chat
        .recall_message(msg_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(message))
}

/// POST /api/v1/messages/{id}/read
#[post("/api/v1/messages/{id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    user: User,
    msg_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    state.chat.mark_read(msg_id.into_inner(), user.id).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// GET /api/v1/messages/offline
#[get("/api/v1/messages/offline")]
pub async fn drain_offline(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let messages = state.chat.drain_offline(user.id).await?;
    Ok(HttpResponse::Ok().json(OfflineMessagesResponse { messages }))
}

/// GET /api/v1/messages/unread/count
#[get("/api/v1/messages/unread/count")]
pub async fn unread_count(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let count = state.chat.unread_count(user.id).await?;
    Ok(HttpResponse::Ok().json(UnreadCountResponse { count }))
}
