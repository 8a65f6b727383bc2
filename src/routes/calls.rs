use crate::error::AppError;
use crate::middleware::guards::User;
use crate::models::{CallEvent, CallKind, ReceiverKind};
use crate::state::AppState;
use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use uuid::Uuid;

/// Ring a user or a group.
#[derive(Debug, Deserialize)]
pub struct InitiateCallRequest {
    pub receiver_kind: ReceiverKind,
    pub receiver_id: Uuid,
    #[serde(default = "default_call_kind")]
    pub kind: CallKind,
}

fn default_call_kind() -> CallKind {
    CallKind::Voice
}

/// POST /api/v1/calls
#[post("/api/v1/calls")]
pub async fn initiate_call(
    state: web::Data<AppState>,
    user: User,
    body: web::Json<InitiateCallRequest>,
) -> Result<HttpResponse, AppError> {
    let call = state
        .calls
        .initiate(user.id, body.receiver_kind, body.receiver_id, body.kind)
        .await?;
    Ok(HttpResponse::Created().json(call))
}

/// GET /api/v1/calls/{id}
#[get("/api/v1/calls/{id}")]
pub async fn get_call(
    state: web::Data<AppState>,
    user: User,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let call = state.calls.get(call_id.into_inner(), user.id).await?;
    Ok(HttpResponse::Ok().json(call))
}

async fn apply(
    state: &AppState,
    user: &User,
    call_id: Uuid,
    event: CallEvent,
) -> Result<HttpResponse, AppError> {
    let call = state.calls.transition(call_id, user.id, event).await?;
    Ok(HttpResponse::Ok().json(call))
}

/// POST /api/v1/calls/{id}/accept
#[post("/api/v1/calls/{id}/accept")]
pub async fn accept_call(
    state: web::Data<AppState>,
    user: User,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    apply(&state, &user, call_id.into_inner(), CallEvent::Accept).await
}

/// POST /api/v1/calls/{id}/reject
#[post("/api/v1/calls/{id}/reject")]
pub async fn reject_call(
    state: web::Data<AppState>,
    user: User,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    apply(&state, &user, call_id.into_inner(), CallEvent::Reject).await
}

/// POST /api/v1/calls/{id}/end
#[post("/api/v1/calls/{id}/end")]
pub async fn end_call(
    state: web::Data<AppState>,
    user: User,
    call_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    apply(&state, &user, call_id.into_inner(), CallEvent::End).await
}
