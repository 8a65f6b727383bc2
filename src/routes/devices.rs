use crate::error::AppError;
use crate::middleware::guards::User;
use crate::models::DeviceId;
use crate::state::AppState;
use actix_web::{get, post, web, HttpResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct DevicesResponse {
    pub devices: Vec<DeviceId>,
}

/// GET /api/v1/devices
///
/// Devices of the caller's account with a live session, sorted by id.
#[get("/api/v1/devices")]
pub async fn list_devices(
    state: web::Data<AppState>,
    user: User,
) -> Result<HttpResponse, AppError> {
    let mut devices: Vec<DeviceId> = state.presence.devices(user.id).await?.into_iter().collect();
    devices.sort();
    Ok(HttpResponse::Ok().json(DevicesResponse { devices }))
}

/// POST /api/v1/devices/{device_id}/kick
#[post("/api/v1/devices/{device_id}/kick")]
pub async fn kick_device(
    state: web::Data<AppState>,
    user: User,
    device_id: web::Path<DeviceId>,
) -> Result<HttpResponse, AppError> {
    if !state.presence.kick(user.id, &device_id).await? {
        return Err(AppError::NotFound);
    }
    Ok(HttpResponse::NoContent().finish())
}
