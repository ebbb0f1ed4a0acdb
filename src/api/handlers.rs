use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::{error, info};

use crate::error::AppError;
use crate::AppState;

/// All persisted messages, oldest first.
pub async fn list_messages(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let messages = state.messages.list_messages().await.map_err(|e| {
        error!("Error retrieving messages: {}", e);
        AppError::from(e)
    })?;

    Ok(HttpResponse::Ok().json(messages))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
}

/// Returns the user for `username`, creating it on first sight.
pub async fn create_user(
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let req: CreateUserRequest = serde_json::from_slice(&body).map_err(|e| {
        error!("Error decoding user data: {}", e);
        AppError::ValidationError("Invalid request body".to_string())
    })?;

    if req.username.is_empty() {
        return Err(AppError::ValidationError("Username is required".to_string()));
    }

    let user = state.users.find_or_create_user(&req.username).await.map_err(|e| {
        error!("Error adding user {}: {}", req.username, e);
        AppError::from(e)
    })?;

    info!("User {} resolved to {}", user.username, user.id);
    Ok(HttpResponse::Ok().json(user))
}

pub async fn preflight() -> HttpResponse {
    HttpResponse::Ok().finish()
}

pub async fn method_not_allowed() -> Result<HttpResponse, AppError> {
    Err(AppError::MethodNotAllowed)
}
