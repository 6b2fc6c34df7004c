use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{Extension, Json};
use hopper_core::auth::{self, ADMIN_USER};
use hopper_core::error::HopperError;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct Credentials {
    pub id: String,
    pub password: String,
}

/// POST /api/login: exchange a user id and password for a bearer token.
pub async fn login(
    State(app): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(credentials) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    let Some(signer) = app.auth.clone() else {
        return Err(HopperError::AuthNotConfigured.into());
    };

    let store = app.store.clone();
    let id = credentials.id.clone();
    let stored = tokio::task::spawn_blocking(move || store.user_password(&id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    let valid = stored.is_some_and(|hash| auth::verify_password(&credentials.password, &hash));
    if !valid {
        tracing::info!(user = %credentials.id, "login failed");
        return Err(HopperError::InvalidCredentials.into());
    }

    let token = signer.issue(&credentials.id).map_err(HopperError::from)?;
    tracing::info!(user = %credentials.id, "login");
    Ok(Json(serde_json::json!({ "token": token })))
}

/// POST /api/users: add a user. Only the admin user may do this.
pub async fn create_user(
    State(app): State<AppState>,
    Extension(caller): Extension<AuthUser>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if caller.0 != ADMIN_USER {
        return Err(HopperError::Forbidden("only the admin user can create users".into()).into());
    }
    let Json(credentials) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    let id = credentials.id.trim().to_string();
    if id.is_empty() || credentials.password.is_empty() {
        return Err(AppError::bad_request("id and password must not be empty"));
    }

    let hash = auth::hash_password(&credentials.password).map_err(HopperError::from)?;
    let store = app.store.clone();
    let created = id.clone();
    tokio::task::spawn_blocking(move || store.create_user(&created, &hash))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    tracing::info!(user = %id, by = %caller.0, "user created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}
