use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use hopper_core::store::NewRegistration;

use crate::auth::AuthUser;
use crate::error::AppError;
use crate::state::AppState;

/// GET /api/registrations: list all registrations.
pub async fn list_registrations(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let registrations = tokio::task::spawn_blocking(move || store.registrations())
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!({ "results": registrations })))
}

/// POST /api/registrations: subscribe an image to a topic. The caller is
/// recorded as its creator.
pub async fn create_registration(
    State(app): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    body: Result<Json<NewRegistration>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let Json(mut new) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    new.topic = new.topic.trim().to_string();
    new.container = new.container.trim().to_string();
    new.creator = user;
    new.validate()?;

    let store = app.store.clone();
    let created = tokio::task::spawn_blocking(move || store.create_registration(&new))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    tracing::info!(id = created.id, topic = %created.topic, container = %created.container, creator = %created.creator, "registration created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": created.id }))))
}

/// GET /api/registrations/:id: one registration.
pub async fn get_registration(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let registration = tokio::task::spawn_blocking(move || store.registration(id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    Ok(Json(serde_json::json!(registration)))
}

/// DELETE /api/registrations/:id: unsubscribe. Buffered files stay put.
pub async fn delete_registration(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let removed = tokio::task::spawn_blocking(move || store.delete_registration(id))
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
    tracing::info!(id, topic = %removed.topic, "registration deleted");
    Ok(Json(serde_json::json!({ "id": removed.id })))
}
