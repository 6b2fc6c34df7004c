use axum::extract::{Path, State};
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/inbox/:topic: files buffered for a topic.
pub async fn get_inbox(
    State(app): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let inbox = app.inbox.clone();
    let result = tokio::task::spawn_blocking(move || {
        let files = inbox.list(&topic)?;
        Ok::<_, hopper_core::HopperError>(serde_json::json!({
            "topic": topic,
            "count": files.len(),
            "files": files,
        }))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    Ok(Json(result))
}
