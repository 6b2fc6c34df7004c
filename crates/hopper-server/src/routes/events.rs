use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// POST /api/event: multipart upload of one or more files for a topic.
///
/// The `topic` text field may appear before or after the file parts. Every
/// part that carries a file name is added to the topic's inbox in order.
pub async fn post_event(
    State(app): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let mut topic: Option<String> = None;
    let mut files: Vec<(String, Bytes)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(format!("failed to read '{file_name}': {e}")))?;
                files.push((file_name, data));
            }
            None if name.as_deref() == Some("topic") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(format!("failed to read topic: {e}")))?;
                topic = Some(value.trim().to_string());
            }
            None => {}
        }
    }

    let topic = topic
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::bad_request("missing required field 'topic'"))?;
    hopper_core::paths::validate_topic(&topic)?;

    let inbox = app.inbox.clone();
    let queued = tokio::task::spawn_blocking(move || {
        let mut queued = Vec::with_capacity(files.len());
        for (file_name, data) in files {
            let seq = inbox.add_bytes(&topic, &data)?;
            tracing::debug!(topic = %topic, file = %file_name, seq, "event queued");
            queued.push(file_name);
        }
        Ok::<_, hopper_core::HopperError>(queued)
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    let status = if queued.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(serde_json::json!({ "results": queued }))))
}
