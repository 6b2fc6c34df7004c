use axum::extract::{Path, State};
use axum::Json;
use chrono::{Duration, Utc};
use hopper_core::store::{CPU_METRIC, MEMORY_METRIC};

use crate::error::AppError;
use crate::state::AppState;

/// Days of history in the per-day run counts.
const HISTORY_DAYS: i64 = 7;
/// Samples of each metric returned as recent history.
const RECENT_SAMPLES: usize = 50;

/// GET /api/metrics/:id: usage and activity report for a registration.
pub async fn get_metrics(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let store = app.store.clone();
    let since = (Utc::now() - Duration::days(HISTORY_DAYS)).timestamp_millis();
    let (registration, report) = tokio::task::spawn_blocking(move || {
        let registration = store.registration(id)?;
        let (topic, container) = (&registration.topic, &registration.container);

        let averages = store.metric_averages(topic, container)?;
        let average_duration = store.average_duration(topic, container)?;
        let per_day: serde_json::Map<String, serde_json::Value> = store
            .events_per_day(topic, container, since)?
            .into_iter()
            .map(|(day, count)| (day.to_string(), serde_json::json!(count)))
            .collect();
        let recent_cpu = store.recent_metrics(topic, container, CPU_METRIC, RECENT_SAMPLES)?;
        let recent_memory = store.recent_metrics(topic, container, MEMORY_METRIC, RECENT_SAMPLES)?;

        let report = serde_json::json!({
            "averages": averages,
            "average_duration_ms": average_duration,
            "events_per_day": per_day,
            "recent": {
                "cpu": recent_cpu.iter().map(|m| serde_json::json!([m.timestamp, m.value])).collect::<Vec<_>>(),
                "memory": recent_memory.iter().map(|m| serde_json::json!([m.timestamp, m.value])).collect::<Vec<_>>(),
            },
        });
        Ok::<_, hopper_core::HopperError>((registration, report))
    })
    .await
    .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;

    let running = match app
        .agent
        .count_running(&registration.topic, &registration.container)
        .await
    {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(id, error = %e, "could not count running containers");
            None
        }
    };

    let mut body = report;
    body["registration"] = serde_json::json!(registration);
    body["running"] = serde_json::json!(running);
    Ok(Json(body))
}
