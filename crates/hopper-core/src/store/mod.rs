//! Relational persistence for registrations, users, metrics and run events.

mod model;
mod sqlite;

pub use model::{
    Metric, NewRegistration, Registration, RunEvent, TriggerPolicy, CPU_METRIC, MAX_TIMEOUT_SECS,
    MEMORY_METRIC,
};
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use crate::error::Result;

/// Blocking store interface. Async callers go through `spawn_blocking`.
pub trait Store: Send + Sync {
    fn create_registration(&self, new: &NewRegistration) -> Result<Registration>;

    fn registration(&self, id: i64) -> Result<Registration>;

    fn registrations(&self) -> Result<Vec<Registration>>;

    fn registrations_for_topic(&self, topic: &str) -> Result<Vec<Registration>>;

    /// Delete and return the registration.
    fn delete_registration(&self, id: i64) -> Result<Registration>;

    fn record_metric(&self, metric: &Metric) -> Result<()>;

    fn record_event(&self, event: &RunEvent) -> Result<()>;

    /// Most recent values of one metric, oldest first.
    fn recent_metrics(&self, topic: &str, container: &str, name: &str, limit: usize) -> Result<Vec<Metric>>;

    /// Mean value per metric name.
    fn metric_averages(&self, topic: &str, container: &str) -> Result<BTreeMap<String, f64>>;

    /// Mean run duration in milliseconds, `None` without runs.
    fn average_duration(&self, topic: &str, container: &str) -> Result<Option<f64>>;

    /// Add an API user. `password_hash` comes from [`crate::auth::hash_password`].
    fn create_user(&self, id: &str, password_hash: &str) -> Result<()>;

    /// Stored password digest of `id`, `None` for unknown users.
    fn user_password(&self, id: &str) -> Result<Option<String>>;

    fn users(&self) -> Result<Vec<String>>;

    /// Run counts keyed by the UTC day (epoch milliseconds at midnight) the
    /// run started, for runs starting at or after `since_ms`.
    fn events_per_day(&self, topic: &str, container: &str, since_ms: i64) -> Result<BTreeMap<i64, u64>>;
}
