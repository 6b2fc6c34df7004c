use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;

use super::model::{Metric, NewRegistration, Registration, RunEvent};
use super::Store;
use crate::error::{HopperError, Result};

const DAY_MS: i64 = 86_400_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registrations (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    topic       TEXT NOT NULL,
    container   TEXT NOT NULL,
    threshold   INTEGER,
    timeout     INTEGER,
    privileged  INTEGER NOT NULL DEFAULT 0,
    creator     TEXT NOT NULL,
    UNIQUE (topic, container)
);
CREATE TABLE IF NOT EXISTS metrics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    topic       TEXT NOT NULL,
    container   TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    name        TEXT NOT NULL,
    value       REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS metrics_by_target ON metrics (topic, container, name);
CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    topic       TEXT NOT NULL,
    container   TEXT NOT NULL,
    timestamp   INTEGER NOT NULL,
    duration    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS events_by_target ON events (topic, container);
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    password    TEXT NOT NULL
);
";

const REGISTRATION_COLUMNS: &str = "id, topic, container, threshold, timeout, privileged, creator";

/// [`Store`] on a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "opened sqlite store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn registration_from_row(row: &Row<'_>) -> rusqlite::Result<Registration> {
    Ok(Registration {
        id: row.get(0)?,
        topic: row.get(1)?,
        container: row.get(2)?,
        threshold: row.get::<_, Option<i64>>(3)?.map(|v| v.clamp(0, u32::MAX as i64) as u32),
        timeout: row.get::<_, Option<i64>>(4)?.map(|v| v.max(0) as u64),
        privileged: row.get(5)?,
        creator: row.get(6)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

impl Store for SqliteStore {
    fn create_registration(&self, new: &NewRegistration) -> Result<Registration> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO registrations (topic, container, threshold, timeout, privileged, creator)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new.topic,
                new.container,
                new.threshold.map(i64::from),
                new.timeout.map(|t| t.min(i64::MAX as u64) as i64),
                new.privileged,
                new.creator,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(HopperError::RegistrationExists {
                    topic: new.topic.clone(),
                    container: new.container.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Registration {
            id: conn.last_insert_rowid(),
            topic: new.topic.clone(),
            container: new.container.clone(),
            threshold: new.threshold,
            timeout: new.timeout,
            privileged: new.privileged,
            creator: new.creator.clone(),
        })
    }

    fn registration(&self, id: i64) -> Result<Registration> {
        self.conn()
            .query_row(
                &format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = ?1"),
                params![id],
                registration_from_row,
            )
            .optional()?
            .ok_or(HopperError::RegistrationNotFound(id))
    }

    fn registrations(&self) -> Result<Vec<Registration>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations ORDER BY id"
        ))?;
        let rows = stmt.query_map([], registration_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn registrations_for_topic(&self, topic: &str) -> Result<Vec<Registration>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE topic = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![topic], registration_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn delete_registration(&self, id: i64) -> Result<Registration> {
        let existing = self.registration(id)?;
        self.conn()
            .execute("DELETE FROM registrations WHERE id = ?1", params![id])?;
        Ok(existing)
    }

    fn record_metric(&self, metric: &Metric) -> Result<()> {
        self.conn().execute(
            "INSERT INTO metrics (topic, container, timestamp, name, value) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![metric.topic, metric.container, metric.timestamp, metric.name, metric.value],
        )?;
        Ok(())
    }

    fn record_event(&self, event: &RunEvent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO events (topic, container, timestamp, duration) VALUES (?1, ?2, ?3, ?4)",
            params![event.topic, event.container, event.timestamp, event.duration_ms],
        )?;
        Ok(())
    }

    fn recent_metrics(&self, topic: &str, container: &str, name: &str, limit: usize) -> Result<Vec<Metric>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT topic, container, timestamp, name, value FROM metrics
             WHERE topic = ?1 AND container = ?2 AND name = ?3
             ORDER BY timestamp DESC, id DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![topic, container, name, limit.min(i64::MAX as usize) as i64],
            |row| {
                Ok(Metric {
                    topic: row.get(0)?,
                    container: row.get(1)?,
                    timestamp: row.get(2)?,
                    name: row.get(3)?,
                    value: row.get(4)?,
                })
            },
        )?;
        let mut metrics = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        metrics.reverse();
        Ok(metrics)
    }

    fn metric_averages(&self, topic: &str, container: &str) -> Result<BTreeMap<String, f64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, AVG(value) FROM metrics
             WHERE topic = ?1 AND container = ?2 GROUP BY name",
        )?;
        let rows = stmt.query_map(params![topic, container], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }

    fn average_duration(&self, topic: &str, container: &str) -> Result<Option<f64>> {
        let avg = self.conn().query_row(
            "SELECT AVG(duration) FROM events WHERE topic = ?1 AND container = ?2",
            params![topic, container],
            |row| row.get::<_, Option<f64>>(0),
        )?;
        Ok(avg)
    }

    fn create_user(&self, id: &str, password_hash: &str) -> Result<()> {
        match self.conn().execute(
            "INSERT INTO users (id, password) VALUES (?1, ?2)",
            params![id, password_hash],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(HopperError::UserExists(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn user_password(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row("SELECT password FROM users WHERE id = ?1", params![id], |row| {
                row.get::<_, String>(0)
            })
            .optional()?)
    }

    fn users(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn events_per_day(&self, topic: &str, container: &str, since_ms: i64) -> Result<BTreeMap<i64, u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT (timestamp / ?4) * ?4 AS day, COUNT(*) FROM events
             WHERE topic = ?1 AND container = ?2 AND timestamp >= ?3
             GROUP BY day ORDER BY day",
        )?;
        let rows = stmt.query_map(params![topic, container, since_ms, DAY_MS], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })?;
        Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
    }
}
