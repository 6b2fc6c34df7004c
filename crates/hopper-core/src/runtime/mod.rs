//! Container runtime seam.
//!
//! [`ContainerRuntime`] is the narrow set of engine operations the agent
//! needs. [`docker::DockerRuntime`] talks to a Docker daemon; [`memory::MemoryRuntime`]
//! keeps everything in process and can be scripted to fail.

pub mod docker;
pub mod memory;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container runtime timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Api(String),
}

impl RuntimeError {
    /// Timeouts are worth retrying; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Timeout(_))
    }
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory bind-mounted into the container.
    pub mount_source: PathBuf,
    /// Path the mount appears at inside the container.
    pub mount_target: String,
    pub labels: HashMap<String, String>,
    /// Container port (e.g. `"8080/tcp"`) to host port.
    pub ports: HashMap<String, u16>,
    pub privileged: bool,
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Other,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Other => "other",
        }
    }

    pub fn parse(state: &str) -> Self {
        match state {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            _ => ContainerStatus::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: Option<String>,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
}

/// Label and status filter for [`ContainerRuntime::list_containers`].
/// Stopped containers are included unless `status` says otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub label: String,
    pub value: Option<String>,
    pub status: Option<ContainerStatus>,
}

impl ContainerFilter {
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn status(mut self, status: ContainerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, info: &ContainerInfo) -> bool {
        let label_ok = match (info.labels.get(&self.label), &self.value) {
            (Some(actual), Some(wanted)) => actual == wanted,
            (Some(_), None) => true,
            (None, _) => false,
        };
        label_ok && self.status.map_or(true, |s| s == info.status)
    }
}

/// One reading from a container's statistics stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSample {
    pub read_at: DateTime<Utc>,
    /// Cumulative CPU time used by the container.
    pub cpu_total: u64,
    /// Cumulative CPU time of the host, when reported.
    pub cpu_system: Option<u64>,
    pub memory_usage: Option<u64>,
    pub memory_limit: Option<u64>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    /// Every `repository:tag` present locally.
    async fn image_tags(&self) -> RuntimeResult<Vec<String>>;

    /// Create a container and return its runtime-assigned id.
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;

    async fn list_containers(&self, filter: &ContainerFilter) -> RuntimeResult<Vec<ContainerInfo>>;

    /// Live statistics for `id`. The stream ends when the container goes away;
    /// a `Timeout` item means the engine stopped answering.
    fn stats_stream(&self, id: &str) -> BoxStream<'static, RuntimeResult<StatsSample>>;
}

// ---------------------------------------------------------------------------
// Image names
// ---------------------------------------------------------------------------

/// Split `image` into repository and optional tag. A `:` that belongs to a
/// registry port (`host:5000/app`) is not a tag separator.
pub fn split_image(image: &str) -> (&str, Option<&str>) {
    match image.rfind(':') {
        Some(idx) if !image[idx..].contains('/') => (&image[..idx], Some(&image[idx + 1..])),
        _ => (image, None),
    }
}

/// Image name without its tag.
pub fn image_base(image: &str) -> &str {
    split_image(image).0
}

/// `image` with an explicit tag, `latest` when none is given.
pub fn qualified_image(image: &str) -> String {
    match split_image(image) {
        (_, Some(_)) => image.to_string(),
        (repo, None) => format!("{repo}:latest"),
    }
}

/// Container-name-safe form of an image name.
pub fn normalize_image_name(image: &str) -> String {
    image
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_registry_ports() {
        assert_eq!(split_image("busybox"), ("busybox", None));
        assert_eq!(split_image("busybox:1.36"), ("busybox", Some("1.36")));
        assert_eq!(split_image("reg.io:5000/team/app"), ("reg.io:5000/team/app", None));
        assert_eq!(split_image("reg.io:5000/team/app:v2"), ("reg.io:5000/team/app", Some("v2")));
    }

    #[test]
    fn qualified_adds_latest() {
        assert_eq!(qualified_image("busybox"), "busybox:latest");
        assert_eq!(qualified_image("busybox:1.36"), "busybox:1.36");
    }

    #[test]
    fn normalized_names() {
        assert_eq!(normalize_image_name("team/word-count"), "team_word_count");
        assert_eq!(normalize_image_name("reg.io:5000/app"), "reg.io_5000_app");
    }

    #[test]
    fn transient_errors() {
        assert!(RuntimeError::Timeout("slow".into()).is_transient());
        assert!(!RuntimeError::NotFound("gone".into()).is_transient());
        assert!(!RuntimeError::Api("boom".into()).is_transient());
    }

    #[test]
    fn filter_matches_label_and_status() {
        let info = ContainerInfo {
            id: "c1".into(),
            name: None,
            image: "busybox:latest".into(),
            status: ContainerStatus::Exited,
            labels: HashMap::from([("hopper.topic".to_string(), "T1".to_string())]),
        };
        assert!(ContainerFilter::labelled("hopper.topic").matches(&info));
        assert!(ContainerFilter::labelled("hopper.topic").value("T1").matches(&info));
        assert!(!ContainerFilter::labelled("hopper.topic").value("T2").matches(&info));
        assert!(!ContainerFilter::labelled("other").matches(&info));
        assert!(!ContainerFilter::labelled("hopper.topic")
            .status(ContainerStatus::Running)
            .matches(&info));
    }
}
