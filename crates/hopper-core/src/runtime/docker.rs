use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions, Stats,
    StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use tracing::debug;

use super::{
    split_image, ContainerFilter, ContainerInfo, ContainerRuntime, ContainerSpec,
    ContainerStatus, RuntimeError, RuntimeResult, StatsSample,
};
use crate::config::{DockerConfig, RegistryConfig};

/// [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerRuntime {
    /// Connect using the platform default socket, with the request timeout from
    /// `config`. Registry credentials, when present, are sent with every pull.
    pub fn connect(config: &DockerConfig, registry: Option<&RegistryConfig>) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(map_err)?
            .with_timeout(Duration::from_secs(config.timeout_secs.max(1)));
        let credentials = registry.map(|r| DockerCredentials {
            username: r.username.clone(),
            password: r.password.clone(),
            serveraddress: Some(format!("{}://{}", r.protocol, r.host)),
            ..Default::default()
        });
        Ok(Self { docker, credentials })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let (repo, tag) = split_image(image);
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.unwrap_or("latest").to_string(),
            ..Default::default()
        };
        let mut progress = self
            .docker
            .create_image(Some(options), None, self.credentials.clone());
        while let Some(item) = progress.next().await {
            let info = item.map_err(map_err)?;
            if let Some(status) = info.status {
                debug!(image, status = %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn image_tags(&self) -> RuntimeResult<Vec<String>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;
        Ok(images.into_iter().flat_map(|i| i.repo_tags).collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let binds = vec![format!("{}:{}", spec.mount_source.display(), spec.mount_target)];

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for (container_port, host_port) in &spec.ports {
            exposed_ports.insert(container_port.clone(), HashMap::new());
            port_bindings.insert(
                container_port.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(binds),
            privileged: Some(spec.privileged),
            port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_err)?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(map_err)
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_err)
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> RuntimeResult<Vec<ContainerInfo>> {
        let label = match &filter.value {
            Some(value) => format!("{}={}", filter.label, value),
            None => filter.label.clone(),
        };
        let mut filters = HashMap::from([("label".to_string(), vec![label])]);
        if let Some(status) = filter.status {
            filters.insert("status".to_string(), vec![status.as_str().to_string()]);
        }

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(map_err)?;

        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                Some(ContainerInfo {
                    id: s.id?,
                    name: s
                        .names
                        .and_then(|n| n.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_string()),
                    image: s.image.unwrap_or_default(),
                    status: s
                        .state
                        .as_deref()
                        .map(ContainerStatus::parse)
                        .unwrap_or(ContainerStatus::Other),
                    labels: s.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    fn stats_stream(&self, id: &str) -> BoxStream<'static, RuntimeResult<StatsSample>> {
        self.docker
            .stats(
                id,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            )
            .map(|item| item.map(|stats| sample_from(&stats)).map_err(map_err))
            .boxed()
    }
}

fn sample_from(stats: &Stats) -> StatsSample {
    let read_at = DateTime::parse_from_rfc3339(&stats.read)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    StatsSample {
        read_at,
        cpu_total: stats.cpu_stats.cpu_usage.total_usage,
        cpu_system: stats.cpu_stats.system_cpu_usage,
        memory_usage: stats.memory_stats.usage,
        memory_limit: stats.memory_stats.limit,
    }
}

fn map_err(err: BollardError) -> RuntimeError {
    match &err {
        BollardError::RequestTimeoutError => RuntimeError::Timeout(err.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message.clone()),
        _ => RuntimeError::Api(err.to_string()),
    }
}
