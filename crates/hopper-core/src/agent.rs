//! Container agent.
//!
//! Owns container identity on top of a [`ContainerRuntime`]: name assignment,
//! start with retry, terminate callbacks, removal of finished containers and
//! statistics streaming. Two background loops keep the index honest:
//!
//! - the **exit monitor** lists labelled containers that have exited, fires
//!   each one's terminate callback once and queues it for removal;
//! - the **removal sweeper** drains the removal queue, rotating a container
//!   that cannot be removed yet to the back so it never blocks the rest.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::DockerConfig;
use crate::error::{HopperError, Result};
use crate::runtime::{
    image_base, normalize_image_name, qualified_image, ContainerFilter, ContainerInfo,
    ContainerRuntime, ContainerSpec, ContainerStatus, RuntimeError, RuntimeResult, StatsSample,
};

/// Shortest period a background loop will tick at.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Invoked once with the container id when its exit is observed.
pub type TerminateCallback = Box<dyn FnOnce(&str) + Send>;

/// Invoked per statistics sample with `(sample, container_id, topic, label)`.
pub type StatsCallback = Arc<dyn Fn(&StatsSample, &str, &str, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Total attempts for each of create and start.
    pub start_retries: u32,
    pub retry_delay: Duration,
    pub monitor_interval: Duration,
    pub removal_interval: Duration,
    /// Label carrying the topic a container was started for.
    pub topic_label: String,
    /// Mount point of the promoted directory inside the container.
    pub container_inbox: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        AgentOptions::from(&DockerConfig::default())
    }
}

impl From<&DockerConfig> for AgentOptions {
    fn from(config: &DockerConfig) -> Self {
        Self {
            start_retries: config.start_retries,
            retry_delay: config.retry_delay(),
            monitor_interval: config.monitor_interval(),
            removal_interval: config.removal_interval(),
            topic_label: config.topic_label.clone(),
            container_inbox: config.container_inbox.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Managed containers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    RemovalQueued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub topic: Option<String>,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to launch one container.
pub struct StartRequest {
    pub image: String,
    pub mount_source: PathBuf,
    pub ports: HashMap<String, u16>,
    pub privileged: bool,
    pub command: Option<Vec<String>>,
    pub topic: Option<String>,
    pub on_terminate: Option<TerminateCallback>,
}

impl StartRequest {
    pub fn new(image: impl Into<String>, mount_source: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            mount_source: mount_source.into(),
            ports: HashMap::new(),
            privileged: false,
            command: None,
            topic: None,
            on_terminate: None,
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn port(mut self, container_port: impl Into<String>, host_port: u16) -> Self {
        self.ports.insert(container_port.into(), host_port);
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    pub fn on_terminate<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&str) + Send + 'static,
    {
        self.on_terminate = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for StartRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartRequest")
            .field("image", &self.image)
            .field("mount_source", &self.mount_source)
            .field("ports", &self.ports)
            .field("privileged", &self.privileged)
            .field("command", &self.command)
            .field("topic", &self.topic)
            .field("on_terminate", &self.on_terminate.is_some())
            .finish()
    }
}

#[derive(Default)]
struct AgentState {
    index: HashMap<String, ManagedContainer>,
    /// Instance numbers in use per normalized image name.
    names: HashMap<String, BTreeSet<u32>>,
    on_terminate: HashMap<String, TerminateCallback>,
    removal: VecDeque<String>,
}

impl AgentState {
    fn reserve_name(&mut self, image: &str) -> String {
        let key = normalize_image_name(image_base(image));
        let used = self.names.entry(key.clone()).or_default();
        let n = (0..).find(|n| !used.contains(n)).unwrap_or(0);
        used.insert(n);
        format!("{key}_{n}")
    }

    fn claim_name(&mut self, name: &str) {
        if let Some((key, n)) = split_name(name) {
            self.names.entry(key.to_string()).or_default().insert(n);
        }
    }

    fn release_name(&mut self, name: &str) {
        if let Some((key, n)) = split_name(name) {
            if let Some(used) = self.names.get_mut(key) {
                used.remove(&n);
                if used.is_empty() {
                    self.names.remove(key);
                }
            }
        }
    }

    fn enqueue_removal(&mut self, id: &str) {
        if let Some(container) = self.index.get_mut(id) {
            container.state = ContainerState::RemovalQueued;
        }
        if !self.removal.iter().any(|queued| queued == id) {
            self.removal.push_back(id.to_string());
        }
    }

    fn forget(&mut self, id: &str) -> Option<TerminateCallback> {
        if let Some(container) = self.index.remove(id) {
            self.release_name(&container.name);
        }
        self.on_terminate.remove(id)
    }
}

fn split_name(name: &str) -> Option<(&str, u32)> {
    let (key, n) = name.rsplit_once('_')?;
    Some((key, n.parse().ok()?))
}

// ---------------------------------------------------------------------------
// ContainerAgent
// ---------------------------------------------------------------------------

pub struct ContainerAgent {
    runtime: Arc<dyn ContainerRuntime>,
    options: AgentOptions,
    state: Mutex<AgentState>,
}

impl ContainerAgent {
    /// Agent with an empty index. Prefer [`ContainerAgent::connect`] when the
    /// runtime may already hold containers from an earlier run.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, options: AgentOptions) -> Self {
        Self {
            runtime,
            options,
            state: Mutex::new(AgentState::default()),
        }
    }

    /// Create an agent and seed its index with every container carrying the
    /// topic label. Those that already exited are queued for removal.
    pub async fn connect(runtime: Arc<dyn ContainerRuntime>, options: AgentOptions) -> Result<Arc<Self>> {
        let agent = Self::new(runtime, options);
        let existing = agent
            .runtime
            .list_containers(&ContainerFilter::labelled(&agent.options.topic_label))
            .await?;

        {
            let mut state = agent.lock();
            for info in existing {
                let exited = info.status == ContainerStatus::Exited;
                let container = agent.discovered(&info);
                state.claim_name(&container.name);
                state.index.insert(info.id.clone(), container);
                if exited {
                    state.enqueue_removal(&info.id);
                }
            }
            info!(
                containers = state.index.len(),
                queued = state.removal.len(),
                "container agent connected"
            );
        }
        Ok(Arc::new(agent))
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discovered(&self, info: &ContainerInfo) -> ManagedContainer {
        ManagedContainer {
            id: info.id.clone(),
            name: info.name.clone().unwrap_or_default(),
            image: info.image.clone(),
            topic: info.labels.get(&self.options.topic_label).cloned(),
            state: match info.status {
                ContainerStatus::Created => ContainerState::Created,
                ContainerStatus::Exited => ContainerState::Exited,
                ContainerStatus::Running | ContainerStatus::Other => ContainerState::Running,
            },
            created_at: Utc::now(),
        }
    }

    // -----------------------------------------------------------------------
    // Images
    // -----------------------------------------------------------------------

    /// Whether `image` is present locally. An untagged name means `:latest`.
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        let wanted = qualified_image(image);
        let tags = self.runtime.image_tags().await?;
        Ok(tags.iter().any(|t| *t == wanted))
    }

    pub async fn pull(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        self.runtime.pull_image(image).await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        self.pull(image).await.map_err(|e| HopperError::ContainerStart {
            image: image.to_string(),
            attempts: 0,
            reason: format!("image not available: {e}"),
        })
    }

    // -----------------------------------------------------------------------
    // Start / stop
    // -----------------------------------------------------------------------

    /// Create and start a container for `request`, returning its id.
    ///
    /// The terminate callback is registered as soon as the container exists,
    /// so an exit observed before `start` returns still reaches it. A container
    /// that was created but could not be started is queued for removal and its
    /// callback is dropped without running.
    pub async fn start(&self, request: StartRequest) -> Result<String> {
        let StartRequest {
            image,
            mount_source,
            ports,
            privileged,
            command,
            topic,
            on_terminate,
        } = request;

        self.ensure_image(&image).await?;

        let name = self.lock().reserve_name(&image);
        let labels = HashMap::from([(
            self.options.topic_label.clone(),
            topic.clone().unwrap_or_default(),
        )]);
        let spec = ContainerSpec {
            name: name.clone(),
            image: image.clone(),
            mount_source,
            mount_target: self.options.container_inbox.clone(),
            labels,
            ports,
            privileged,
            command,
        };

        let runtime = Arc::clone(&self.runtime);
        let created = self
            .with_retries("create", &image, || {
                let runtime = Arc::clone(&runtime);
                let spec = spec.clone();
                async move { runtime.create_container(&spec).await }
            })
            .await;
        let id = match created {
            Ok(id) => id,
            Err(e) => {
                self.lock().release_name(&name);
                return Err(e);
            }
        };

        {
            let mut state = self.lock();
            state.index.insert(
                id.clone(),
                ManagedContainer {
                    id: id.clone(),
                    name: name.clone(),
                    image: image.clone(),
                    topic: topic.clone(),
                    state: ContainerState::Created,
                    created_at: Utc::now(),
                },
            );
            if let Some(callback) = on_terminate {
                state.on_terminate.insert(id.clone(), callback);
            }
        }

        let started = self
            .with_retries("start", &image, || {
                let runtime = Arc::clone(&runtime);
                let id = id.clone();
                async move { runtime.start_container(&id).await }
            })
            .await;
        if let Err(e) = started {
            let mut state = self.lock();
            state.on_terminate.remove(&id);
            state.enqueue_removal(&id);
            return Err(e);
        }

        if let Some(container) = self.lock().index.get_mut(&id) {
            if container.state == ContainerState::Created {
                container.state = ContainerState::Running;
            }
        }
        info!(container = %id, name = %name, image = %image, topic = ?topic, "container started");
        Ok(id)
    }

    async fn with_retries<T, F, Fut>(&self, step: &str, image: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let attempts = self.options.start_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(image, step, attempt, error = %e, "transient runtime error, retrying");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Err(e) => {
                    return Err(HopperError::ContainerStart {
                        image: image.to_string(),
                        attempts: attempt,
                        reason: format!("{step} failed: {e}"),
                    })
                }
            }
        }
    }

    /// Stop a container and queue it for removal. A container the runtime no
    /// longer knows is only queued.
    pub async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        match self.runtime.stop_container(id, grace).await {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.lock().enqueue_removal(id);
        info!(container = %id, "container stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Running containers labelled with `topic` whose image starts with
    /// `image` stripped of its tag.
    pub async fn count_running(&self, topic: &str, image: &str) -> Result<usize> {
        let filter = ContainerFilter::labelled(&self.options.topic_label)
            .value(topic)
            .status(ContainerStatus::Running);
        let base = image_base(image);
        let running = self.runtime.list_containers(&filter).await?;
        Ok(running.iter().filter(|c| c.image.starts_with(base)).count())
    }

    /// Snapshot of the index, ordered by id.
    pub fn managed(&self) -> Vec<ManagedContainer> {
        let mut containers: Vec<_> = self.lock().index.values().cloned().collect();
        containers.sort_by(|a, b| a.id.cmp(&b.id));
        containers
    }

    pub fn removal_queue(&self) -> Vec<String> {
        self.lock().removal.iter().cloned().collect()
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Stream statistics for `id` into `callback` on a spawned task. The task
    /// ends when the stream does; a timeout ends it quietly.
    pub fn stats(&self, id: &str, topic: &str, label: &str, callback: StatsCallback) -> JoinHandle<()> {
        let mut stream = self.runtime.stats_stream(id);
        let id = id.to_string();
        let topic = topic.to_string();
        let label = label.to_string();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(sample) => {
                        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            callback(&sample, &id, &topic, &label)
                        }));
                        if delivered.is_err() {
                            error!(container = %id, "stats callback panicked");
                        }
                    }
                    Err(RuntimeError::Timeout(_)) => {
                        debug!(container = %id, "stats stream timed out");
                        break;
                    }
                    Err(e) => {
                        warn!(container = %id, error = %e, "stats stream failed");
                        break;
                    }
                }
            }
            debug!(container = %id, "stats stream closed");
        })
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// One exit-monitor pass. Returns how many exits were newly observed.
    pub async fn observe_exits(&self) -> Result<usize> {
        let filter = ContainerFilter::labelled(&self.options.topic_label).status(ContainerStatus::Exited);
        let exited = self.runtime.list_containers(&filter).await?;

        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            for info in &exited {
                let newly = match state.index.get_mut(&info.id) {
                    Some(c) if matches!(c.state, ContainerState::Exited | ContainerState::RemovalQueued) => false,
                    Some(c) => {
                        c.state = ContainerState::Exited;
                        true
                    }
                    None => {
                        let container = self.discovered(info);
                        state.claim_name(&container.name);
                        state.index.insert(info.id.clone(), container);
                        true
                    }
                };
                if !newly {
                    continue;
                }
                debug!(container = %info.id, "container exited");
                if let Some(callback) = state.on_terminate.remove(&info.id) {
                    fired.push((info.id.clone(), callback));
                }
                state.enqueue_removal(&info.id);
            }
        }

        let count = fired.len();
        for (id, callback) in fired {
            fire_terminate(&id, callback);
        }
        Ok(count)
    }

    /// One removal pass over a snapshot of the queue. Returns how many
    /// containers were removed. The first failure is rotated to the back of
    /// the queue and ends the pass.
    pub async fn sweep_removals(&self) -> usize {
        let snapshot = self.removal_queue();
        let mut removed = 0;
        for id in snapshot {
            match self.runtime.remove_container(&id).await {
                Ok(()) | Err(RuntimeError::NotFound(_)) => {
                    let pending = {
                        let mut state = self.lock();
                        state.removal.retain(|queued| *queued != id);
                        state.forget(&id)
                    };
                    if let Some(callback) = pending {
                        fire_terminate(&id, callback);
                    }
                    debug!(container = %id, "container removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(container = %id, error = %e, "failed to remove container, will retry");
                    let mut state = self.lock();
                    if let Some(pos) = state.removal.iter().position(|queued| *queued == id) {
                        if let Some(failed) = state.removal.remove(pos) {
                            state.removal.push_back(failed);
                        }
                    }
                    break;
                }
            }
        }
        removed
    }

    /// Spawn the exit monitor and the removal sweeper. Both stop when
    /// `shutdown` changes.
    pub fn spawn_background(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).exit_monitor(shutdown.clone())),
            tokio::spawn(Arc::clone(self).removal_sweeper(shutdown)),
        ]
    }

    async fn exit_monitor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.options.monitor_interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.observe_exits().await {
                        warn!(error = %e, "exit monitor pass failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("exit monitor stopped");
    }

    async fn removal_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.options.removal_interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_removals().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("removal sweeper stopped");
    }
}

fn fire_terminate(id: &str, callback: TerminateCallback) {
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(id))).is_err() {
        error!(container = %id, "terminate callback panicked");
    }
}
