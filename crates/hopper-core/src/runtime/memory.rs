use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use super::{
    qualified_image, ContainerFilter, ContainerInfo, ContainerRuntime, ContainerSpec,
    ContainerStatus, RuntimeError, RuntimeResult, StatsSample,
};

/// In-process [`ContainerRuntime`].
///
/// Containers never run anything; tests drive their lifecycle with
/// [`MemoryRuntime::exit`] and queue failures for the next calls.
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    images: BTreeSet<String>,
    unreachable: HashSet<String>,
    containers: BTreeMap<String, MemoryContainer>,
    create_failures: VecDeque<RuntimeError>,
    start_failures: VecDeque<RuntimeError>,
    remove_failures: HashMap<String, VecDeque<RuntimeError>>,
    stats: HashMap<String, Vec<RuntimeResult<StatsSample>>>,
    pulls: Vec<String>,
    start_delay: Option<Duration>,
}

struct MemoryContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemoryRuntime::add_image`].
    pub fn with_image(self, image: &str) -> Self {
        self.add_image(image);
        self
    }

    pub fn add_image(&self, image: &str) {
        self.lock().images.insert(qualified_image(image));
    }

    /// Make pulls of `image` fail with `NotFound`.
    pub fn make_unreachable(&self, image: &str) {
        self.lock().unreachable.insert(qualified_image(image));
    }

    /// Fail the next `times` creates with `err`.
    pub fn fail_creates(&self, times: usize, err: RuntimeError) {
        self.lock().create_failures.extend(std::iter::repeat(err).take(times));
    }

    /// Fail the next `times` starts with `err`.
    pub fn fail_starts(&self, times: usize, err: RuntimeError) {
        self.lock().start_failures.extend(std::iter::repeat(err).take(times));
    }

    /// Hold every start for `delay` before it takes effect. A container that
    /// exits meanwhile stays exited.
    pub fn delay_starts(&self, delay: Duration) {
        self.lock().start_delay = Some(delay);
    }

    /// Fail the next `times` removals of container `id` with `err`.
    pub fn fail_removals(&self, id: &str, times: usize, err: RuntimeError) {
        self.lock()
            .remove_failures
            .entry(id.to_string())
            .or_default()
            .extend(std::iter::repeat(err).take(times));
    }

    /// Items the next stats stream for `id` yields before it times out.
    pub fn push_stats(&self, id: &str, items: Vec<RuntimeResult<StatsSample>>) {
        self.lock().stats.insert(id.to_string(), items);
    }

    /// Mark a container as exited, as if its process finished.
    pub fn exit(&self, id: &str) -> bool {
        match self.lock().containers.get_mut(id) {
            Some(c) => {
                c.status = ContainerStatus::Exited;
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &str) -> Option<ContainerStatus> {
        self.lock().containers.get(id).map(|c| c.status)
    }

    pub fn spec(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).map(|c| c.spec.clone())
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn pulls(&self) -> Vec<String> {
        self.lock().pulls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let tag = qualified_image(image);
        let mut state = self.lock();
        state.pulls.push(image.to_string());
        if state.unreachable.contains(&tag) {
            return Err(RuntimeError::NotFound(format!("manifest for {tag} not found")));
        }
        state.images.insert(tag);
        Ok(())
    }

    async fn image_tags(&self) -> RuntimeResult<Vec<String>> {
        Ok(self.lock().images.iter().cloned().collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut state = self.lock();
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        if !state.images.contains(&qualified_image(&spec.image)) {
            return Err(RuntimeError::NotFound(format!("no such image: {}", spec.image)));
        }
        if !spec.name.is_empty() && state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::Api(format!("name {} already in use", spec.name)));
        }
        state.next_id += 1;
        let id = format!("mem{:08x}", state.next_id);
        state.containers.insert(
            id.clone(),
            MemoryContainer {
                spec: spec.clone(),
                status: ContainerStatus::Created,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let delay = {
            let mut state = self.lock();
            if let Some(err) = state.start_failures.pop_front() {
                return Err(err);
            }
            state.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {id}")))?;
        if container.status != ContainerStatus::Exited {
            container.status = ContainerStatus::Running;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> RuntimeResult<()> {
        match self.lock().containers.get_mut(id) {
            Some(c) => {
                c.status = ContainerStatus::Exited;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("no such container: {id}"))),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.lock();
        if let Some(err) = state.remove_failures.get_mut(id).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {id}")))
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> RuntimeResult<Vec<ContainerInfo>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: Some(c.spec.name.clone()),
                image: c.spec.image.clone(),
                status: c.status,
                labels: c.spec.labels.clone(),
            })
            .filter(|info| filter.matches(info))
            .collect())
    }

    fn stats_stream(&self, id: &str) -> BoxStream<'static, RuntimeResult<StatsSample>> {
        let mut items = self.lock().stats.remove(id).unwrap_or_default();
        items.push(Err(RuntimeError::Timeout(format!("stats for {id}"))));
        stream::iter(items).boxed()
    }
}
