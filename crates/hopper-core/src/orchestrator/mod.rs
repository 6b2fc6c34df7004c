//! Batch orchestrator.
//!
//! Decides when a topic's buffered files become a batch and launches one
//! container per registration of the topic on it. Two things fire a batch:
//!
//! - a `Received` notification that finds the inbox at or above a
//!   registration's threshold;
//! - a tick that finds an armed timeout has elapsed.
//!
//! Every batch promotes the whole topic into one fresh directory that all of
//! the topic's registrations mount, so firing clears every armed timeout of
//! the topic. Run durations and per-sample CPU/memory usage go to the store.

mod pending;
mod usage;

pub use pending::{PendingTable, TriggerKey};
pub use usage::{cpu_utilization, memory_utilization, CpuCounters, UsageTracker};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{ContainerAgent, StartRequest};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::inbox::{Inbox, InboxEvent};
use crate::runtime::StatsSample;
use crate::store::{Metric, Registration, RunEvent, Store, CPU_METRIC, MEMORY_METRIC};

const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub tick_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for OrchestratorOptions {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
        }
    }
}

/// Start metadata of a container launched for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStart {
    pub topic: String,
    pub image: String,
    pub started_at: DateTime<Utc>,
}

pub struct Orchestrator {
    inbox: Arc<Inbox>,
    agent: Arc<ContainerAgent>,
    store: Arc<dyn Store>,
    options: OrchestratorOptions,
    pending: Mutex<PendingTable>,
    usage: Mutex<UsageTracker>,
    runs: Mutex<HashMap<String, RunStart>>,
    received: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Orchestrator {
    /// Build the orchestrator and subscribe it to the inbox's `Received`
    /// notifications. Nothing is acted on until [`Orchestrator::spawn`].
    pub fn new(
        inbox: Arc<Inbox>,
        agent: Arc<ContainerAgent>,
        store: Arc<dyn Store>,
        options: OrchestratorOptions,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        inbox.subscribe(InboxEvent::Received, move |topic: &str| {
            if tx.send(topic.to_string()).is_err() {
                debug!(topic, "orchestrator gone; dropping notification");
            }
        });
        Arc::new(Self {
            inbox,
            agent,
            store,
            options,
            pending: Mutex::new(PendingTable::default()),
            usage: Mutex::new(UsageTracker::default()),
            runs: Mutex::new(HashMap::new()),
            received: Mutex::new(Some(rx)),
        })
    }

    /// Run the decision loop until `shutdown` changes. Topics that still hold
    /// files from before the start are evaluated first.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut received) = lock(&self.received).take() else {
            warn!("orchestrator loop already running");
            return;
        };

        self.recover().await;

        let mut ticker = tokio::time::interval(self.options.tick_interval.max(MIN_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(topic) = received.recv() => {
                    if let Err(e) = self.handle_received(&topic).await {
                        warn!(topic = %topic, error = %e, "failed to evaluate topic");
                    }
                }
                _ = ticker.tick() => self.fire_due(Instant::now()),
                _ = shutdown.changed() => break,
            }
        }
        info!("orchestrator stopped");
    }

    async fn recover(self: &Arc<Self>) {
        let inbox = Arc::clone(&self.inbox);
        let topics = match tokio::task::spawn_blocking(move || inbox.topics()).await {
            Ok(Ok(topics)) => topics,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to scan master inbox");
                return;
            }
            Err(e) => {
                warn!(error = %e, "master inbox scan panicked");
                return;
            }
        };
        for topic in topics {
            if self.inbox.count(&topic) == 0 {
                continue;
            }
            info!(topic = %topic, "re-evaluating files buffered before start");
            if let Err(e) = self.handle_received(&topic).await {
                warn!(topic = %topic, error = %e, "failed to evaluate topic");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// React to new files in `topic`: fire registrations whose threshold is
    /// met, arm the timeout of the others.
    pub async fn handle_received(self: &Arc<Self>, topic: &str) -> Result<()> {
        let count = self.inbox.count(topic);
        if count == 0 {
            debug!(topic, "inbox empty; nothing to decide");
            return Ok(());
        }

        let registrations = self.registrations_for(topic).await?;
        if registrations.is_empty() {
            info!(topic, count, "no registrations for topic; files stay buffered");
            return Ok(());
        }

        let now = Instant::now();
        for registration in registrations {
            let policy = registration.policy();
            let key = TriggerKey::new(topic, &registration.container);
            if count >= policy.threshold {
                info!(topic, image = %registration.container, count, threshold = policy.threshold, "threshold reached");
                self.trigger(key);
            } else if let Some(timeout) = policy.timeout {
                let Some(deadline) = now.checked_add(timeout) else {
                    warn!(topic, image = %registration.container, ?timeout, "timeout out of range; waiting for threshold only");
                    continue;
                };
                if self.lock_pending().arm(key, deadline) {
                    debug!(topic, image = %registration.container, ?timeout, "timeout armed");
                }
            }
        }
        Ok(())
    }

    /// Fire every armed timeout due at `now`.
    pub fn fire_due(self: &Arc<Self>, now: Instant) {
        let due = self.lock_pending().take_due(now);
        for key in due {
            info!(topic = %key.topic, image = %key.image, "timeout elapsed");
            self.trigger(key);
        }
    }

    fn trigger(self: &Arc<Self>, key: TriggerKey) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.process(&key.topic, &key.image).await {
                error!(topic = %key.topic, image = %key.image, error = %e, "batch failed");
            }
        });
    }

    /// Whether a timeout is armed for `(topic, image)`.
    pub fn is_pending(&self, topic: &str, image: &str) -> bool {
        self.lock_pending().fire_at(&TriggerKey::new(topic, image)).is_some()
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Promote everything buffered for `topic` and start a container per
    /// registration on it. Returns the started container ids; empty when the
    /// topic had no registrations or nothing left to promote.
    pub async fn process(self: &Arc<Self>, topic: &str, image: &str) -> Result<Vec<String>> {
        let cleared = self.lock_pending().clear_topic(topic);
        debug!(topic, trigger = image, cleared, "processing batch");

        let registrations = self.registrations_for(topic).await?;
        if registrations.is_empty() {
            info!(topic, "registrations removed before batch ran; files stay buffered");
            return Ok(Vec::new());
        }

        let inbox = Arc::clone(&self.inbox);
        let owned_topic = topic.to_string();
        let destination = Uuid::new_v4().to_string();
        let promotion = tokio::task::spawn_blocking(move || {
            inbox.promote(&owned_topic, &[destination.as_str()])
        })
        .await??;

        let Some(promotion) = promotion else {
            info!(topic, trigger = image, "inbox already drained; nothing to process");
            return Ok(Vec::new());
        };
        if !promotion.abandoned.is_empty() {
            warn!(topic, abandoned = promotion.abandoned.len(), "some files could not be promoted");
        }
        info!(topic, files = promotion.promoted.len(), "batch promoted");

        let mut started = Vec::new();
        for directory in &promotion.destinations {
            for registration in &registrations {
                match self.launch(topic, registration, directory).await {
                    Ok(id) => started.push(id),
                    Err(e) => {
                        error!(topic, image = %registration.container, error = %e, "failed to launch container")
                    }
                }
            }
        }
        Ok(started)
    }

    async fn launch(self: &Arc<Self>, topic: &str, registration: &Registration, directory: &Path) -> Result<String> {
        let image = registration.container.clone();
        if let Err(e) = self.agent.pull(&image).await {
            warn!(image = %image, error = %e, "pull failed; trying the local image");
        }

        let run = RunStart {
            topic: topic.to_string(),
            image: image.clone(),
            started_at: Utc::now(),
        };

        // Set before the exit is handled; checked under the `runs` lock.
        let terminated = Arc::new(AtomicBool::new(false));
        let weak: Weak<Self> = Arc::downgrade(self);
        let finished = run.clone();
        let exit_seen = Arc::clone(&terminated);
        let request = StartRequest::new(&image, directory)
            .topic(topic)
            .privileged(registration.privileged)
            .on_terminate(move |id| {
                if let Some(orchestrator) = weak.upgrade() {
                    exit_seen.store(true, Ordering::SeqCst);
                    orchestrator.finish_run(id, Some(finished));
                }
            });

        let id = self.agent.start(request).await?;
        {
            let mut runs = lock(&self.runs);
            if terminated.load(Ordering::SeqCst) {
                debug!(container = %id, topic, "container exited before start returned");
                return Ok(id);
            }
            runs.insert(id.clone(), run);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        self.agent.stats(
            &id,
            topic,
            &image,
            Arc::new(move |sample: &StatsSample, id: &str, topic: &str, label: &str| {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.record_sample(sample, id, topic, label);
                }
            }),
        );
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Completion and usage
    // -----------------------------------------------------------------------

    /// Record the run of `container_id` as finished now and drop its state.
    /// Containers this orchestrator did not start are ignored.
    pub fn cleanup(&self, container_id: &str) {
        self.finish_run(container_id, None);
    }

    fn finish_run(&self, container_id: &str, captured: Option<RunStart>) {
        let known = lock(&self.runs).remove(container_id);
        lock(&self.usage).forget(container_id);
        let Some(run) = known.or(captured) else {
            debug!(container = %container_id, "no run metadata; skipping event");
            return;
        };

        let duration = Utc::now().signed_duration_since(run.started_at);
        let event = RunEvent {
            topic: run.topic.clone(),
            container: run.image.clone(),
            timestamp: run.started_at.timestamp_millis(),
            duration_ms: duration.num_milliseconds().max(0),
        };
        match self.store.record_event(&event) {
            Ok(()) => info!(container = %container_id, topic = %run.topic, duration_ms = event.duration_ms, "run finished"),
            Err(e) => error!(container = %container_id, error = %e, "failed to record run event"),
        }
    }

    /// Persist CPU and memory usage from one sample. Failures are logged and
    /// the sample dropped.
    pub fn record_sample(&self, sample: &StatsSample, container_id: &str, topic: &str, label: &str) {
        if let Err(e) = self.persist_sample(sample, container_id, topic, label) {
            warn!(container = %container_id, error = %e, "dropping stats sample");
        }
    }

    fn persist_sample(&self, sample: &StatsSample, container_id: &str, topic: &str, label: &str) -> Result<()> {
        let timestamp = sample.read_at.timestamp_millis();
        let metric = |name: &str, value: f64| Metric {
            topic: topic.to_string(),
            container: label.to_string(),
            timestamp,
            name: name.to_string(),
            value,
        };

        if let Some(system) = sample.cpu_system {
            let counters = CpuCounters {
                total: sample.cpu_total,
                system,
            };
            let cpu = lock(&self.usage).observe(container_id, counters);
            if let Some(cpu) = cpu {
                self.store.record_metric(&metric(CPU_METRIC, cpu))?;
            }
        }

        let memory = memory_utilization(sample.memory_usage, sample.memory_limit);
        self.store.record_metric(&metric(MEMORY_METRIC, memory))?;
        Ok(())
    }

    /// Containers started by this orchestrator that have not finished yet.
    pub fn active_runs(&self) -> HashMap<String, RunStart> {
        lock(&self.runs).clone()
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn registrations_for(&self, topic: &str) -> Result<Vec<Registration>> {
        let store = Arc::clone(&self.store);
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || store.registrations_for_topic(&topic)).await?
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingTable> {
        lock(&self.pending)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOptions;
    use crate::runtime::memory::MemoryRuntime;
    use crate::runtime::{ContainerRuntime, ContainerStatus};
    use crate::store::{NewRegistration, SqliteStore};
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        inbox: Arc<Inbox>,
        runtime: Arc<MemoryRuntime>,
        agent: Arc<ContainerAgent>,
        store: Arc<SqliteStore>,
        orchestrator: Arc<Orchestrator>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let inbox = Arc::new(Inbox::open(dir.path().join("master"), dir.path().join("containers")).unwrap());
        let runtime = Arc::new(MemoryRuntime::new().with_image("busybox"));
        let agent = Arc::new(ContainerAgent::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            AgentOptions {
                retry_delay: Duration::from_millis(1),
                monitor_interval: Duration::from_millis(20),
                removal_interval: Duration::from_millis(20),
                ..AgentOptions::default()
            },
        ));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orchestrator = Orchestrator::new(
            Arc::clone(&inbox),
            Arc::clone(&agent),
            Arc::clone(&store) as Arc<dyn Store>,
            OrchestratorOptions {
                tick_interval: Duration::from_millis(50),
            },
        );
        Harness {
            _dir: dir,
            inbox,
            runtime,
            agent,
            store,
            orchestrator,
        }
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn sample(total: u64, system: u64) -> StatsSample {
        StatsSample {
            read_at: Utc::now(),
            cpu_total: total,
            cpu_system: Some(system),
            memory_usage: Some(512),
            memory_limit: Some(1024),
        }
    }

    #[tokio::test]
    async fn threshold_fires_immediately() {
        let h = harness();
        h.store
            .create_registration(&NewRegistration::new("T1", "busybox").threshold(1).timeout(15))
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let loop_handle = h.orchestrator.spawn(rx);

        h.inbox.add_bytes("T1", b"This is some data").unwrap();
        wait_until("inbox drained", || h.inbox.list("T1").unwrap().is_empty()).await;
        wait_until("container started", || h.runtime.container_ids().len() == 1).await;

        let ids = h.runtime.container_ids();
        let spec = h.runtime.spec(&ids[0]).unwrap();
        let files: Vec<_> = std::fs::read_dir(&spec.mount_source).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        assert_eq!(std::fs::read(path).unwrap(), b"This is some data");
        assert_eq!(spec.labels.get("hopper.topic").map(String::as_str), Some("T1"));
        assert!(!h.orchestrator.is_pending("T1", "busybox"));

        tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn below_threshold_waits_for_timeout() {
        let h = harness();
        h.store
            .create_registration(&NewRegistration::new("T2", "busybox").threshold(100).timeout(1))
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let loop_handle = h.orchestrator.spawn(rx);

        h.inbox.add_bytes("T2", b"x").unwrap();
        wait_until("timeout armed", || h.orchestrator.is_pending("T2", "busybox")).await;
        assert_eq!(h.inbox.count("T2"), 1);
        assert!(h.runtime.container_ids().is_empty());

        wait_until("inbox drained", || h.inbox.count("T2") == 0).await;
        wait_until("container started", || h.runtime.container_ids().len() == 1).await;
        assert!(!h.orchestrator.is_pending("T2", "busybox"));

        tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_topic_keeps_files() {
        let h = harness();
        h.inbox.add_bytes("orphan", b"x").unwrap();
        h.orchestrator.handle_received("orphan").await.unwrap();
        assert_eq!(h.inbox.count("orphan"), 1);
        assert!(h.orchestrator.process("orphan", "busybox").await.unwrap().is_empty());
        assert_eq!(h.inbox.count("orphan"), 1);
    }

    #[tokio::test]
    async fn first_arm_is_not_extended() {
        let h = harness();
        h.store
            .create_registration(&NewRegistration::new("T2", "busybox").threshold(10).timeout(60))
            .unwrap();
        h.inbox.add_bytes("T2", b"a").unwrap();
        h.orchestrator.handle_received("T2").await.unwrap();
        let key = TriggerKey::new("T2", "busybox");
        let first = h.orchestrator.lock_pending().fire_at(&key).unwrap();

        h.inbox.add_bytes("T2", b"b").unwrap();
        h.orchestrator.handle_received("T2").await.unwrap();
        assert_eq!(h.orchestrator.lock_pending().fire_at(&key), Some(first));

        // not due yet
        h.orchestrator.fire_due(Instant::now());
        assert!(h.orchestrator.is_pending("T2", "busybox"));
    }

    #[tokio::test]
    async fn no_timeout_means_no_arm() {
        let h = harness();
        h.store
            .create_registration(&NewRegistration::new("T3", "busybox").threshold(5))
            .unwrap();
        h.inbox.add_bytes("T3", b"a").unwrap();
        h.orchestrator.handle_received("T3").await.unwrap();
        assert!(!h.orchestrator.is_pending("T3", "busybox"));
        assert_eq!(h.inbox.count("T3"), 1);
    }

    #[tokio::test]
    async fn process_serves_every_registration_from_one_directory() {
        let h = harness();
        h.runtime.add_image("word-count");
        h.store.create_registration(&NewRegistration::new("T1", "busybox").threshold(50).timeout(60)).unwrap();
        h.store.create_registration(&NewRegistration::new("T1", "word-count").threshold(50).timeout(60)).unwrap();
        h.inbox.add_bytes("T1", b"a").unwrap();
        h.inbox.add_bytes("T1", b"b").unwrap();
        h.orchestrator.handle_received("T1").await.unwrap();
        assert!(h.orchestrator.is_pending("T1", "word-count"));

        let started = h.orchestrator.process("T1", "busybox").await.unwrap();
        assert_eq!(started.len(), 2);
        assert!(!h.orchestrator.is_pending("T1", "word-count"));

        let mounts: Vec<_> = started
            .iter()
            .map(|id| h.runtime.spec(id).unwrap().mount_source)
            .collect();
        assert_eq!(mounts[0], mounts[1]);
        assert_eq!(std::fs::read_dir(&mounts[0]).unwrap().count(), 2);
        assert_eq!(h.orchestrator.active_runs().len(), 2);

        assert!(h.orchestrator.process("T1", "word-count").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_start_does_not_stop_other_registrations() {
        let h = harness();
        h.runtime.make_unreachable("ghost");
        h.store.create_registration(&NewRegistration::new("T1", "ghost")).unwrap();
        h.store.create_registration(&NewRegistration::new("T1", "busybox")).unwrap();
        h.inbox.add_bytes("T1", b"a").unwrap();

        let started = h.orchestrator.process("T1", "busybox").await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(h.runtime.spec(&started[0]).unwrap().image, "busybox");
    }

    #[tokio::test]
    async fn exit_records_run_event() {
        let h = harness();
        h.store.create_registration(&NewRegistration::new("T1", "busybox")).unwrap();
        h.inbox.add_bytes("T1", b"a").unwrap();
        let started = h.orchestrator.process("T1", "busybox").await.unwrap();
        let id = started[0].clone();

        h.orchestrator.record_sample(&sample(100, 1000), &id, "T1", "busybox");
        h.runtime.exit(&id);
        assert_eq!(h.agent.observe_exits().await.unwrap(), 1);

        assert!(h.orchestrator.active_runs().is_empty());
        assert_eq!(lock(&h.orchestrator.usage).tracked(), 0);
        assert!(h.store.average_duration("T1", "busybox").unwrap().is_some());
        let since = Utc::now().timestamp_millis() - 86_400_000;
        assert_eq!(h.store.events_per_day("T1", "busybox", since).unwrap().values().sum::<u64>(), 1);

        // a second cleanup for the same container records nothing
        h.orchestrator.cleanup(&id);
        assert_eq!(h.store.events_per_day("T1", "busybox", since).unwrap().values().sum::<u64>(), 1);
        assert_eq!(h.runtime.status(&id), Some(ContainerStatus::Exited));
    }

    #[tokio::test]
    async fn exit_before_start_returns_leaves_no_run() {
        let h = harness();
        h.store.create_registration(&NewRegistration::new("T1", "busybox")).unwrap();
        h.inbox.add_bytes("T1", b"a").unwrap();
        h.runtime.delay_starts(Duration::from_millis(200));

        let orchestrator = Arc::clone(&h.orchestrator);
        let batch = tokio::spawn(async move { orchestrator.process("T1", "busybox").await });
        wait_until("container created", || h.runtime.container_ids().len() == 1).await;
        let id = h.runtime.container_ids()[0].clone();
        h.runtime.exit(&id);
        assert_eq!(h.agent.observe_exits().await.unwrap(), 1);

        let started = batch.await.unwrap().unwrap();
        assert_eq!(started, vec![id.clone()]);
        assert!(h.orchestrator.active_runs().is_empty());
        assert_eq!(lock(&h.orchestrator.usage).tracked(), 0);
        let since = Utc::now().timestamp_millis() - 86_400_000;
        assert_eq!(h.store.events_per_day("T1", "busybox", since).unwrap().values().sum::<u64>(), 1);
        assert_eq!(h.runtime.status(&id), Some(ContainerStatus::Exited));
    }

    #[tokio::test]
    async fn out_of_range_timeout_is_not_armed() {
        let h = harness();
        h.store
            .create_registration(&NewRegistration::new("T2", "busybox").threshold(100).timeout(u64::MAX))
            .unwrap();
        h.inbox.add_bytes("T2", b"x").unwrap();
        h.orchestrator.handle_received("T2").await.unwrap();
        assert!(!h.orchestrator.is_pending("T2", "busybox"));
        assert_eq!(h.inbox.count("T2"), 1);
    }

    #[tokio::test]
    async fn loop_survives_out_of_range_timeout() {
        let h = harness();
        h.store
            .create_registration(&NewRegistration::new("T2", "busybox").threshold(100).timeout(u64::MAX))
            .unwrap();
        h.store.create_registration(&NewRegistration::new("T1", "busybox").threshold(1)).unwrap();
        let (tx, rx) = watch::channel(false);
        let loop_handle = h.orchestrator.spawn(rx);

        h.inbox.add_bytes("T2", b"x").unwrap();
        h.inbox.add_bytes("T1", b"y").unwrap();
        wait_until("T1 drained", || h.inbox.count("T1") == 0).await;
        wait_until("container started", || h.runtime.container_ids().len() == 1).await;
        assert_eq!(h.inbox.count("T2"), 1);
        assert!(!loop_handle.is_finished());

        tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn one_file_crossing_two_thresholds_runs_one_batch() {
        let h = harness();
        h.runtime.add_image("word-count");
        h.store.create_registration(&NewRegistration::new("T1", "busybox").threshold(1)).unwrap();
        h.store.create_registration(&NewRegistration::new("T1", "word-count").threshold(1)).unwrap();
        let (tx, rx) = watch::channel(false);
        let loop_handle = h.orchestrator.spawn(rx);

        h.inbox.add_bytes("T1", b"only").unwrap();
        wait_until("both containers started", || h.runtime.container_ids().len() == 2).await;
        // the second trigger finds the inbox drained
        tokio::time::sleep(Duration::from_millis(200)).await;

        let ids = h.runtime.container_ids();
        assert_eq!(ids.len(), 2);
        let mounts: Vec<_> = ids.iter().map(|id| h.runtime.spec(id).unwrap().mount_source).collect();
        assert_eq!(mounts[0], mounts[1]);
        assert_eq!(std::fs::read_dir(&mounts[0]).unwrap().count(), 1);
        assert_eq!(std::fs::read_dir(h.inbox.containers_dir()).unwrap().count(), 1);
        assert_eq!(h.inbox.count("T1"), 0);

        tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn samples_become_cpu_and_memory_metrics() {
        let h = harness();
        h.orchestrator.record_sample(&sample(100, 1000), "c1", "T1", "busybox");
        let memory = h.store.recent_metrics("T1", "busybox", MEMORY_METRIC, 10).unwrap();
        assert_eq!(memory.len(), 1);
        assert_eq!(memory[0].value, 0.5);
        assert!(h.store.recent_metrics("T1", "busybox", CPU_METRIC, 10).unwrap().is_empty());

        h.orchestrator.record_sample(&sample(200, 1400), "c1", "T1", "busybox");
        h.orchestrator.record_sample(&sample(50, 1800), "c1", "T1", "busybox");
        let cpu: Vec<f64> = h
            .store
            .recent_metrics("T1", "busybox", CPU_METRIC, 10)
            .unwrap()
            .iter()
            .map(|m| m.value)
            .collect();
        assert_eq!(cpu, vec![0.25, 0.0]);
    }

    #[tokio::test]
    async fn files_buffered_before_start_are_recovered() {
        let h = harness();
        h.store.create_registration(&NewRegistration::new("T1", "busybox")).unwrap();
        // written by another process: no notification reaches this orchestrator
        let other = Inbox::open(h.inbox.master_dir(), h.inbox.containers_dir()).unwrap();
        other.add_bytes("T1", b"left over").unwrap();

        let (tx, rx) = watch::channel(false);
        let loop_handle = h.orchestrator.spawn(rx);
        wait_until("inbox drained", || h.inbox.list("T1").unwrap().is_empty()).await;
        wait_until("container started", || h.runtime.container_ids().len() == 1).await;

        tx.send(true).unwrap();
        loop_handle.await.unwrap();
    }
}
