//! Durable per-topic staging area.
//!
//! Entries live at `<master>/<topic>/<sequence>` until a promotion hard-links
//! them into `<containers>/<destination_id>/<sequence>` and removes the master
//! copy. Sequence numbers come from one counter shared by every inbox opened
//! with the same `Arc<AtomicU64>`, seeded from the largest sequence already on
//! disk so numbering survives restarts.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{HopperError, Result};
use crate::{io, paths};

/// Number of fresh sequence numbers tried when another process already wrote
/// the file a sequence maps to.
const ADD_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboxEvent {
    /// A file was added to the topic's master inbox.
    Received,
}

type Handler = Arc<dyn Fn(&str) + Send + Sync>;

/// Outcome of a successful promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    /// One directory per destination id, each holding every promoted file.
    pub destinations: Vec<PathBuf>,
    /// File names moved out of the master inbox.
    pub promoted: Vec<String>,
    /// File names left behind in the master inbox after a per-file failure.
    pub abandoned: Vec<String>,
}

pub struct Inbox {
    master: PathBuf,
    containers: PathBuf,
    counter: Arc<AtomicU64>,
    counts: Mutex<HashMap<String, usize>>,
    handlers: Mutex<HashMap<InboxEvent, Handler>>,
    /// One lock per topic so promotions of a topic in this process run one
    /// at a time.
    promoting: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("master", &self.master)
            .field("containers", &self.containers)
            .field("counter", &self.counter.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Inbox {
    /// Open (creating if needed) an inbox with its own sequence counter.
    pub fn open(master: impl Into<PathBuf>, containers: impl Into<PathBuf>) -> Result<Self> {
        Self::with_counter(master, containers, Arc::new(AtomicU64::new(0)))
    }

    /// Open an inbox drawing sequence numbers from `counter`. The counter is
    /// raised to at least the largest sequence found on disk.
    pub fn with_counter(
        master: impl Into<PathBuf>,
        containers: impl Into<PathBuf>,
        counter: Arc<AtomicU64>,
    ) -> Result<Self> {
        let master = master.into();
        let containers = containers.into();
        io::ensure_dir(&master)?;
        io::ensure_dir(&containers)?;

        let seed = io::max_sequence(&master)?.max(io::max_sequence(&containers)?);
        counter.fetch_max(seed, Ordering::SeqCst);
        debug!(master = %master.display(), seed, "inbox opened");

        Ok(Self {
            master,
            containers,
            counter,
            counts: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            promoting: Mutex::new(HashMap::new()),
        })
    }

    pub fn master_dir(&self) -> &Path {
        &self.master
    }

    pub fn containers_dir(&self) -> &Path {
        &self.containers
    }

    // -----------------------------------------------------------------------
    // Adding
    // -----------------------------------------------------------------------

    /// Store `data` as the next entry of `topic`. Returns its sequence number.
    pub fn add_bytes(&self, topic: &str, data: &[u8]) -> Result<u64> {
        paths::validate_topic(topic)?;
        let seq = self.place(topic, |dest| io::write_new(dest, data))?;
        self.added(topic, seq);
        Ok(seq)
    }

    /// Move the file at `source` into `topic` as its next entry.
    pub fn add_path(&self, topic: &str, source: &Path) -> Result<u64> {
        paths::validate_topic(topic)?;
        if !source.is_file() {
            return Err(HopperError::InboxSourceMissing(source.to_path_buf()));
        }
        let seq = self.place(topic, |dest| io::move_new(source, dest))?;
        self.added(topic, seq);
        Ok(seq)
    }

    fn place<F>(&self, topic: &str, mut write: F) -> Result<u64>
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        io::ensure_dir(&paths::topic_dir(&self.master, topic))?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let dest = paths::entry_path(&self.master, topic, seq);
            match write(&dest) {
                Ok(()) => return Ok(seq),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt < ADD_ATTEMPTS => {
                    debug!(topic, seq, "sequence already taken on disk, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn added(&self, topic: &str, seq: u64) {
        let count = self.refresh_count(topic);
        debug!(topic, seq, count, "file added to inbox");
        self.notify(InboxEvent::Received, topic);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Buffered file names of `topic` in sequence order.
    pub fn list(&self, topic: &str) -> Result<Vec<String>> {
        paths::validate_topic(topic)?;
        let dir = paths::topic_dir(&self.master, topic);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Some(seq) = paths::parse_sequence(name) {
                    found.push((seq, name.to_string()));
                }
            }
        }
        found.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    /// Cached number of buffered files for `topic`. The first call for a topic
    /// counts the directory.
    pub fn count(&self, topic: &str) -> usize {
        if let Some(count) = self.lock_counts().get(topic) {
            return *count;
        }
        self.refresh_count(topic)
    }

    /// Topics that currently have a master inbox directory.
    pub fn topics(&self) -> Result<Vec<String>> {
        let mut topics = Vec::new();
        for entry in std::fs::read_dir(&self.master)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if paths::validate_topic(name).is_ok() {
                    topics.push(name.to_string());
                }
            }
        }
        topics.sort();
        Ok(topics)
    }

    fn refresh_count(&self, topic: &str) -> usize {
        let count = match self.list(topic) {
            Ok(files) => files.len(),
            Err(e) => {
                warn!(topic, error = %e, "failed to count inbox");
                0
            }
        };
        self.lock_counts().insert(topic.to_string(), count);
        count
    }

    // -----------------------------------------------------------------------
    // Promotion
    // -----------------------------------------------------------------------

    /// Move every buffered file of `topic` into one fresh directory per
    /// destination id.
    ///
    /// Each file is hard-linked into every destination and the original is
    /// removed only once its link count shows all links exist. A file that
    /// fails at any step has its links undone and stays in the master inbox.
    /// Returns `None` when nothing was buffered or nothing could be moved.
    ///
    /// Promotions of one topic are serialized within the process. Across
    /// processes a file goes to whichever promotion removes the original;
    /// the others undo their links.
    pub fn promote(&self, topic: &str, destination_ids: &[&str]) -> Result<Option<Promotion>> {
        paths::validate_topic(topic)?;
        if destination_ids.is_empty() {
            return Err(HopperError::InvalidDestination(String::new()));
        }
        let mut ids: Vec<&str> = Vec::with_capacity(destination_ids.len());
        for id in destination_ids {
            paths::validate_destination(id)?;
            if !ids.contains(id) {
                ids.push(id);
            }
        }

        let topic_lock = self.topic_lock(topic);
        let _promoting = topic_lock.lock().unwrap_or_else(|e| e.into_inner());

        let buffered = self.list(topic)?;
        if buffered.is_empty() {
            debug!(topic, "nothing to promote");
            return Ok(None);
        }

        let destinations: Vec<PathBuf> = ids
            .iter()
            .map(|id| paths::destination_dir(&self.containers, id))
            .collect();
        for dir in &destinations {
            io::ensure_dir(dir)?;
        }

        let master_dir = paths::topic_dir(&self.master, topic);
        let mut promoted = Vec::new();
        let mut abandoned = Vec::new();
        for name in buffered {
            match promote_file(&master_dir.join(&name), &name, &destinations) {
                Ok(true) => promoted.push(name),
                Ok(false) => debug!(topic, file = %name, "file taken by a concurrent promotion"),
                Err(e) => {
                    warn!(topic, file = %name, error = %e, "promotion failed; file stays in master inbox");
                    abandoned.push(name);
                }
            }
        }
        self.refresh_count(topic);

        if promoted.is_empty() {
            for dir in &destinations {
                if let Err(e) = std::fs::remove_dir(dir) {
                    debug!(dir = %dir.display(), error = %e, "left unused destination in place");
                }
            }
            return Ok(None);
        }

        debug!(topic, promoted = promoted.len(), abandoned = abandoned.len(), "promotion complete");
        Ok(Some(Promotion {
            destinations,
            promoted,
            abandoned,
        }))
    }

    // -----------------------------------------------------------------------
    // Notification
    // -----------------------------------------------------------------------

    /// Install the handler for `event`, replacing any previous one.
    pub fn subscribe<F>(&self, event: InboxEvent, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.lock_handlers().insert(event, Arc::new(handler));
    }

    fn notify(&self, event: InboxEvent, topic: &str) {
        let handler = self.lock_handlers().get(&event).cloned();
        if let Some(handler) = handler {
            handler(topic);
        }
    }

    fn lock_counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<InboxEvent, Handler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn topic_lock(&self, topic: &str) -> Arc<Mutex<()>> {
        let mut locks = self.promoting.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(topic.to_string()).or_default())
    }
}

/// Link `source` into every destination, then remove it. `Ok(false)` means
/// the source vanished because a concurrent promotion already took it.
fn promote_file(source: &Path, name: &str, destinations: &[PathBuf]) -> std::io::Result<bool> {
    let before = match std::fs::metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut linked = Vec::with_capacity(destinations.len());
    for dir in destinations {
        let target = dir.join(name);
        if let Err(e) = std::fs::hard_link(source, &target) {
            unlink_all(&linked);
            return if e.kind() == ErrorKind::NotFound {
                Ok(false)
            } else {
                Err(e)
            };
        }
        linked.push(target);
    }

    match links_present(source, &before, &linked) {
        Ok(true) => {}
        Ok(false) => {
            unlink_all(&linked);
            return Err(std::io::Error::other("link count did not increase after linking"));
        }
        Err(e) => {
            unlink_all(&linked);
            return if e.kind() == ErrorKind::NotFound {
                Ok(false)
            } else {
                Err(e)
            };
        }
    }

    match std::fs::remove_file(source) {
        Ok(()) => Ok(true),
        Err(e) => {
            unlink_all(&linked);
            if e.kind() == ErrorKind::NotFound {
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

#[cfg(unix)]
fn links_present(
    source: &Path,
    before: &std::fs::Metadata,
    linked: &[PathBuf],
) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let after = std::fs::metadata(source)?;
    Ok(after.nlink() >= before.nlink() + linked.len() as u64)
}

#[cfg(not(unix))]
fn links_present(
    _source: &Path,
    _before: &std::fs::Metadata,
    linked: &[PathBuf],
) -> std::io::Result<bool> {
    Ok(linked.iter().all(|p| p.is_file()))
}

fn unlink_all(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to undo promotion link");
        }
    }
}
