//! Persisted key/value state shared by every module.
//!
//! Values live in memory and are mirrored to a single JSON file. Writes are
//! debounced, never overlap, and always carry the full snapshot so a crash
//! mid-write can't drop keys that were already durable.

use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Notify;

use crate::{
    errors::Error,
    fsutil,
    logging::Logger,
    scheduler::{lock, Scheduler, TimerHandle},
    Result,
};

const COMPONENT: &str = "StateStore";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);

/// Physical write sink for snapshots.
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// Writes snapshots with temp file + rename.
pub struct FsSnapshotWriter;

#[async_trait]
impl SnapshotWriter for FsSnapshotWriter {
    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        fsutil::write_atomic(path, bytes).await
    }
}

#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Window in which repeated `set()` calls coalesce into one write.
    pub debounce: Duration,
    /// Delays between attempts when the file is busy; its length is the retry count.
    pub retry_backoff: Vec<Duration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            retry_backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(500),
            ],
        }
    }
}

#[derive(Default)]
struct StoreState {
    entries: BTreeMap<String, Value>,
    dirty: HashSet<String>,
    timer: Option<TimerHandle>,
    writing: bool,
    pending: bool,
    loaded: bool,
    writes: u64,
}

struct Snapshot {
    keys: HashSet<String>,
    entries: BTreeMap<String, Value>,
}

impl StoreState {
    fn take_snapshot(&mut self) -> Option<Snapshot> {
        if self.dirty.is_empty() {
            return None;
        }
        Some(Snapshot {
            keys: std::mem::take(&mut self.dirty),
            entries: self.entries.clone(),
        })
    }
}

struct StoreInner {
    path: PathBuf,
    opts: StoreOptions,
    scheduler: Arc<dyn Scheduler>,
    writer: Arc<dyn SnapshotWriter>,
    logger: Logger,
    state: Mutex<StoreState>,
    idle: Notify,
    load_lock: tokio::sync::Mutex<()>,
}

/// In-memory key/value cache backed by one JSON file.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, scheduler: Arc<dyn Scheduler>, logger: Logger) -> Self {
        Self::with_parts(
            path,
            StoreOptions::default(),
            scheduler,
            Arc::new(FsSnapshotWriter),
            logger,
        )
    }

    pub fn with_parts(
        path: impl Into<PathBuf>,
        opts: StoreOptions,
        scheduler: Arc<dyn Scheduler>,
        writer: Arc<dyn SnapshotWriter>,
        logger: Logger,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path: path.into(),
                opts,
                scheduler,
                writer,
                logger,
                state: Mutex::new(StoreState::default()),
                idle: Notify::new(),
                load_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Read the backing file into memory. Only the first call does any I/O.
    ///
    /// A missing file leaves the store empty. Keys changed in memory before
    /// `load()` keep their in-memory value.
    pub async fn load(&self) -> Result<()> {
        let _guard = self.inner.load_lock.lock().await;
        if lock(&self.inner.state).loaded {
            return Ok(());
        }

        let raw = fsutil::read_if_exists(&self.inner.path).await?;
        let data: BTreeMap<String, Value> = match raw {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)?,
            _ => BTreeMap::new(),
        };

        let loaded = {
            let mut st = lock(&self.inner.state);
            let mut n = 0usize;
            for (k, v) in data {
                if st.dirty.contains(&k) {
                    continue;
                }
                st.entries.insert(k, v);
                n += 1;
            }
            st.loaded = true;
            n
        };

        self.inner.logger.info(
            COMPONENT,
            format!("Loaded {loaded} keys from {}", self.inner.path.display()),
        );
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.inner.state).loaded
    }

    /// Current in-memory value. Never touches disk.
    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.inner.state).entries.get(key).cloned()
    }

    /// Typed view of [`StateStore::get`].
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    /// Update memory, mark `key` dirty and schedule a debounced persist.
    ///
    /// Returns immediately; persistence failures are logged, never returned.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut st = lock(&self.inner.state);
        st.entries.insert(key.clone(), value);
        StoreInner::touch(&self.inner, &mut st, key);
    }

    pub fn set_as<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    /// Drop `key`; the removal is persisted like any other change.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut st = lock(&self.inner.state);
        let old = st.entries.remove(key);
        if old.is_some() {
            StoreInner::touch(&self.inner, &mut st, key.to_string());
        }
        old
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.inner.state).entries.keys().cloned().collect()
    }

    /// Keys changed in memory but not yet covered by a successful write.
    pub fn dirty_len(&self) -> usize {
        lock(&self.inner.state).dirty.len()
    }

    /// Number of successful physical writes since construction.
    pub fn write_count(&self) -> u64 {
        lock(&self.inner.state).writes
    }

    /// Cancel the debounce timer and write the current snapshot now.
    ///
    /// Waits for an in-flight write first. Returns the outcome of the last
    /// physical write this call performed.
    pub async fn flush(&self) -> Result<()> {
        let snap = loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = lock(&self.inner.state);
                if let Some(h) = st.timer.take() {
                    self.inner.scheduler.cancel(h);
                }
                if !st.writing {
                    match st.take_snapshot() {
                        Some(s) => {
                            st.writing = true;
                            break s;
                        }
                        None => return Ok(()),
                    }
                }
            }

            notified.await;
        };

        self.inner.run_writes(snap).await
    }
}

impl StoreInner {
    fn touch(this: &Arc<Self>, st: &mut StoreState, key: String) {
        st.dirty.insert(key);
        if st.writing {
            st.pending = true;
            return;
        }
        if st.timer.is_none() {
            let inner = this.clone();
            let handle = this.scheduler.schedule_once(
                this.opts.debounce,
                Box::pin(async move { inner.on_timer().await }),
            );
            st.timer = Some(handle);
        }
    }

    async fn on_timer(self: Arc<Self>) {
        let snap = {
            let mut st = lock(&self.state);
            st.timer = None;
            if st.writing {
                st.pending = true;
                return;
            }
            let snap = st.take_snapshot();
            if snap.is_some() {
                st.writing = true;
            }
            snap
        };

        if let Some(snap) = snap {
            // Failures are already logged by run_writes.
            let _ = self.run_writes(snap).await;
        }
    }

    /// Write `first`, then keep writing while requests were deferred during a flight.
    ///
    /// Caller must have set `writing` before calling.
    async fn run_writes(&self, first: Snapshot) -> Result<()> {
        let mut next = Some(first);
        let mut last = Ok(());

        while let Some(snap) = next.take() {
            let result = self.write_snapshot(&snap).await;

            let mut st = lock(&self.state);
            match &result {
                Ok(()) => st.writes += 1,
                Err(e) => {
                    self.logger.error(
                        COMPONENT,
                        format!(
                            "Failed to write {}: {e}; {} keys stay dirty",
                            self.path.display(),
                            snap.keys.len()
                        ),
                    );
                    st.dirty.extend(snap.keys);
                }
            }
            last = result;

            if st.pending {
                st.pending = false;
                next = st.take_snapshot();
            }
            if next.is_none() {
                st.writing = false;
            }
        }

        self.idle.notify_waiters();
        last
    }

    async fn write_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&snap.entries)?;
        let retries = self.opts.retry_backoff.len();
        let mut attempt = 0usize;

        loop {
            let err: Error = match self.writer.write(&self.path, &bytes).await {
                Ok(()) => return Ok(()),
                Err(e) => e.into(),
            };
            if !err.is_resource_busy() || attempt >= retries {
                return Err(err);
            }

            let delay = self.opts.retry_backoff[attempt];
            attempt += 1;
            self.logger.warn(
                COMPONENT,
                format!("State file busy, retry {attempt}/{retries} in {delay:?}"),
            );
            self.scheduler.sleep(delay).await;
        }
    }
}
