//! Per-feature batch storage partitioned by tracking consent.
//!
//! Each feature owns three directories under its root: `granted/` holds
//! batches awaiting upload, `pending/` holds batches written before the user
//! decided, and `unauthorized/` is a transient partition cleared at startup.
//! All file mutation is serialized through the shared read/write lane.

use crate::batch::{self, Batch, BatchId};
use crate::bus::Telemetry;
use crate::config::PerformancePreset;
use crate::error::BoxError;
use crate::lane::{QuiescenceBarrier, SerialLane};
use crate::platform::DateProvider;
use crate::types::TrackingConsent;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;

/// Symmetric encryption-at-rest adapter. When installed, every event payload
/// is encrypted before the disk write and decrypted on read; length prefixes
/// cover the ciphertext.
///
/// Both functions must be pure. A failure drops the write or, on read,
/// condemns the whole batch.
pub trait DataEncryption: Send + Sync + 'static {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, BoxError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BoxError>;
}

/// What to do with a batch handed out by the reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BatchResolution {
    /// Uploaded or unrecoverable: remove from disk.
    Delete,
    /// Retryable failure: leave on disk for a later tick.
    Keep,
}

struct OpenFile {
    id: BatchId,
    size: u64,
    objects: usize,
}

#[derive(Default)]
struct StorageState {
    /// At most one open file per consent value.
    open: HashMap<TrackingConsent, OpenFile>,
    /// Batches handed to the reader and not yet confirmed.
    in_flight: HashSet<BatchId>,
}

struct Shared {
    feature: String,
    granted: PathBuf,
    pending: PathBuf,
    unauthorized: PathBuf,
    preset: PerformancePreset,
    encryption: Option<Arc<dyn DataEncryption>>,
    date: Arc<dyn DateProvider>,
    telemetry: Telemetry,
    /// Touched only from read/write lane jobs, except the flag below.
    state: Mutex<StorageState>,
    ignore_file_age_for_read: AtomicBool,
}

/// Batch-file manager for one feature.
pub(crate) struct Storage {
    lane: SerialLane<()>,
    shared: Arc<Shared>,
}

impl Storage {
    /// Create the consent partition directories under `root` (the feature's
    /// versioned directory).
    pub fn new(
        feature: impl Into<String>,
        root: &Path,
        preset: PerformancePreset,
        encryption: Option<Arc<dyn DataEncryption>>,
        date: Arc<dyn DateProvider>,
        telemetry: Telemetry,
        lane: SerialLane<()>,
    ) -> io::Result<Self> {
        let granted = root.join(TrackingConsent::Granted.directory());
        let pending = root.join(TrackingConsent::Pending.directory());
        let unauthorized = root.join(TrackingConsent::NotGranted.directory());
        fs::create_dir_all(&granted)?;
        fs::create_dir_all(&pending)?;
        fs::create_dir_all(&unauthorized)?;

        Ok(Self {
            lane,
            shared: Arc::new(Shared {
                feature: feature.into(),
                granted,
                pending,
                unauthorized,
                preset,
                encryption,
                date,
                telemetry,
                state: Mutex::new(StorageState::default()),
                ignore_file_age_for_read: AtomicBool::new(false),
            }),
        })
    }

    /// Obtain a writer bound to `consent`. Writes under `NotGranted` are
    /// silently dropped. `force_new_batch` closes the current open file on
    /// the first write.
    pub fn writer(&self, consent: TrackingConsent, force_new_batch: bool) -> EventWriter {
        let inner = (consent != TrackingConsent::NotGranted).then(|| WriterInner {
            lane: self.lane.clone(),
            shared: self.shared.clone(),
            consent,
            force_new: AtomicBool::new(force_new_batch),
        });
        EventWriter { inner }
    }

    /// The oldest uploadable batch, if any. Hands out each batch at most once
    /// until it is confirmed.
    pub async fn next_batch(&self) -> Option<Batch> {
        let shared = self.shared.clone();
        let (tx, rx) = oneshot::channel();
        self.lane.post(move |_| {
            let _ = tx.send(shared.next_batch());
        });
        rx.await.ok().flatten()
    }

    /// Resolve a batch previously handed out by [`next_batch`](Self::next_batch).
    pub fn confirm(&self, id: BatchId, resolution: BatchResolution) {
        let shared = self.shared.clone();
        self.lane.post(move |_| shared.confirm(id, resolution));
    }

    /// Move `pending/` batches to their post-decision destination: `granted/`
    /// when consent was granted, deletion when it was denied.
    pub fn migrate_unauthorized(&self, to: TrackingConsent) {
        let shared = self.shared.clone();
        self.lane.post(move |_| shared.migrate_unauthorized(to));
    }

    /// Remove every batch across all consent partitions.
    pub fn clear_all_data(&self) {
        let shared = self.shared.clone();
        self.lane.post(move |_| shared.clear_all_data());
    }

    /// Startup cleanup: drop `pending/` batches from a previous run (the
    /// consent decision they awaited is gone) and stale transient files.
    pub fn clear_unauthorized_data(&self) {
        let shared = self.shared.clone();
        self.lane.post(move |_| shared.clear_unauthorized_data());
    }

    /// Used by the synchronous flush to drain batches regardless of age.
    pub fn set_ignore_file_age_for_read(&self, ignore: bool) {
        self.shared
            .ignore_file_age_for_read
            .store(ignore, Ordering::SeqCst);
    }

    pub fn barrier(&self) -> QuiescenceBarrier {
        self.lane.barrier()
    }
}

/// Appends events to the batch selected by the writer's consent.
///
/// Obtained through a feature's write scope; each append is serialized on the
/// shared read/write lane.
pub struct EventWriter {
    inner: Option<WriterInner>,
}

struct WriterInner {
    lane: SerialLane<()>,
    shared: Arc<Shared>,
    consent: TrackingConsent,
    force_new: AtomicBool,
}

impl EventWriter {
    /// Append one event. Accepted immediately; the disk write happens on the
    /// read/write lane. Oversize events and encryption failures are dropped
    /// with telemetry.
    pub fn write(&self, event: impl Into<Bytes>) {
        let Some(inner) = &self.inner else {
            // Consent not granted: drop silently.
            return;
        };
        let event = event.into();
        let force_new = inner.force_new.swap(false, Ordering::AcqRel);
        let shared = inner.shared.clone();
        let consent = inner.consent;
        inner
            .lane
            .post(move |_| shared.append(consent, event, force_new));
    }
}

impl Shared {
    fn dir(&self, consent: TrackingConsent) -> &Path {
        match consent {
            TrackingConsent::Granted => &self.granted,
            TrackingConsent::Pending => &self.pending,
            TrackingConsent::NotGranted => &self.unauthorized,
        }
    }

    fn append(&self, consent: TrackingConsent, event: Bytes, force_new: bool) {
        if event.len() as u64 > self.preset.max_object_size {
            self.telemetry.error(format!(
                "dropped {}-byte event exceeding the {}-byte object cap",
                event.len(),
                self.preset.max_object_size
            ));
            return;
        }
        let payload = match &self.encryption {
            Some(encryption) => match encryption.encrypt(&event) {
                Ok(ciphertext) => ciphertext,
                Err(err) => {
                    self.telemetry.error(format!("dropped event, encryption failed: {err}"));
                    return;
                }
            },
            None => event.to_vec(),
        };
        let needed = batch::stored_size(payload.len());
        let now = self.date.now();
        let dir = self.dir(consent).to_path_buf();

        let mut state = self.state.lock();
        let reusable = !force_new
            && state.open.get(&consent).is_some_and(|open| {
                open.size + needed <= self.preset.max_file_size
                    && open.objects < self.preset.max_objects_in_file
                    && age(now, open.id.created()) <= self.preset.max_file_age_for_write
            });
        if !reusable {
            state.open.remove(&consent);
            self.purge(&mut state, now);
            let id = self.unused_id(&dir, now);
            state.open.insert(
                consent,
                OpenFile {
                    id,
                    size: 0,
                    objects: 0,
                },
            );
        }
        let Some(open) = state.open.get_mut(&consent) else {
            return;
        };
        let path = dir.join(open.id.as_str());
        match batch::append_event(&path, &payload) {
            Ok(()) => {
                open.size += needed;
                open.objects += 1;
            }
            Err(err) => {
                // Start from a fresh file on the next write.
                state.open.remove(&consent);
                self.telemetry
                    .error(format!("failed to persist event: {err}"));
            }
        }
    }

    fn next_batch(&self) -> Option<Batch> {
        let now = self.date.now();
        let min_age = if self.ignore_file_age_for_read.load(Ordering::SeqCst) {
            Duration::ZERO
        } else {
            self.preset.min_file_age_for_read
        };

        for (id, _) in self.list(&self.granted) {
            if self.state.lock().in_flight.contains(&id) {
                continue;
            }
            let file_age = age(now, id.created());
            if file_age > self.preset.max_file_age_for_read {
                self.remove(&self.granted, &id, "obsolete");
                continue;
            }
            if file_age < min_age {
                // Entries are oldest first; everything after is younger.
                break;
            }
            // An open file old enough to read is closed by that fact.
            {
                let mut state = self.state.lock();
                if state
                    .open
                    .get(&TrackingConsent::Granted)
                    .is_some_and(|open| open.id == id)
                {
                    state.open.remove(&TrackingConsent::Granted);
                }
            }
            let path = self.granted.join(id.as_str());
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(err) => {
                    self.telemetry
                        .error(format!("failed to read batch {id}: {err}"));
                    continue;
                }
            };
            let events = match self.decode(&data) {
                Ok(events) => events,
                Err(err) => {
                    self.remove(&self.granted, &id, "corrupt");
                    self.telemetry
                        .error(format!("deleted corrupt batch {id}: {err}"));
                    continue;
                }
            };
            self.state.lock().in_flight.insert(id.clone());
            return Some(Batch { id, events });
        }
        None
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<Bytes>, BoxError> {
        let blobs = batch::decode_events(data)?;
        match &self.encryption {
            Some(encryption) => blobs
                .iter()
                .map(|blob| encryption.decrypt(blob).map(Bytes::from))
                .collect(),
            None => Ok(blobs),
        }
    }

    fn confirm(&self, id: BatchId, resolution: BatchResolution) {
        self.state.lock().in_flight.remove(&id);
        if resolution == BatchResolution::Delete {
            self.remove(&self.granted, &id, "resolved");
        }
    }

    fn migrate_unauthorized(&self, to: TrackingConsent) {
        match to {
            TrackingConsent::Granted => {
                for (id, _) in self.list(&self.pending) {
                    let mut target = id.clone();
                    while self.granted.join(target.as_str()).exists() {
                        target = target.next();
                    }
                    if let Err(err) = fs::rename(
                        self.pending.join(id.as_str()),
                        self.granted.join(target.as_str()),
                    ) {
                        tracing::warn!(
                            feature = %self.feature,
                            "failed to migrate batch {id}: {err}"
                        );
                    }
                }
                self.state.lock().open.remove(&TrackingConsent::Pending);
            }
            TrackingConsent::NotGranted => {
                self.wipe(&self.pending);
                self.state.lock().open.remove(&TrackingConsent::Pending);
            }
            TrackingConsent::Pending => {}
        }
    }

    fn clear_all_data(&self) {
        self.wipe(&self.granted);
        self.wipe(&self.pending);
        self.wipe(&self.unauthorized);
        let mut state = self.state.lock();
        state.open.clear();
        state.in_flight.clear();
    }

    fn clear_unauthorized_data(&self) {
        self.wipe(&self.pending);
        self.wipe(&self.unauthorized);
        self.state.lock().open.remove(&TrackingConsent::Pending);
    }

    /// Drop obsolete files, then evict oldest first until the feature's total
    /// footprint fits the directory budget. Runs before each new file opens.
    fn purge(&self, state: &mut StorageState, now: SystemTime) {
        let mut candidates: Vec<(BatchId, PathBuf, u64)> = Vec::new();
        for dir in [&self.granted, &self.pending] {
            for (id, size) in self.list(dir) {
                candidates.push((id, dir.clone(), size));
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let mut total: u64 = candidates.iter().map(|(_, _, size)| size).sum();
        for (id, dir, size) in candidates {
            if state.in_flight.contains(&id) || state.open.values().any(|open| open.id == id) {
                continue;
            }
            let obsolete = age(now, id.created()) > self.preset.max_file_age_for_read;
            if obsolete || total > self.preset.max_directory_size {
                self.remove(&dir, &id, if obsolete { "obsolete" } else { "evicted" });
                total -= size;
            }
        }
    }

    fn unused_id(&self, dir: &Path, now: SystemTime) -> BatchId {
        let mut id = BatchId::at(now);
        while dir.join(id.as_str()).exists() {
            id = id.next();
        }
        id
    }

    /// Batch files in `dir` with their sizes, oldest first.
    fn list(&self, dir: &Path) -> Vec<(BatchId, u64)> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(feature = %self.feature, "failed to list {dir:?}: {err}");
                return Vec::new();
            }
        };
        let mut batches: Vec<(BatchId, u64)> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let id = BatchId::parse(entry.file_name().to_str()?)?;
                let size = entry.metadata().ok()?.len();
                Some((id, size))
            })
            .collect();
        batches.sort_by(|a, b| a.0.cmp(&b.0));
        batches
    }

    fn remove(&self, dir: &Path, id: &BatchId, reason: &str) {
        match fs::remove_file(dir.join(id.as_str())) {
            Ok(()) => {
                tracing::debug!(feature = %self.feature, "removed {reason} batch {id}");
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(feature = %self.feature, "failed to remove batch {id}: {err}");
            }
        }
    }

    fn wipe(&self, dir: &Path) {
        for (id, _) in self.list(dir) {
            self.remove(dir, &id, "cleared");
        }
    }
}

fn age(now: SystemTime, created: SystemTime) -> Duration {
    now.duration_since(created).unwrap_or(Duration::ZERO)
}
