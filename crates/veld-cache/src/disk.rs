//! Disk cache tier.
//!
//! Blobs are stored by fingerprint in a two-level directory structure:
//!   <root>/{hex[0..2]}/{full_hex}
//!
//! There is no index file. The in-memory index is rebuilt by enumerating
//! the directory on startup, each file contributing the prefix range
//! `[0, len)`. Only prefix-contiguous data is persisted; runs that start
//! beyond the current prefix are served from an in-memory overlay and do
//! not survive a restart, which keeps the no-index-file rebuild honest.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use memmap2::Mmap;

use veld_core::{Chunk, Fingerprint};

use crate::policy::CachePolicy;
use crate::range::{DenseData, Range, RangeList, SparseData};
use crate::tier::{with_fired_flag, CacheTier, PendingTable, TierLink, TierStats, TransferCallback};
use crate::uri::ResourceUri;

pub struct DiskTier {
    inner: Arc<DiskInner>,
}

struct DiskInner {
    link: TierLink,
    root: PathBuf,
    index: DashMap<Fingerprint, DiskEntry>,
    policy: Mutex<Box<dyn CachePolicy>>,
    pins: Mutex<PinSet>,
    pending: PendingTable,
}

#[derive(Default)]
struct PinSet {
    counts: HashMap<Fingerprint, usize>,
    deferred: HashSet<Fingerprint>,
}

#[derive(Clone, Default)]
struct DiskEntry {
    /// Bytes `[0, persisted_len)` live in the blob file.
    persisted_len: u64,
    /// Runs beyond the prefix, memory only.
    overlay: SparseData,
    total_len: Option<u64>,
}

impl DiskEntry {
    fn known(&self) -> RangeList {
        let mut list = RangeList::new();
        if self.persisted_len > 0 {
            list.insert(0, self.persisted_len);
        }
        for run in self.overlay.runs() {
            list.insert(run.start, run.end());
        }
        list
    }

    fn covers(&self, range: &Range) -> bool {
        self.known().covers(range, self.total_len)
    }

    fn size(&self) -> u64 {
        self.persisted_len + self.overlay.size_bytes()
    }

    /// Drop overlay runs the persisted prefix has since swallowed.
    fn compact(&mut self) {
        if self
            .overlay
            .runs()
            .iter()
            .all(|r| r.end() > self.persisted_len)
        {
            return;
        }
        let mut overlay = SparseData::new();
        for run in self.overlay.runs() {
            if run.end() > self.persisted_len {
                overlay.insert(run.clone());
            }
        }
        self.overlay = overlay;
    }
}

impl DiskTier {
    /// Open a tier rooted at `root`, enumerating existing blobs to
    /// rebuild the index.
    pub fn open(
        root: impl Into<PathBuf>,
        policy: Box<dyn CachePolicy>,
        request_timeout: Duration,
    ) -> std::io::Result<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let tier = Arc::new(DiskTier {
            inner: Arc::new(DiskInner {
                link: TierLink::new(),
                root,
                index: DashMap::new(),
                policy: Mutex::new(policy),
                pins: Mutex::new(PinSet::default()),
                pending: PendingTable::new(request_timeout),
            }),
        });
        tier.rebuild_index()?;
        Ok(tier)
    }

    fn rebuild_index(&self) -> std::io::Result<()> {
        let mut entries = 0usize;
        for subdir in fs::read_dir(&self.inner.root)? {
            let subdir = subdir?;
            if !subdir.file_type()?.is_dir() {
                continue;
            }
            for blob in fs::read_dir(subdir.path())? {
                let blob = blob?;
                let name = blob.file_name();
                let Some(fingerprint) = name.to_str().and_then(|s| s.parse::<Fingerprint>().ok())
                else {
                    continue;
                };
                let len = blob.metadata()?.len();
                self.inner.index.insert(
                    fingerprint,
                    DiskEntry {
                        persisted_len: len,
                        ..Default::default()
                    },
                );
                let victims = self.inner.policy_lock().on_insert(&fingerprint, len);
                for victim in victims {
                    self.inner.remove_blob(&victim);
                }
                entries += 1;
            }
        }
        tracing::info!(
            root = %self.inner.root.display(),
            entries,
            "disk cache index rebuilt"
        );
        Ok(())
    }
}

impl DiskInner {
    fn policy_lock(&self) -> MutexGuard<'_, Box<dyn CachePolicy>> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pins_lock(&self) -> MutexGuard<'_, PinSet> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(&hex[0..2]).join(&hex)
    }

    fn pin(&self, fingerprint: &Fingerprint) {
        *self.pins_lock().counts.entry(*fingerprint).or_insert(0) += 1;
    }

    fn unpin(&self, fingerprint: &Fingerprint) {
        let evict_now = {
            let mut pins = self.pins_lock();
            let Some(count) = pins.counts.get_mut(fingerprint) else {
                return;
            };
            *count -= 1;
            if *count == 0 {
                pins.counts.remove(fingerprint);
                pins.deferred.remove(fingerprint)
            } else {
                false
            }
        };
        if evict_now {
            self.remove_blob(fingerprint);
        }
    }

    fn evict_or_defer(&self, victim: Fingerprint) {
        let pinned = {
            let mut pins = self.pins_lock();
            if pins.counts.contains_key(&victim) {
                pins.deferred.insert(victim);
                true
            } else {
                false
            }
        };
        if !pinned {
            self.remove_blob(&victim);
        }
    }

    fn remove_blob(&self, fingerprint: &Fingerprint) {
        self.index.remove(fingerprint);
        let path = self.blob_path(fingerprint);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, fingerprint = %fingerprint, "failed to delete blob");
            }
        }
        tracing::debug!(fingerprint = %fingerprint, "disk tier evicted");
    }
}

impl CacheTier for DiskTier {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn link(&self) -> &TierLink {
        &self.inner.link
    }

    fn get_data(&self, uri: &ResourceUri, range: Range, callback: TransferCallback) -> bool {
        let fingerprint = uri.fingerprint;
        let hit = self
            .inner
            .index
            .get(&fingerprint)
            .map(|e| e.value().clone())
            .filter(|e| e.covers(&range));

        if let Some(entry) = hit {
            self.inner.policy_lock().on_use(&fingerprint);
            self.inner.pin(&fingerprint);
            let inner = Arc::clone(&self.inner);
            return match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        let path = inner.blob_path(&fingerprint);
                        let blocking_entry = entry.clone();
                        let read = tokio::task::spawn_blocking(move || {
                            read_blob(&path, &blocking_entry, &range)
                        })
                        .await;
                        match read {
                            Ok(Ok(view)) => {
                                for run in view.runs() {
                                    inner.link.populate_parent(
                                        &fingerprint,
                                        run.clone(),
                                        entry.total_len,
                                    );
                                }
                                callback(Some(view));
                            }
                            Ok(Err(e)) => {
                                tracing::warn!(error = %e, fingerprint = %fingerprint, "disk read failed");
                                callback(None);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "disk read task failed");
                                callback(None);
                            }
                        }
                        inner.unpin(&fingerprint);
                    });
                    true
                }
                Err(_) => {
                    // no runtime to offload onto; read on the caller
                    let path = inner.blob_path(&fingerprint);
                    match read_blob(&path, &entry, &range) {
                        Ok(view) => {
                            for run in view.runs() {
                                inner
                                    .link
                                    .populate_parent(&fingerprint, run.clone(), entry.total_len);
                            }
                            callback(Some(view));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, fingerprint = %fingerprint, "disk read failed");
                            callback(None);
                        }
                    }
                    inner.unpin(&fingerprint);
                    false
                }
            };
        }

        let (callback, fired) = with_fired_flag(callback);
        let shares_in_flight = self.inner.pending.park(fingerprint, range, callback);
        if !shares_in_flight {
            let inner = Arc::clone(&self.inner);
            let relay: TransferCallback = Box::new(move |result| {
                if result.is_none() {
                    inner.pending.fail_within(&fingerprint, &range);
                }
            });
            self.inner.link.forward(uri, range, relay);
        }
        !fired.load(Ordering::Acquire)
    }

    fn populate(&self, fingerprint: &Fingerprint, data: DenseData, total_len: Option<u64>) {
        let (view, size, persist) = {
            let mut entry = self.inner.index.entry(*fingerprint).or_default();
            let persist = if data.start <= entry.persisted_len {
                let existing = entry.persisted_len;
                entry.persisted_len = entry.persisted_len.max(data.end());
                entry.compact();
                Some(existing)
            } else {
                entry.overlay.insert(data.clone());
                None
            };
            if let Some(t) = total_len {
                entry.total_len = Some(entry.total_len.map_or(t, |known| known.max(t)));
            }
            let mut view = entry.overlay.clone();
            if let Some(t) = entry.total_len {
                view.set_total_len(t);
            }
            view.insert(data.clone());
            (view, entry.size(), persist)
        };

        if let Some(existing_len) = persist {
            // Writes are atomic: splice into the prefix, tmp file, rename.
            let path = self.inner.blob_path(fingerprint);
            if let Err(e) = write_prefix(&path, existing_len, &data) {
                tracing::warn!(error = %e, fingerprint = %fingerprint, "disk write failed, dropping entry");
                self.inner.index.remove(fingerprint);
                self.inner.policy_lock().on_remove(fingerprint);
                self.inner.link.populate_parent(fingerprint, data, total_len);
                return;
            }
            tracing::trace!(fingerprint = %fingerprint, bytes = data.len(), "blob persisted");
        }

        let victims = self.inner.policy_lock().on_insert(fingerprint, size);
        for victim in victims {
            self.inner.evict_or_defer(victim);
        }

        self.inner
            .pending
            .complete(fingerprint, |r| view.covers(r), |r| view.clipped(r));
        self.inner.link.populate_parent(fingerprint, data, total_len);
    }

    fn purge(&self, fingerprint: &Fingerprint) {
        if self.inner.index.remove(fingerprint).is_some() {
            self.inner.policy_lock().on_remove(fingerprint);
            let path = self.inner.blob_path(fingerprint);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, fingerprint = %fingerprint, "failed to delete purged blob");
                }
            }
        }
        self.inner.link.purge_next(fingerprint);
    }

    fn stats(&self) -> TierStats {
        let mut stats = TierStats::default();
        for entry in self.inner.index.iter() {
            stats.entries += 1;
            stats.stored_bytes += entry.size();
        }
        stats
    }
}

fn read_blob(path: &Path, entry: &DiskEntry, range: &Range) -> std::io::Result<SparseData> {
    let mut full = entry.overlay.clone();
    if let Some(t) = entry.total_len {
        full.set_total_len(t);
    }
    if entry.persisted_len > 0 {
        let file = fs::File::open(path)?;
        // Safety: opened read-only and the mapping is copied out before
        // any other thread could replace the file
        let mmap = unsafe { Mmap::map(&file)? };
        let len = (entry.persisted_len as usize).min(mmap.len());
        full.insert(DenseData::new(0, Chunk::copy_from_slice(&mmap[..len])));
    }
    Ok(full.clipped(range))
}

fn write_prefix(path: &Path, existing_len: u64, data: &DenseData) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut buf = if existing_len > 0 && path.exists() {
        fs::read(path)?
    } else {
        Vec::new()
    };
    let end = data.end() as usize;
    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[data.start as usize..end].copy_from_slice(&data.bytes);

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
