//! Bounded set-associative pool of memory-mapped files.
//!
//! Every file the replay store touches is mapped through one
//! [`MappedFileCache`]. A file identity hashes to one of `num_sets` sets and
//! each set keeps at most `set_size` mappings, so eviction only ever scans a
//! single set.
//!
//! Callers borrow a mapping through a [`RegionLease`]. A leased region is
//! never evicted; when every slot of a full set is leased the new mapping is
//! admitted anyway and the set is trimmed back on a later acquire.
//!
//! Locks are taken set first, then region. Faults are collected while locked
//! and handed to the error sink once every lock is released.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorSink, ReplayError};
use crate::types::{SessionId, StreamId};

// =============================================================================
// File identity
// =============================================================================

/// Which of the two per-session files a mapping belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Archive,
    Index,
}

/// Cache key: one file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub kind: FileKind,
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub path: PathBuf,
}

impl FileIdentity {
    /// Index file of a session: `replay-index-{session}-{stream}`.
    #[must_use]
    pub fn index(dir: &Path, session_id: SessionId, stream_id: StreamId) -> Self {
        Self {
            kind: FileKind::Index,
            session_id,
            stream_id,
            path: dir.join(format!("replay-index-{session_id}-{stream_id}")),
        }
    }

    /// Archive log of a session: `archive-{session}-{stream}.log`.
    #[must_use]
    pub fn archive(dir: &Path, session_id: SessionId, stream_id: StreamId) -> Self {
        Self {
            kind: FileKind::Archive,
            session_id,
            stream_id,
            path: dir.join(format!("archive-{session_id}-{stream_id}.log")),
        }
    }
}

/// How to treat a file that is not mapped yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create the file if missing and grow it to at least this many bytes.
    /// Existing contents are never truncated.
    CreateWithSize(u64),
    /// Map only a file that already exists with non-zero length.
    ExistingOnly,
}

// =============================================================================
// Region factory
// =============================================================================

/// Produces mappings for the cache.
///
/// `Ok(None)` means "nothing to map" (a missing or empty file in
/// [`OpenMode::ExistingOnly`]) and is not an error.
pub trait RegionFactory: Send + Sync {
    fn map(&self, path: &Path, mode: OpenMode) -> io::Result<Option<MmapMut>>;
}

/// Maps real files with `memmap2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileRegionFactory;

impl RegionFactory for FileRegionFactory {
    fn map(&self, path: &Path, mode: OpenMode) -> io::Result<Option<MmapMut>> {
        match mode {
            OpenMode::ExistingOnly => {
                let file = match OpenOptions::new().read(true).write(true).open(path) {
                    Ok(file) => file,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                    Err(err) => return Err(err),
                };
                if file.metadata()?.len() == 0 {
                    return Ok(None);
                }
                map_file(&file).map(Some)
            }
            OpenMode::CreateWithSize(size) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                if file.metadata()?.len() < size {
                    file.set_len(size)?;
                }
                map_file(&file).map(Some)
            }
        }
    }
}

#[allow(unsafe_code)]
fn map_file(file: &File) -> io::Result<MmapMut> {
    // SAFETY: replay files are only modified through mappings owned by a
    // MappedFileCache, and every access to a mapping goes through the
    // region's RwLock. Files are never truncated once mapped.
    unsafe { MmapMut::map_mut(file) }
}

// =============================================================================
// Regions and leases
// =============================================================================

/// One mapped file. Byte access goes through a reader/writer lock held for a
/// single operation.
pub struct MappedRegion {
    identity: FileIdentity,
    data: RwLock<MmapMut>,
}

impl MappedRegion {
    fn new(identity: FileIdentity, map: MmapMut) -> Self {
        Self {
            identity,
            data: RwLock::new(map),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MmapMut> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, MmapMut> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flush dirty pages to the file.
    pub fn flush(&self) -> io::Result<()> {
        self.read().flush()
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Pins a cached region against eviction until dropped.
#[derive(Debug)]
pub struct RegionLease {
    region: Arc<MappedRegion>,
}

impl Deref for RegionLease {
    type Target = MappedRegion;

    fn deref(&self) -> &MappedRegion {
        &self.region
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Files successfully mapped.
    pub maps: u64,
    pub evictions: u64,
    /// Inserts into a set whose slots were all leased.
    pub overflows: u64,
    /// Resident mappings grown in place to a larger requested size.
    pub remaps: u64,
    pub map_failures: u64,
    /// Mappings currently held.
    pub resident: usize,
}

impl CacheStats {
    /// Hit rate as a fraction [0.0, 1.0]. Returns 0.0 if no lookups.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_lookups();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    #[must_use]
    pub fn total_lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    maps: AtomicU64,
    evictions: AtomicU64,
    overflows: AtomicU64,
    remaps: AtomicU64,
    map_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Cache
// =============================================================================

struct CacheSlot {
    region: Arc<MappedRegion>,
    last_used: u64,
}

impl CacheSlot {
    fn is_leased(&self) -> bool {
        Arc::strong_count(&self.region) > 1
    }
}

#[derive(Default)]
struct CacheSet {
    slots: Vec<CacheSlot>,
    /// Per-set logical clock for LRU ordering.
    clock: u64,
}

/// Bounded pool of mapped files shared by writers and readers.
pub struct MappedFileCache {
    sets: Box<[Mutex<CacheSet>]>,
    set_size: usize,
    factory: Box<dyn RegionFactory>,
    errors: Arc<dyn ErrorSink>,
    counters: Counters,
}

impl fmt::Debug for MappedFileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedFileCache")
            .field("num_sets", &self.sets.len())
            .field("set_size", &self.set_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// splitmix64 finalizer; spreads sequential session ids across sets.
#[inline]
fn mix64(key: u64) -> u64 {
    let mut h = key;
    h = (h ^ (h >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h = (h ^ (h >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    h ^ (h >> 31)
}

impl MappedFileCache {
    /// Create a cache that maps real files.
    ///
    /// # Panics
    /// Panics if `num_sets` or `set_size` is 0.
    pub fn new(num_sets: usize, set_size: usize, errors: Arc<dyn ErrorSink>) -> Self {
        Self::with_factory(num_sets, set_size, FileRegionFactory, errors)
    }

    /// Create a cache around a custom region factory.
    ///
    /// # Panics
    /// Panics if `num_sets` or `set_size` is 0.
    pub fn with_factory(
        num_sets: usize,
        set_size: usize,
        factory: impl RegionFactory + 'static,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        assert!(num_sets > 0, "MappedFileCache num_sets must be > 0");
        assert!(set_size > 0, "MappedFileCache set_size must be > 0");
        let sets = (0..num_sets)
            .map(|_| Mutex::new(CacheSet::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            sets,
            set_size,
            factory: Box::new(factory),
            errors,
            counters: Counters::default(),
        }
    }

    /// Borrow the mapping for `identity`, mapping it on first use.
    ///
    /// A resident mapping shorter than a requested
    /// [`OpenMode::CreateWithSize`] is grown in place, so every holder sees
    /// the larger mapping.
    ///
    /// Returns `None` when there is nothing to map (a missing file in
    /// [`OpenMode::ExistingOnly`]) or when mapping failed; failures are
    /// reported to the error sink once no cache lock is held.
    pub fn acquire(&self, identity: &FileIdentity, mode: OpenMode) -> Option<RegionLease> {
        let mut faults = Vec::new();
        let lease = match self.lookup_or_map(identity, mode, &mut faults) {
            Some((lease, true)) => match mode {
                OpenMode::CreateWithSize(size) => self.grow(lease, size, &mut faults),
                OpenMode::ExistingOnly => Some(lease),
            },
            Some((lease, false)) => Some(lease),
            None => None,
        };
        self.report(faults);
        lease
    }

    /// Find or map `identity` under its set lock. The flag is true for a
    /// resident hit.
    fn lookup_or_map(
        &self,
        identity: &FileIdentity,
        mode: OpenMode,
        faults: &mut Vec<ReplayError>,
    ) -> Option<(RegionLease, bool)> {
        let mut set = self.lock_set(self.set_index(identity));
        set.clock += 1;
        let now = set.clock;

        if let Some(slot) = set
            .slots
            .iter_mut()
            .find(|slot| slot.region.identity() == identity)
        {
            slot.last_used = now;
            let lease = RegionLease {
                region: Arc::clone(&slot.region),
            };
            Counters::bump(&self.counters.hits);
            self.evict_down_to(&mut set, self.set_size, faults);
            return Some((lease, true));
        }
        Counters::bump(&self.counters.misses);

        let map = match self.factory.map(&identity.path, mode) {
            Ok(Some(map)) => map,
            Ok(None) => {
                tracing::trace!(path = %identity.path.display(), "no file to map");
                return None;
            }
            Err(source) => {
                faults.push(self.map_failed(identity, source));
                return None;
            }
        };
        Counters::bump(&self.counters.maps);
        tracing::debug!(
            session_id = identity.session_id,
            stream_id = identity.stream_id,
            kind = ?identity.kind,
            path = %identity.path.display(),
            len = map.len(),
            "mapped file"
        );

        self.evict_down_to(&mut set, self.set_size - 1, faults);
        if set.slots.len() >= self.set_size {
            Counters::bump(&self.counters.overflows);
            tracing::debug!(
                resident = set.slots.len(),
                set_size = self.set_size,
                "every slot leased, admitting over capacity"
            );
        }
        let region = Arc::new(MappedRegion::new(identity.clone(), map));
        set.slots.push(CacheSlot {
            region: Arc::clone(&region),
            last_used: now,
        });
        Some((RegionLease { region }, false))
    }

    /// Extend a resident mapping to at least `size` bytes, remapping under
    /// the region's write lock.
    fn grow(
        &self,
        lease: RegionLease,
        size: u64,
        faults: &mut Vec<ReplayError>,
    ) -> Option<RegionLease> {
        if lease.len() as u64 >= size {
            return Some(lease);
        }
        let identity = lease.identity();
        let mut map = lease.write();
        let old_len = map.len();
        if old_len as u64 >= size {
            drop(map);
            return Some(lease);
        }
        let grown = match self.factory.map(&identity.path, OpenMode::CreateWithSize(size)) {
            Ok(Some(grown)) => grown,
            Ok(None) => {
                drop(map);
                return Some(lease);
            }
            Err(source) => {
                drop(map);
                faults.push(self.map_failed(identity, source));
                return None;
            }
        };
        if let Err(source) = map.flush() {
            faults.push(ReplayError::Io {
                path: identity.path.clone(),
                source,
            });
        }
        *map = grown;
        drop(map);
        Counters::bump(&self.counters.remaps);
        tracing::debug!(
            session_id = identity.session_id,
            path = %identity.path.display(),
            old_len,
            len = size,
            "grew mapping"
        );
        Some(lease)
    }

    fn map_failed(&self, identity: &FileIdentity, source: io::Error) -> ReplayError {
        Counters::bump(&self.counters.map_failures);
        let err = ReplayError::Map {
            path: identity.path.clone(),
            source,
        };
        tracing::warn!(session_id = identity.session_id, error = %err, "mapping failed");
        err
    }

    fn report(&self, faults: Vec<ReplayError>) {
        for err in &faults {
            self.errors.on_error(err);
        }
    }

    /// True when `identity` is currently mapped.
    pub fn contains(&self, identity: &FileIdentity) -> bool {
        self.lock_set(self.set_index(identity))
            .slots
            .iter()
            .any(|slot| slot.region.identity() == identity)
    }

    /// Number of mappings currently held across all sets.
    pub fn resident(&self) -> usize {
        self.sets
            .iter()
            .map(|set| set.lock().unwrap_or_else(PoisonError::into_inner).slots.len())
            .sum()
    }

    /// Flush every resident mapping. Failures go to the error sink after
    /// each set is released.
    pub fn flush_all(&self) {
        for set in &*self.sets {
            let mut faults = Vec::new();
            {
                let set = set.lock().unwrap_or_else(PoisonError::into_inner);
                for slot in &set.slots {
                    faults.extend(flush_region(&slot.region));
                }
            }
            self.report(faults);
        }
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            maps: load(&self.counters.maps),
            evictions: load(&self.counters.evictions),
            overflows: load(&self.counters.overflows),
            remaps: load(&self.counters.remaps),
            map_failures: load(&self.counters.map_failures),
            resident: self.resident(),
        }
    }

    fn set_index(&self, identity: &FileIdentity) -> usize {
        let kind = match identity.kind {
            FileKind::Archive => 0,
            FileKind::Index => 1,
        };
        let h = mix64(mix64(identity.session_id) ^ ((u64::from(identity.stream_id) << 1) | kind));
        (h % self.sets.len() as u64) as usize
    }

    fn lock_set(&self, index: usize) -> MutexGuard<'_, CacheSet> {
        self.sets[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict least-recently-used unleased slots until at most `target` remain
    /// or only leased slots are left.
    fn evict_down_to(&self, set: &mut CacheSet, target: usize, faults: &mut Vec<ReplayError>) {
        while set.slots.len() > target {
            let victim = set
                .slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| !slot.is_leased())
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(pos, _)| pos);
            let Some(pos) = victim else {
                return;
            };
            let slot = set.slots.swap_remove(pos);
            faults.extend(flush_region(&slot.region));
            Counters::bump(&self.counters.evictions);
            tracing::debug!(
                session_id = slot.region.identity().session_id,
                path = %slot.region.identity().path.display(),
                "evicted mapping"
            );
        }
    }

}

fn flush_region(region: &MappedRegion) -> Option<ReplayError> {
    region.flush().err().map(|source| ReplayError::Io {
        path: region.identity().path.clone(),
        source,
    })
}

impl Drop for MappedFileCache {
    fn drop(&mut self) {
        self.flush_all();
    }
}
