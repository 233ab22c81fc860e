//! Pooled memory regions backing row arenas
//!
//! A [`MemoryPool`] hands out fixed-capacity regions obtained from anonymous
//! memory mappings. Regions are reference counted through [`RegionHandle`];
//! when the last handle to a region is dropped the region goes back on the
//! pool's free list with its capacity intact. Regions are only unmapped when
//! the pool itself is torn down.

use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use memmap2::MmapMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::arena::BumpCursor;
use crate::error::{Error, Result};

/// Default region size (128 KiB)
pub const DEFAULT_UNIT_SIZE: usize = 128 * 1024;

/// Constant for typical OS page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Round `value` up to the next multiple of `align`
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Configuration for a memory pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum size of every mapped region in bytes
    pub unit_size: usize,

    /// Granularity regions are rounded up to
    pub page_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            unit_size: DEFAULT_UNIT_SIZE,
            page_size: PAGE_SIZE,
        }
    }
}

impl PoolConfig {
    /// Check that the configuration describes a usable pool
    pub fn validate(&self) -> Result<()> {
        if self.unit_size == 0 {
            return Err(Error::InvalidArgument("Pool unit size must be positive".into()));
        }
        if !self.page_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "Pool page size must be a power of two, got {}",
                self.page_size
            )));
        }
        Ok(())
    }
}

/// Memory usage statistics for a memory pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total bytes currently mapped by the pool
    pub mapped_bytes: usize,

    /// Number of regions currently mapped
    pub mapped_regions: usize,

    /// Regions sitting on the free list
    pub free_regions: usize,

    /// Regions held by at least one handle
    pub live_regions: usize,
}

/// A fixed-capacity anonymous mapping
struct Region {
    id: usize,
    base: NonNull<u8>,
    map: MmapMut,
}

// The base pointer is derived from `map`, which is itself Send + Sync. Handing
// out disjoint byte ranges is the arena's job.
#[allow(unsafe_code)]
unsafe impl Send for Region {}
#[allow(unsafe_code)]
unsafe impl Sync for Region {}

impl Region {
    fn map(id: usize, size: usize) -> Result<Self> {
        let mut map =
            MmapMut::map_anon(size).map_err(|source| Error::AllocationFailure { size, source })?;
        let base = NonNull::new(map.as_mut_ptr()).ok_or_else(|| Error::AllocationFailure {
            size,
            source: io::Error::new(io::ErrorKind::Other, "mapping returned a null address"),
        })?;

        Ok(Self { id, base, map })
    }

    fn capacity(&self) -> usize {
        self.map.len()
    }
}

/// Lease on a region; returns the region to its pool when dropped
struct RegionLease {
    region: Option<Region>,
    pool: Weak<PoolShared>,
}

impl Drop for RegionLease {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            match self.pool.upgrade() {
                Some(pool) => pool.recycle(region),
                // Pool already torn down, unmap right here
                None => drop(region),
            }
        }
    }
}

/// Strong, reference-counted handle on a pooled region
#[derive(Clone)]
pub struct RegionHandle {
    lease: Arc<RegionLease>,
}

impl RegionHandle {
    fn region(&self) -> &Region {
        // Only `RegionLease::drop` takes the region out
        self.lease
            .region
            .as_ref()
            .unwrap_or_else(|| unreachable!("live lease without a region"))
    }

    /// Stable identifier of the underlying region
    pub fn id(&self) -> usize {
        self.region().id
    }

    /// Capacity of the underlying region in bytes
    pub fn capacity(&self) -> usize {
        self.region().capacity()
    }

    /// Number of handles currently sharing this region
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }

    /// Check whether two handles refer to the same lease
    pub fn ptr_eq(&self, other: &RegionHandle) -> bool {
        Arc::ptr_eq(&self.lease, &other.lease)
    }

    /// Address of byte `offset` within the region
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        let region = self.region();
        debug_assert!(offset <= region.capacity());
        // SAFETY: offset is within (or one past) the mapping, so the result
        // stays inside the same allocation and is non-null.
        #[allow(unsafe_code)]
        unsafe {
            NonNull::new_unchecked(region.base.as_ptr().add(offset))
        }
    }
}

impl fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionHandle")
            .field("id", &self.id())
            .field("capacity", &self.capacity())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

struct PoolShared {
    config: PoolConfig,
    free: Mutex<Vec<Region>>,
    cursor: Mutex<Option<BumpCursor>>,
    next_id: AtomicUsize,
    mapped_bytes: AtomicUsize,
    mapped_regions: AtomicUsize,
    live_regions: AtomicUsize,
}

impl PoolShared {
    fn recycle(&self, region: Region) {
        trace!(region = region.id, capacity = region.capacity(), "region returned to pool");
        self.live_regions.fetch_sub(1, Ordering::SeqCst);
        lock(&self.free).push(region);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let free = self.free.get_mut().unwrap_or_else(PoisonError::into_inner);
        debug!(
            free_regions = free.len(),
            mapped_bytes = self.mapped_bytes.load(Ordering::SeqCst),
            "tearing down memory pool"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pool of anonymous memory regions shared by row arenas
///
/// Cloning a `MemoryPool` yields another handle on the same pool. Every
/// [`RowArena`](crate::arena::RowArena) receives its pool explicitly, so
/// independent pools can coexist (tests use this for isolation).
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Create a pool with the default configuration
    pub fn new() -> Self {
        Self::from_valid_config(PoolConfig::default())
    }

    /// Create a pool with a custom configuration
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                free: Mutex::new(Vec::new()),
                cursor: Mutex::new(None),
                next_id: AtomicUsize::new(0),
                mapped_bytes: AtomicUsize::new(0),
                mapped_regions: AtomicUsize::new(0),
                live_regions: AtomicUsize::new(0),
            }),
        }
    }

    /// Process-wide default pool, created on first use
    pub fn shared() -> Self {
        static SHARED: OnceLock<MemoryPool> = OnceLock::new();
        SHARED.get_or_init(MemoryPool::new).clone()
    }

    /// Configuration of this pool
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Size of the region that would serve a request of `min_size` bytes
    pub fn region_size_for(&self, min_size: usize) -> usize {
        let config = &self.shared.config;
        align_up(min_size.max(config.unit_size), config.page_size)
    }

    /// Acquire a region with at least `min_size` bytes of capacity
    ///
    /// A free region of sufficient capacity is reused when one exists;
    /// otherwise a new region is mapped.
    pub fn acquire(&self, min_size: usize) -> Result<RegionHandle> {
        let size = self.region_size_for(min_size);

        let reused = {
            let mut free = lock(&self.shared.free);
            free.iter()
                .position(|region| region.capacity() >= size)
                .map(|idx| free.swap_remove(idx))
        };

        let region = match reused {
            Some(region) => {
                trace!(region = region.id, capacity = region.capacity(), "reusing pooled region");
                region
            }
            None => {
                let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
                let region = Region::map(id, size)?;
                self.shared.mapped_bytes.fetch_add(size, Ordering::SeqCst);
                self.shared.mapped_regions.fetch_add(1, Ordering::SeqCst);
                debug!(region = id, size, "mapped new region");
                region
            }
        };

        self.shared.live_regions.fetch_add(1, Ordering::SeqCst);

        Ok(RegionHandle {
            lease: Arc::new(RegionLease {
                region: Some(region),
                pool: Arc::downgrade(&self.shared),
            }),
        })
    }

    /// Release a handle obtained from [`acquire`](Self::acquire)
    ///
    /// The region returns to the free list once no other handle shares it.
    pub fn release(&self, handle: RegionHandle) {
        drop(handle);
    }

    /// Current usage statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            mapped_bytes: self.shared.mapped_bytes.load(Ordering::SeqCst),
            mapped_regions: self.shared.mapped_regions.load(Ordering::SeqCst),
            free_regions: lock(&self.shared.free).len(),
            live_regions: self.shared.live_regions.load(Ordering::SeqCst),
        }
    }

    /// Lock the bump cursor shared by every arena drawing from this pool
    pub(crate) fn lock_cursor(&self) -> MutexGuard<'_, Option<BumpCursor>> {
        lock(&self.shared.cursor)
    }

    /// Check whether two handles refer to the same pool
    pub fn ptr_eq(&self, other: &MemoryPool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}
