//! Per-row bump allocation over pooled regions
//!
//! Every arena drawing from the same [`MemoryPool`] shares one bump cursor,
//! so consecutive rows pack their column storage into the same region. An
//! arena remembers each region it has touched and holds a handle on it until
//! the arena is dropped.

use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::memory::{align_up, MemoryPool, RegionHandle};

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Current bump position within the pool's active region
pub(crate) struct BumpCursor {
    region: RegionHandle,
    used: usize,
}

impl BumpCursor {
    fn new(region: RegionHandle) -> Self {
        Self { region, used: 0 }
    }

    fn fits(&self, size: usize, align: usize) -> bool {
        align_up(self.used, align)
            .checked_add(size)
            .is_some_and(|end| end <= self.region.capacity())
    }
}

/// Byte range handed out by a [`RowArena`]
///
/// A span is only meaningful to the arena that produced it; its bytes are
/// reachable through [`RowArena::bytes`] and [`RowArena::bytes_mut`], which
/// reject spans carrying another arena's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSpan {
    ptr: NonNull<u8>,
    len: usize,
    arena: u64,
}

// A span is an address range inside a region kept alive by the owning arena.
#[allow(unsafe_code)]
unsafe impl Send for ArenaSpan {}
#[allow(unsafe_code)]
unsafe impl Sync for ArenaSpan {}

impl ArenaSpan {
    /// Length of the span in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the span is zero-length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bump allocator owned by a single row
#[derive(Debug)]
pub struct RowArena {
    id: u64,
    pool: MemoryPool,
    regions: Vec<RegionHandle>,
    allocated_bytes: usize,
}

impl RowArena {
    /// Create an empty arena drawing from `pool`
    pub fn new(pool: MemoryPool) -> Self {
        Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            regions: Vec::new(),
            allocated_bytes: 0,
        }
    }

    /// Pool this arena draws from
    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Allocate `size` bytes aligned to `align`
    ///
    /// When the shared cursor's region cannot hold the request it is released
    /// and a region of at least `size` bytes is acquired in its place.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<ArenaSpan> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "Alignment must be a power of two, got {align}"
            )));
        }

        let mut guard = self.pool.lock_cursor();
        let mut cursor = match guard.take() {
            Some(cursor) if cursor.fits(size, align) => cursor,
            stale => {
                drop(stale);
                BumpCursor::new(self.pool.acquire(size)?)
            }
        };

        let offset = align_up(cursor.used, align);
        cursor.used = offset + size;
        let ptr = cursor.region.ptr_at(offset);

        // Hold the region once, however many spans land in it
        let seen = self
            .regions
            .last()
            .is_some_and(|last| last.ptr_eq(&cursor.region));
        if !seen {
            self.regions.push(cursor.region.clone());
        }
        *guard = Some(cursor);

        self.allocated_bytes += size;
        Ok(ArenaSpan {
            ptr,
            len: size,
            arena: self.id,
        })
    }

    fn check_owner(&self, span: ArenaSpan) -> Result<()> {
        if span.arena == self.id {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "Span from arena {} passed to arena {}",
                span.arena, self.id
            )))
        }
    }

    /// Bytes of a span produced by this arena
    pub fn bytes(&self, span: ArenaSpan) -> Result<&[u8]> {
        self.check_owner(span)?;
        // SAFETY: arena ids are never reused, so the span came from
        // `allocate` on `self` and lies in a region `self.regions` keeps
        // mapped for as long as `self` lives. Mapped memory is initialized.
        #[allow(unsafe_code)]
        let bytes = unsafe { slice::from_raw_parts(span.ptr.as_ptr(), span.len) };
        Ok(bytes)
    }

    /// Mutable bytes of a span produced by this arena
    pub fn bytes_mut(&mut self, span: ArenaSpan) -> Result<&mut [u8]> {
        self.check_owner(span)?;
        // SAFETY: as in `bytes`. Spans never overlap because the shared
        // cursor only moves forward within a region, and the `&mut self`
        // borrow excludes any other view through this arena.
        #[allow(unsafe_code)]
        let bytes = unsafe { slice::from_raw_parts_mut(span.ptr.as_ptr(), span.len) };
        Ok(bytes)
    }

    /// Regions this arena holds
    pub fn regions(&self) -> &[RegionHandle] {
        &self.regions
    }

    /// Total bytes handed out by this arena
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DEFAULT_UNIT_SIZE;

    #[test]
    fn consecutive_arenas_share_a_region() {
        let pool = MemoryPool::new();
        let mut a = RowArena::new(pool.clone());
        let mut b = RowArena::new(pool.clone());

        a.allocate(64, 8).unwrap();
        a.allocate(64, 8).unwrap();
        b.allocate(64, 8).unwrap();

        assert_eq!(a.regions().len(), 1);
        assert_eq!(b.regions().len(), 1);
        assert!(a.regions()[0].ptr_eq(&b.regions()[0]));
        assert_eq!(pool.stats().mapped_regions, 1);
    }

    #[test]
    fn allocation_respects_alignment() {
        let pool = MemoryPool::new();
        let mut arena = RowArena::new(pool);

        arena.allocate(3, 1).unwrap();
        let span = arena.allocate(16, 8).unwrap();
        assert_eq!(span.ptr.as_ptr() as usize % 8, 0);
        assert_eq!(span.len(), 16);
    }

    #[test]
    fn spans_do_not_overlap() {
        let pool = MemoryPool::new();
        let mut arena = RowArena::new(pool);

        let first = arena.allocate(32, 4).unwrap();
        let second = arena.allocate(32, 4).unwrap();
        arena.bytes_mut(first).unwrap().fill(0xAA);
        arena.bytes_mut(second).unwrap().fill(0x55);

        assert!(arena.bytes(first).unwrap().iter().all(|&b| b == 0xAA));
        assert!(arena.bytes(second).unwrap().iter().all(|&b| b == 0x55));
    }

    #[test]
    fn oversized_request_gets_dedicated_region() {
        let pool = MemoryPool::new();
        let mut arena = RowArena::new(pool.clone());

        arena.allocate(16, 8).unwrap();
        let span = arena.allocate(3 * DEFAULT_UNIT_SIZE, 8).unwrap();

        assert_eq!(span.len(), 3 * DEFAULT_UNIT_SIZE);
        assert_eq!(arena.regions().len(), 2);
        assert!(arena.regions()[1].capacity() >= 3 * DEFAULT_UNIT_SIZE);
    }

    #[test]
    fn dropping_arenas_returns_regions() {
        let pool = MemoryPool::new();
        {
            let mut arena = RowArena::new(pool.clone());
            arena.allocate(DEFAULT_UNIT_SIZE, 8).unwrap();
            arena.allocate(DEFAULT_UNIT_SIZE, 8).unwrap();
            assert_eq!(arena.regions().len(), 2);
        }

        // The cursor still pins the most recent region
        let stats = pool.stats();
        assert_eq!(stats.live_regions, 1);
        assert_eq!(stats.free_regions, 1);
    }

    #[test]
    fn rejects_bad_alignment() {
        let mut arena = RowArena::new(MemoryPool::new());
        assert!(arena.allocate(8, 3).is_err());
    }

    #[test]
    fn foreign_span_rejected() {
        let pool = MemoryPool::new();
        let mut a = RowArena::new(pool.clone());
        let mut b = RowArena::new(pool);

        // Both arenas hold the same region, ownership is still per arena
        let span = a.allocate(64, 8).unwrap();
        b.allocate(64, 8).unwrap();
        assert!(b.bytes(span).is_err());
        assert!(b.bytes_mut(span).is_err());
        assert!(a.bytes(span).is_ok());
    }

    #[test]
    fn span_outliving_its_pool_rejected() {
        let span = {
            let mut a = RowArena::new(MemoryPool::new());
            a.allocate(64, 8).unwrap()
        };

        let err = RowArena::new(MemoryPool::new()).bytes(span).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
