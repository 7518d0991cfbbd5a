//! Chunk region (C1) and mempool (C2).

use crate::memory::error::AllocError;
use crate::memory::objcache::ObjCacheInner;

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use anyhow::Result;

/// Size, in bytes, of one chunk. A fixed power of two.
pub const CHUNK_SIZE: usize = 8192;
const CHUNK_SHIFT: u32 = CHUNK_SIZE.trailing_zeros();

/// Per-chunk metadata, parallel to the chunk's data bytes.
///
/// In the free state a chunk only needs to know the next free chunk in
/// whichever free list currently owns it (global pool or a named pool). In
/// the in-use state it additionally carries the owning cache (so that an
/// object pointer can be mapped back to its cache in O(1)) and the cache's
/// partial/full list linkage.
enum ChunkHeader {
    Free {
        next: Option<u32>,
    },
    InUse {
        /// Back-reference to the owning objcache. A `Weak` pointer so that
        /// an objcache can be torn down without chunks outliving it (in
        /// practice `objcache_fini` always vacates its chunks first).
        cache: Weak<RefCell<ObjCacheInner>>,
        obj_sz: usize,
        inuse: u32,
        /// Head of this chunk's intra-chunk object free list.
        free_list: Option<NonNull<u8>>,
        /// Doubly-linked membership in the owning cache's partials/full list.
        prev: Option<u32>,
        next: Option<u32>,
        in_full: bool,
    },
}

/// A contiguous reservation of `numchunks * CHUNK_SIZE` bytes, sliced into
/// fixed-size chunks with a parallel metadata array.
///
/// Owns the only allocation in the allocator: every [`Mempool`] and
/// [`ObjCache`](crate::memory::ObjCache) created against a region borrows
/// chunks from it and must return them before the region (or the pool) is
/// torn down.
pub struct ChunkRegion(Rc<RefCell<RegionInner>>);

struct RegionInner {
    data: Box<[u8]>,
    headers: Vec<ChunkHeader>,
    global_free: Option<u32>,
    global_numfree: usize,
}

impl ChunkRegion {
    /// Reserves `numchunks` chunks as one contiguous allocation and links
    /// every chunk into the global pool's free list, lowest address first.
    pub fn new(numchunks: usize) -> Result<Self> {
        if numchunks == 0 {
            return Err(AllocError::InvalidChunkCount(numchunks).into());
        }

        let data = vec![0u8; numchunks * CHUNK_SIZE].into_boxed_slice();
        let mut headers = Vec::with_capacity(numchunks);
        for i in 0..numchunks {
            let next = if i + 1 == numchunks { None } else { Some(i as u32 + 1) };
            headers.push(ChunkHeader::Free { next });
        }

        log::info!(
            "memchunk: {}K requested ({} chunks)",
            (numchunks * CHUNK_SIZE) >> 10,
            numchunks,
        );

        Ok(ChunkRegion(Rc::new(RefCell::new(RegionInner {
            data,
            headers,
            global_free: Some(0),
            global_numfree: numchunks,
        }))))
    }

    pub(crate) fn numchunks(&self) -> usize {
        self.0.borrow().headers.len()
    }

    pub(crate) fn global_numfree(&self) -> usize {
        self.0.borrow().global_numfree
    }

    /// Pops `numchunks` chunks off the global free list into a new pool.
    pub(crate) fn draw_from_global(&self, numchunks: usize) -> Result<Vec<u32>, AllocError> {
        let mut inner = self.0.borrow_mut();
        if inner.global_numfree < numchunks {
            return Err(AllocError::PoolExhausted("_global".to_string(), numchunks));
        }
        let mut drawn = Vec::with_capacity(numchunks);
        for _ in 0..numchunks {
            let idx = inner.global_free.expect("numfree tracked global_numfree inconsistently");
            inner.global_free = match &inner.headers[idx as usize] {
                ChunkHeader::Free { next } => *next,
                ChunkHeader::InUse { .. } => unreachable!("free list pointed at in-use chunk"),
            };
            inner.global_numfree -= 1;
            drawn.push(idx);
        }
        Ok(drawn)
    }

    /// Returns chunks to the global free list (used by pool teardown and by
    /// the spill path when a pool is above its reserve watermark).
    pub(crate) fn return_to_global(&self, idx: u32) {
        let mut inner = self.0.borrow_mut();
        inner.headers[idx as usize] = ChunkHeader::Free { next: inner.global_free };
        inner.global_free = Some(idx);
        inner.global_numfree += 1;
    }

    /// Returns the base address of chunk `idx`'s data area.
    fn chunk_data(&self, idx: u32) -> NonNull<u8> {
        let mut inner = self.0.borrow_mut();
        let off = idx as usize * CHUNK_SIZE;
        unsafe { NonNull::new_unchecked(inner.data.as_mut_ptr().add(off)) }
    }

    /// Pure arithmetic mapping from a live object pointer back to its chunk
    /// index: subtract the region base, shift right by `CHUNK_SHIFT`.
    ///
    /// # Safety
    /// `ptr` must point inside this region's data area.
    unsafe fn chunk_index_of(&self, ptr: NonNull<u8>) -> u32 {
        let inner = self.0.borrow();
        let base = inner.data.as_ptr() as usize;
        let p = ptr.as_ptr() as usize;
        debug_assert!(p >= base && p < base + inner.data.len(), "pointer outside region");
        ((p - base) >> CHUNK_SHIFT) as u32
    }

    pub(crate) fn init_inuse(
        &self,
        idx: u32,
        cache: Weak<RefCell<ObjCacheInner>>,
        obj_sz: usize,
    ) -> NonNull<u8> {
        let mut inner = self.0.borrow_mut();
        inner.headers[idx as usize] = ChunkHeader::InUse {
            cache,
            obj_sz,
            inuse: 0,
            free_list: None,
            prev: None,
            next: None,
            in_full: false,
        };
        drop(inner);
        self.chunk_data(idx)
    }

    fn with_inuse<R>(&self, idx: u32, f: impl FnOnce(&mut ChunkInUseView) -> R) -> R {
        let mut inner = self.0.borrow_mut();
        match &mut inner.headers[idx as usize] {
            ChunkHeader::InUse {
                cache,
                obj_sz,
                inuse,
                free_list,
                prev,
                next,
                in_full,
            } => f(&mut ChunkInUseView {
                cache,
                obj_sz,
                inuse,
                free_list,
                prev,
                next,
                in_full,
            }),
            ChunkHeader::Free { .. } => panic!("operation on a free chunk"),
        }
    }

    pub(crate) fn owner_of(&self, obj: NonNull<u8>) -> (u32, Weak<RefCell<ObjCacheInner>>) {
        let idx = unsafe { self.chunk_index_of(obj) };
        let cache = self.with_inuse(idx, |c| c.cache.clone());
        (idx, cache)
    }

    pub(crate) fn inuse_count(&self, idx: u32) -> u32 {
        self.with_inuse(idx, |c| *c.inuse)
    }

    pub(crate) fn obj_sz_of(&self, idx: u32) -> usize {
        self.with_inuse(idx, |c| *c.obj_sz)
    }

    pub(crate) fn bump_inuse(&self, idx: u32, delta: i32) -> u32 {
        self.with_inuse(idx, |c| {
            *c.inuse = (*c.inuse as i32 + delta) as u32;
            *c.inuse
        })
    }

    pub(crate) fn pop_free_obj(&self, idx: u32) -> Option<NonNull<u8>> {
        self.with_inuse(idx, |c| {
            let head = (*c.free_list)?;
            let next = unsafe { *(head.as_ptr() as *const *mut u8) };
            *c.free_list = NonNull::new(next);
            Some(head)
        })
    }

    pub(crate) fn push_free_obj(&self, idx: u32, obj: NonNull<u8>) {
        self.with_inuse(idx, |c| unsafe {
            *(obj.as_ptr() as *mut *mut u8) = c.free_list.map_or(std::ptr::null_mut(), |p| p.as_ptr());
            *c.free_list = Some(obj);
        })
    }

    pub(crate) fn free_list_empty(&self, idx: u32) -> bool {
        self.with_inuse(idx, |c| c.free_list.is_none())
    }

    pub(crate) fn link_get(&self, idx: u32) -> (Option<u32>, Option<u32>, bool) {
        self.with_inuse(idx, |c| (*c.prev, *c.next, *c.in_full))
    }

    pub(crate) fn link_set(&self, idx: u32, prev: Option<u32>, next: Option<u32>, in_full: bool) {
        self.with_inuse(idx, |c| {
            *c.prev = prev;
            *c.next = next;
            *c.in_full = in_full;
        })
    }
}

impl Clone for ChunkRegion {
    fn clone(&self) -> Self {
        ChunkRegion(Rc::clone(&self.0))
    }
}

/// Borrowed view into an in-use chunk header, used to keep the match-arm
/// bindings in `ChunkRegion` short-lived and borrow-checker friendly.
struct ChunkInUseView<'a> {
    cache: &'a mut Weak<RefCell<ObjCacheInner>>,
    obj_sz: &'a mut usize,
    inuse: &'a mut u32,
    free_list: &'a mut Option<NonNull<u8>>,
    prev: &'a mut Option<u32>,
    next: &'a mut Option<u32>,
    in_full: &'a mut bool,
}

/// A named reservation of chunks drawn from the global pool, with a spill /
/// refill watermark (`reserve`).
pub struct Mempool(Rc<RefCell<MempoolInner>>);

struct MempoolInner {
    label: String,
    region: ChunkRegion,
    free: Option<u32>,
    numfree: usize,
    reserve: usize,
}

impl Mempool {
    /// Draws `numchunks` chunks from the region's global pool into a new
    /// named reservation. Fails if the global pool cannot supply them.
    pub fn new(region: &ChunkRegion, label: impl Into<String>, numchunks: usize) -> Result<Self> {
        let label = label.into();
        if numchunks == 0 {
            return Err(AllocError::PoolExhausted(label, numchunks).into());
        }
        let drawn = region.draw_from_global(numchunks)?;

        let mut free = None;
        {
            let mut inner = region.0.borrow_mut();
            for idx in drawn {
                inner.headers[idx as usize] = ChunkHeader::Free { next: free };
                free = Some(idx);
            }
        }

        log::info!("mempool: new: {} ({} chunks)", label, numchunks);
        Ok(Mempool(Rc::new(RefCell::new(MempoolInner {
            label,
            region: region.clone(),
            free,
            numfree: numchunks,
            reserve: numchunks,
        }))))
    }

    pub fn label(&self) -> String {
        self.0.borrow().label.clone()
    }

    pub fn numfree(&self) -> usize {
        self.0.borrow().numfree
    }

    pub fn reserve(&self) -> usize {
        self.0.borrow().reserve
    }

    /// Pops a chunk off this pool's free list; if empty, spills to the
    /// global pool. Returns `None` if both are exhausted.
    pub(crate) fn acquire(&self) -> Option<u32> {
        let mut inner = self.0.borrow_mut();
        if let Some(idx) = inner.free {
            inner.free = match &inner.region.0.borrow().headers[idx as usize] {
                ChunkHeader::Free { next } => *next,
                ChunkHeader::InUse { .. } => unreachable!(),
            };
            inner.numfree -= 1;
            return Some(idx);
        }
        drop(inner);
        let drawn = self.region_ref().draw_from_global(1).ok()?;
        drawn.into_iter().next()
    }

    /// Returns a chunk to this pool, or to the global pool if that would put
    /// this pool's free list above its reserve watermark.
    pub(crate) fn release(&self, idx: u32) {
        let mut inner = self.0.borrow_mut();
        if inner.numfree >= inner.reserve {
            let region = inner.region.clone();
            drop(inner);
            region.return_to_global(idx);
            return;
        }
        let region = inner.region.clone();
        region.0.borrow_mut().headers[idx as usize] = ChunkHeader::Free { next: inner.free };
        inner.free = Some(idx);
        inner.numfree += 1;
    }

    pub(crate) fn region_ref(&self) -> ChunkRegion {
        self.0.borrow().region.clone()
    }

    /// Destroys the pool: asserts every chunk has been returned, then
    /// returns them all to the global pool.
    ///
    /// # Panics
    /// Panics (via `assert!`) if `numfree != reserve` -- i.e. some chunk is
    /// still on loan to a live objcache. This is a programming error, not a
    /// recoverable condition: callers must tear down every objcache bound
    /// to this pool first.
    pub fn destroy(self) {
        let inner = self.0.borrow();
        assert_eq!(
            inner.numfree, inner.reserve,
            "mempool '{}' destroyed with {} chunks still on loan",
            inner.label,
            inner.reserve - inner.numfree
        );
        let mut cur = inner.free;
        let region = inner.region.clone();
        drop(inner);
        while let Some(idx) = cur {
            cur = match &region.0.borrow().headers[idx as usize] {
                ChunkHeader::Free { next } => *next,
                ChunkHeader::InUse { .. } => unreachable!(),
            };
            region.return_to_global(idx);
        }
    }
}

impl Clone for Mempool {
    fn clone(&self) -> Self {
        Mempool(Rc::clone(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_new_rejects_zero_chunks() {
        assert!(ChunkRegion::new(0).is_err());
    }

    #[test]
    fn region_starts_fully_free() {
        let region = ChunkRegion::new(8).unwrap();
        assert_eq!(region.numchunks(), 8);
        assert_eq!(region.global_numfree(), 8);
    }

    #[test]
    fn mempool_draws_from_global() {
        let region = ChunkRegion::new(8).unwrap();
        let pool = Mempool::new(&region, "p", 3).unwrap();
        assert_eq!(pool.numfree(), 3);
        assert_eq!(region.global_numfree(), 5);
    }

    #[test]
    fn mempool_new_rejects_more_than_available() {
        let region = ChunkRegion::new(4).unwrap();
        assert!(Mempool::new(&region, "p", 5).is_err());
    }

    #[test]
    fn mempool_acquire_spills_to_global_when_local_free_list_empty() {
        let region = ChunkRegion::new(4).unwrap();
        let pool = Mempool::new(&region, "p", 1).unwrap();
        let first = pool.acquire().unwrap();
        // The pool's own free list is now empty; the next acquire must spill into the
        // global pool rather than returning None.
        let second = pool.acquire();
        assert!(second.is_some());
        assert_ne!(first, second.unwrap());
    }

    #[test]
    fn mempool_release_respects_reserve_watermark() {
        let region = ChunkRegion::new(4).unwrap();
        let pool = Mempool::new(&region, "p", 1).unwrap();
        let idx = pool.acquire().unwrap();
        // Acquiring above the reserve pulled one extra chunk from global; releasing
        // both back should leave the pool at its reserve and the rest in global.
        let extra = pool.acquire().unwrap();
        pool.release(idx);
        pool.release(extra);
        assert_eq!(pool.numfree(), pool.reserve());
    }

    #[test]
    #[should_panic(expected = "still on loan")]
    fn mempool_destroy_panics_if_chunks_outstanding() {
        let region = ChunkRegion::new(4).unwrap();
        let pool = Mempool::new(&region, "p", 2).unwrap();
        let _idx = pool.acquire().unwrap();
        pool.destroy();
    }

    #[test]
    fn mempool_destroy_returns_all_chunks_to_global() {
        let region = ChunkRegion::new(4).unwrap();
        let pool = Mempool::new(&region, "p", 2).unwrap();
        assert_eq!(region.global_numfree(), 2);
        pool.destroy();
        assert_eq!(region.global_numfree(), 4);
    }
}
