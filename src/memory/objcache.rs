//! Per-object-size slab cache (C3).
//!
//! An [`ObjCache`] carves fixed-size objects out of chunks borrowed from a
//! [`Mempool`]. Allocation tries three paths in order, matching
//! `do_alloc`/`alloc_from_partial`/`alloc_fast`/`alloc_slow` in the chunk
//! allocator this is adapted from:
//!
//! 1. pop an object off a partially-full chunk's intra-chunk free list;
//! 2. bump-allocate the next untouched object out of the current chunk;
//! 3. pull a fresh chunk from the pool and retry.

use crate::memory::error::AllocError;
use crate::memory::region::{ChunkRegion, Mempool, CHUNK_SIZE};

use std::cell::RefCell;
use std::mem::size_of;
use std::ptr::NonNull;
use std::rc::Rc;

use anyhow::Result;

/// Fill byte written over a freed object when the `poison` feature is on.
/// Purely a debugging aid; must never be relied on for correctness.
#[cfg(feature = "poison")]
const POISON_BYTE: u8 = 0x5a;

pub(crate) struct ObjCacheInner {
    label: String,
    obj_sz: usize,
    obj_per_chunk: u32,
    pool: Mempool,
    region: ChunkRegion,
    /// Chunk currently being bump-allocated from, and how many untouched
    /// objects remain in it.
    current_chunk: Option<u32>,
    bump_remaining: u32,
    bump_next: Option<NonNull<u8>>,
    /// Chunks with at least one object both allocated and freed, so their
    /// intra-chunk free list is non-empty.
    partials: Vec<u32>,
    /// Fully allocated chunks (no bump capacity, empty free list). Kept so
    /// a freed object can splice the chunk back into `partials`.
    full: Vec<u32>,
}

/// A fixed-object-size slab allocator bound to one [`Mempool`].
///
/// Cheap to clone: clones share the same backing chunks and free lists.
#[derive(Clone)]
pub struct ObjCache(Rc<RefCell<ObjCacheInner>>);

impl ObjCache {
    /// Binds a new cache of `obj_sz`-byte objects to `pool`. Object size is
    /// rounded up to the machine word size, matching the minimum needed to
    /// thread a free-list pointer through a freed object's own storage.
    pub fn new(pool: &Mempool, label: impl Into<String>, obj_sz: usize) -> Result<Self> {
        let label = label.into();
        if obj_sz == 0 {
            return Err(AllocError::InvalidObjectSize(label).into());
        }
        let obj_sz = obj_sz.max(size_of::<*const u8>());
        let obj_per_chunk = (CHUNK_SIZE / obj_sz) as u32;

        log::info!("objcache: init: {} (obj_sz={})", label, obj_sz);
        Ok(ObjCache(Rc::new(RefCell::new(ObjCacheInner {
            label,
            obj_sz,
            obj_per_chunk,
            pool: pool.clone(),
            region: pool.region_ref(),
            current_chunk: None,
            bump_remaining: 0,
            bump_next: None,
            partials: Vec::new(),
            full: Vec::new(),
        }))))
    }

    pub fn label(&self) -> String {
        self.0.borrow().label.clone()
    }

    pub fn obj_sz(&self) -> usize {
        self.0.borrow().obj_sz
    }

    /// Allocates one object, or `None` if the backing pool is exhausted.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        if let Some(obj) = self.alloc_from_partial() {
            return Some(obj);
        }
        if let Some(obj) = self.alloc_fast() {
            return Some(obj);
        }
        self.alloc_slow()
    }

    /// Like [`ObjCache::alloc`], but zero-fills the object first.
    pub fn alloc_zeroed(&self) -> Option<NonNull<u8>> {
        let obj = self.alloc()?;
        let sz = self.0.borrow().obj_sz;
        unsafe { std::ptr::write_bytes(obj.as_ptr(), 0, sz) };
        Some(obj)
    }

    fn alloc_from_partial(&self) -> Option<NonNull<u8>> {
        let mut inner = self.0.borrow_mut();
        let idx = *inner.partials.last()?;
        let region = inner.region.clone();
        let obj = region.pop_free_obj(idx).expect("partial chunk had empty free list");
        region.bump_inuse(idx, 1);
        if region.free_list_empty(idx) {
            inner.partials.pop();
            inner.full.push(idx);
            let (prev, next, _) = region.link_get(idx);
            region.link_set(idx, prev, next, true);
        }
        Some(obj)
    }

    fn alloc_fast(&self) -> Option<NonNull<u8>> {
        let mut inner = self.0.borrow_mut();
        if inner.bump_remaining == 0 {
            return None;
        }
        let ptr = inner.bump_next?;
        let obj_sz = inner.obj_sz;
        let idx = inner.current_chunk.expect("bump path requires a current chunk");
        inner.bump_remaining -= 1;
        inner.bump_next = if inner.bump_remaining == 0 {
            None
        } else {
            NonNull::new(unsafe { ptr.as_ptr().add(obj_sz) })
        };

        let region = inner.region.clone();
        region.bump_inuse(idx, 1);

        if inner.bump_remaining == 0 {
            // Bump capacity is exhausted. The chunk only belongs in `full` if its intra-chunk
            // free list is also empty; an object freed earlier out of this same chunk (while it
            // was still being bumped from) would already be sitting on that list, in which case
            // the chunk belongs in `partials` instead.
            if region.free_list_empty(idx) {
                inner.full.push(idx);
                let (prev, next, _) = region.link_get(idx);
                region.link_set(idx, prev, next, true);
            } else {
                inner.partials.push(idx);
            }
            inner.current_chunk = None;
        }
        Some(ptr)
    }

    fn alloc_slow(&self) -> Option<NonNull<u8>> {
        let idx = {
            let inner = self.0.borrow();
            inner.pool.acquire()
        }?;

        let (region, obj_sz, obj_per_chunk) = {
            let inner = self.0.borrow();
            (inner.region.clone(), inner.obj_sz, inner.obj_per_chunk)
        };
        let base = region.init_inuse(idx, Rc::downgrade(&self.0), obj_sz);

        let mut inner = self.0.borrow_mut();
        inner.current_chunk = Some(idx);
        inner.bump_remaining = obj_per_chunk - 1;
        inner.bump_next = if obj_per_chunk > 1 {
            NonNull::new(unsafe { base.as_ptr().add(obj_sz) })
        } else {
            None
        };
        drop(inner);
        region.bump_inuse(idx, 1);
        Some(base)
    }

    /// Frees `obj` back into `self`, asserting (in debug builds) that `obj`
    /// actually belongs to this cache. Prefer this over the freestanding
    /// [`objcache_free`] when the owning cache is already in hand.
    pub fn free_checked(&self, obj: NonNull<u8>) {
        let (idx, owner) = self.0.borrow().region.owner_of(obj);
        debug_assert!(
            owner.upgrade().is_some_and(|o| Rc::ptr_eq(&o, &self.0)),
            "free_checked: object does not belong to this cache"
        );
        self.free_into(idx, obj);
    }

    #[cfg(feature = "poison")]
    fn poison(&self, obj: NonNull<u8>) {
        let sz = self.0.borrow().obj_sz;
        unsafe { std::ptr::write_bytes(obj.as_ptr(), POISON_BYTE, sz) };
    }

    fn free_into(&self, idx: u32, obj: NonNull<u8>) {
        #[cfg(feature = "poison")]
        self.poison(obj);

        let mut inner = self.0.borrow_mut();
        let region = inner.region.clone();
        let was_full = region.free_list_empty(idx);
        region.push_free_obj(idx, obj);
        let remaining = region.bump_inuse(idx, -1);

        if remaining == 0 {
            // Chunk is now fully unused; hand it back to the pool.
            let (_, _, in_full) = region.link_get(idx);
            if in_full {
                inner.full.retain(|&i| i != idx);
            } else {
                inner.partials.retain(|&i| i != idx);
            }
            if inner.current_chunk == Some(idx) {
                inner.current_chunk = None;
                inner.bump_remaining = 0;
                inner.bump_next = None;
            }
            let pool = inner.pool.clone();
            drop(inner);
            pool.release(idx);
            return;
        }

        if was_full {
            inner.full.retain(|&i| i != idx);
            inner.partials.push(idx);
            let (prev, next, _) = region.link_get(idx);
            region.link_set(idx, prev, next, false);
        }
    }
}

/// Frees `obj` back into whichever cache owns it, recovering the cache via
/// the region's chunk metadata rather than requiring a cache reference.
/// Mirrors `objcache_free(obj)` in the allocator this module is adapted
/// from.
///
/// # Panics
/// Panics if the owning cache has already been torn down, or if `obj` does
/// not point into a chunk owned by `region`.
pub fn objcache_free(region: &ChunkRegion, obj: NonNull<u8>) {
    let (idx, owner) = region.owner_of(obj);
    let cache = owner.upgrade().expect("objcache_free: owning cache no longer exists");
    ObjCache(cache).free_into(idx, obj);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(obj_sz: usize, chunks: usize) -> (ChunkRegion, Mempool, ObjCache) {
        let region = ChunkRegion::new(chunks).unwrap();
        let pool = Mempool::new(&region, "test", chunks).unwrap();
        let cache = ObjCache::new(&pool, "test", obj_sz).unwrap();
        (region, pool, cache)
    }

    #[test]
    fn new_rejects_zero_obj_size() {
        let region = ChunkRegion::new(1).unwrap();
        let pool = Mempool::new(&region, "p", 1).unwrap();
        assert!(ObjCache::new(&pool, "p", 0).is_err());
    }

    #[test]
    fn alloc_zeroed_returns_zeroed_memory() {
        let (_region, _pool, cache) = fixture(64, 1);
        let obj = cache.alloc_zeroed().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(obj.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn alloc_fills_one_chunk_then_draws_another() {
        let obj_sz = 64;
        let per_chunk = CHUNK_SIZE / obj_sz;
        let (_region, _pool, cache) = fixture(obj_sz, 2);

        let mut objs = Vec::new();
        for _ in 0..per_chunk {
            objs.push(cache.alloc().expect("chunk 1 should satisfy every allocation"));
        }
        // The first chunk's bump capacity is now exhausted; the next alloc must pull a
        // second chunk rather than returning None.
        assert!(cache.alloc().is_some());
    }

    /// A chunk whose bump capacity runs out with an empty free list is genuinely full: it must
    /// be moved into `full` and stop being the bump target, or it becomes unreachable from
    /// either list while still holding no free objects.
    #[test]
    fn bump_exhaustion_moves_the_chunk_to_full_and_clears_the_bump_target() {
        let obj_sz = 2048; // 4 objects per chunk
        let per_chunk = CHUNK_SIZE / obj_sz;
        let (_region, _pool, cache) = fixture(obj_sz, 1);

        for _ in 0..per_chunk {
            cache.alloc().expect("chunk should satisfy every allocation");
        }

        let inner = cache.0.borrow();
        assert!(inner.current_chunk.is_none());
        assert_eq!(inner.full.len(), 1);
        assert!(inner.partials.is_empty());
    }

    #[test]
    fn alloc_returns_none_once_pool_is_exhausted() {
        let obj_sz = CHUNK_SIZE; // exactly one object per chunk
        let (_region, _pool, cache) = fixture(obj_sz, 1);
        assert!(cache.alloc().is_some());
        assert!(cache.alloc().is_none());
    }

    #[test]
    fn freed_object_is_reused_by_next_alloc() {
        let (_region, _pool, cache) = fixture(CHUNK_SIZE, 1);
        let obj = cache.alloc().unwrap();
        assert!(cache.alloc().is_none());
        cache.free_checked(obj);
        let reused = cache.alloc();
        assert_eq!(reused, Some(obj));
    }

    #[test]
    fn objcache_free_recovers_owning_cache_from_region() {
        let (region, _pool, cache) = fixture(64, 1);
        let obj = cache.alloc().unwrap();
        objcache_free(&region, obj);
        // The object is back on the cache's free list, reachable through a normal alloc.
        assert_eq!(cache.alloc(), Some(obj));
    }

    #[test]
    #[should_panic(expected = "does not belong to this cache")]
    fn free_checked_rejects_object_from_a_different_cache() {
        let region = ChunkRegion::new(2).unwrap();
        let pool_a = Mempool::new(&region, "a", 1).unwrap();
        let pool_b = Mempool::new(&region, "b", 1).unwrap();
        let cache_a = ObjCache::new(&pool_a, "a", 64).unwrap();
        let cache_b = ObjCache::new(&pool_b, "b", 64).unwrap();

        let obj = cache_a.alloc().unwrap();
        cache_b.free_checked(obj);
    }
}
