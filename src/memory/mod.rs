//! Chunk-backed slab allocator.
//!
//! A [`ChunkRegion`] carves one contiguous reservation into fixed-size chunks.
//! [`Mempool`]s draw named reservations of chunks from the region, and
//! [`ObjCache`]s carve fixed-size objects out of chunks owned by a pool.
//!
//! This is adapted from the mbuf/mempool wrapper pattern used elsewhere in
//! this crate for DPDK buffers: a thin, `NonNull`-based handle over a single
//! backing allocation, with `thiserror` variants for the ways allocation can
//! fail. Unlike a DPDK mempool, the region here is process-owned (not
//! hardware-owned), so it is modeled as an explicit context rather than a
//! global singleton: tests can create isolated regions.

mod error;
mod objcache;
mod region;

pub use error::AllocError;
pub use objcache::ObjCache;
pub use region::{ChunkRegion, Mempool, CHUNK_SIZE};
