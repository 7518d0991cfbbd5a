#![allow(clippy::needless_doctest_main)]

//! Flow-tracking and memory-management core for a passive network intrusion detection sensor.
//!
//! This crate reconstructs per-connection state from a stream of already-decoded IPv4/TCP
//! packets: it identifies each TCP conversation, advances a per-session state machine through
//! handshake, established and teardown phases, and maintains per-direction sequence/window
//! state. It deliberately stops there — packet capture, the layered protocol decode dispatch
//! table, stream reassembly and application-layer inspection are all out of scope; callers are
//! expected to hand this crate a [`protocols::packet::PacketBuf`] and a
//! [`conntrack::Dcb`] already located within it.
//!
//! Two building blocks make this up:
//!
//! - [`memory`]: a chunk-backed slab allocator ([`memory::ChunkRegion`], [`memory::Mempool`],
//!   [`memory::ObjCache`]) that every session, window-state and future per-flow record is
//!   allocated from. It exists because this crate targets sustained per-packet allocation rates
//!   where the general-purpose allocator's locking and fragmentation behavior would dominate.
//! - [`conntrack`]: the TCP flow tracker itself, built on top of the allocator.
//!
//! ```no_run
//! use sentryflow_core::conntrack::{Dcb, FlowTracker, TrackerConfig};
//! use sentryflow_core::protocols::packet::PacketBuf;
//!
//! # fn example(raw_packet: &[u8], ts: u32) -> anyhow::Result<()> {
//! let config = TrackerConfig {
//!     session_chunks: 256,
//!     window_chunks: 256,
//!     tcp_establish_timeout: 10_000,
//!     tcp_inactivity_timeout: 600_000,
//!     timeout_resolution: 1_000,
//! };
//! let mut tracker = FlowTracker::new(config)?;
//! let dcb = Dcb { iph_ptr: 0, tcph_ptr: 20 };
//! tracker.track(ts, PacketBuf::new(raw_packet), dcb)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conntrack;
pub mod memory;
pub mod protocols;
pub mod utils;

pub use self::conntrack::{Dcb, FlowTracker, TrackerConfig, TrackerStats};
pub use self::memory::{ChunkRegion, Mempool, ObjCache};
