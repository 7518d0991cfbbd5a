//! Connection state management.
//!
//! [`FlowTracker`] is the entry point (C7): it owns the session table (C4) and the object
//! caches sessions and per-direction window state are allocated from, and orchestrates the
//! segment parser (C5) and state machine (C6) on every packet.

pub mod segment;
pub mod session;
pub mod tcp_state;
mod timerwheel;

use crate::conntrack::segment::TcpSegment;
use crate::conntrack::session::{alloc_session, SessionTable, TcpSession};
use crate::conntrack::tcp_state::{transition, ConnState, TcpWindowState};
use crate::conntrack::timerwheel::TimerWheel;
use crate::memory::{ChunkRegion, Mempool, ObjCache};
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::tcp::Tcp;
use crate::protocols::packet::PacketBuf;

use std::ptr::NonNull;

use anyhow::Result;

/// Minimum TTL a segment must carry to be considered (RFC 793 evasion guard, not an actual
/// routing-layer TTL check — low-TTL packets are commonly used to evade a sensor sitting closer
/// to the monitor port than the intended TCP endpoint).
pub const MIN_TTL: u8 = 1;

/// Decode control block: the decoder that invoked this crate has already located the IPv4 and
/// TCP headers within `packet` and records their byte offsets here. Mirrors the narrow
/// `{iph_ptr, tcph_ptr}` descriptor this module is handed in production, where link-layer
/// decode and any encapsulation happen upstream.
#[derive(Debug, Clone, Copy)]
pub struct Dcb {
    pub iph_ptr: usize,
    pub tcph_ptr: usize,
}

/// Per-tracker counters, surfaced for monitoring; not used internally for control flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackerStats {
    pub segments: u64,
    pub ttl_dropped: u64,
    pub checksum_dropped: u64,
    pub sessions_created: u64,
    pub sessions_expired: u64,
    pub allocator_exhausted: u64,
}

/// Runtime configuration for a [`FlowTracker`]. See [`crate::config::ConnTrackConfig`] for the
/// on-disk representation this is built from.
#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub session_chunks: u32,
    pub window_chunks: u32,
    pub tcp_establish_timeout: u32,
    pub tcp_inactivity_timeout: u32,
    pub timeout_resolution: u32,
}

/// Owns the allocator handles, session table and timeout wheel for one packet stream. Not
/// `Send`/`Sync`: the core runs single-threaded on a sequential stream per pipeline (see
/// [`crate::conntrack::timerwheel`]).
pub struct FlowTracker {
    sessions: ObjCache,
    windows: ObjCache,
    table: SessionTable,
    timers: TimerWheel,
    stats: TrackerStats,
    /// Monotonic counter tagging each allocated session (see [`TcpSession::id`]), so the timer
    /// wheel can recognize a timer entry left behind by a freed-and-reused slab slot.
    next_session_id: u64,
}

impl FlowTracker {
    /// Builds a `FlowTracker` with its own chunk region, sized per `config`.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        let total_chunks = config.session_chunks + config.window_chunks;
        let region = ChunkRegion::new(total_chunks as usize)?;

        let session_pool = Mempool::new(&region, "tcp_sessions", config.session_chunks as usize)?;
        let sessions = ObjCache::new(&session_pool, "tcp_sessions", std::mem::size_of::<TcpSession>())?;

        let window_pool = Mempool::new(&region, "tcp_windows", config.window_chunks as usize)?;
        let windows = ObjCache::new(&window_pool, "tcp_windows", std::mem::size_of::<TcpWindowState>())?;

        Ok(FlowTracker {
            sessions,
            windows,
            table: SessionTable::new(),
            timers: TimerWheel::new(
                config.tcp_establish_timeout,
                config.tcp_inactivity_timeout,
                config.timeout_resolution,
            ),
            stats: TrackerStats::default(),
            next_session_id: 0,
        })
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    /// Runs one packet through the tracker: builds the segment descriptor (C5), validates it,
    /// looks up or creates a session (C4), runs the state machine (C6), and frees the session on
    /// teardown completion. Mirrors `_tcpflow_track`'s top-level dispatch.
    pub fn track(&mut self, ts: u32, packet: PacketBuf<'_>, dcb: Dcb) -> Result<()> {
        let ipv4 = Ipv4::parse(packet, dcb.iph_ptr)?;
        let tcp_buf = packet.slice_from(dcb.tcph_ptr);
        let tcp = Tcp::parse(packet, dcb.tcph_ptr)?;

        let seg = TcpSegment::build(ts, &ipv4, &tcp, tcp_buf);
        self.stats.segments += 1;

        if seg.ttl < MIN_TTL {
            self.stats.ttl_dropped += 1;
            log::debug!("ttl evasion guard: dropping segment with ttl {}", seg.ttl);
            return Ok(());
        }
        if !seg.checksum_ok {
            self.stats.checksum_dropped += 1;
            log::debug!("bad tcp checksum, dropping segment");
            return Ok(());
        }

        let lookup = self
            .table
            .lookup(seg.hash, seg.src_addr, seg.dst_addr, seg.src_port, seg.dst_port);

        let (mut session, from_client) = match lookup {
            Some(found) => {
                self.table.touch(found.session);
                (found.session, found.to_server)
            }
            None => match self.new_session(&seg, &tcp)? {
                Some(session) => (session, true),
                None => return Ok(()),
            },
        };

        let has_data = seg.len > 0;
        let prev = unsafe { session.as_ref().state };
        let next = transition(prev, from_client, seg.flags, has_data);

        // The server's SYN+ACK is the first segment carrying the server side's own initial
        // sequence number and window; this is where `s_wnd` gets populated, mirroring
        // `new_session`'s client-side `from_syn` call one RTT later.
        if prev == ConnState::S1 && next == ConnState::S2 && !from_client {
            match self.alloc_window() {
                Some(mut s_wnd) => {
                    unsafe {
                        std::ptr::write(s_wnd.as_mut(), TcpWindowState::from_syn(&seg, tcp.options()));
                        session.as_mut().s_wnd = Some(s_wnd);
                    }
                }
                None => {
                    self.stats.allocator_exhausted += 1;
                    log::error!("window cache exhausted, dropping new connection");
                    self.free_session(session);
                    return Ok(());
                }
            }
        }

        unsafe {
            session.as_mut().state = next;
            session.as_mut().last_touched = ts;
        }

        if next == ConnState::C {
            self.free_session(session);
        }

        Ok(())
    }

    /// Creates a new half-open session on a bare SYN, matching `new_session`'s requirement that
    /// the triggering segment carry exactly `SYN` among `SYN|ACK|FIN|RST`.
    fn new_session(&mut self, seg: &TcpSegment, tcp: &Tcp<'_>) -> Result<Option<NonNull<TcpSession>>> {
        use crate::protocols::packet::tcp::{ACK, FIN, RST, SYN};

        if seg.flags & (SYN | ACK | FIN | RST) != SYN {
            log::debug!("non-syn segment for unknown session, dropping");
            return Ok(None);
        }

        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);

        let session = match alloc_session(&self.sessions, id) {
            Some(s) => s,
            None => {
                self.stats.allocator_exhausted += 1;
                log::error!("session cache exhausted, dropping new connection");
                return Ok(None);
            }
        };

        unsafe {
            let s = session.as_ptr();
            (*s).c_addr = seg.src_addr;
            (*s).s_addr = seg.dst_addr;
            (*s).c_port = seg.src_port;
            (*s).s_port = seg.dst_port;
            (*s).state = ConnState::S1;
            (*s).c_wnd = TcpWindowState::from_syn(seg, tcp.options());
            (*s).last_touched = seg.ts;
        }

        self.table.insert(session);
        self.timers.insert(session, id, seg.ts);
        self.stats.sessions_created += 1;
        Ok(Some(session))
    }

    fn free_session(&mut self, mut session: NonNull<TcpSession>) {
        self.table.remove(session);

        unsafe {
            if let Some(s_wnd) = session.as_ref().s_wnd {
                self.windows.free_checked(s_wnd.cast());
            }
            // The objcache free path only overwrites the start of the object (to thread the
            // intra-chunk free-list pointer through it); `id`, being the last field, survives
            // untouched in a freed-but-not-yet-reused slot. A timer entry left behind by this
            // session would otherwise still read back a matching `id` and get misapplied a
            // second time once its window elapses. Stamp an id no real session will ever carry
            // so the wheel's staleness check catches it even without the slot being reused.
            session.as_mut().id = u64::MAX;
        }
        self.sessions.free_checked(session.cast());
        self.stats.sessions_expired += 1;
    }

    /// Sweeps sessions past their logical timeout, evaluated against `now` (the latest packet
    /// timestamp seen), not wall-clock time.
    pub fn expire(&mut self, now: u32) {
        let expired = self.timers.expire(now);
        for session in expired {
            log::debug!("session expired");
            self.free_session(session);
        }
    }

    /// Allocates a server-direction window state, used once the session sees its first
    /// server-originated segment (SYN+ACK).
    fn alloc_window(&self) -> Option<NonNull<TcpWindowState>> {
        self.windows.alloc().map(NonNull::cast)
    }
}

impl std::fmt::Debug for FlowTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTracker")
            .field("sessions", &self.table.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Builds a [`TrackerConfig`] from the on-disk [`crate::config::ConnTrackConfig`].
impl From<&crate::config::ConnTrackConfig> for TrackerConfig {
    fn from(config: &crate::config::ConnTrackConfig) -> Self {
        TrackerConfig {
            session_chunks: config.session_chunks,
            window_chunks: config.window_chunks,
            tcp_establish_timeout: config.tcp_establish_timeout,
            tcp_inactivity_timeout: config.tcp_inactivity_timeout,
            timeout_resolution: config.timeout_resolution,
        }
    }
}
