//! Session table (C4): hash-bucketed TCP sessions with move-to-front collision chains and an
//! LRU list for timeout/reap ordering.

use crate::conntrack::tcp_state::{ConnState, TcpWindowState};
use crate::memory::ObjCache;

use std::net::Ipv4Addr;
use std::ptr::NonNull;

/// Number of hash buckets. Must be a power of two so the hash can be reduced with a mask
/// instead of a modulo.
pub const TCPHASH: usize = 1024;

/// Symmetric hash: both directions of the same flow fold to the same bucket, since
/// `(saddr ^ sport) ^ (daddr ^ dport)` is invariant under swapping (saddr,sport) with
/// (daddr,dport).
pub fn tcp_hashfn(saddr: Ipv4Addr, daddr: Ipv4Addr, sport: u16, dport: u16) -> u16 {
    let s = u32::from(saddr) ^ (sport as u32);
    let d = u32::from(daddr) ^ (dport as u32);
    let mut h = s ^ d;
    h ^= h >> 16;
    h ^= h >> 8;
    (h as usize % TCPHASH) as u16
}

/// A single tracked TCP connection.
///
/// Allocated out of an [`ObjCache`](crate::memory::ObjCache), so its address is stable for the
/// life of the session; the LRU list below is an intrusive doubly-linked list of raw pointers
/// into that stable storage, which is safe only because of that stability guarantee.
pub struct TcpSession {
    pub c_addr: Ipv4Addr,
    pub s_addr: Ipv4Addr,
    pub c_port: u16,
    pub s_port: u16,
    pub state: ConnState,
    pub c_wnd: TcpWindowState,
    pub s_wnd: Option<NonNull<TcpWindowState>>,
    bucket: u16,
    lru_prev: Option<NonNull<TcpSession>>,
    lru_next: Option<NonNull<TcpSession>>,
    /// Logical (packet-timestamp) time this session was last touched; drives the timeout queue.
    pub last_touched: u32,
    /// Set once at allocation from a monotonic counter the tracker owns. A timer wheel entry
    /// records the `id` it was registered against; if the slab slot gets freed and reused for an
    /// unrelated session before the timer fires, the `id`s no longer match and the stale entry
    /// is recognized as such instead of misapplied to the new occupant.
    pub id: u64,
}

/// Outcome of a session table lookup: the matching session and whether the looked-up packet
/// was traveling towards the server.
pub struct Lookup {
    pub session: NonNull<TcpSession>,
    pub to_server: bool,
}

/// Hash-bucketed TCP session table with move-to-front chains and one global LRU list.
pub struct SessionTable {
    buckets: Vec<Vec<NonNull<TcpSession>>>,
    lru_head: Option<NonNull<TcpSession>>,
    lru_tail: Option<NonNull<TcpSession>>,
    count: usize,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            buckets: (0..TCPHASH).map(|_| Vec::new()).collect(),
            lru_head: None,
            lru_tail: None,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finds the session matching `(saddr, daddr, sport, dport)` in bucket `hash`, if any,
    /// determines direction, and moves the session to the front of its collision chain.
    pub fn lookup(
        &mut self,
        hash: u16,
        saddr: Ipv4Addr,
        daddr: Ipv4Addr,
        sport: u16,
        dport: u16,
    ) -> Option<Lookup> {
        let bucket = &mut self.buckets[hash as usize];
        let pos = bucket.iter().position(|&ptr| {
            let s = unsafe { ptr.as_ref() };
            (s.s_addr == saddr && s.c_addr == daddr && s.s_port == sport && s.c_port == dport)
                || (s.c_addr == saddr && s.s_addr == daddr && s.c_port == sport && s.s_port == dport)
        })?;

        let to_server = {
            let s = unsafe { bucket[pos].as_ref() };
            s.c_addr == saddr && s.c_port == sport
        };

        // Move to front of the collision chain (MTF).
        let ptr = bucket.remove(pos);
        bucket.insert(0, ptr);

        Some(Lookup { session: ptr, to_server })
    }

    /// Inserts a freshly allocated session into its bucket (front) and the LRU list (head).
    pub fn insert(&mut self, session: NonNull<TcpSession>) {
        let hash = tcp_hashfn(
            unsafe { session.as_ref() }.c_addr,
            unsafe { session.as_ref() }.s_addr,
            unsafe { session.as_ref() }.c_port,
            unsafe { session.as_ref() }.s_port,
        );
        unsafe {
            (*session.as_ptr()).bucket = hash;
        }
        self.buckets[hash as usize].insert(0, session);
        self.lru_push_front(session);
        self.count += 1;
    }

    /// Removes a session from its bucket and from the LRU list. Does not free its storage.
    pub fn remove(&mut self, session: NonNull<TcpSession>) {
        let bucket_idx = unsafe { session.as_ref() }.bucket as usize;
        let bucket = &mut self.buckets[bucket_idx];
        if let Some(pos) = bucket.iter().position(|&p| p == session) {
            bucket.remove(pos);
        }
        self.lru_unlink(session);
        self.count -= 1;
    }

    /// Moves `session` to the head of the LRU list; called after processing every packet.
    pub fn touch(&mut self, session: NonNull<TcpSession>) {
        self.lru_unlink(session);
        self.lru_push_front(session);
    }

    /// Returns the least-recently-touched session, for timeout sweeps.
    pub fn lru_tail(&self) -> Option<NonNull<TcpSession>> {
        self.lru_tail
    }

    fn lru_push_front(&mut self, mut session: NonNull<TcpSession>) {
        unsafe {
            session.as_mut().lru_prev = None;
            session.as_mut().lru_next = self.lru_head;
        }
        if let Some(mut head) = self.lru_head {
            unsafe { head.as_mut().lru_prev = Some(session) };
        }
        self.lru_head = Some(session);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(session);
        }
    }

    fn lru_unlink(&mut self, session: NonNull<TcpSession>) {
        let (prev, next) = unsafe {
            let s = session.as_ref();
            (s.lru_prev, s.lru_next)
        };
        match prev {
            Some(mut p) => unsafe { p.as_mut().lru_next = next },
            None => self.lru_head = next,
        }
        match next {
            Some(mut n) => unsafe { n.as_mut().lru_prev = prev },
            None => self.lru_tail = prev,
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}


/// Allocates a new half-open session (client side only) from `cache`, tags it with `id` (see
/// [`TcpSession::id`]), and initializes its identity fields. Window state is initialized by the
/// caller via [`TcpWindowState::from_syn`].
pub fn alloc_session(cache: &ObjCache, id: u64) -> Option<NonNull<TcpSession>> {
    let obj = cache.alloc_zeroed()?;
    let ptr = obj.cast::<TcpSession>();
    unsafe {
        std::ptr::write(
            ptr.as_ptr(),
            TcpSession {
                c_addr: Ipv4Addr::UNSPECIFIED,
                s_addr: Ipv4Addr::UNSPECIFIED,
                c_port: 0,
                s_port: 0,
                state: ConnState::S1,
                c_wnd: TcpWindowState::default(),
                s_wnd: None,
                bucket: 0,
                lru_prev: None,
                lru_next: None,
                last_touched: 0,
                id,
            },
        );
    }
    Some(ptr)
}
