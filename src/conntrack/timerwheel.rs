//! Inactivity timeout wheel, driven by logical (packet-timestamp) time rather than wall-clock
//! time: the core never suspends between packets, so "now" only ever advances when a new
//! packet's timestamp says it has.

use crate::conntrack::session::TcpSession;
use crate::conntrack::tcp_state::ConnState;

use std::collections::VecDeque;
use std::ptr::NonNull;

/// Tracks session expiration against logical time.
///
/// A session's applicable inactivity window isn't fixed at registration time: a half-open
/// session (`S1`) is held to the short `establish_timeout`, while anything past that uses the
/// longer `inactivity_timeout`. Rather than re-registering a timer every time a session's state
/// changes, the window is looked up from the session's *current* state each time its entry is
/// swept, so one registration at creation suffices for the session's whole life.
pub(super) struct TimerWheel {
    /// Period to check for inactive sessions (logical time units).
    period: u32,
    /// Inactivity window applied to a session still in `S1`.
    establish_timeout: u32,
    /// Inactivity window applied to a session past `S1`.
    inactivity_timeout: u32,
    /// Logical time of the first tick.
    start_ts: Option<u32>,
    /// Index of the next bucket to expire.
    next_bucket: usize,
    /// List of timers: each entry is a session and the id it was registered against (see
    /// [`TcpSession::id`]), so a timer entry left behind by a freed-and-reused slab slot can be
    /// recognized as stale instead of misapplied to the new occupant.
    timers: Vec<VecDeque<(NonNull<TcpSession>, u64)>>,
}

impl TimerWheel {
    /// Creates a new `TimerWheel`. `establish_timeout` bounds how long a half-open session may
    /// sit idle; `inactivity_timeout` bounds everything past that. `timeout_resolution` is the
    /// sweep granularity. All three are in logical time units (the packet timestamp's unit).
    pub(super) fn new(establish_timeout: u32, inactivity_timeout: u32, timeout_resolution: u32) -> Self {
        let max_timeout = establish_timeout.max(inactivity_timeout);
        if timeout_resolution > max_timeout {
            panic!("timeout check period must be smaller than maximum inactivity timeout");
        }
        TimerWheel {
            period: timeout_resolution,
            establish_timeout,
            inactivity_timeout,
            start_ts: None,
            next_bucket: 0,
            timers: vec![VecDeque::new(); (max_timeout / timeout_resolution).max(1) as usize],
        }
    }

    fn window_for(&self, state: ConnState) -> u32 {
        if state == ConnState::S1 {
            self.establish_timeout
        } else {
            self.inactivity_timeout
        }
    }

    /// Registers `session` (tagged with `id`, see [`TcpSession::id`]) for its first sweep,
    /// bucketed by `establish_timeout` since a session is always created in `S1`.
    pub(super) fn insert(&mut self, session: NonNull<TcpSession>, id: u64, last_seen_ts: u32) {
        let start = *self.start_ts.get_or_insert(last_seen_ts);
        let current_time = last_seen_ts.saturating_sub(start);
        let expire_time = current_time + self.establish_timeout;
        let nb_buckets = self.timers.len();
        let timer_index = ((expire_time / self.period) as usize) % nb_buckets;
        self.timers[timer_index].push_back((session, id));
    }

    /// Sweeps buckets between the last checkpoint and `now`, returning sessions that are
    /// genuinely past their expiry (re-bucketing the rest, since a session may have been touched,
    /// or left `S1`, since its timer was last evaluated). Entries whose recorded id no longer
    /// matches the session's current id are stale — the slab slot was freed and reused for an
    /// unrelated session since this entry was registered — and are dropped silently rather than
    /// acted on.
    pub(super) fn expire(&mut self, now: u32) -> Vec<NonNull<TcpSession>> {
        let start = match self.start_ts {
            Some(s) => s,
            None => return Vec::new(),
        };
        let nb_buckets = self.timers.len();
        let check_time = now.saturating_sub(start) / self.period * self.period;
        let last_expire_bucket = (check_time / self.period) as usize;

        let mut expired = Vec::new();
        let mut not_expired = Vec::new();

        for bucket in self.next_bucket..last_expire_bucket {
            let idx = bucket % nb_buckets;
            for (session, id) in self.timers[idx].drain(..) {
                let current = unsafe { session.as_ref() };
                if current.id != id {
                    continue;
                }
                let window = self.window_for(current.state);
                let expire_time = current.last_touched.saturating_sub(start) + window;
                if expire_time <= check_time {
                    expired.push(session);
                } else {
                    let reindex = (expire_time / self.period) as usize % nb_buckets;
                    not_expired.push((reindex, session, id));
                }
            }
        }
        for (idx, session, id) in not_expired {
            self.timers[idx].push_back((session, id));
        }
        self.next_bucket = last_expire_bucket;
        expired
    }
}
