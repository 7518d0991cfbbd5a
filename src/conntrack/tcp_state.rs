//! Flow state machine (C6): per-direction window state and session state progression.
//!
//! The state machine is a tagged enum with named transition functions rather than the
//! `state++` arithmetic between sub-states used in the parser this is adapted from, which
//! relied on declaration order between e.g. `CF1`/`CF2`/`CF3` matching `SF1`/`SF2`/`SF3`.

use crate::conntrack::segment::{parse_syn_options, TcpSegment};

use bitmask_enum::bitmask;

/// Options observed on a direction's SYN, recorded for the life of the connection.
#[bitmask(u8)]
pub enum TcpOptFlags {
    SackOk,
    TstampOk,
    WscaleOk,
}

/// Per-direction sequence, window and option state, initialized from that direction's SYN.
#[derive(Debug, Clone, Default)]
pub struct TcpWindowState {
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub rcv_wup: u32,
    pub rcv_wnd: u32,
    pub flags: TcpOptFlags,
    pub scale: u8,
    pub ts_recent: u32,
    pub ts_recent_stamp: u32,
}

impl TcpWindowState {
    /// Initializes window state from a direction's SYN segment: `snd_una = seq + 1`,
    /// `snd_nxt = snd_una + 1`, `rcv_wnd` from the advertised window, `rcv_wup = rcv_nxt`
    /// (i.e. zero, since this side hasn't received anything yet), and options from the SYN's
    /// options block.
    pub fn from_syn(seg: &TcpSegment, tcp_options: &[u8]) -> Self {
        let mut s = TcpWindowState {
            snd_una: seg.seq.wrapping_add(1),
            ..Default::default()
        };
        s.snd_nxt = s.snd_una.wrapping_add(1);
        s.rcv_wnd = seg.win as u32;
        s.rcv_wup = s.rcv_nxt;

        let opts = parse_syn_options(tcp_options, seg.ts);
        if opts.sack_permitted {
            s.flags |= TcpOptFlags::SackOk;
        }
        if let Some((tsval, observed_at)) = opts.timestamp {
            s.flags |= TcpOptFlags::TstampOk;
            s.ts_recent = tsval;
            s.ts_recent_stamp = observed_at;
        }
        if let Some(scale) = opts.window_scale {
            s.flags |= TcpOptFlags::WscaleOk;
            s.scale = scale;
        }
        s
    }
}

/// Session lifecycle state. `CFn`/`SFn` are mirror images of each other (client-initiated vs.
/// server-initiated teardown); `f1_processing`/`f2_processing`/`f3_processing` below dispatch on
/// either variant of a stage without caring which side started the close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// SYN seen, awaiting SYN+ACK.
    S1,
    /// SYN+ACK seen, awaiting final ACK.
    S2,
    /// ACK for the SYN+ACK seen, no data has flowed yet.
    S3,
    /// Established: data flowing in at least one direction.
    E,
    /// Client-initiated FIN, stage 1: FIN sent, awaiting ACK or simultaneous FIN.
    CF1,
    /// Client-initiated FIN, stage 2: ACKed (or simultaneous close seen), awaiting peer's FIN.
    CF2,
    /// Client-initiated FIN, stage 3: peer's FIN seen, awaiting final ACK.
    CF3,
    /// Server-initiated FIN, stage 1.
    SF1,
    /// Server-initiated FIN, stage 2.
    SF2,
    /// Server-initiated FIN, stage 3.
    SF3,
    /// Closed; eligible for reap (2MSL wait in the original, logical here).
    C,
}

/// `true` if `wnd` is the session's client-side window state (i.e. the packet that triggered
/// this transition was sent by the client).
pub type SenderIsClient = bool;

/// Runs one state transition given the current state, which side sent the packet, and its
/// flags. Returns the next state. Mirrors `state_track`'s dispatch switch, but as a pure
/// function of `(state, sender, flags)` with no hidden dependency on enum declaration order.
pub fn transition(state: ConnState, from_client: SenderIsClient, flags: u8, has_data: bool) -> ConnState {
    use crate::protocols::packet::tcp::{ACK, FIN, RST, SYN};

    let syn = flags & SYN != 0;
    let ack = flags & ACK != 0;
    let fin = flags & FIN != 0;
    let rst = flags & RST != 0;

    match state {
        ConnState::S1 => {
            if from_client {
                log::debug!("syn resend?");
                ConnState::S1
            } else if fin || rst {
                log::debug!("connection refused");
                ConnState::C
            } else if syn {
                log::debug!("syn+ack");
                ConnState::S2
            } else {
                state
            }
        }
        ConnState::S2 => {
            if !from_client {
                log::debug!("syn+ack resend?");
                ConnState::S2
            } else if ack {
                log::debug!("ack for syn+ack");
                ConnState::S3
            } else {
                state
            }
        }
        ConnState::S3 => {
            if !has_data {
                return state;
            }
            if from_client {
                log::debug!("client sent first data");
            } else {
                log::debug!("server sent first data");
            }
            e_processing(ConnState::E, from_client, fin)
        }
        ConnState::E => e_processing(state, from_client, fin),
        ConnState::CF1 | ConnState::SF1 => f1_processing(state, from_client, ack, fin),
        ConnState::CF2 | ConnState::SF2 => f2_processing(state, from_client, fin),
        ConnState::CF3 | ConnState::SF3 => f3_processing(state, from_client, ack),
        ConnState::C => {
            log::debug!("2MSL wait");
            ConnState::C
        }
    }
}

fn e_processing(state: ConnState, from_client: bool, fin: bool) -> ConnState {
    if !fin {
        return state;
    }
    if from_client {
        log::debug!("client close");
        ConnState::CF1
    } else {
        log::debug!("server close");
        ConnState::SF1
    }
}

/// `closer_is_client` is `true` when the side that opened this FIN stage (CFn) was the client.
fn closer_is_client(state: ConnState) -> bool {
    matches!(state, ConnState::CF1 | ConnState::CF2 | ConnState::CF3)
}

fn f1_processing(state: ConnState, from_client: bool, ack: bool, fin: bool) -> ConnState {
    let closer_is_client = closer_is_client(state);
    if from_client == closer_is_client {
        if fin {
            log::debug!("fin resend?");
        }
        return state;
    }
    if ack || fin {
        log::debug!("ack/simultaneous fin for our fin");
        return advance_f(state);
    }
    state
}

fn f2_processing(state: ConnState, from_client: bool, fin: bool) -> ConnState {
    let closer_is_client = closer_is_client(state);
    if from_client != closer_is_client && fin {
        log::debug!("final fin");
        return advance_f(state);
    }
    state
}

fn f3_processing(state: ConnState, from_client: bool, ack: bool) -> ConnState {
    let closer_is_client = closer_is_client(state);
    if from_client == closer_is_client && ack {
        log::debug!("teardown complete");
        return ConnState::C;
    }
    state
}

/// Advances a `CFn`/`SFn` state by one sub-stage, preserving which side is the closer.
fn advance_f(state: ConnState) -> ConnState {
    match state {
        ConnState::CF1 => ConnState::CF2,
        ConnState::CF2 => ConnState::CF3,
        ConnState::CF3 => ConnState::C,
        ConnState::SF1 => ConnState::SF2,
        ConnState::SF2 => ConnState::SF3,
        ConnState::SF3 => ConnState::C,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::packet::tcp::{ACK, FIN, PSH, RST, SYN};

    const CLIENT: bool = true;
    const SERVER: bool = false;

    /// Full client-initiated open/close handshake: SYN, SYN+ACK, ACK, data, ACK, then a
    /// standard (non-simultaneous) client-initiated four-way close.
    #[test]
    fn full_handshake_and_client_initiated_close() {
        let mut state = ConnState::S1;
        state = transition(state, SERVER, SYN | ACK, false);
        assert_eq!(state, ConnState::S2);
        state = transition(state, CLIENT, ACK, false);
        assert_eq!(state, ConnState::S3);
        state = transition(state, CLIENT, ACK | PSH, true);
        assert_eq!(state, ConnState::E);
        state = transition(state, SERVER, ACK, false);
        assert_eq!(state, ConnState::E);
        state = transition(state, CLIENT, FIN | ACK, false);
        assert_eq!(state, ConnState::CF1);
        state = transition(state, SERVER, ACK, false);
        assert_eq!(state, ConnState::CF2);
        state = transition(state, SERVER, FIN | ACK, false);
        assert_eq!(state, ConnState::CF3);
        state = transition(state, CLIENT, ACK, false);
        assert_eq!(state, ConnState::C);
    }

    /// Server refuses the connection with RST while still in `S1`.
    #[test]
    fn server_rst_in_s1_closes_immediately() {
        let state = transition(ConnState::S1, SERVER, RST | ACK, false);
        assert_eq!(state, ConnState::C);
    }

    /// `S3` only advances to `E` on a data-bearing segment; a bare ACK stays put.
    #[test]
    fn s3_requires_data_bearing_segment_to_reach_established() {
        let state = transition(ConnState::S3, CLIENT, ACK, false);
        assert_eq!(state, ConnState::S3);
        let state = transition(ConnState::S3, CLIENT, ACK, true);
        assert_eq!(state, ConnState::E);
    }

    /// Simultaneous close: the server FINs before acknowledging the client's FIN. Per the
    /// transition table, that FIN advances the closer's stage by exactly one step -- the same
    /// single step a plain ACK would cause -- never a double jump to `CF3`. The server's
    /// retransmitted FIN (unanswered until now) is what finally carries the stage from `CF2` to
    /// `CF3`.
    #[test]
    fn simultaneous_close_advances_one_stage_at_a_time() {
        let mut state = ConnState::E;
        state = transition(state, CLIENT, FIN | ACK, false);
        assert_eq!(state, ConnState::CF1);
        // Server FINs without having ACKed the client's FIN yet.
        state = transition(state, SERVER, FIN | ACK, false);
        assert_eq!(state, ConnState::CF2);
        // Server retransmits its FIN; this is what the table recognizes as the closer's peer
        // finally FINing, carrying CF2 -> CF3.
        state = transition(state, SERVER, FIN | ACK, false);
        assert_eq!(state, ConnState::CF3);
        state = transition(state, CLIENT, ACK, false);
        assert_eq!(state, ConnState::C);
    }

    #[test]
    fn from_syn_initializes_sequence_and_window_fields() {
        let ipv4_src: std::net::Ipv4Addr = "10.0.0.1".parse().unwrap();
        let ipv4_dst: std::net::Ipv4Addr = "10.0.0.2".parse().unwrap();
        let seg = TcpSegment {
            ts: 0,
            src_addr: ipv4_src,
            dst_addr: ipv4_dst,
            src_port: 1234,
            dst_port: 80,
            ttl: 64,
            flags: SYN,
            seq: 1000,
            ack: 0,
            win: 65535,
            len: 0,
            seq_end: 1000,
            hash: 0,
            payload: &[],
            tsval: 0,
            saw_tstamp: false,
            checksum_ok: true,
        };
        let wnd = TcpWindowState::from_syn(&seg, &[]);
        assert_eq!(wnd.snd_una, 1001);
        assert_eq!(wnd.snd_nxt, 1002);
        assert_eq!(wnd.rcv_wnd, 65535);
    }
}
