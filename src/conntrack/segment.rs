//! TCP segment parser (C5): per-packet descriptor, checksum validation, TCP options, and
//! wrap-safe sequence arithmetic.

use crate::conntrack::tcp_state::TcpWindowState;
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::tcp::{Tcp, TCP_PROTOCOL};

use std::net::Ipv4Addr;

/// TCP option kind numbers (RFC 793 / RFC 1323).
mod opt {
    pub const EOL: u8 = 0;
    pub const NOP: u8 = 1;
    pub const SACK_PERMITTED: u8 = 4;
    pub const TIMESTAMP: u8 = 8;
    pub const WSCALE: u8 = 3;
}

/// `before(a, b)`: is `a` strictly before `b` in wrap-safe sequence-space order?
///
/// Implemented as the sign of the 32-bit signed difference `a - b`, so it tolerates a single
/// wraparound of the 32-bit sequence space.
#[inline]
pub fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `after(a, b) == before(b, a)`.
#[inline]
pub fn after(a: u32, b: u32) -> bool {
    before(b, a)
}

/// Is `s2` within the wrap-safe closed interval `[s1, s3]`?
#[inline]
pub fn between(s1: u32, s2: u32, s3: u32) -> bool {
    s3.wrapping_sub(s2) >= s1.wrapping_sub(s2)
}

/// The currently offered receive window, clamped to zero if it has collapsed.
#[inline]
pub fn receive_window(s: &TcpWindowState) -> u32 {
    let win = (s.rcv_wup.wrapping_add(s.rcv_wnd)).wrapping_sub(s.rcv_nxt) as i32;
    win.max(0) as u32
}

/// Is `[seq, seq_end)` within `s`'s currently offered window?
#[inline]
pub fn in_window(s: &TcpWindowState, seq: u32, seq_end: u32) -> bool {
    !before(seq_end, s.rcv_wup) && !after(seq, s.rcv_nxt.wrapping_add(receive_window(s)))
}

/// A parsed TCP option relevant to the flow tracker; all others are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SynOptions {
    pub sack_permitted: bool,
    pub timestamp: Option<(u32, u32)>, // (tsval, observed_at)
    pub window_scale: Option<u8>,
}

/// Scans `options` for relevant TCP options, stopping at an `EOL` option rather than continuing
/// past it (the original parser this is adapted from continues past `EOL` with a `TODO`
/// questioning that behavior; RFC 793 treats `EOL` as "no more options").
fn parse_options(options: &[u8], want_syn_fields: bool, observed_at: u32) -> (SynOptions, Option<u32>) {
    let mut syn = SynOptions::default();
    let mut tsval = None;
    let mut i = 0usize;

    while i < options.len() {
        match options[i] {
            opt::EOL => break,
            opt::NOP => {
                i += 1;
                continue;
            }
            _ => {}
        }

        if i + 1 >= options.len() {
            break;
        }
        let kind = options[i];
        let len = options[i + 1] as usize;

        match kind {
            opt::TIMESTAMP => {
                if i + 10 <= options.len() {
                    let v = u32::from_be_bytes(options[i + 2..i + 6].try_into().unwrap());
                    tsval = Some(v);
                    if want_syn_fields {
                        syn.timestamp = Some((v, observed_at));
                    } else {
                        // Fast mode only needs the timestamp value itself.
                        return (syn, tsval);
                    }
                }
            }
            opt::SACK_PERMITTED if want_syn_fields => syn.sack_permitted = true,
            opt::WSCALE if want_syn_fields => {
                if i + 2 < options.len() {
                    syn.window_scale = Some(options[i + 2].min(14));
                }
            }
            _ => {}
        }

        let step = if len < 2 {
            log::debug!("malformed tcp option length, clamping to 2");
            2
        } else {
            len
        };
        i += step;
    }

    (syn, tsval)
}

/// Fast-path options scan run on every packet: looks only for a timestamp option.
pub fn parse_fast_options(options: &[u8]) -> Option<u32> {
    parse_options(options, false, 0).1
}

/// Full options scan run on SYN packets: records SACK-permitted, timestamp, and window scale.
pub fn parse_syn_options(options: &[u8], observed_at: u32) -> SynOptions {
    parse_options(options, true, observed_at).0
}

/// Computes the TCP checksum over a pseudo-header, the TCP header, and payload, and reports
/// whether it is valid (the one's-complement of the folded sum is zero).
pub fn tcp_checksum_ok(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    let mut sum: u32 = 0;

    let src_octets = src.octets();
    let dst_octets = dst.octets();
    sum += u16::from_be_bytes([src_octets[0], src_octets[1]]) as u32;
    sum += u16::from_be_bytes([src_octets[2], src_octets[3]]) as u32;
    sum += u16::from_be_bytes([dst_octets[0], dst_octets[1]]) as u32;
    sum += u16::from_be_bytes([dst_octets[2], dst_octets[3]]) as u32;
    sum += TCP_PROTOCOL as u32;
    sum += segment.len() as u32;

    let mut chunks = segment.chunks_exact(2);
    for c in &mut chunks {
        sum += u16::from_be_bytes([c[0], c[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    (!sum as u16) == 0
}

/// The per-packet TCP segment descriptor the entry point builds before touching session state.
#[derive(Debug)]
pub struct TcpSegment<'a> {
    pub ts: u32,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ttl: u8,
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
    pub win: u16,
    pub len: usize,
    pub seq_end: u32,
    pub hash: u16,
    pub payload: &'a [u8],
    pub tsval: u32,
    pub saw_tstamp: bool,
    pub checksum_ok: bool,
}

impl<'a> TcpSegment<'a> {
    /// Builds a segment descriptor from a decoded IPv4/TCP header pair and the packet's logical
    /// timestamp. `tcp_buf` must be the raw bytes of the TCP header onward (header + options +
    /// payload), used for checksum validation.
    pub fn build(ts: u32, ipv4: &Ipv4<'a>, tcp: &Tcp<'a>, tcp_buf: &[u8]) -> Self {
        let ihl_bytes = (ipv4.ihl() as usize) * 4;
        let doff_bytes = (tcp.data_offset() as usize) * 4;
        let len = (ipv4.total_length() as usize)
            .saturating_sub(ihl_bytes)
            .saturating_sub(doff_bytes);

        let seq = tcp.seq_no();
        let hash = super::session::tcp_hashfn(
            ipv4.src_addr(),
            ipv4.dst_addr(),
            tcp.src_port(),
            tcp.dst_port(),
        );
        let payload = tcp_buf.get(doff_bytes..doff_bytes + len).unwrap_or(&[]);
        let tcp_segment_bytes = tcp_buf.get(..doff_bytes + len).unwrap_or(tcp_buf);

        let tsval = parse_fast_options(tcp.options());

        TcpSegment {
            ts,
            src_addr: ipv4.src_addr(),
            dst_addr: ipv4.dst_addr(),
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            ttl: ipv4.time_to_live(),
            flags: tcp.flags(),
            seq,
            ack: tcp.ack_no(),
            win: tcp.window(),
            len,
            seq_end: seq.wrapping_add(len as u32),
            hash,
            payload,
            tsval: tsval.unwrap_or(0),
            saw_tstamp: tsval.is_some(),
            checksum_ok: tcp_checksum_ok(ipv4.src_addr(), ipv4.dst_addr(), tcp_segment_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn before_after_tolerate_one_wraparound() {
        assert!(before(10, 20));
        assert!(after(20, 10));
        // Sequence space wrapped past u32::MAX.
        assert!(before(u32::MAX, 5));
        assert!(after(5, u32::MAX));
    }

    #[test]
    fn between_is_inclusive_on_both_ends() {
        assert!(between(10, 10, 20));
        assert!(between(10, 20, 20));
        assert!(between(10, 15, 20));
        assert!(!between(10, 25, 20));
    }

    #[test]
    fn receive_window_clamps_to_zero_when_collapsed() {
        let wnd = TcpWindowState {
            rcv_wup: 100,
            rcv_wnd: 10,
            rcv_nxt: 200, // past rcv_wup + rcv_wnd
            ..Default::default()
        };
        assert_eq!(receive_window(&wnd), 0);
    }

    #[test]
    fn parse_syn_options_reads_sack_timestamp_and_wscale() {
        // kind=SACK_PERMITTED(4) len=2, kind=TIMESTAMP(8) len=10 tsval=0x01020304
        // tsecr=0, kind=WSCALE(3) len=3 shift=7, EOL
        let options: [u8; 17] = [
            4, 2, 8, 10, 0x01, 0x02, 0x03, 0x04, 0, 0, 0, 0, 3, 3, 7, 0, 0,
        ];
        let parsed = parse_syn_options(&options, 42);
        assert!(parsed.sack_permitted);
        assert_eq!(parsed.timestamp, Some((0x01020304, 42)));
        assert_eq!(parsed.window_scale, Some(7));
    }

    #[test]
    fn parse_options_stops_at_eol_without_reading_past_it() {
        // A bogus SACK_PERMITTED option placed after an EOL must never be observed.
        let options: [u8; 4] = [0 /* EOL */, 4, 2, 0];
        let parsed = parse_syn_options(&options, 0);
        assert!(!parsed.sack_permitted);
    }

    #[test]
    fn parse_options_clamps_window_scale_to_14() {
        let options: [u8; 3] = [3, 3, 20];
        let parsed = parse_syn_options(&options, 0);
        assert_eq!(parsed.window_scale, Some(14));
    }

    #[test]
    fn parse_fast_options_only_reports_timestamp() {
        let options: [u8; 10] = [8, 10, 0, 0, 0, 7, 0, 0, 0, 0];
        assert_eq!(parse_fast_options(&options), Some(7));
    }

    #[test]
    fn tcp_checksum_ok_accepts_a_correctly_computed_checksum() {
        let src: Ipv4Addr = "192.0.2.1".parse().unwrap();
        let dst: Ipv4Addr = "192.0.2.2".parse().unwrap();

        // Minimal 20-byte TCP header, checksum field zeroed, no payload.
        let mut segment = [0u8; 20];
        segment[0..2].copy_from_slice(&1234u16.to_be_bytes()); // src port
        segment[2..4].copy_from_slice(&80u16.to_be_bytes()); // dst port
        segment[12] = 5 << 4; // data offset = 5 words

        let checksum = compute_checksum_for_test(src, dst, &segment);
        segment[16..18].copy_from_slice(&checksum.to_be_bytes());

        assert!(tcp_checksum_ok(src, dst, &segment));
        segment[16] ^= 0xff;
        assert!(!tcp_checksum_ok(src, dst, &segment));
    }

    /// Computes the checksum the same way `tcp_checksum_ok` validates it, so the fixture above
    /// can embed a correct value without hand-computing it.
    fn compute_checksum_for_test(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        let s = src.octets();
        let d = dst.octets();
        sum += u16::from_be_bytes([s[0], s[1]]) as u32;
        sum += u16::from_be_bytes([s[2], s[3]]) as u32;
        sum += u16::from_be_bytes([d[0], d[1]]) as u32;
        sum += u16::from_be_bytes([d[2], d[3]]) as u32;
        sum += TCP_PROTOCOL as u32;
        sum += segment.len() as u32;
        let mut chunks = segment.chunks_exact(2);
        for c in &mut chunks {
            sum += u16::from_be_bytes([c[0], c[1]]) as u32;
        }
        if let [last] = chunks.remainder() {
            sum += u16::from_be_bytes([*last, 0]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !sum as u16
    }
}
