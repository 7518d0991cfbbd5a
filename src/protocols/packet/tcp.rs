//! TCP header.

use crate::protocols::packet::{Packet, PacketBuf, PacketHeader, PacketParseError};
use crate::utils::types::*;

use anyhow::{bail, Result};

/// TCP assigned protocol number.
pub const TCP_PROTOCOL: usize = 6;

// TCP flags.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// A TCP header, parsed from the decode control block's `tcph_ptr` offset.
///
/// TCP options are exposed as a raw byte slice; parsing them is the segment parser's job
/// (fast-path timestamp-only vs. full SYN-options parsing).
#[derive(Debug)]
pub struct Tcp<'a> {
    header: TcpHeader,
    offset: usize,
    buf: PacketBuf<'a>,
}

impl<'a> Tcp<'a> {
    /// Parses a TCP header directly at `offset` within `buf` (the decoder-supplied `tcph_ptr`).
    pub fn parse(buf: PacketBuf<'a>, offset: usize) -> Result<Self> {
        let header: TcpHeader = unsafe { buf.read_at(offset)? };
        if header.length() < TcpHeader::size_of() {
            bail!(PacketParseError::InvalidRead);
        }
        Ok(Tcp { header, offset, buf })
    }

    /// Returns the sending port.
    #[inline]
    pub fn src_port(&self) -> u16 {
        self.header.src_port.into()
    }

    /// Returns the receiving port.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.header.dst_port.into()
    }

    /// Returns the sequence number.
    #[inline]
    pub fn seq_no(&self) -> u32 {
        self.header.seq_no.into()
    }

    /// Returns the acknowledgment number.
    #[inline]
    pub fn ack_no(&self) -> u32 {
        self.header.ack_no.into()
    }

    /// Returns the header length measured in 32-bit words.
    #[inline]
    pub fn data_offset(&self) -> u8 {
        (self.header.data_offset_to_ns & 0xf0) >> 4
    }

    /// Returns the 8-bit TCP flags.
    #[inline]
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Returns the advertised receive window, unscaled.
    #[inline]
    pub fn window(&self) -> u16 {
        self.header.window.into()
    }

    /// Returns the 16-bit checksum field as transmitted.
    #[inline]
    pub fn checksum(&self) -> u16 {
        self.header.checksum.into()
    }

    /// Returns the raw options bytes (between the fixed header and the payload).
    #[inline]
    pub fn options(&self) -> &'a [u8] {
        let start = self.offset + TcpHeader::size_of();
        let end = self.offset + self.header_len();
        self.buf.slice_from(start).get(..end - start).unwrap_or(&[])
    }

    /// Returns `true` if the synchronize flag is set.
    #[inline]
    pub fn syn(&self) -> bool {
        (self.flags() & SYN) != 0
    }

    /// Returns `true` if the acknowledgment flag is set.
    #[inline]
    pub fn ack(&self) -> bool {
        (self.flags() & ACK) != 0
    }

    /// Returns `true` if the FIN flag is set.
    #[inline]
    pub fn fin(&self) -> bool {
        (self.flags() & FIN) != 0
    }

    /// Returns `true` if the reset flag is set.
    #[inline]
    pub fn rst(&self) -> bool {
        (self.flags() & RST) != 0
    }
}

impl<'a> Packet<'a> for Tcp<'a> {
    fn buf(&self) -> PacketBuf<'a> {
        self.buf
    }

    fn header_len(&self) -> usize {
        self.header.length()
    }

    fn next_header_offset(&self) -> usize {
        self.offset + self.header_len()
    }

    fn next_header(&self) -> Option<usize> {
        None
    }

    fn parse_from(_outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        bail!(PacketParseError::InvalidProtocol)
    }
}

/// Fixed portion of a TCP header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct TcpHeader {
    src_port: u16be,
    dst_port: u16be,
    seq_no: u32be,
    ack_no: u32be,
    data_offset_to_ns: u8,
    flags: u8,
    window: u16be,
    checksum: u16be,
    urgent_pointer: u16be,
}

impl PacketHeader for TcpHeader {
    /// Header length measured in bytes (the `Data Offset` field measures it in 32-bit words).
    fn length(&self) -> usize {
        ((self.data_offset_to_ns & 0xf0) >> 2).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a TCP segment (header, taking `data_offset` 32-bit words, plus `payload`) with the
    /// given fields.
    fn segment_bytes(
        sport: u16,
        dport: u16,
        seq: u32,
        ack: u32,
        data_offset: u8,
        flags: u8,
        window: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let header_len = (data_offset as usize) * 4;
        let mut buf = vec![0u8; header_len + payload.len()];
        buf[0..2].copy_from_slice(&sport.to_be_bytes());
        buf[2..4].copy_from_slice(&dport.to_be_bytes());
        buf[4..8].copy_from_slice(&seq.to_be_bytes());
        buf[8..12].copy_from_slice(&ack.to_be_bytes());
        buf[12] = data_offset << 4;
        buf[13] = flags;
        buf[14..16].copy_from_slice(&window.to_be_bytes());
        buf[header_len..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn parse_reads_fixed_header_fields() {
        let bytes = segment_bytes(1234, 80, 1000, 2000, 5, SYN | ACK, 65535, &[]);
        let buf = PacketBuf::new(&bytes);
        let tcp = Tcp::parse(buf, 0).unwrap();

        assert_eq!(tcp.src_port(), 1234);
        assert_eq!(tcp.dst_port(), 80);
        assert_eq!(tcp.seq_no(), 1000);
        assert_eq!(tcp.ack_no(), 2000);
        assert_eq!(tcp.data_offset(), 5);
        assert_eq!(tcp.window(), 65535);
        assert!(tcp.syn());
        assert!(tcp.ack());
        assert!(!tcp.fin());
        assert!(!tcp.rst());
    }

    #[test]
    fn options_slice_spans_only_the_bytes_between_header_and_payload() {
        // data_offset=6 -> 24-byte header, 4 bytes of options, then payload.
        let options = [1u8, 1, 1, 1]; // NOP NOP NOP NOP
        let mut bytes = segment_bytes(1234, 80, 0, 0, 6, ACK, 65535, b"payload");
        bytes[20..24].copy_from_slice(&options);

        let buf = PacketBuf::new(&bytes);
        let tcp = Tcp::parse(buf, 0).unwrap();

        assert_eq!(tcp.options(), &options);
        assert_eq!(tcp.header_len(), 24);
    }

    #[test]
    fn parse_rejects_a_header_length_shorter_than_the_fixed_header() {
        // Buffer holds a full 20-byte fixed header, but data_offset=4 claims only 16 bytes --
        // less than the fixed header itself.
        let mut bytes = segment_bytes(1234, 80, 0, 0, 5, ACK, 65535, &[]);
        bytes[12] = 4 << 4;
        let buf = PacketBuf::new(&bytes);
        assert!(Tcp::parse(buf, 0).is_err());
    }
}
