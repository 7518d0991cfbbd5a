//! IPv4 header.

use crate::protocols::packet::{Packet, PacketBuf, PacketHeader, PacketParseError};
use crate::utils::types::*;

use std::net::Ipv4Addr;

use anyhow::{bail, Result};

/// IPv4 assigned protocol number (IANA, within the IP protocol field, not an EtherType).
pub const IPV4_PROTOCOL: usize = 4;
/// Flag: "Reserved bit"
const IPV4_RF: u16 = 0x8000;
/// Flag: "Don't fragment"
const IPV4_DF: u16 = 0x4000;
/// Flag: "More fragments"
const IPV4_MF: u16 = 0x2000;
/// Fragment offset part
const IPV4_FRAG_OFFSET: u16 = 0x1FFF;

/// An IPv4 header, parsed from the decode control block's `iph_ptr` offset.
///
/// IPv4 options are not parsed; the core only needs the fixed header fields.
#[derive(Debug)]
pub struct Ipv4<'a> {
    header: Ipv4Header,
    offset: usize,
    buf: PacketBuf<'a>,
}

impl<'a> Ipv4<'a> {
    /// Parses an IPv4 header directly at `offset` within `buf` (the decoder-supplied `iph_ptr`).
    pub fn parse(buf: PacketBuf<'a>, offset: usize) -> Result<Self> {
        let header: Ipv4Header = unsafe { buf.read_at(offset)? };
        if header.version() != 4 {
            bail!(PacketParseError::InvalidProtocol);
        }
        Ok(Ipv4 { header, offset, buf })
    }

    /// Returns the IP protocol version.
    #[inline]
    pub fn version(&self) -> u8 {
        self.header.version()
    }

    /// Returns the header length measured in 32-bit words (IHL).
    #[inline]
    pub fn ihl(&self) -> u8 {
        self.header.version_ihl & 0x0f
    }

    /// Returns the total length of the packet in bytes, including the header and data.
    #[inline]
    pub fn total_length(&self) -> u16 {
        self.header.total_length.into()
    }

    /// Returns the 3-bit IP flags.
    #[inline]
    pub fn flags(&self) -> u8 {
        (u16::from(self.header.flags_to_fragment_offset) >> 13) as u8
    }

    /// Returns `true` if the Reserved flag is set.
    #[inline]
    pub fn rf(&self) -> bool {
        (u16::from(self.header.flags_to_fragment_offset) & IPV4_RF) != 0
    }

    /// Returns `true` if the Don't Fragment flag is set.
    #[inline]
    pub fn df(&self) -> bool {
        (u16::from(self.header.flags_to_fragment_offset) & IPV4_DF) != 0
    }

    /// Returns `true` if the More Fragments flag is set.
    #[inline]
    pub fn mf(&self) -> bool {
        (u16::from(self.header.flags_to_fragment_offset) & IPV4_MF) != 0
    }

    /// Returns the fragment offset in units of 8 bytes.
    #[inline]
    pub fn fragment_offset(&self) -> u16 {
        u16::from(self.header.flags_to_fragment_offset) & IPV4_FRAG_OFFSET
    }

    /// Returns the time to live (TTL) of the packet.
    #[inline]
    pub fn time_to_live(&self) -> u8 {
        self.header.time_to_live
    }

    /// Returns the encapsulated protocol identifier.
    #[inline]
    pub fn protocol(&self) -> u8 {
        self.header.protocol
    }

    /// Returns the sender's IPv4 address.
    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.src_addr))
    }

    /// Returns the receiver's IPv4 address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.header.dst_addr))
    }
}

impl<'a> Packet<'a> for Ipv4<'a> {
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
        Some(self.protocol().into())
    }

    fn parse_from(_outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        // The core is always handed a decode control block pointing directly at the IP
        // header; it never walks down from a link-layer packet. Use `Ipv4::parse` instead.
        bail!(PacketParseError::InvalidProtocol)
    }
}

/// Fixed portion of an IPv4 header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct Ipv4Header {
    version_ihl: u8,
    dscp_ecn: u8,
    total_length: u16be,
    identification: u16be,
    flags_to_fragment_offset: u16be,
    time_to_live: u8,
    protocol: u8,
    header_checksum: u16be,
    src_addr: u32be,
    dst_addr: u32be,
}

impl Ipv4Header {
    fn version(&self) -> u8 {
        (self.version_ihl & 0xf0) >> 4
    }
}

impl PacketHeader for Ipv4Header {
    /// Header length measured in bytes (`IHL` measures it in 32-bit words).
    fn length(&self) -> usize {
        ((self.version_ihl & 0xf) << 2).into()
    }
}
