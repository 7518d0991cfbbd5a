//! Types for parsing packet-level network protocols.
//!
//! The structure of this module is adapted from
//! [capsule::packets](https://docs.rs/capsule/0.1.5/capsule/packets/index.html) and
//! [pnet::packet](https://docs.rs/pnet/latest/pnet/packet/index.html): every packet type
//! represents a single frame on the wire, parsed from a borrowed byte buffer rather than an
//! owned mbuf, since the core never captures or allocates frame storage itself.

pub mod ipv4;
pub mod tcp;

use anyhow::Result;
use thiserror::Error;

/// A byte buffer holding one captured frame, supplied by the decoder that invokes the core.
///
/// The core does not own or allocate this buffer; it only borrows it for the duration of
/// `track`.
#[derive(Debug, Clone, Copy)]
pub struct PacketBuf<'a>(&'a [u8]);

impl<'a> PacketBuf<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PacketBuf(data)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads a `T` out of the buffer at `offset`, or errors if the buffer is too short.
    ///
    /// # Safety
    /// `T` must be a `#[repr(C, packed)]` type with no padding and no invalid bit patterns.
    pub(crate) unsafe fn read_at<T: Copy>(&self, offset: usize) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let slice = self
            .0
            .get(offset..offset + size)
            .ok_or(PacketParseError::InvalidRead)?;
        Ok(*(slice.as_ptr() as *const T))
    }

    /// Returns the subslice starting at `offset`, or an empty slice past the end of the buffer.
    pub(crate) fn slice_from(&self, offset: usize) -> &'a [u8] {
        self.0.get(offset..).unwrap_or(&[])
    }
}

/// Represents a single parsed packet layer.
pub trait Packet<'a> {
    /// Reference to the underlying packet buffer.
    fn buf(&self) -> PacketBuf<'a>;

    /// Offset from the beginning of the header to the start of the payload.
    fn header_len(&self) -> usize;

    /// Offset from the beginning of the packet buffer to the start of the payload.
    fn next_header_offset(&self) -> usize;

    /// Next level IANA protocol number.
    fn next_header(&self) -> Option<usize>;

    /// Parses the `Packet`'s payload as a new `Packet` of type `T`.
    fn parse_to<T: Packet<'a>>(&'a self) -> Result<T>
    where
        Self: Sized,
    {
        T::parse_from(self)
    }

    /// Parses a `Packet` from the outer encapsulating `Packet`'s payload.
    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized;
}

/// Represents a packet header.
pub trait PacketHeader {
    /// Offset from beginning of the header to start of the payload. Includes the length of any
    /// variable-sized options.
    fn length(&self) -> usize;

    /// Size of the fixed portion of the header in bytes.
    fn size_of() -> usize
    where
        Self: Sized,
    {
        std::mem::size_of::<Self>()
    }
}

#[derive(Error, Debug)]
pub(crate) enum PacketParseError {
    #[error("invalid protocol")]
    InvalidProtocol,

    #[error("invalid data read")]
    InvalidRead,
}
