//! Wire-format parsing for the protocol layers the core understands.

pub mod packet;
