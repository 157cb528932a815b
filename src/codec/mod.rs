//! Low-level wire primitives shared by the event codec (`core::event`) and
//! the segment stream framing (`storage::segment`).

pub mod varint;

pub use varint::{read_varint, read_varint_from_slice, varint_len, write_varint};
