//! Base-128 varints (protobuf-style: 7 data bits per byte, MSB is the
//! continuation bit, little-endian group order). Used both for the tagged
//! event codec's field headers and for the outer length-delimited framing
//! `spec.md` §4.1 describes for the event stream.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use std::io::Read;

/// Maximum encoded length of a `u64` varint.
const MAX_VARINT_BYTES: usize = 10;

/// Append `value` to `buf` as a varint.
pub fn write_varint(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            break;
        } else {
            buf.put_u8(byte | 0x80);
        }
    }
}

/// Number of bytes `write_varint` would emit for `value`.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Read a varint from an in-memory buffer implementing `bytes::Buf`.
/// Fails with `CorruptRecord` on an overlong or unterminated sequence.
pub fn read_varint(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for _ in 0..MAX_VARINT_BYTES {
        if !buf.has_remaining() {
            return Err(Error::CorruptRecord("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::CorruptRecord("varint too long".to_string()))
}

/// Read a varint from a byte slice, returning the decoded value and the
/// number of bytes consumed.
pub fn read_varint_from_slice(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in data.iter().enumerate().take(MAX_VARINT_BYTES) {
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(Error::CorruptRecord("truncated or overlong varint".to_string()))
}

/// Read a varint from a blocking `Read` stream.
///
/// Returns `Ok(None)` only when EOF is hit before any byte of this varint is
/// read (a clean stream end between frames). An EOF encountered after at
/// least one byte has been consumed is a `TruncatedTail` — the frame that was
/// being read started but never finished, which is exactly the "partially
/// written open segment" case `spec.md` §4.2 asks callers to recover from by
/// truncation rather than treat as `CorruptRecord`.
pub fn read_varint_reader<R: Read>(r: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut byte_buf = [0u8; 1];
    for i in 0..MAX_VARINT_BYTES {
        match r.read(&mut byte_buf) {
            Ok(0) => {
                if i == 0 {
                    return Ok(None);
                }
                return Err(Error::TruncatedTail("EOF mid-varint".to_string()));
            }
            Ok(_) => {}
            Err(e) => return Err(Error::Io(e)),
        }
        let byte = byte_buf[0];
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
    }
    Err(Error::CorruptRecord("varint too long".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn round_trip_small_and_large_values() {
        for value in [0u64, 1, 127, 128, 300, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value));
            let mut reader = &buf[..];
            let decoded = read_varint(&mut reader).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn slice_decode_reports_consumed_length() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, 300);
        buf.put_u8(0xFF); // trailing garbage that must not be consumed
        let (value, consumed) = read_varint_from_slice(&buf).unwrap();
        assert_eq!(value, 300);
        assert_eq!(consumed, 2);
    }

    #[test]
    fn truncated_varint_is_corrupt() {
        let buf = [0x80u8]; // continuation bit set, then nothing
        let mut reader = &buf[..];
        let err = read_varint(&mut reader).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord(_)));
    }

    #[test]
    fn reader_distinguishes_clean_eof_from_truncated_tail() {
        let empty: &[u8] = &[];
        let mut r = empty;
        assert!(read_varint_reader(&mut r).unwrap().is_none());

        let partial = [0x80u8];
        let mut r2 = &partial[..];
        let err = read_varint_reader(&mut r2).unwrap_err();
        assert!(matches!(err, Error::TruncatedTail(_)));
    }
}
