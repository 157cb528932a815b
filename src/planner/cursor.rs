//! Opaque pagination cursor (`spec.md` §6.2): a base64 string encoding
//! `version(u8)=1 | last_kind_len(varint) | last_kind | last_ns_len |
//! last_ns | last_name_len | last_name | segment_idx(varint) |
//! intra_offset(varint)`.
//!
//! Grounded on no teacher analogue — the teacher had no pagination
//! concept — so this follows `codec::varint`'s own framing style (the one
//! other place in this crate packs a binary layout by hand) rather than
//! introducing a second wire format idiom.

use crate::codec::varint::{read_varint_from_slice, write_varint};
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{BufMut, BytesMut};

const CURSOR_VERSION: u8 = 1;

/// The decoded position a `next_cursor` resumes a paginated `GetTimeline`
/// scan from: the last resource fully delivered, plus how far into its
/// originating segment set the scan had gotten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub last_kind: String,
    pub last_namespace: String,
    pub last_name: String,
    pub segment_idx: u64,
    pub intra_offset: u64,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let mut buf = BytesMut::new();
        buf.put_u8(CURSOR_VERSION);
        write_len_prefixed(&mut buf, &self.last_kind);
        write_len_prefixed(&mut buf, &self.last_namespace);
        write_len_prefixed(&mut buf, &self.last_name);
        write_varint(&mut buf, self.segment_idx);
        write_varint(&mut buf, self.intra_offset);
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Decode a cursor string produced by [`Cursor::encode`] (this version
    /// or an earlier one, per §6.2's forward-compatibility rule — any
    /// future trailing optional fields are additive and this parser
    /// simply stops once the fields it knows about are read).
    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| Error::Query(format!("invalid cursor encoding: {e}")))?;
        if bytes.is_empty() {
            return Err(Error::Query("empty cursor".to_string()));
        }
        let version = bytes[0];
        if version != CURSOR_VERSION {
            return Err(Error::Query(format!("unsupported cursor version {version}")));
        }
        let mut offset = 1usize;
        let last_kind = read_len_prefixed(&bytes, &mut offset)?;
        let last_namespace = read_len_prefixed(&bytes, &mut offset)?;
        let last_name = read_len_prefixed(&bytes, &mut offset)?;
        let (segment_idx, consumed) = read_varint_from_slice(&bytes[offset..])?;
        offset += consumed;
        let (intra_offset, consumed) = read_varint_from_slice(&bytes[offset..])?;
        offset += consumed;
        let _ = offset;

        Ok(Cursor { last_kind, last_namespace, last_name, segment_idx, intra_offset })
    }
}

fn write_len_prefixed(buf: &mut BytesMut, s: &str) {
    write_varint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

fn read_len_prefixed(bytes: &[u8], offset: &mut usize) -> Result<String> {
    let (len, consumed) = read_varint_from_slice(&bytes[*offset..])?;
    *offset += consumed;
    let len = len as usize;
    if *offset + len > bytes.len() {
        return Err(Error::Query("truncated cursor field".to_string()));
    }
    let s = std::str::from_utf8(&bytes[*offset..*offset + len])
        .map_err(|e| Error::Query(format!("invalid UTF-8 in cursor: {e}")))?
        .to_string();
    *offset += len;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Cursor {
        Cursor {
            last_kind: "Pod".to_string(),
            last_namespace: "default".to_string(),
            last_name: "my-pod".to_string(),
            segment_idx: 3,
            intra_offset: 42,
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let cursor = sample();
        let encoded = cursor.encode();
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn encoded_form_is_url_safe_base64() {
        let encoded = sample().encode();
        assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn rejects_an_unsupported_version_byte() {
        let mut raw = vec![99u8];
        raw.extend_from_slice(b"garbage");
        let encoded = URL_SAFE_NO_PAD.encode(raw);
        assert!(matches!(Cursor::decode(&encoded), Err(Error::Query(_))));
    }

    #[test]
    fn rejects_malformed_base64() {
        assert!(matches!(Cursor::decode("not valid base64!!!"), Err(Error::Query(_))));
    }
}
