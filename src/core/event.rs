//! The canonical `Event` record (`spec.md` §3, §4.1) and its tagged binary
//! wire codec.
//!
//! Every event is immutable once constructed; the informer adapter that
//! authors events is out of scope here (`spec.md` §1) — this module only
//! defines the shape and the codec.

use crate::codec::varint::{read_varint_from_slice, read_varint_reader, varint_len, write_varint};
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::io::Read;

/// The four event kinds the informer adapter may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ResourceAdded,
    ResourceModified,
    ResourceDeleted,
    K8sEvent,
}

impl EventKind {
    fn wire_tag(self) -> u8 {
        match self {
            EventKind::ResourceAdded => 0,
            EventKind::ResourceModified => 1,
            EventKind::ResourceDeleted => 2,
            EventKind::K8sEvent => 3,
        }
    }

    fn from_wire_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(EventKind::ResourceAdded),
            1 => Ok(EventKind::ResourceModified),
            2 => Ok(EventKind::ResourceDeleted),
            3 => Ok(EventKind::K8sEvent),
            other => Err(Error::CorruptRecord(format!(
                "unknown event kind discriminant {other}"
            ))),
        }
    }

    /// Stable label used in the segment footer's kind histogram
    /// (`spec.md` §6.1) and in log fields.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::ResourceAdded => "ResourceAdded",
            EventKind::ResourceModified => "ResourceModified",
            EventKind::ResourceDeleted => "ResourceDeleted",
            EventKind::K8sEvent => "K8sEvent",
        }
    }
}

/// The canonical, immutable cluster-change record.
///
/// `unknown_fields` holds any wire tags this build doesn't recognize,
/// captured verbatim on decode and re-emitted on the next encode — this is
/// what keeps old binaries forward-compatible with newer optional fields
/// (`spec.md` §4.1).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub timestamp: Timestamp,
    pub cluster_id: String,
    pub instance_id: String,
    pub kind: EventKind,
    pub api_version: String,
    pub object_kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub manifest: serde_json::Value,
    pub parent_uid: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub unknown_fields: Vec<(u32, Vec<u8>)>,
}

/// Wire tag assignments. Stable once shipped — see `SPEC_FULL.md` §4.1.
mod tag {
    pub const ID: u32 = 1;
    pub const TIMESTAMP: u32 = 2;
    pub const CLUSTER_ID: u32 = 3;
    pub const INSTANCE_ID: u32 = 4;
    pub const KIND: u32 = 5;
    pub const API_VERSION: u32 = 6;
    pub const OBJECT_KIND: u32 = 7;
    pub const NAMESPACE: u32 = 8;
    pub const NAME: u32 = 9;
    pub const UID: u32 = 10;
    pub const MANIFEST: u32 = 11;
    pub const PARENT_UID: u32 = 12;
    pub const LABELS: u32 = 13;
}

impl Event {
    /// Construct an event with the identity fields required by every kind.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        timestamp: Timestamp,
        cluster_id: String,
        instance_id: String,
        kind: EventKind,
        api_version: String,
        object_kind: String,
        namespace: String,
        name: String,
        uid: String,
        manifest: serde_json::Value,
    ) -> Self {
        Self {
            id,
            timestamp,
            cluster_id,
            instance_id,
            kind,
            api_version,
            object_kind,
            namespace,
            name,
            uid,
            manifest,
            parent_uid: None,
            labels: BTreeMap::new(),
            unknown_fields: Vec::new(),
        }
    }

    pub fn with_parent_uid(mut self, parent_uid: String) -> Self {
        self.parent_uid = Some(parent_uid);
        self
    }

    pub fn with_label(mut self, key: String, value: String) -> Self {
        self.labels.insert(key, value);
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// The composed resource identity used to group events for timeline
    /// reconstruction: `(apiVersion, kind, namespace, name, uid)`.
    pub fn resource_identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            api_version: self.api_version.clone(),
            kind: self.object_kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }

    /// Deterministic tag/length/value encode. Two calls on an equal `Event`
    /// (including equal `unknown_fields`) byte-for-byte agree, satisfying the
    /// "deterministic codec" testable property in `spec.md` §8.
    pub fn encode(&self) -> Bytes {
        let mut fields: Vec<(u32, Vec<u8>)> = Vec::with_capacity(13 + self.unknown_fields.len());

        fields.push((tag::ID, self.id.clone().into_bytes()));
        fields.push((tag::TIMESTAMP, self.timestamp.as_nanos().to_le_bytes().to_vec()));
        fields.push((tag::CLUSTER_ID, self.cluster_id.clone().into_bytes()));
        fields.push((tag::INSTANCE_ID, self.instance_id.clone().into_bytes()));
        fields.push((tag::KIND, vec![self.kind.wire_tag()]));
        fields.push((tag::API_VERSION, self.api_version.clone().into_bytes()));
        fields.push((tag::OBJECT_KIND, self.object_kind.clone().into_bytes()));
        fields.push((tag::NAMESPACE, self.namespace.clone().into_bytes()));
        fields.push((tag::NAME, self.name.clone().into_bytes()));
        fields.push((tag::UID, self.uid.clone().into_bytes()));
        fields.push((
            tag::MANIFEST,
            serde_json::to_vec(&self.manifest).unwrap_or_default(),
        ));
        if let Some(parent_uid) = &self.parent_uid {
            fields.push((tag::PARENT_UID, parent_uid.clone().into_bytes()));
        }
        if !self.labels.is_empty() {
            fields.push((tag::LABELS, encode_labels(&self.labels)));
        }

        fields.extend(self.unknown_fields.iter().cloned());
        fields.sort_by_key(|(t, _)| *t);

        let total_len: usize = fields
            .iter()
            .map(|(t, v)| varint_len(*t as u64) + varint_len(v.len() as u64) + v.len())
            .sum();
        let mut buf = BytesMut::with_capacity(total_len);
        for (t, v) in fields {
            write_varint(&mut buf, t as u64);
            write_varint(&mut buf, v.len() as u64);
            buf.put_slice(&v);
        }
        buf.freeze()
    }

    /// Decode a single tagged-field record produced by `encode`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let mut id = None;
        let mut timestamp = None;
        let mut cluster_id = None;
        let mut instance_id = None;
        let mut kind = None;
        let mut api_version = None;
        let mut object_kind = None;
        let mut namespace = None;
        let mut name = None;
        let mut uid = None;
        let mut manifest = None;
        let mut parent_uid = None;
        let mut labels = BTreeMap::new();
        let mut unknown_fields = Vec::new();

        while offset < bytes.len() {
            let (t, consumed) = read_varint_from_slice(&bytes[offset..])?;
            offset += consumed;
            let (len, consumed) = read_varint_from_slice(&bytes[offset..])?;
            offset += consumed;
            let len = len as usize;
            if offset + len > bytes.len() {
                return Err(Error::CorruptRecord(
                    "field length exceeds remaining record".to_string(),
                ));
            }
            let value = &bytes[offset..offset + len];
            offset += len;

            match t as u32 {
                tag::ID => id = Some(utf8(value)?),
                tag::TIMESTAMP => timestamp = Some(decode_i64(value)?),
                tag::CLUSTER_ID => cluster_id = Some(utf8(value)?),
                tag::INSTANCE_ID => instance_id = Some(utf8(value)?),
                tag::KIND => {
                    if value.len() != 1 {
                        return Err(Error::CorruptRecord("bad kind field length".to_string()));
                    }
                    kind = Some(EventKind::from_wire_tag(value[0])?);
                }
                tag::API_VERSION => api_version = Some(utf8(value)?),
                tag::OBJECT_KIND => object_kind = Some(utf8(value)?),
                tag::NAMESPACE => namespace = Some(utf8(value)?),
                tag::NAME => name = Some(utf8(value)?),
                tag::UID => uid = Some(utf8(value)?),
                tag::MANIFEST => {
                    manifest = Some(serde_json::from_slice(value).map_err(|e| {
                        Error::CorruptRecord(format!("invalid manifest JSON: {e}"))
                    })?)
                }
                tag::PARENT_UID => parent_uid = Some(utf8(value)?),
                tag::LABELS => labels = decode_labels(value)?,
                other => unknown_fields.push((other, value.to_vec())),
            }
        }

        Ok(Event {
            id: require(id, "id")?,
            timestamp: Timestamp::from_nanos(require(timestamp, "timestamp")?),
            cluster_id: require(cluster_id, "cluster_id")?,
            instance_id: require(instance_id, "instance_id")?,
            kind: require(kind, "kind")?,
            api_version: require(api_version, "api_version")?,
            object_kind: require(object_kind, "object_kind")?,
            namespace: require(namespace, "namespace")?,
            name: require(name, "name")?,
            uid: require(uid, "uid")?,
            manifest: manifest.unwrap_or(serde_json::Value::Null),
            parent_uid,
            labels,
            unknown_fields,
        })
    }
}

/// The identity a group of events for one resource is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| Error::CorruptRecord(format!("missing required tag: {field}")))
}

fn utf8(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| Error::CorruptRecord(format!("invalid UTF-8: {e}")))
}

fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::CorruptRecord("bad i64 field length".to_string()))?;
    Ok(i64::from_le_bytes(arr))
}

fn encode_labels(labels: &BTreeMap<String, String>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for (k, v) in labels {
        write_varint(&mut buf, k.len() as u64);
        buf.put_slice(k.as_bytes());
        write_varint(&mut buf, v.len() as u64);
        buf.put_slice(v.as_bytes());
    }
    buf.to_vec()
}

fn decode_labels(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (klen, consumed) = read_varint_from_slice(&bytes[offset..])?;
        offset += consumed;
        let klen = klen as usize;
        if offset + klen > bytes.len() {
            return Err(Error::CorruptRecord("truncated label key".to_string()));
        }
        let key = utf8(&bytes[offset..offset + klen])?;
        offset += klen;

        let (vlen, consumed) = read_varint_from_slice(&bytes[offset..])?;
        offset += consumed;
        let vlen = vlen as usize;
        if offset + vlen > bytes.len() {
            return Err(Error::CorruptRecord("truncated label value".to_string()));
        }
        let value = utf8(&bytes[offset..offset + vlen])?;
        offset += vlen;

        labels.insert(key, value);
    }
    Ok(labels)
}

/// Write the outer size-delimited frame for one event: a varint byte length
/// followed by that many bytes of `Event::encode`'s output.
pub fn encode_frame(event: &Event) -> Bytes {
    let payload = event.encode();
    let mut buf = BytesMut::with_capacity(varint_len(payload.len() as u64) + payload.len());
    write_varint(&mut buf, payload.len() as u64);
    buf.put_slice(&payload);
    buf.freeze()
}

/// Read frames from `reader` until EOF, yielding decoded events.
///
/// A partial trailing frame (the stream ends mid varint, or ends after the
/// length prefix but before all payload bytes arrive) surfaces as
/// `Error::TruncatedTail`, never `CorruptRecord` — callers scanning a sealed
/// segment treat that as fatal for the segment, callers scanning the
/// still-open segment treat it as "truncate here and keep going".
pub struct StreamDecoder<R: Read> {
    reader: R,
}

impl<R: Read> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> Iterator for StreamDecoder<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = match read_varint_reader(&mut self.reader) {
            Ok(Some(len)) => len,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        let mut buf = vec![0u8; len as usize];
        if let Err(e) = self.reader.read_exact(&mut buf) {
            return Some(Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::TruncatedTail("EOF mid-event payload".to_string())
            } else {
                Error::Io(e)
            }));
        }
        Some(Event::decode(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event::new(
            "evt-1".to_string(),
            Timestamp::from_secs(1_000),
            "cluster-a".to_string(),
            "inst-1".to_string(),
            EventKind::ResourceAdded,
            "v1".to_string(),
            "Pod".to_string(),
            "default".to_string(),
            "my-pod".to_string(),
            "uid-123".to_string(),
            serde_json::json!({"status": {"phase": "Running"}}),
        )
        .with_label("app".to_string(), "web".to_string())
    }

    #[test]
    fn encode_decode_round_trip_is_byte_identical() {
        let event = sample_event();
        let a = event.encode();
        let b = event.encode();
        assert_eq!(a, b, "encode must be deterministic");

        let decoded = Event::decode(&a).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let mut event = sample_event();
        event.unknown_fields.push((99, vec![1, 2, 3]));
        let encoded = event.encode();
        let decoded = Event::decode(&encoded).unwrap();
        assert_eq!(decoded.unknown_fields, vec![(99, vec![1, 2, 3])]);

        // Re-encoding the decoded event reproduces the same bytes.
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn decode_rejects_truncated_record() {
        let event = sample_event();
        let encoded = event.encode();
        let truncated = &encoded[..encoded.len() - 3];
        assert!(matches!(
            Event::decode(truncated),
            Err(Error::CorruptRecord(_))
        ));
    }

    #[test]
    fn stream_decode_reads_multiple_frames_and_reports_truncated_tail() {
        let mut stream = BytesMut::new();
        stream.put_slice(&encode_frame(&sample_event()));
        stream.put_slice(&encode_frame(&sample_event()));
        // Append a partial trailing frame: a length prefix with no payload.
        write_varint(&mut stream, 50);

        let mut decoder = StreamDecoder::new(&stream[..]);
        assert!(decoder.next().unwrap().is_ok());
        assert!(decoder.next().unwrap().is_ok());
        match decoder.next() {
            Some(Err(Error::TruncatedTail(_))) => {}
            other => panic!("expected TruncatedTail, got {other:?}"),
        }
        assert!(decoder.next().is_none());
    }

    #[test]
    fn decode_rejects_invalid_utf8_in_string_field() {
        let event = sample_event();
        let mut encoded = event.encode().to_vec();
        // Corrupt the last byte of the record, which falls inside the
        // `labels` payload's value bytes for this fixture.
        let last = encoded.len() - 1;
        encoded[last] = 0xFF;
        let result = Event::decode(&encoded);
        assert!(result.is_err());
    }
}
