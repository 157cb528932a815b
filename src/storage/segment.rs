//! On-disk segment file format (`spec.md` §4.2, §6.1): a fixed 64-byte
//! header, a stream of length-prefixed event frames, and — once the segment
//! is sealed — a footer carrying the event count, a bloom filter over UIDs,
//! and a per-kind histogram, all covered by a trailing CRC32C.
//!
//! Grounded on the teacher's `storage/segment_file.rs` (`SegmentWriter`/
//! `SegmentReader` split, header serialize/deserialize, finalize-returns-
//! header shape) with the on-disk layout replaced to match the format this
//! crate actually needs: no zstd block compression (not in the spec), CRC32C
//! instead of the teacher's CRC32 (`crc32c` crate, swapped in because §6.1
//! names Castagnoli explicitly), and an explicit sealed/open distinction
//! driven by the `.seg.tmp` → `.seg` rename the append path requires.

use crate::codec::varint::{read_varint_from_slice, write_varint};
use crate::core::event::{encode_frame, Event, EventKind, StreamDecoder};
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::storage::bloom::BloomFilter;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: &[u8; 8] = b"SPCTRSEG";
pub const SEGMENT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 64;
const FIXED_STRING_FIELD_LEN: usize = 16;

const FLAG_SEALED: u16 = 0x0001;

/// The 64-byte fixed segment header.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    pub version: u16,
    pub sealed: bool,
    pub bucket_start: Timestamp,
    pub bucket_end: Timestamp,
    pub cluster_id: String,
    pub instance_id: String,
}

impl SegmentHeader {
    fn new(bucket_start: Timestamp, bucket_end: Timestamp, cluster_id: &str, instance_id: &str) -> Self {
        Self {
            version: SEGMENT_VERSION,
            sealed: false,
            bucket_start,
            bucket_end,
            cluster_id: cluster_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }

    fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..10].copy_from_slice(&self.version.to_le_bytes());
        let flags = if self.sealed { FLAG_SEALED } else { 0 };
        buf[10..12].copy_from_slice(&flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.bucket_start.as_nanos().to_le_bytes());
        buf[20..28].copy_from_slice(&self.bucket_end.as_nanos().to_le_bytes());
        write_fixed_str(&mut buf[28..44], &self.cluster_id)?;
        write_fixed_str(&mut buf[44..60], &self.instance_id)?;
        // buf[60..64] reserved, zeroed.
        Ok(buf)
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::CorruptRecord("segment header truncated".to_string()));
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::CorruptRecord(format!(
                "bad segment magic: {:?}",
                &buf[0..8]
            )));
        }
        let version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        if version != SEGMENT_VERSION {
            return Err(Error::CorruptRecord(format!(
                "unsupported segment version {version}"
            )));
        }
        let flags = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let bucket_start = Timestamp::from_nanos(i64::from_le_bytes(buf[12..20].try_into().unwrap()));
        let bucket_end = Timestamp::from_nanos(i64::from_le_bytes(buf[20..28].try_into().unwrap()));
        let cluster_id = read_fixed_str(&buf[28..44])?;
        let instance_id = read_fixed_str(&buf[44..60])?;

        Ok(Self {
            version,
            sealed: flags & FLAG_SEALED != 0,
            bucket_start,
            bucket_end,
            cluster_id,
            instance_id,
        })
    }
}

fn write_fixed_str(slot: &mut [u8], s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > FIXED_STRING_FIELD_LEN {
        return Err(Error::Invariant(format!(
            "identifier '{s}' exceeds {FIXED_STRING_FIELD_LEN} bytes"
        )));
    }
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn read_fixed_str(slot: &[u8]) -> Result<String> {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    std::str::from_utf8(&slot[..end])
        .map(str::to_string)
        .map_err(|e| Error::CorruptRecord(format!("invalid UTF-8 in segment header: {e}")))
}

/// Footer metadata a sealed segment carries, returned to the caller (the
/// segment store) so it can update the manifest without re-reading the file.
#[derive(Debug, Clone)]
pub struct SegmentFooter {
    pub event_count: u32,
    pub bloom: BloomFilter,
    pub kind_histogram: BTreeMap<String, u32>,
}

fn encode_footer(footer_no_crc: &SegmentFooter, running_crc: u32) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(footer_no_crc.event_count);
    let bloom_bytes = footer_no_crc.bloom.as_bytes();
    buf.put_u32_le(bloom_bytes.len() as u32);
    buf.put_slice(bloom_bytes);
    buf.put_u16_le(footer_no_crc.kind_histogram.len() as u16);
    for (name, count) in &footer_no_crc.kind_histogram {
        write_varint(&mut buf, name.len() as u64);
        buf.put_slice(name.as_bytes());
        buf.put_u32_le(*count);
    }
    let crc = crc32c::crc32c_append(running_crc, &buf);
    buf.put_u32_le(crc);
    buf
}

fn decode_footer(buf: &[u8]) -> Result<(SegmentFooter, u32)> {
    if buf.len() < 4 {
        return Err(Error::CorruptRecord("footer truncated at event_count".to_string()));
    }
    let mut offset = 0;
    let event_count = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    offset += 4;

    let bloom_len = u32::from_le_bytes(
        buf.get(offset..offset + 4)
            .ok_or_else(|| Error::CorruptRecord("footer truncated at bloom_len".to_string()))?
            .try_into()
            .unwrap(),
    ) as usize;
    offset += 4;

    let bloom_bytes = buf
        .get(offset..offset + bloom_len)
        .ok_or_else(|| Error::CorruptRecord("footer truncated at bloom bytes".to_string()))?;
    offset += bloom_len;
    let bloom = BloomFilter::from_bytes(bloom_bytes);

    let kind_hist_len = u16::from_le_bytes(
        buf.get(offset..offset + 2)
            .ok_or_else(|| Error::CorruptRecord("footer truncated at kind_hist_len".to_string()))?
            .try_into()
            .unwrap(),
    );
    offset += 2;

    let mut kind_histogram = BTreeMap::new();
    for _ in 0..kind_hist_len {
        let (name_len, consumed) = read_varint_from_slice(&buf[offset..])?;
        offset += consumed;
        let name_len = name_len as usize;
        let name = std::str::from_utf8(
            buf.get(offset..offset + name_len)
                .ok_or_else(|| Error::CorruptRecord("footer truncated at kind name".to_string()))?,
        )
        .map_err(|e| Error::CorruptRecord(format!("invalid UTF-8 in kind histogram: {e}")))?
        .to_string();
        offset += name_len;
        let count = u32::from_le_bytes(
            buf.get(offset..offset + 4)
                .ok_or_else(|| Error::CorruptRecord("footer truncated at kind count".to_string()))?
                .try_into()
                .unwrap(),
        );
        offset += 4;
        kind_histogram.insert(name, count);
    }

    let crc = u32::from_le_bytes(
        buf.get(offset..offset + 4)
            .ok_or_else(|| Error::CorruptRecord("footer truncated at crc".to_string()))?
            .try_into()
            .unwrap(),
    );

    Ok((
        SegmentFooter {
            event_count,
            bloom,
            kind_histogram,
        },
        crc,
    ))
}

/// Writes the currently-open (unsealed) segment. Lives under `<bucket>.seg.tmp`
/// until `seal` renames it to `<bucket>.seg`.
pub struct SegmentWriter {
    file: File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    header: SegmentHeader,
    event_count: u32,
    bloom: BloomFilter,
    kind_histogram: BTreeMap<String, u32>,
    running_crc: u32,
    dirty_since_fsync: bool,
    min_event_ts: Option<Timestamp>,
    max_event_ts: Option<Timestamp>,
}

impl SegmentWriter {
    /// Create a brand new open segment for `bucket_start..bucket_end`.
    pub fn create(
        dir: &Path,
        bucket_start: Timestamp,
        bucket_end: Timestamp,
        cluster_id: &str,
        instance_id: &str,
        expected_events: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let final_path = dir.join(format!("{}.seg", bucket_start.as_secs()));
        let tmp_path = dir.join(format!("{}.seg.tmp", bucket_start.as_secs()));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let header = SegmentHeader::new(bucket_start, bucket_end, cluster_id, instance_id);
        file.write_all(&header.encode()?)?;
        file.sync_all()?;

        Ok(Self {
            file,
            tmp_path,
            final_path,
            header,
            event_count: 0,
            bloom: BloomFilter::with_capacity(expected_events),
            kind_histogram: BTreeMap::new(),
            running_crc: 0,
            dirty_since_fsync: false,
            min_event_ts: None,
            max_event_ts: None,
        })
    }

    /// Reopen a segment left behind as `.seg.tmp` by a crash: replay its
    /// frames, stopping at the first `TruncatedTail`, truncating the file to
    /// the last valid frame boundary, and reconstructing in-memory state so
    /// appends can resume. Returns the writer plus the events recovered, so
    /// the caller can re-derive any downstream state (e.g. re-feed them to
    /// the pipeline if they hadn't been acknowledged).
    pub fn recover(tmp_path: PathBuf, final_path: PathBuf) -> Result<(Self, Vec<Event>)> {
        let mut file = OpenOptions::new().read(true).write(true).open(&tmp_path)?;
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = SegmentHeader::decode(&header_buf)?;
        if header.sealed {
            return Err(Error::CorruptRecord(format!(
                "{} is sealed but still has a .seg.tmp extension",
                tmp_path.display()
            )));
        }

        let mut bloom = BloomFilter::with_capacity(1024);
        let mut kind_histogram = BTreeMap::new();
        let mut event_count = 0u32;
        let mut running_crc = 0u32;
        let mut recovered = Vec::new();
        let mut valid_end = HEADER_SIZE as u64;
        let mut min_event_ts = None;
        let mut max_event_ts = None;

        file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut rest = Vec::new();
        file.read_to_end(&mut rest)?;
        let mut decoder = StreamDecoder::new(&rest[..]);
        loop {
            match decoder.next() {
                Some(Ok(event)) => {
                    let frame = encode_frame(&event);
                    running_crc = crc32c::crc32c_append(running_crc, &frame);
                    bloom.insert(event.uid.as_bytes());
                    *kind_histogram.entry(event.kind.name().to_string()).or_insert(0) += 1;
                    event_count += 1;
                    valid_end += frame.len() as u64;
                    min_event_ts = Some(min_event_ts.map_or(event.timestamp, |m: Timestamp| m.min(event.timestamp)));
                    max_event_ts = Some(max_event_ts.map_or(event.timestamp, |m: Timestamp| m.max(event.timestamp)));
                    recovered.push(event);
                }
                Some(Err(Error::TruncatedTail(_))) | None => break,
                Some(Err(e)) => return Err(e),
            }
        }

        file.set_len(valid_end)?;
        file.seek(SeekFrom::End(0))?;

        Ok((
            Self {
                file,
                tmp_path,
                final_path,
                header,
                event_count,
                bloom,
                kind_histogram,
                running_crc,
                dirty_since_fsync: false,
                min_event_ts,
                max_event_ts,
            },
            recovered,
        ))
    }

    pub fn bucket_start(&self) -> Timestamp {
        self.header.bucket_start
    }

    pub fn bucket_end(&self) -> Timestamp {
        self.header.bucket_end
    }

    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    /// Earliest event timestamp appended so far, if any.
    pub fn min_event_ts(&self) -> Option<Timestamp> {
        self.min_event_ts
    }

    /// Latest event timestamp appended so far, if any.
    pub fn max_event_ts(&self) -> Option<Timestamp> {
        self.max_event_ts
    }

    /// Append one encoded event frame, updating in-memory bloom, histogram,
    /// and running CRC. Does not fsync — the caller (the segment store)
    /// batches fsyncs on its own interval per `spec.md` §4.2 step 4.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        if event.timestamp < self.header.bucket_start || event.timestamp >= self.header.bucket_end {
            return Err(Error::Invariant(format!(
                "event timestamp {} outside segment bucket [{}, {})",
                event.timestamp.as_nanos(),
                self.header.bucket_start.as_nanos(),
                self.header.bucket_end.as_nanos()
            )));
        }

        let frame = encode_frame(event);
        self.file.write_all(&frame)?;
        self.running_crc = crc32c::crc32c_append(self.running_crc, &frame);
        self.bloom.insert(event.uid.as_bytes());
        *self.kind_histogram.entry(event.kind.name().to_string()).or_insert(0) += 1;
        self.event_count += 1;
        self.min_event_ts = Some(self.min_event_ts.map_or(event.timestamp, |m| m.min(event.timestamp)));
        self.max_event_ts = Some(self.max_event_ts.map_or(event.timestamp, |m| m.max(event.timestamp)));
        self.dirty_since_fsync = true;
        Ok(())
    }

    pub fn has_unsynced_writes(&self) -> bool {
        self.dirty_since_fsync
    }

    /// Whether the segment's in-memory bloom admits `uid` — used by `Scan`
    /// to decide whether decoding the still-open segment is worth it.
    pub fn might_contain_uid(&self, uid: &str) -> bool {
        self.bloom.might_contain(uid.as_bytes())
    }

    /// Decode every frame appended so far by reopening the `.seg.tmp` file
    /// read-only. Used by `Scan` to make not-yet-sealed events visible
    /// (`spec.md` §4.2's "Scan after Append within `fsync_interval`"
    /// acceptance criterion) without disturbing the writer's own handle.
    pub fn scan_appended(&self) -> Result<Vec<Event>> {
        let mut file = File::open(&self.tmp_path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut events = Vec::new();
        for item in StreamDecoder::new(file) {
            match item {
                Ok(event) => events.push(event),
                Err(Error::TruncatedTail(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.dirty_since_fsync = false;
        Ok(())
    }

    /// Write the footer, flip the sealed flag, fsync, and rename
    /// `.seg.tmp` → `.seg`. Returns the footer and the path the segment now
    /// lives at.
    pub fn seal(mut self) -> Result<(SegmentFooter, PathBuf)> {
        let footer = SegmentFooter {
            event_count: self.event_count,
            bloom: self.bloom,
            kind_histogram: self.kind_histogram,
        };
        let footer_bytes = encode_footer(&footer, self.running_crc);
        self.file.write_all(&footer_bytes)?;

        self.header.sealed = true;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode()?)?;
        self.file.sync_all()?;
        drop(self.file);

        std::fs::rename(&self.tmp_path, &self.final_path)?;
        Ok((footer, self.final_path))
    }
}

/// Reads a sealed segment file.
pub struct SegmentReader {
    path: PathBuf,
    header: SegmentHeader,
    footer: SegmentFooter,
    payload_start: u64,
    payload_len: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = SegmentHeader::decode(&header_buf)?;
        if !header.sealed {
            return Err(Error::CorruptRecord(format!(
                "{} has a .seg extension but is not sealed",
                path.display()
            )));
        }

        // The footer's variable length means we must scan forward through
        // frames to find where the payload ends and the footer begins; the
        // footer only self-identifies via a CRC that also covers it, so we
        // try decoding a footer at each frame boundary until one validates.
        let mut rest = Vec::new();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        file.read_to_end(&mut rest)?;

        let mut offset = 0usize;
        loop {
            if offset >= rest.len() {
                return Err(Error::CorruptRecord("segment has no footer".to_string()));
            }
            if let Ok((footer, crc)) = decode_footer(&rest[offset..]) {
                let footer_without_crc_len = rest.len() - offset - 4;
                let mut computed_crc = crc32c::crc32c_append(0, &rest[..offset]);
                computed_crc =
                    crc32c::crc32c_append(computed_crc, &rest[offset..offset + footer_without_crc_len]);
                if computed_crc == crc && footer.event_count as usize == count_frames(&rest[..offset])? {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        header,
                        footer,
                        payload_start: HEADER_SIZE as u64,
                        payload_len: offset as u64,
                    });
                }
            }
            offset += advance_one_frame(&rest[offset..]).ok_or_else(|| {
                Error::CorruptRecord(format!("{}: could not locate footer", path.display()))
            })?;
        }
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    pub fn footer(&self) -> &SegmentFooter {
        &self.footer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn might_contain_uid(&self, uid: &str) -> bool {
        self.footer.bloom.might_contain(uid.as_bytes())
    }

    /// Lazily decode every event frame in the payload region.
    pub fn scan(&self) -> Result<impl Iterator<Item = Result<Event>>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.payload_start))?;
        let payload = file.take(self.payload_len);
        Ok(StreamDecoder::new(payload))
    }
}

fn count_frames(payload: &[u8]) -> Result<usize> {
    let mut offset = 0usize;
    let mut count = 0usize;
    while offset < payload.len() {
        let (len, consumed) = read_varint_from_slice(&payload[offset..])?;
        offset += consumed + len as usize;
        count += 1;
    }
    Ok(count)
}

fn advance_one_frame(payload: &[u8]) -> Option<usize> {
    let (len, consumed) = read_varint_from_slice(payload).ok()?;
    let total = consumed + len as usize;
    if total > payload.len() {
        None
    } else {
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_event(secs: i64, uid: &str) -> Event {
        Event::new(
            format!("evt-{secs}-{uid}"),
            Timestamp::from_secs(secs),
            "cluster-a".to_string(),
            "inst-1".to_string(),
            EventKind::ResourceAdded,
            "v1".to_string(),
            "Pod".to_string(),
            "default".to_string(),
            "my-pod".to_string(),
            uid.to_string(),
            serde_json::json!({}),
        )
    }

    #[test]
    fn write_seal_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let start = Timestamp::from_secs(1_000);
        let end = Timestamp::from_secs(2_000);
        let mut writer =
            SegmentWriter::create(dir.path(), start, end, "cluster-a", "inst-1", 10).unwrap();

        writer.append(&sample_event(1_100, "uid-1")).unwrap();
        writer.append(&sample_event(1_200, "uid-2")).unwrap();
        let (footer, final_path) = writer.seal().unwrap();

        assert_eq!(footer.event_count, 2);
        assert!(final_path.to_string_lossy().ends_with(".seg"));
        assert!(!final_path.to_string_lossy().ends_with(".tmp"));

        let reader = SegmentReader::open(&final_path).unwrap();
        assert!(reader.header().sealed);
        assert_eq!(reader.footer().event_count, 2);
        assert!(reader.might_contain_uid("uid-1"));
        assert!(!reader.might_contain_uid("uid-nonexistent"));

        let events: Vec<Event> = reader.scan().unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].uid, "uid-1");
    }

    #[test]
    fn append_rejects_event_outside_bucket() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(
            dir.path(),
            Timestamp::from_secs(1_000),
            Timestamp::from_secs(2_000),
            "cluster-a",
            "inst-1",
            10,
        )
        .unwrap();

        let result = writer.append(&sample_event(5_000, "uid-1"));
        assert!(matches!(result, Err(Error::Invariant(_))));
    }

    #[test]
    fn recover_replays_events_and_truncates_trailing_garbage() {
        let dir = TempDir::new().unwrap();
        let start = Timestamp::from_secs(1_000);
        let end = Timestamp::from_secs(2_000);
        let tmp_path = dir.path().join("1000.seg.tmp");
        let final_path = dir.path().join("1000.seg");

        {
            let mut writer =
                SegmentWriter::create(dir.path(), start, end, "cluster-a", "inst-1", 10).unwrap();
            writer.append(&sample_event(1_100, "uid-1")).unwrap();
            writer.append(&sample_event(1_200, "uid-2")).unwrap();
            // Simulate a crash mid-write: append a truncated trailing frame
            // directly, bypassing the normal append path.
            let mut raw = OpenOptions::new().append(true).open(&writer.tmp_path).unwrap();
            let mut garbage = BytesMut::new();
            write_varint(&mut garbage, 100); // length prefix, no payload follows
            raw.write_all(&garbage).unwrap();
            std::mem::forget(writer); // avoid sealing/renaming in this test
        }

        let (writer, recovered) = SegmentWriter::recover(tmp_path, final_path).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(writer.event_count(), 2);
    }
}
