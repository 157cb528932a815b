//! The segment store facade (`spec.md` §4.2): ties `SegmentWriter`,
//! `SegmentReader`, and `Manifest` together into the `Append`/`Scan`
//! operations C3 and C5 actually call.
//!
//! Grounded on the teacher's `storage/wal.rs` for the "one open writer per
//! key, seal-and-rotate on boundary crossing, batch fsyncs" shape (the
//! teacher batched fsyncs on a fixed interval for its write-ahead log; the
//! same policy applies here per bucket). The manifest-mutex-on-seal
//! coordination follows `spec.md` §5 ("manifest is shared read, updated by
//! C2 on seal under a short mutex").

use crate::core::event::Event;
use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::storage::manifest::{Manifest, SegmentEntry};
use crate::storage::segment::{SegmentReader, SegmentWriter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Tunables for the segment store, surfaced through `config::Config`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub bucket_duration_nanos: i64,
    pub fsync_interval: Duration,
    pub expected_events_per_segment: usize,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bucket_duration_nanos: Duration::from_secs(3600).as_nanos() as i64,
            fsync_interval: Duration::from_millis(250),
            expected_events_per_segment: 4096,
        }
    }
}

/// Predicate applied during `Scan`, mirroring the timeline planner's query
/// filters (`spec.md` §4.5): `namespaces`/`kinds` are inclusive arrays
/// (empty means "all"), the single-valued fields are legacy filters AND-ed
/// with the arrays.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub uid: Option<String>,
    pub namespace: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub namespaces: Vec<String>,
    pub kinds: Vec<String>,
    pub label_selector: Option<(String, String)>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(uid) = &self.uid {
            if &event.uid != uid {
                return false;
            }
        }
        if let Some(ns) = &self.namespace {
            if &event.namespace != ns {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &event.object_kind != kind {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &event.name != name {
                return false;
            }
        }
        if !self.namespaces.is_empty() && !self.namespaces.iter().any(|n| n == &event.namespace) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k == &event.object_kind) {
            return false;
        }
        if let Some((key, value)) = &self.label_selector {
            if event.labels.get(key) != Some(value) {
                return false;
            }
        }
        true
    }
}

struct OpenSegment {
    writer: SegmentWriter,
    last_fsync: Instant,
}

/// Key identifying one (cluster, instance)'s active append stream.
type StreamKey = (String, String);

/// The append-only, time-bucketed event store.
pub struct SegmentStore {
    config: StoreConfig,
    manifest: Mutex<Manifest>,
    open: Mutex<HashMap<StreamKey, OpenSegment>>,
}

impl SegmentStore {
    /// Open (or initialize) the store at `config.root`: rebuild the manifest
    /// from a directory scan and recover any `.seg.tmp` left by a crash.
    /// Returns the store plus any events recovered from an open segment
    /// (the caller — typically the rebuilder — may want to re-derive
    /// downstream state from them).
    pub fn open(config: StoreConfig) -> Result<(Self, Vec<Event>)> {
        let manifest = Manifest::scan_dir(&config.root)?;
        let mut open = HashMap::new();
        let mut recovered_all = Vec::new();

        for (tmp_path, final_path, cluster_id, instance_id) in find_leftover_tmp_segments(&config.root)? {
            let (writer, recovered) = SegmentWriter::recover(tmp_path, final_path)?;
            recovered_all.extend(recovered);
            open.insert((cluster_id, instance_id), OpenSegment { writer, last_fsync: Instant::now() });
        }

        Ok((
            Self { config, manifest: Mutex::new(manifest), open: Mutex::new(open) },
            recovered_all,
        ))
    }

    fn bucket_for(&self, ts: Timestamp) -> (Timestamp, Timestamp) {
        let d = self.config.bucket_duration_nanos;
        let start = (ts.as_nanos().div_euclid(d)) * d;
        (Timestamp::from_nanos(start), Timestamp::from_nanos(start + d))
    }

    fn dir_for(&self, cluster_id: &str, instance_id: &str) -> PathBuf {
        self.config.root.join(cluster_id).join(instance_id)
    }

    /// Append one event, sealing and rotating the open segment if it
    /// belongs to a new bucket (`spec.md` §4.2 steps 1-4).
    pub fn append(&self, event: &Event) -> Result<()> {
        let (bucket_start, bucket_end) = self.bucket_for(event.timestamp);
        let key = (event.cluster_id.clone(), event.instance_id.clone());
        let mut open = self.open.lock().map_err(|_| Error::Storage("open segment map poisoned".to_string()))?;

        if let Some(existing) = open.get(&key) {
            if existing.writer.bucket_start() != bucket_start {
                if bucket_start < existing.writer.bucket_start() {
                    return self.quarantine_late_event(&key.0, &key.1, event);
                }
                let sealed = open.remove(&key).expect("checked above");
                self.seal_and_record(sealed.writer)?;
            }
        }

        if !open.contains_key(&key) {
            let dir = self.dir_for(&key.0, &key.1);
            let writer = SegmentWriter::create(
                &dir,
                bucket_start,
                bucket_end,
                &key.0,
                &key.1,
                self.config.expected_events_per_segment,
            )?;
            open.insert(key.clone(), OpenSegment { writer, last_fsync: Instant::now() });
        }

        let segment = open.get_mut(&key).expect("just inserted or already present");
        segment.writer.append(event)?;

        if segment.last_fsync.elapsed() >= self.config.fsync_interval {
            segment.writer.fsync()?;
            segment.last_fsync = Instant::now();
        }

        Ok(())
    }

    /// An event whose bucket has already been sealed: append it to a
    /// `late.seg` append-only quarantine file under the bucket's directory
    /// instead of reopening a sealed segment (`spec.md` §5, late-event
    /// tolerance note).
    fn quarantine_late_event(&self, cluster_id: &str, instance_id: &str, event: &Event) -> Result<()> {
        use std::io::Write;
        let dir = self.dir_for(cluster_id, instance_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("late.seg");
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let frame = crate::core::event::encode_frame(event);
        file.write_all(&frame)?;
        file.sync_data()?;
        tracing::warn!(
            uid = %event.uid,
            path = %path.display(),
            "late event quarantined: its bucket was already sealed"
        );
        Ok(())
    }

    fn seal_and_record(&self, writer: SegmentWriter) -> Result<()> {
        let min_ts = writer.min_event_ts();
        let max_ts = writer.max_event_ts();
        let bucket_start = writer.bucket_start();
        let bucket_end = writer.bucket_end();
        let (footer, path) = writer.seal()?;
        let cluster_id_instance_id = parse_cluster_instance_from_path(&path, &self.config.root);
        let (cluster_id, instance_id) = cluster_id_instance_id;

        let entry = SegmentEntry {
            path,
            cluster_id,
            instance_id,
            bucket_start,
            bucket_end,
            event_count: footer.event_count,
            first_ts: min_ts.unwrap_or(bucket_start),
            last_ts: max_ts.unwrap_or(bucket_start),
            bloom_present: true,
        };

        let mut manifest = self.manifest.lock().map_err(|_| Error::Storage("manifest poisoned".to_string()))?;
        manifest.record_seal(entry)
    }

    /// Force-seal every open segment, e.g. on graceful shutdown. Segments
    /// with no events are still sealed (an empty bloom/histogram is valid).
    pub fn seal_all(&self) -> Result<()> {
        let mut open = self.open.lock().map_err(|_| Error::Storage("open segment map poisoned".to_string()))?;
        for (_, segment) in open.drain() {
            self.seal_and_record(segment.writer)?;
        }
        Ok(())
    }

    /// Scan `[start, end]` for `(cluster_id, instance_id)`, applying
    /// `filter` (`spec.md` §4.2 read path).
    pub fn scan(
        &self,
        cluster_id: &str,
        instance_id: &str,
        start: Timestamp,
        end: Timestamp,
        filter: EventFilter,
    ) -> Result<ScanIter> {
        let manifest = self.manifest.lock().map_err(|_| Error::Storage("manifest poisoned".to_string()))?;
        let segments: std::collections::VecDeque<SegmentEntry> = manifest
            .select(cluster_id, instance_id, start, end)
            .into_iter()
            .cloned()
            .collect();
        drop(manifest);

        let open_tail = {
            let open = self.open.lock().map_err(|_| Error::Storage("open segment map poisoned".to_string()))?;
            match open.get(&(cluster_id.to_string(), instance_id.to_string())) {
                Some(segment)
                    if segment.writer.bucket_start() <= end && segment.writer.bucket_end() > start =>
                {
                    Some(segment.writer.scan_appended()?.into_iter())
                }
                _ => None,
            }
        };

        Ok(ScanIter { segments, current: None, open_tail, start, end, filter })
    }

    pub fn manifest_len(&self) -> usize {
        self.manifest.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Every `(cluster_id, instance_id)` pair the store currently holds
    /// any segment for. The rebuilder (§4.6) and export path (§6.4) use
    /// this to enumerate streams rather than requiring the caller to know
    /// them up front.
    pub fn cluster_instance_pairs(&self) -> Vec<(String, String)> {
        self.manifest.lock().map(|m| m.cluster_instance_pairs()).unwrap_or_default()
    }

    /// Sealed segments intersecting `[start, end]` across every stream,
    /// for the export path (§6.4's "time window filter applies").
    pub fn select_segments_all(&self, start: Timestamp, end: Timestamp) -> Vec<SegmentEntry> {
        let manifest = match self.manifest.lock() {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        manifest.select_all(start, end).into_iter().cloned().collect()
    }

    /// Segments intersecting `[start, end]`, sorted by `bucket_start`
    /// ascending. Exposed (rather than only used internally by `scan`) so
    /// the timeline planner can account for `segments_scanned` up front and
    /// scan segment-by-segment to isolate a `CorruptRecord` to the one
    /// segment it came from (`spec.md` §4.5 step 1, §7).
    pub fn select_segments(&self, cluster_id: &str, instance_id: &str, start: Timestamp, end: Timestamp) -> Vec<SegmentEntry> {
        let manifest = match self.manifest.lock() {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        manifest.select(cluster_id, instance_id, start, end).into_iter().cloned().collect()
    }

    /// The segment immediately preceding `start`, if any — the planner uses
    /// this to discover resources that pre-date the query window
    /// (`spec.md` §4.5 step 1, "pre-existing" resources).
    pub fn preceding_segment(&self, cluster_id: &str, instance_id: &str, start: Timestamp) -> Option<SegmentEntry> {
        self.manifest.lock().ok()?.preceding(cluster_id, instance_id, start).cloned()
    }

    /// Decode one sealed segment's events, windowed and filtered. A
    /// `CorruptRecord` partway through the payload quarantines the segment
    /// (same as `scan`'s fatal-per-segment handling) and is surfaced to the
    /// caller so it can mark its result `partial=true` rather than aborting
    /// the whole query (`spec.md` §4.5 failure semantics).
    pub fn scan_segment(&self, entry: &SegmentEntry, filter: &EventFilter, start: Timestamp, end: Timestamp) -> Result<Vec<Event>> {
        let reader = match SegmentReader::open(&entry.path) {
            Ok(r) => r,
            Err(Error::CorruptRecord(msg)) => {
                tracing::warn!(path = %entry.path.display(), error = %msg, "quarantining corrupt segment");
                quarantine_corrupt_segment(&entry.path)?;
                return Err(Error::CorruptRecord(msg));
            }
            Err(e) => return Err(e),
        };

        if let Some(uid) = &filter.uid {
            if !reader.might_contain_uid(uid) {
                return Ok(Vec::new());
            }
        }

        let mut events = Vec::new();
        for item in reader.scan()? {
            match item {
                Ok(event) => {
                    if event.timestamp >= start && event.timestamp <= end && filter.matches(&event) {
                        events.push(event);
                    }
                }
                Err(Error::CorruptRecord(msg)) => {
                    tracing::warn!(path = %entry.path.display(), error = %msg, "quarantining corrupt segment mid-scan");
                    quarantine_corrupt_segment(&entry.path)?;
                    return Err(Error::CorruptRecord(msg));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    /// The still-open segment's already-appended events for `(cluster_id,
    /// instance_id)`, if its bucket overlaps `[start, end]` — lets a query
    /// see events that haven't sealed yet.
    pub fn scan_open_tail(&self, cluster_id: &str, instance_id: &str, filter: &EventFilter, start: Timestamp, end: Timestamp) -> Result<Vec<Event>> {
        let open = self.open.lock().map_err(|_| Error::Storage("open segment map poisoned".to_string()))?;
        match open.get(&(cluster_id.to_string(), instance_id.to_string())) {
            Some(segment) if segment.writer.bucket_start() <= end && segment.writer.bucket_end() > start => {
                Ok(segment
                    .writer
                    .scan_appended()?
                    .into_iter()
                    .filter(|e| e.timestamp >= start && e.timestamp <= end && filter.matches(e))
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }
}

fn quarantine_corrupt_segment(path: &Path) -> Result<()> {
    let quarantined = path.with_extension("seg.corrupt");
    std::fs::rename(path, quarantined)?;
    Ok(())
}

fn open_segment_for_scan(
    entry: &SegmentEntry,
    filter: &EventFilter,
) -> Result<Option<Box<dyn Iterator<Item = Result<Event>>>>> {
    let reader = match SegmentReader::open(&entry.path) {
        Ok(r) => r,
        Err(Error::CorruptRecord(msg)) => {
            tracing::warn!(path = %entry.path.display(), error = %msg, "quarantining corrupt segment");
            quarantine_corrupt_segment(&entry.path)?;
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if let Some(uid) = &filter.uid {
        if !reader.might_contain_uid(uid) {
            return Ok(None);
        }
    }

    Ok(Some(Box::new(reader.scan()?)))
}

/// Lazy, order-preserving iterator over one `Scan` call: sealed segments
/// first, in `bucket_start` ascending order, then the currently open
/// segment's already-appended events last — matching the on-disk,
/// wall-clock order `spec.md` §3 requires ("for any `uid`, its event
/// timestamps across all segments form a non-decreasing sequence"). The
/// open segment is always the newest bucket, so its events belong at the
/// end, not the front.
pub struct ScanIter {
    segments: std::collections::VecDeque<SegmentEntry>,
    current: Option<Box<dyn Iterator<Item = Result<Event>>>>,
    open_tail: Option<std::vec::IntoIter<Event>>,
    start: Timestamp,
    end: Timestamp,
    filter: EventFilter,
}

impl Iterator for ScanIter {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = self.current.as_mut() {
                match iter.next() {
                    Some(Ok(event)) => {
                        if self.in_window(&event) && self.filter.matches(&event) {
                            return Some(Ok(event));
                        }
                        continue;
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => {
                        self.current = None;
                        continue;
                    }
                }
            }

            if let Some(entry) = self.segments.pop_front() {
                match open_segment_for_scan(&entry, &self.filter) {
                    Ok(Some(iter)) => {
                        self.current = Some(iter);
                        continue;
                    }
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }

            if let Some(tail) = self.open_tail.as_mut() {
                match tail.next() {
                    Some(event) => {
                        if self.in_window(&event) && self.filter.matches(&event) {
                            return Some(Ok(event));
                        }
                        continue;
                    }
                    None => {
                        self.open_tail = None;
                        continue;
                    }
                }
            }

            return None;
        }
    }
}

impl ScanIter {
    fn in_window(&self, event: &Event) -> bool {
        event.timestamp >= self.start && event.timestamp <= self.end
    }
}

fn parse_cluster_instance_from_path(path: &Path, root: &Path) -> (String, String) {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut components = rel.components();
    let cluster = components.next().map(|c| c.as_os_str().to_string_lossy().into_owned()).unwrap_or_default();
    let instance = components.next().map(|c| c.as_os_str().to_string_lossy().into_owned()).unwrap_or_default();
    (cluster, instance)
}

fn find_leftover_tmp_segments(root: &Path) -> Result<Vec<(PathBuf, PathBuf, String, String)>> {
    let mut found = Vec::new();
    if !root.exists() {
        return Ok(found);
    }
    for cluster_entry in std::fs::read_dir(root)? {
        let cluster_entry = cluster_entry?;
        if !cluster_entry.file_type()?.is_dir() {
            continue;
        }
        let cluster_id = cluster_entry.file_name().to_string_lossy().into_owned();
        for instance_entry in std::fs::read_dir(cluster_entry.path())? {
            let instance_entry = instance_entry?;
            if !instance_entry.file_type()?.is_dir() {
                continue;
            }
            let instance_id = instance_entry.file_name().to_string_lossy().into_owned();
            for file_entry in std::fs::read_dir(instance_entry.path())? {
                let file_entry = file_entry?;
                let path = file_entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp")
                    && path.file_stem().and_then(|s| s.to_str()).map(|s| s.ends_with(".seg")).unwrap_or(false)
                {
                    let final_path = path.with_extension("");
                    found.push((path, final_path, cluster_id.clone(), instance_id.clone()));
                }
            }
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::EventKind;
    use tempfile::TempDir;

    fn sample_event(secs: i64, uid: &str) -> Event {
        Event::new(
            format!("evt-{uid}"),
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

    fn test_config(root: &Path) -> StoreConfig {
        let mut config = StoreConfig::new(root);
        config.bucket_duration_nanos = Duration::from_secs(100).as_nanos() as i64;
        config.fsync_interval = Duration::from_millis(0);
        config
    }

    #[test]
    fn append_then_scan_sees_the_event_before_the_segment_seals() {
        let dir = TempDir::new().unwrap();
        let (store, recovered) = SegmentStore::open(test_config(dir.path())).unwrap();
        assert!(recovered.is_empty());

        store.append(&sample_event(50, "uid-1")).unwrap();

        let events: Vec<Event> = store
            .scan("cluster-a", "inst-1", Timestamp::from_secs(0), Timestamp::from_secs(200), EventFilter::default())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uid, "uid-1");
    }

    #[test]
    fn crossing_a_bucket_boundary_seals_the_prior_segment() {
        let dir = TempDir::new().unwrap();
        let (store, _) = SegmentStore::open(test_config(dir.path())).unwrap();

        store.append(&sample_event(50, "uid-1")).unwrap();
        store.append(&sample_event(150, "uid-2")).unwrap();

        assert_eq!(store.manifest_len(), 1);

        let events: Vec<Event> = store
            .scan("cluster-a", "inst-1", Timestamp::from_secs(0), Timestamp::from_secs(300), EventFilter::default())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    /// A `Scan` spanning a sealed segment and the still-open segment after
    /// it must yield events in bucket order (sealed first, open tail
    /// last) — `spec.md` §3's "non-decreasing sequence" invariant, and what
    /// `Rebuilder::replay_stream` relies on to stamp `created_at` from the
    /// right event when a crash-recovered open segment sits next to an
    /// older sealed one.
    #[test]
    fn scan_yields_sealed_segments_before_the_open_tail() {
        let dir = TempDir::new().unwrap();
        let (store, _) = SegmentStore::open(test_config(dir.path())).unwrap();

        store.append(&sample_event(50, "uid-1")).unwrap();
        store.append(&sample_event(150, "uid-2")).unwrap();
        assert_eq!(store.manifest_len(), 1);

        let events: Vec<Event> = store
            .scan("cluster-a", "inst-1", Timestamp::from_secs(0), Timestamp::from_secs(300), EventFilter::default())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(events.iter().map(|e| e.uid.as_str()).collect::<Vec<_>>(), vec!["uid-1", "uid-2"]);
    }

    #[test]
    fn scan_filters_by_uid() {
        let dir = TempDir::new().unwrap();
        let (store, _) = SegmentStore::open(test_config(dir.path())).unwrap();
        store.append(&sample_event(10, "uid-1")).unwrap();
        store.append(&sample_event(20, "uid-2")).unwrap();

        let mut filter = EventFilter::default();
        filter.uid = Some("uid-2".to_string());
        let events: Vec<Event> = store
            .scan("cluster-a", "inst-1", Timestamp::from_secs(0), Timestamp::from_secs(100), filter)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].uid, "uid-2");
    }

    #[test]
    fn seal_all_flushes_every_open_segment_to_the_manifest() {
        let dir = TempDir::new().unwrap();
        let (store, _) = SegmentStore::open(test_config(dir.path())).unwrap();
        store.append(&sample_event(10, "uid-1")).unwrap();
        assert_eq!(store.manifest_len(), 0);
        store.seal_all().unwrap();
        assert_eq!(store.manifest_len(), 1);
    }
}
