//! Segment export/import (`spec.md` §6.4): a gzipped tar of sealed
//! segments plus a manifest snapshot, for moving a time window of history
//! between deployments.
//!
//! Grounded on `examples/abitofhelp-adaptive_pipeline`'s compression
//! adapter for the `flate2::read::{GzEncoder, GzDecoder}` pairing; the
//! archive layout itself (`segments/<relative path>` plus a top-level
//! `manifest.json`) has no teacher analogue and is this crate's own, kept
//! as small and literal as the data it carries.

use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::storage::manifest::SegmentEntry;
use crate::storage::segment::SegmentReader;
use crate::storage::store::{EventFilter, SegmentStore};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, Header};

const MANIFEST_ENTRY_NAME: &str = "manifest.json";
const SEGMENTS_DIR: &str = "segments";

/// What one export run wrote, surfaced back to the CLI.
#[derive(Debug, Clone, Default)]
pub struct ExportReport {
    pub segments_written: usize,
}

/// Write every sealed segment intersecting `[start, end]`, across every
/// stream the store holds, to a gzipped tar at `output`.
pub fn export(store: &SegmentStore, output: &Path, start: Timestamp, end: Timestamp) -> Result<ExportReport> {
    let entries = store.select_segments_all(start, end);
    let file = File::create(output).map_err(Error::Io)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar = Builder::new(encoder);

    let manifest_json = serde_json::to_vec_pretty(&entries).map_err(|e| Error::Serialization(e.to_string()))?;
    append_bytes(&mut tar, MANIFEST_ENTRY_NAME, &manifest_json)?;

    for entry in &entries {
        let relative = archive_relative_path(&entry.path);
        tar.append_path_with_name(&entry.path, Path::new(SEGMENTS_DIR).join(&relative)).map_err(Error::Io)?;
    }

    let encoder = tar.into_inner().map_err(Error::Io)?;
    encoder.finish().map_err(Error::Io)?;
    Ok(ExportReport { segments_written: entries.len() })
}

/// What one import run did, surfaced back to the CLI.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub segments_examined: usize,
    pub events_imported: usize,
    pub events_deduplicated: usize,
}

/// Read an archive written by [`export`] and merge its events into `store`,
/// skipping any event whose id the destination already holds for the same
/// `(cluster_id, instance_id)` stream and time window. Each source segment
/// is opened through `SegmentReader::open`, which validates its CRC32C
/// footer before anything is trusted out of it.
pub fn import(store: &SegmentStore, input: &Path) -> Result<ImportReport> {
    let file = File::open(input).map_err(Error::Io)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);

    let extract_dir = tempfile::tempdir().map_err(Error::Io)?;
    archive.unpack(extract_dir.path()).map_err(Error::Io)?;

    let manifest_path = extract_dir.path().join(MANIFEST_ENTRY_NAME);
    let manifest_bytes = std::fs::read(&manifest_path).map_err(Error::Io)?;
    let entries: Vec<SegmentEntry> =
        serde_json::from_slice(&manifest_bytes).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut report = ImportReport::default();
    for entry in &entries {
        report.segments_examined += 1;
        let relative = archive_relative_path(&entry.path);
        let segment_path = extract_dir.path().join(SEGMENTS_DIR).join(&relative);
        import_one_segment(store, entry, &segment_path, &mut report)?;
    }
    Ok(report)
}

fn import_one_segment(
    store: &SegmentStore,
    entry: &SegmentEntry,
    segment_path: &Path,
    report: &mut ImportReport,
) -> Result<()> {
    let reader = SegmentReader::open(segment_path)?;
    let existing_ids = existing_event_ids(store, &entry.cluster_id, &entry.instance_id, entry.first_ts, entry.last_ts)?;

    for event in reader.scan()? {
        let event = event?;
        if existing_ids.contains(&event.id) {
            report.events_deduplicated += 1;
            continue;
        }
        store.append(&event)?;
        report.events_imported += 1;
    }
    Ok(())
}

fn existing_event_ids(
    store: &SegmentStore,
    cluster_id: &str,
    instance_id: &str,
    start: Timestamp,
    end: Timestamp,
) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    for event in store.scan(cluster_id, instance_id, start, end, EventFilter::default())? {
        ids.insert(event?.id);
    }
    Ok(ids)
}

/// Segment paths embed the store's own root, which the importing side
/// neither has nor needs; only the `<cluster_id>/<instance_id>/<file>` tail
/// carries meaning for re-assembly.
fn archive_relative_path(path: &Path) -> PathBuf {
    let mut parts: Vec<_> = path.iter().rev().take(3).collect();
    parts.reverse();
    parts.into_iter().collect()
}

fn append_bytes<W: Write>(tar: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_cksum();
    tar.append_data(&mut header, name, bytes).map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{Event, EventKind};
    use crate::storage::store::StoreConfig;
    use std::time::Duration;
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

    fn test_store(root: &Path) -> SegmentStore {
        let mut config = StoreConfig::new(root);
        config.fsync_interval = Duration::from_millis(0);
        SegmentStore::open(config).unwrap().0
    }

    #[test]
    fn exports_and_reimports_into_a_fresh_store_without_loss() {
        let src_dir = TempDir::new().unwrap();
        let src = test_store(src_dir.path());
        src.append(&sample_event(1_700_000_000, "uid-1")).unwrap();
        src.append(&sample_event(1_700_000_100, "uid-2")).unwrap();
        src.seal_all().unwrap();

        let archive_dir = TempDir::new().unwrap();
        let archive_path = archive_dir.path().join("export.tar.gz");
        let report = export(&src, &archive_path, Timestamp::from_secs(0), Timestamp::from_secs(2_000_000_000)).unwrap();
        assert_eq!(report.segments_written, 1);

        let dst_dir = TempDir::new().unwrap();
        let dst = test_store(dst_dir.path());
        let import_report = import(&dst, &archive_path).unwrap();
        assert_eq!(import_report.events_imported, 2);
        assert_eq!(import_report.events_deduplicated, 0);
    }

    #[test]
    fn reimporting_the_same_archive_deduplicates_every_event() {
        let src_dir = TempDir::new().unwrap();
        let src = test_store(src_dir.path());
        src.append(&sample_event(1_700_000_000, "uid-1")).unwrap();
        src.seal_all().unwrap();

        let archive_dir = TempDir::new().unwrap();
        let archive_path = archive_dir.path().join("export.tar.gz");
        export(&src, &archive_path, Timestamp::from_secs(0), Timestamp::from_secs(2_000_000_000)).unwrap();

        let dst_dir = TempDir::new().unwrap();
        let dst = test_store(dst_dir.path());
        import(&dst, &archive_path).unwrap();
        let second = import(&dst, &archive_path).unwrap();
        assert_eq!(second.events_imported, 0);
        assert_eq!(second.events_deduplicated, 1);
    }
}
