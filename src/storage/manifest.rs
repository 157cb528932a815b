//! The segment manifest (`spec.md` §4.2): an in-memory index of every
//! segment's time window and bloom status, kept in sync with a small JSON
//! sidecar file written next to each segment on seal. The sidecar is a
//! cache — on startup the manifest is rebuilt from a directory scan, using
//! the sidecar when present and falling back to the segment's own header
//! and footer (with `bloom_present` degraded to `false`, per §4.2's failure
//! semantics) when it is missing or unreadable.
//!
//! Grounded on the teacher's `core/temporal.rs` style of small, serde-
//! derived structs; there is no teacher analogue for a manifest since the
//! teacher's `db.rs` indexed everything in an in-memory `BTreeMap` with no
//! persisted sidecar at all.

use crate::core::temporal::Timestamp;
use crate::error::{Error, Result};
use crate::storage::segment::{SegmentReader, SEGMENT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One segment's entry in the manifest: everything `Scan` needs to decide
/// whether to open the file at all.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentEntry {
    pub path: PathBuf,
    pub cluster_id: String,
    pub instance_id: String,
    pub bucket_start: Timestamp,
    pub bucket_end: Timestamp,
    pub event_count: u32,
    pub first_ts: Timestamp,
    pub last_ts: Timestamp,
    pub bloom_present: bool,
}

/// `(cluster_id, instance_id, bucket_start)` — the manifest's key, matching
/// the tuple `spec.md` §4.2 keys entries by.
pub type ManifestKey = (String, String, i64);

fn key_for(entry: &SegmentEntry) -> ManifestKey {
    (entry.cluster_id.clone(), entry.instance_id.clone(), entry.bucket_start.as_nanos())
}

/// The in-memory segment index. Never the source of truth: always
/// reconstructible from the segment files themselves via [`Manifest::scan_dir`].
#[derive(Debug, Default)]
pub struct Manifest {
    entries: BTreeMap<ManifestKey, SegmentEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Sidecar path for a sealed segment file: `<bucket>.seg` -> `<bucket>.seg.idx`.
    pub fn sidecar_path(segment_path: &Path) -> PathBuf {
        let mut p = segment_path.as_os_str().to_owned();
        p.push(".idx");
        PathBuf::from(p)
    }

    /// Record a freshly sealed segment: write its JSON sidecar and insert it
    /// into the in-memory index. Called by the segment store under its
    /// manifest mutex, immediately after the `.seg.tmp` -> `.seg` rename.
    pub fn record_seal(&mut self, entry: SegmentEntry) -> Result<()> {
        let sidecar = Self::sidecar_path(&entry.path);
        let json = serde_json::to_vec_pretty(&entry)?;
        std::fs::write(&sidecar, json)?;
        self.entries.insert(key_for(&entry), entry);
        Ok(())
    }

    pub fn insert(&mut self, entry: SegmentEntry) {
        self.entries.insert(key_for(&entry), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every distinct `(cluster_id, instance_id)` pair with at least one
    /// segment, in sorted order. Used by the rebuilder (C6) and the
    /// export path (§6.4), both of which must enumerate every stream the
    /// store holds rather than a single caller-supplied pair.
    pub fn cluster_instance_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> =
            self.entries.values().map(|e| (e.cluster_id.clone(), e.instance_id.clone())).collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// Every entry whose `[first_ts, last_ts]` intersects `[start, end]`,
    /// across all `(cluster_id, instance_id)` pairs, sorted by
    /// `(cluster_id, instance_id, bucket_start)`. Used by the export path
    /// (§6.4), which filters by time window only, not by stream.
    pub fn select_all(&self, start: Timestamp, end: Timestamp) -> Vec<&SegmentEntry> {
        let mut hits: Vec<&SegmentEntry> = self.entries.values().filter(|e| e.first_ts <= end && e.last_ts >= start).collect();
        hits.sort_by_key(|e| (e.cluster_id.clone(), e.instance_id.clone(), e.bucket_start));
        hits
    }

    /// Segments for `(cluster_id, instance_id)` whose `[first_ts, last_ts]`
    /// intersects `[start, end]`, sorted by `bucket_start` ascending
    /// (`spec.md` §4.2 read path, steps 1-2).
    pub fn select(
        &self,
        cluster_id: &str,
        instance_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<&SegmentEntry> {
        let mut hits: Vec<&SegmentEntry> = self
            .entries
            .values()
            .filter(|e| e.cluster_id == cluster_id && e.instance_id == instance_id)
            .filter(|e| e.first_ts <= end && e.last_ts >= start)
            .collect();
        hits.sort_by_key(|e| e.bucket_start);
        hits
    }

    /// The segment immediately preceding `start` for `(cluster_id,
    /// instance_id)`, if any — needed by the timeline planner to discover
    /// resources that pre-date the query window (`spec.md` §4.5 step 1).
    pub fn preceding(
        &self,
        cluster_id: &str,
        instance_id: &str,
        start: Timestamp,
    ) -> Option<&SegmentEntry> {
        self.entries
            .values()
            .filter(|e| e.cluster_id == cluster_id && e.instance_id == instance_id)
            .filter(|e| e.bucket_start < start)
            .max_by_key(|e| e.bucket_start)
    }

    /// Rebuild the manifest by walking `<root>/<cluster>/<instance>/*.seg`.
    /// Sidecars are trusted when present and structurally valid; a missing
    /// or corrupt sidecar falls back to the segment's own header/footer,
    /// with `first_ts`/`last_ts` widened to the full bucket (the exact
    /// range isn't recoverable without a full scan) and `bloom_present`
    /// forced to `false` so `Scan` never prunes this segment on a stale
    /// bloom read (`spec.md` §4.2 line 148).
    pub fn scan_dir(root: &Path) -> Result<Self> {
        let mut manifest = Self::new();
        if !root.exists() {
            return Ok(manifest);
        }

        for cluster_dir in read_subdirs(root)? {
            for instance_dir in read_subdirs(&cluster_dir)? {
                for seg_path in read_seg_files(&instance_dir)? {
                    match Self::entry_for_segment(&seg_path) {
                        Ok(entry) => manifest.insert(entry),
                        Err(e) => {
                            tracing::warn!(path = %seg_path.display(), error = %e, "skipping unreadable segment during manifest scan");
                        }
                    }
                }
            }
        }

        Ok(manifest)
    }

    fn entry_for_segment(seg_path: &Path) -> Result<SegmentEntry> {
        let sidecar = Self::sidecar_path(seg_path);
        if let Ok(bytes) = std::fs::read(&sidecar) {
            if let Ok(entry) = serde_json::from_slice::<SegmentEntry>(&bytes) {
                if entry.path == seg_path {
                    return Ok(entry);
                }
            }
        }

        let reader = SegmentReader::open(seg_path)?;
        if reader.header().version != SEGMENT_VERSION {
            return Err(Error::CorruptRecord(format!(
                "{}: unsupported segment version {}",
                seg_path.display(),
                reader.header().version
            )));
        }

        Ok(SegmentEntry {
            path: seg_path.to_path_buf(),
            cluster_id: reader.header().cluster_id.clone(),
            instance_id: reader.header().instance_id.clone(),
            bucket_start: reader.header().bucket_start,
            bucket_end: reader.header().bucket_end,
            event_count: reader.footer().event_count,
            first_ts: reader.header().bucket_start,
            last_ts: reader.header().bucket_end,
            bloom_present: false,
        })
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(out),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn read_seg_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(out),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("seg") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}
