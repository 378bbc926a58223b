// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! The dead-letter store: an append-only ring of segment files.

use crate::error::Error;
use crate::record::{
    KIND_BATCH, KIND_FOOTER, ReadOutcome, encode_footer, encode_record, read_record, record_crc,
};
use nrdot_config::{DlqConfig, FsyncPolicy};
use nrdot_telemetry::Metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

const MANIFEST_NAME: &str = "MANIFEST.json";
const SEGMENT_SUFFIX: &str = ".seg";

/// Position of one batch record inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchRef {
    /// Segment sequence number.
    pub segment: u64,
    /// Record index within the segment (batch records only precede the
    /// footer, so the index is also the frame index).
    pub record: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    next_seq: u64,
    cursor_segment: u64,
    cursor_record: u32,
    total_bytes: u64,
    segments: Vec<ManifestSegment>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestSegment {
    seq: u64,
    bytes: u64,
    records: u32,
    crc: u32,
}

#[derive(Debug, Clone)]
struct SegmentMeta {
    seq: u64,
    file_bytes: u64,
    records: u32,
    overall_crc: u32,
}

struct ActiveSegment {
    file: File,
    seq: u64,
    file_bytes: u64,
    records: u32,
    opened_at: Instant,
    /// Chained crc over every record crc, for the footer.
    crc_chain: crc32fast::Hasher,
    writes_since_sync: u32,
    last_sync: Instant,
}

struct Reader {
    seq: u64,
    file: BufReader<File>,
    next_record: u32,
}

struct Inner {
    sealed: VecDeque<SegmentMeta>,
    active: Option<ActiveSegment>,
    next_seq: u64,
    /// Next unresolved record; persisted in the manifest.
    cursor: BatchRef,
    /// Next record to hand out to a replay worker.
    read_pos: BatchRef,
    reader: Option<Reader>,
    /// Records handed out and awaiting ack/poison, in hand-out order.
    handed: VecDeque<BatchRef>,
    done: HashSet<BatchRef>,
    advances_since_persist: u32,
}

/// Durable spillover store for batches. Single writer (the active
/// segment), sequential reader (replay); one mutex guards the manifest
/// and the active segment tail.
pub struct DeadLetterStore {
    dir: PathBuf,
    cfg: DlqConfig,
    metrics: Metrics,
    inner: Mutex<Inner>,
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq:010}{SEGMENT_SUFFIX}"))
}

impl DeadLetterStore {
    /// Opens the store, scanning existing segments oldest-to-newest,
    /// truncating a partial tail and sealing any unsealed segment left by
    /// a crash. The scan is O(total bytes) and runs once at startup.
    pub fn open(cfg: DlqConfig, metrics: Metrics) -> Result<Self, Error> {
        let dir = cfg.dir.clone();
        fs::create_dir_all(&dir).map_err(|e| Error::Unusable {
            dir: dir.display().to_string(),
            details: e.to_string(),
        })?;

        let mut seqs = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| Error::Unusable {
            dir: dir.display().to_string(),
            details: e.to_string(),
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(SEGMENT_SUFFIX) {
                if let Ok(seq) = stem.parse::<u64>() {
                    seqs.push(seq);
                }
            }
        }
        seqs.sort_unstable();

        let mut sealed = VecDeque::new();
        for seq in &seqs {
            match Self::recover_segment(&dir, *seq, &metrics) {
                Ok(Some(meta)) => sealed.push_back(meta),
                Ok(None) => {}
                Err(e) => {
                    warn!(segment = seq, error = %e, "skipping unreadable segment");
                }
            }
        }

        let next_seq = seqs.last().map(|s| s + 1).unwrap_or(1);
        let manifest_cursor = Self::load_manifest(&dir).map(|m| BatchRef {
            segment: m.cursor_segment,
            record: m.cursor_record,
        });

        // Clamp the cursor onto what actually exists on disk; a corrupt or
        // missing manifest restarts replay from the oldest segment.
        let mut cursor = manifest_cursor.unwrap_or(BatchRef {
            segment: sealed.front().map(|m| m.seq).unwrap_or(next_seq),
            record: 0,
        });
        while let Some(front_seq) = sealed.front().map(|m| m.seq) {
            if front_seq >= cursor.segment {
                break;
            }
            // Fully acked before the crash; reclaim it now.
            let path = segment_path(&dir, front_seq);
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to unlink acked segment");
            }
            let _ = sealed.pop_front();
        }
        match sealed.front() {
            Some(front) if cursor.segment == front.seq => {
                cursor.record = cursor.record.min(front.records);
            }
            Some(front) => {
                // Cursor pointed at a segment that no longer exists.
                cursor = BatchRef {
                    segment: front.seq,
                    record: 0,
                };
            }
            None => {
                cursor = BatchRef {
                    segment: next_seq,
                    record: 0,
                };
            }
        }

        let store = Self {
            dir,
            cfg,
            metrics,
            inner: Mutex::new(Inner {
                sealed,
                active: None,
                next_seq,
                cursor,
                read_pos: cursor,
                reader: None,
                handed: VecDeque::new(),
                done: HashSet::new(),
                advances_since_persist: 0,
            }),
        };
        {
            let mut inner = store.inner.lock();
            store.enforce_cap(&mut inner);
            store.update_gauges(&inner);
            store.persist_manifest(&inner);
        }
        info!(
            dir = %store.dir.display(),
            segments = store.inner.lock().sealed.len(),
            bytes = store.total_bytes(),
            "dead-letter store opened"
        );
        Ok(store)
    }

    /// Scans one segment: truncates a partial tail, seals it if the crash
    /// left it without a footer, and returns its metadata. Returns `None`
    /// for an empty segment (which is unlinked).
    fn recover_segment(
        dir: &Path,
        seq: u64,
        metrics: &Metrics,
    ) -> Result<Option<SegmentMeta>, std::io::Error> {
        let path = segment_path(dir, seq);
        let file_len = fs::metadata(&path)?.len();
        let file = File::open(&path)?;
        let mut reader = BufReader::new(file);
        let mut offset: u64 = 0;
        let mut records: u32 = 0;
        let mut crc_chain = crc32fast::Hasher::new();
        let mut has_footer = false;
        let mut truncate_at: Option<u64> = None;

        loop {
            match read_record(&mut reader)? {
                ReadOutcome::Record(record) => {
                    let frame_len =
                        crate::record::RECORD_OVERHEAD + record.payload.len() as u64;
                    if record.kind == KIND_FOOTER && record.crc_ok {
                        has_footer = true;
                        offset += frame_len;
                        // Anything after a footer is garbage from a
                        // partially-overwritten reuse; drop it.
                        truncate_at = Some(offset);
                        break;
                    }
                    if !record.crc_ok {
                        debug!(segment = seq, record = records, "crc mismatch in segment scan");
                    }
                    crc_chain.update(&record.crc.to_le_bytes());
                    records += 1;
                    offset += frame_len;
                }
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    metrics.dlq_integrity_drops_total.inc();
                    warn!(segment = seq, offset, "truncating partial record tail");
                    truncate_at = Some(offset);
                    break;
                }
            }
        }
        drop(reader);

        if let Some(at) = truncate_at.filter(|at| *at < file_len) {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(at)?;
            file.sync_all()?;
        }

        if records == 0 && !has_footer {
            fs::remove_file(&path)?;
            return Ok(None);
        }

        let overall_crc = crc_chain.finalize();
        if !has_footer {
            // Crash before sealing: seal it now so it becomes replayable.
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(&encode_footer(records, overall_crc))?;
            file.sync_all()?;
            info!(segment = seq, records, "sealed segment left open by previous run");
        }

        let file_bytes = fs::metadata(&path)?.len();
        Ok(Some(SegmentMeta {
            seq,
            file_bytes,
            records,
            overall_crc,
        }))
    }

    fn load_manifest(dir: &Path) -> Option<Manifest> {
        let path = dir.join(MANIFEST_NAME);
        let text = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Manifest>(&text) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(error = %e, "corrupt manifest; rebuilding from segments");
                None
            }
        }
    }

    fn persist_manifest(&self, inner: &Inner) {
        let manifest = Manifest {
            next_seq: inner.next_seq,
            cursor_segment: inner.cursor.segment,
            cursor_record: inner.cursor.record,
            total_bytes: self.compute_total_bytes(inner),
            segments: inner
                .sealed
                .iter()
                .map(|m| ManifestSegment {
                    seq: m.seq,
                    bytes: m.file_bytes,
                    records: m.records,
                    crc: m.overall_crc,
                })
                .collect(),
        };
        let tmp = self.dir.join(format!("{MANIFEST_NAME}.tmp"));
        let path = self.dir.join(MANIFEST_NAME);
        let write = || -> std::io::Result<()> {
            let payload = serde_json::to_vec_pretty(&manifest)?;
            let mut file = File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            warn!(error = %e, "failed to persist manifest");
        }
    }

    /// Appends one encoded batch payload. On success the payload is
    /// durable per the configured fsync policy.
    pub fn append(&self, payload: &[u8]) -> Result<BatchRef, Error> {
        let mut inner = self.inner.lock();
        let frame = encode_record(KIND_BATCH, payload);

        // Roll the active segment by size before the write, never after,
        // so a segment file cannot exceed segment_max_bytes by more than
        // one record.
        let roll = inner.active.as_ref().is_some_and(|a| {
            a.records > 0 && a.file_bytes + frame.len() as u64 > self.cfg.segment_max_bytes
        });
        if roll {
            self.seal_active(&mut inner);
        }
        self.ensure_active(&mut inner)?;

        let crc = record_crc(KIND_BATCH, payload);
        let active = inner.active.as_mut().expect("ensured above");
        let record_index = active.records;
        let segment = active.seq;
        if let Err(e) = active.file.write_all(&frame) {
            // Roll back to the pre-write length so a half-written frame
            // cannot be mistaken for a record later.
            let _ = active.file.set_len(active.file_bytes);
            return Err(Error::DurableWriteFailed {
                details: e.to_string(),
            });
        }
        active.file_bytes += frame.len() as u64;
        active.records += 1;
        active.crc_chain.update(&crc.to_le_bytes());
        active.writes_since_sync += 1;

        if self.fsync_due(active) {
            if let Err(e) = active.file.sync_data() {
                return Err(Error::DurableWriteFailed {
                    details: e.to_string(),
                });
            }
            active.writes_since_sync = 0;
            active.last_sync = Instant::now();
        }

        self.enforce_cap(&mut inner);
        self.update_gauges(&inner);
        Ok(BatchRef {
            segment,
            record: record_index,
        })
    }

    fn fsync_due(&self, active: &ActiveSegment) -> bool {
        match &self.cfg.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN { n } => active.writes_since_sync >= *n,
            FsyncPolicy::EveryInterval { interval } => active.last_sync.elapsed() >= *interval,
            FsyncPolicy::Hybrid { n, interval } => {
                active.writes_since_sync >= *n || active.last_sync.elapsed() >= *interval
            }
        }
    }

    fn ensure_active(&self, inner: &mut Inner) -> Result<(), Error> {
        if inner.active.is_some() {
            return Ok(());
        }
        let seq = inner.next_seq;
        let path = segment_path(&self.dir, seq);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::DurableWriteFailed {
                details: format!("cannot create segment {}: {e}", path.display()),
            })?;
        inner.next_seq += 1;
        inner.active = Some(ActiveSegment {
            file,
            seq,
            file_bytes: 0,
            records: 0,
            opened_at: Instant::now(),
            crc_chain: crc32fast::Hasher::new(),
            writes_since_sync: 0,
            last_sync: Instant::now(),
        });
        Ok(())
    }

    fn seal_active(&self, inner: &mut Inner) {
        let Some(mut active) = inner.active.take() else {
            return;
        };
        if active.records == 0 {
            // Nothing written; drop the empty file.
            let path = segment_path(&self.dir, active.seq);
            drop(active.file);
            let _ = fs::remove_file(path);
            return;
        }
        let overall_crc = active.crc_chain.clone().finalize();
        let footer = encode_footer(active.records, overall_crc);
        let sealed_ok = active.file.write_all(&footer).is_ok();
        if !sealed_ok {
            warn!(segment = active.seq, "failed to write segment footer");
        }
        if let Err(e) = active.file.sync_all() {
            warn!(segment = active.seq, error = %e, "failed to fsync sealed segment");
        }
        let file_bytes = active.file_bytes + if sealed_ok { footer.len() as u64 } else { 0 };
        inner.sealed.push_back(SegmentMeta {
            seq: active.seq,
            file_bytes,
            records: active.records,
            overall_crc,
        });
        debug!(segment = active.seq, records = active.records, "segment sealed");
    }

    /// Seals the active segment when it exceeds the configured age, runs
    /// deferred fsyncs and persists the manifest if acks are pending.
    /// Called periodically by the pipeline maintenance task.
    pub fn maintain(&self) {
        let mut inner = self.inner.lock();
        let seal = inner
            .active
            .as_ref()
            .is_some_and(|a| a.records > 0 && a.opened_at.elapsed() >= self.cfg.segment_max_age);
        if seal {
            self.seal_active(&mut inner);
        }
        if let Some(active) = inner.active.as_mut() {
            if active.writes_since_sync > 0 && self.fsync_due(active) {
                if active.file.sync_data().is_ok() {
                    active.writes_since_sync = 0;
                    active.last_sync = Instant::now();
                }
            }
        }
        if inner.advances_since_persist > 0 {
            self.persist_manifest(&inner);
            inner.advances_since_persist = 0;
        }
        self.update_gauges(&inner);
    }

    /// Hands out the next unread batch payload in append order, or `None`
    /// when the backlog is exhausted. The record stays re-deliverable
    /// until [`ack`](Self::ack) or [`poison`](Self::poison) is called.
    pub fn next_replay(&self) -> Result<Option<(BatchRef, Vec<u8>)>, Error> {
        let mut inner = self.inner.lock();
        loop {
            let meta = inner
                .sealed
                .iter()
                .find(|m| m.seq == inner.read_pos.segment)
                .cloned();
            let Some(meta) = meta else {
                // Past every sealed segment. If data sits in the active
                // segment, seal it so it becomes visible to replay.
                let has_active_data = inner.active.as_ref().is_some_and(|a| a.records > 0);
                if has_active_data {
                    let active_seq = inner.active.as_ref().map(|a| a.seq).expect("active");
                    self.seal_active(&mut inner);
                    inner.read_pos = BatchRef {
                        segment: active_seq,
                        record: 0,
                    };
                    continue;
                }
                return Ok(None);
            };
            if inner.read_pos.record >= meta.records {
                self.advance_read_segment(&mut inner, meta.seq);
                continue;
            }

            self.position_reader(&mut inner, &meta)?;
            let outcome = {
                let reader = inner.reader.as_mut().expect("positioned above");
                read_record(&mut reader.file).map_err(|e| Error::Io {
                    path: segment_path(&self.dir, meta.seq).display().to_string(),
                    source: e,
                })?
            };
            match outcome {
                ReadOutcome::Record(record) if record.kind == KIND_BATCH && record.crc_ok => {
                    let reference = inner.read_pos;
                    if let Some(reader) = inner.reader.as_mut() {
                        reader.next_record += 1;
                    }
                    inner.read_pos.record += 1;
                    inner.handed.push_back(reference);
                    self.metrics.dlq_replay_batches_total.inc();
                    return Ok(Some((reference, record.payload)));
                }
                ReadOutcome::Record(record) if record.kind == KIND_BATCH => {
                    // Corrupt record: count it, mark it resolved and move on.
                    self.metrics.dlq_integrity_drops_total.inc();
                    warn!(
                        segment = meta.seq,
                        record = inner.read_pos.record,
                        "skipping batch record with bad crc"
                    );
                    let reference = inner.read_pos;
                    if let Some(reader) = inner.reader.as_mut() {
                        reader.next_record += 1;
                    }
                    inner.read_pos.record += 1;
                    inner.handed.push_back(reference);
                    let _ = inner.done.insert(reference);
                    self.advance_cursor(&mut inner);
                    continue;
                }
                ReadOutcome::Record(_) | ReadOutcome::Eof | ReadOutcome::Partial => {
                    // Footer (or an inconsistency versus the scan): done
                    // with this segment.
                    self.advance_read_segment(&mut inner, meta.seq);
                    continue;
                }
            }
        }
    }

    fn advance_read_segment(&self, inner: &mut Inner, current: u64) {
        inner.reader = None;
        let next = inner
            .sealed
            .iter()
            .map(|m| m.seq)
            .find(|s| *s > current)
            .or_else(|| inner.active.as_ref().map(|a| a.seq))
            .unwrap_or(inner.next_seq);
        inner.read_pos = BatchRef {
            segment: next,
            record: 0,
        };
    }

    fn position_reader(&self, inner: &mut Inner, meta: &SegmentMeta) -> Result<(), Error> {
        let target = inner.read_pos;
        let needs_reopen = match &inner.reader {
            Some(reader) => reader.seq != target.segment || reader.next_record > target.record,
            None => true,
        };
        if needs_reopen {
            let path = segment_path(&self.dir, meta.seq);
            let file = BufReader::new(File::open(&path).map_err(|e| Error::Io {
                path: path.display().to_string(),
                source: e,
            })?);
            inner.reader = Some(Reader {
                seq: meta.seq,
                file,
                next_record: 0,
            });
        }
        let reader = inner.reader.as_mut().expect("set above");
        while reader.next_record < target.record {
            match read_record(&mut reader.file).map_err(|e| Error::Io {
                path: segment_path(&self.dir, meta.seq).display().to_string(),
                source: e,
            })? {
                ReadOutcome::Record(_) => reader.next_record += 1,
                ReadOutcome::Eof | ReadOutcome::Partial => break,
            }
        }
        Ok(())
    }

    /// Records a successful replay of the referenced batch.
    pub fn ack(&self, reference: BatchRef) {
        let mut inner = self.inner.lock();
        self.resolve(&mut inner, reference);
    }

    /// Marks the referenced batch as poison: replay gave up on it. The
    /// cursor advances past it exactly like an ack.
    pub fn poison(&self, reference: BatchRef) {
        self.metrics.dlq_poison_total.inc();
        let mut inner = self.inner.lock();
        self.resolve(&mut inner, reference);
    }

    fn resolve(&self, inner: &mut Inner, reference: BatchRef) {
        if !inner.handed.contains(&reference) {
            return;
        }
        let _ = inner.done.insert(reference);
        self.advance_cursor(inner);
    }

    /// Advances the durable cursor over the contiguous prefix of resolved
    /// records, unlinking segments once every record in them is resolved.
    fn advance_cursor(&self, inner: &mut Inner) {
        let mut unlinked = false;
        while let Some(front) = inner.handed.front().copied() {
            if !inner.done.remove(&front) {
                break;
            }
            let _ = inner.handed.pop_front();
            inner.cursor = BatchRef {
                segment: front.segment,
                record: front.record + 1,
            };
            inner.advances_since_persist += 1;

            let completed = inner
                .sealed
                .iter()
                .find(|m| m.seq == front.segment)
                .is_some_and(|m| inner.cursor.record >= m.records);
            if completed {
                self.unlink_segment(inner, front.segment);
                let next = inner
                    .sealed
                    .iter()
                    .map(|m| m.seq)
                    .find(|s| *s > front.segment)
                    .or_else(|| inner.active.as_ref().map(|a| a.seq))
                    .unwrap_or(inner.next_seq);
                inner.cursor = BatchRef {
                    segment: next,
                    record: 0,
                };
                unlinked = true;
            }
        }
        if unlinked || inner.advances_since_persist >= 32 {
            self.persist_manifest(inner);
            inner.advances_since_persist = 0;
        }
        self.update_gauges(inner);
    }

    fn unlink_segment(&self, inner: &mut Inner, seq: u64) {
        inner.sealed.retain(|m| m.seq != seq);
        if inner.reader.as_ref().is_some_and(|r| r.seq == seq) {
            inner.reader = None;
        }
        let path = segment_path(&self.dir, seq);
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to unlink segment");
        } else {
            debug!(segment = seq, "segment fully replayed and unlinked");
        }
    }

    /// Discards oldest sealed segments while the total size exceeds the
    /// cap. The active segment is never discarded.
    fn enforce_cap(&self, inner: &mut Inner) {
        while self.compute_total_bytes(inner) > self.cfg.max_bytes {
            let Some(oldest) = inner.sealed.front().map(|m| m.seq) else {
                break;
            };
            self.metrics.dlq_dropped_segments_total.inc();
            warn!(segment = oldest, "size cap exceeded; discarding oldest segment");
            self.unlink_segment(inner, oldest);
            let dropped_refs: Vec<BatchRef> = inner
                .handed
                .iter()
                .filter(|r| r.segment == oldest)
                .copied()
                .collect();
            for reference in &dropped_refs {
                let _ = inner.done.remove(reference);
            }
            inner.handed.retain(|r| r.segment != oldest);
            let next = inner
                .sealed
                .front()
                .map(|m| m.seq)
                .or_else(|| inner.active.as_ref().map(|a| a.seq))
                .unwrap_or(inner.next_seq);
            if inner.cursor.segment <= oldest {
                inner.cursor = BatchRef {
                    segment: next,
                    record: 0,
                };
            }
            if inner.read_pos.segment <= oldest {
                inner.read_pos = BatchRef {
                    segment: next,
                    record: 0,
                };
            }
        }
    }

    fn compute_total_bytes(&self, inner: &Inner) -> u64 {
        let sealed: u64 = inner.sealed.iter().map(|m| m.file_bytes).sum();
        sealed + inner.active.as_ref().map(|a| a.file_bytes).unwrap_or(0)
    }

    fn update_gauges(&self, inner: &Inner) {
        self.metrics
            .dlq_size_bytes
            .set(self.compute_total_bytes(inner) as i64);
        let files = inner.sealed.len() as i64 + i64::from(inner.active.is_some());
        self.metrics.dlq_files_count.set(files);
    }

    /// Total bytes currently on disk.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        self.compute_total_bytes(&inner)
    }

    /// True when unreplayed data remains (sealed backlog or active data).
    #[must_use]
    pub fn has_backlog(&self) -> bool {
        let inner = self.inner.lock();
        let active_data = inner.active.as_ref().is_some_and(|a| a.records > 0);
        let sealed_backlog = inner.sealed.iter().any(|m| {
            m.seq > inner.cursor.segment
                || (m.seq == inner.cursor.segment && inner.cursor.record < m.records)
        });
        active_data || sealed_backlog
    }

    /// Fsyncs the active segment and persists the manifest. Called on
    /// controlled shutdown.
    pub fn flush(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.active.as_mut() {
            active.file.sync_all().map_err(|e| Error::DurableWriteFailed {
                details: e.to_string(),
            })?;
            active.writes_since_sync = 0;
            active.last_sync = Instant::now();
        }
        self.persist_manifest(&inner);
        inner.advances_since_persist = 0;
        Ok(())
    }
}
