//! Overflow store: rotating segment files plus a persisted read cursor

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use super::record::{self, Decoded};
use super::segment::{self, SegmentId};
use crate::error::StoreError;
use crate::message::OutboundMessage;

const CURSOR_FILE: &str = "cursor";
const CURSOR_TMP_FILE: &str = "cursor.tmp";
const COMPACT_SUFFIX: &str = ".compact";

/// Records consumed between cursor writes during a drain
const CURSOR_PERSIST_INTERVAL: u64 = 64;

#[derive(Debug, Clone)]
struct SegmentMeta {
    id: SegmentId,
    len: u64,
    records: u64,
}

/// Progress through the head segment. Ignored if `segment` is no longer the head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReadCursor {
    segment: SegmentId,
    offset: u64,
    consumed: u64,
}

/// Bounded, rotating file store for messages that no longer fit in memory.
///
/// Appends go to the newest segment. Reads consume the oldest segment from the
/// persisted cursor onwards, so records are replayed in append order across
/// restarts. When `max_segments` is reached the oldest segment is deleted,
/// unconsumed records included.
#[derive(Debug)]
pub struct OverflowStore {
    dir: PathBuf,
    max_segments: usize,
    max_segment_bytes: u64,
    segments: VecDeque<SegmentMeta>,
    cursor: ReadCursor,
    next_id: u64,
    active: Option<File>,
    evicted_records: u64,
}

impl OverflowStore {
    /// Open a store over `dir`, picking up segments left by a previous run.
    ///
    /// The directory is not created here; the first append creates it.
    /// Existing segments are compacted: torn tails are truncated and the
    /// already replayed prefix of the head segment is removed.
    pub fn open(
        dir: impl Into<PathBuf>,
        max_segments: usize,
        max_segment_bytes: u64,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        let mut store = Self {
            dir,
            max_segments: max_segments.max(1),
            max_segment_bytes,
            segments: VecDeque::new(),
            cursor: ReadCursor::default(),
            next_id: 1,
            active: None,
            evicted_records: 0,
        };

        if !store.dir.exists() {
            debug!(dir = %store.dir.display(), "Overflow directory does not exist yet");
            return Ok(store);
        }

        let entries = fs::read_dir(&store.dir).map_err(|e| StoreError::io(&store.dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&store.dir, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(SegmentId::parse_file_name) {
                ids.push(id);
            }
        }
        ids.sort();

        if let Some(last) = ids.last() {
            store.next_id = last.0 + 1;
        }
        store.segments = ids
            .into_iter()
            .map(|id| SegmentMeta {
                id,
                len: 0,
                records: 0,
            })
            .collect();
        store.cursor = store.load_cursor();
        store.compact()?;

        if !store.segments.is_empty() {
            info!(
                dir = %store.dir.display(),
                segments = store.segments.len(),
                records = store.record_count(),
                "Recovered overflow segments from previous run"
            );
        }
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Segment ids in append order, oldest first
    pub fn list_segments(&self) -> Vec<SegmentId> {
        self.segments.iter().map(|s| s.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Unconsumed records across all segments
    pub fn record_count(&self) -> u64 {
        let total: u64 = self.segments.iter().map(|s| s.records).sum();
        total.saturating_sub(self.head_progress().1)
    }

    /// Unconsumed bytes on disk, record framing included
    pub fn size_bytes(&self) -> u64 {
        let total: u64 = self.segments.iter().map(|s| s.len).sum();
        total.saturating_sub(self.head_progress().0)
    }

    /// Records lost to segment eviction or discarded segments since the
    /// store was opened
    pub fn evicted_records(&self) -> u64 {
        self.evicted_records
    }

    /// Append one record to the active segment, rotating first if it would
    /// overflow `max_segment_bytes`.
    pub fn append(&mut self, msg: &OutboundMessage) -> Result<(), StoreError> {
        let len = record::encoded_len(msg);
        if len > self.max_segment_bytes {
            return Err(StoreError::RecordTooLarge {
                size: len,
                limit: self.max_segment_bytes,
            });
        }

        fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let needs_rotation = match self.segments.back() {
            None => true,
            Some(last) => last.len + len > self.max_segment_bytes,
        };
        if needs_rotation {
            self.rotate()?;
        }

        let bytes = record::encode(msg);
        let Some(last) = self.segments.back() else {
            return Ok(());
        };
        let (id, committed) = (last.id, last.len);
        let path = self.segment_path(id);

        let result = self.active_file(id).and_then(|file| file.write_all(&bytes));
        if let Err(e) = result {
            // Cut off whatever part of the record made it to disk
            self.active = None;
            if let Ok(file) = OpenOptions::new().write(true).open(&path) {
                let _ = file.set_len(committed);
            }
            return Err(StoreError::io(path, e));
        }

        if let Some(last) = self.segments.back_mut() {
            last.len += len;
            last.records += 1;
        }
        Ok(())
    }

    /// Flush the active segment to disk.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        let Some(last) = self.segments.back() else {
            return Ok(());
        };
        let path = self.segment_path(last.id);
        if let Some(file) = self.active.as_mut() {
            file.sync_data().map_err(|e| StoreError::io(path, e))?;
        }
        Ok(())
    }

    /// Consuming iterator over one segment.
    ///
    /// Segments are drained oldest first; iterating a segment that is not
    /// the current head yields nothing. Each yielded record is consumed
    /// unless handed back with [`SegmentDrain::requeue_last`].
    pub fn iterate(&mut self, segment: SegmentId) -> SegmentDrain<'_> {
        let is_head = self.segments.front().is_some_and(|s| s.id == segment);
        if !is_head {
            debug!(segment = %segment, "Skipping drain of non-head segment");
        }
        SegmentDrain {
            store: self,
            segment,
            reader: None,
            last: None,
            unpersisted: 0,
            done: !is_head,
        }
    }

    /// Rewrite the store so it holds only unconsumed, valid records.
    ///
    /// Truncates torn tails, removes the consumed prefix of the head segment
    /// and deletes empty segments. Runs on open and on publisher shutdown.
    pub fn compact(&mut self) -> Result<(), StoreError> {
        self.active = None;

        let mut kept = VecDeque::with_capacity(self.segments.len());
        let segments = std::mem::take(&mut self.segments);
        for mut meta in segments {
            let path = self.segment_path(meta.id);
            let scan = match segment::scan(&path) {
                Ok(scan) => scan,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(path, e)),
            };

            if let Some(reason) = scan.torn {
                warn!(
                    segment = %meta.id,
                    reason,
                    dropped_bytes = scan.file_len - scan.valid_len,
                    "Truncating damaged segment tail"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| StoreError::io(&path, e))?;
                file.set_len(scan.valid_len)
                    .map_err(|e| StoreError::io(&path, e))?;
            }
            meta.len = scan.valid_len;
            meta.records = scan.records;

            let is_head = kept.is_empty();
            if is_head && self.cursor.segment == meta.id && self.cursor.offset > 0 {
                if self.cursor.offset >= meta.len {
                    meta.records = 0;
                } else {
                    self.strip_prefix(&path, self.cursor.offset)?;
                    meta.len -= self.cursor.offset;
                    meta.records = meta.records.saturating_sub(self.cursor.consumed);
                }
            }

            if meta.records == 0 {
                remove_file(&path)?;
                continue;
            }
            kept.push_back(meta);
        }

        self.segments = kept;
        self.cursor = ReadCursor {
            segment: self.segments.front().map(|s| s.id).unwrap_or_default(),
            offset: 0,
            consumed: 0,
        };
        self.persist_cursor()
    }

    fn strip_prefix(&self, path: &Path, offset: u64) -> Result<(), StoreError> {
        let tmp = path.with_extension(format!("log{}", COMPACT_SUFFIX));
        let copy = || -> io::Result<()> {
            let mut src = File::open(path)?;
            src.seek(SeekFrom::Start(offset))?;
            let mut dst = File::create(&tmp)?;
            io::copy(&mut src, &mut dst)?;
            dst.sync_all()?;
            fs::rename(&tmp, path)
        };
        copy().map_err(|e| StoreError::io(path, e))?;
        debug!(path = %path.display(), removed_bytes = offset, "Removed replayed prefix from segment");
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), StoreError> {
        self.active = None;
        while !self.segments.is_empty() && self.segments.len() >= self.max_segments {
            self.evict_oldest()?;
        }

        let id = SegmentId(self.next_id);
        self.next_id += 1;
        let path = self.segment_path(id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        self.segments.push_back(SegmentMeta {
            id,
            len: 0,
            records: 0,
        });
        self.active = Some(file);
        debug!(segment = %id, "Started new overflow segment");
        Ok(())
    }

    fn evict_oldest(&mut self) -> Result<(), StoreError> {
        let (_, consumed) = self.head_progress();
        let Some(oldest) = self.segments.pop_front() else {
            return Ok(());
        };
        let lost = oldest.records.saturating_sub(consumed);
        remove_file(&self.segment_path(oldest.id))?;

        self.evicted_records += lost;
        self.cursor = ReadCursor::default();
        error!(
            segment = %oldest.id,
            lost_records = lost,
            "Overflow store full, dropped oldest segment"
        );
        self.persist_cursor()
    }

    fn active_file(&mut self, id: SegmentId) -> io::Result<&mut File> {
        if self.active.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.segment_path(id))?;
            self.active = Some(file);
        }
        self.active
            .as_mut()
            .ok_or_else(|| io::Error::other("active segment unavailable"))
    }

    /// (byte offset, records consumed) into the head segment
    fn head_progress(&self) -> (u64, u64) {
        match self.segments.front() {
            Some(head) if head.id == self.cursor.segment => {
                (self.cursor.offset, self.cursor.consumed)
            },
            _ => (0, 0),
        }
    }

    /// Give up on the head segment, e.g. when its file is gone or cannot be
    /// read. Its unconsumed records are counted as evicted. Returns that count.
    pub fn discard_head(&mut self) -> Result<u64, StoreError> {
        let (_, consumed) = self.head_progress();
        let Some(head) = self.segments.pop_front() else {
            return Ok(0);
        };
        let lost = head.records.saturating_sub(consumed);
        if self.segments.is_empty() {
            self.active = None;
        }
        self.evicted_records += lost;
        self.cursor = ReadCursor {
            segment: self.segments.front().map(|s| s.id).unwrap_or_default(),
            offset: 0,
            consumed: 0,
        };
        error!(
            segment = %head.id,
            lost_records = lost,
            "Discarding unreadable overflow segment"
        );
        remove_file(&self.segment_path(head.id))?;
        self.persist_cursor()?;
        Ok(lost)
    }

    /// Drop the fully consumed head segment.
    fn finish_head(&mut self) -> Result<(), StoreError> {
        let Some(head) = self.segments.pop_front() else {
            return Ok(());
        };
        if self.segments.is_empty() {
            self.active = None;
        }
        remove_file(&self.segment_path(head.id))?;
        self.cursor = ReadCursor {
            segment: self.segments.front().map(|s| s.id).unwrap_or_default(),
            offset: 0,
            consumed: 0,
        };
        debug!(segment = %head.id, "Segment fully replayed");
        self.persist_cursor()
    }

    fn segment_path(&self, id: SegmentId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    fn load_cursor(&self) -> ReadCursor {
        let path = self.dir.join(CURSOR_FILE);
        let Ok(text) = fs::read_to_string(&path) else {
            return ReadCursor::default();
        };
        let fields: Vec<u64> = text
            .split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect();
        match fields.as_slice() {
            [segment, offset, consumed] => ReadCursor {
                segment: SegmentId(*segment),
                offset: *offset,
                consumed: *consumed,
            },
            _ => {
                warn!(path = %path.display(), "Ignoring malformed read cursor");
                ReadCursor::default()
            },
        }
    }

    fn persist_cursor(&self) -> Result<(), StoreError> {
        let path = self.dir.join(CURSOR_FILE);
        if self.segments.is_empty() {
            return remove_file(&path);
        }
        if !self.dir.exists() {
            return Ok(());
        }

        let tmp = self.dir.join(CURSOR_TMP_FILE);
        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            writeln!(
                file,
                "{} {} {}",
                self.cursor.segment.0, self.cursor.offset, self.cursor.consumed
            )?;
            file.sync_data()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| StoreError::io(&path, e))
    }
}

fn remove_file(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Consuming iterator returned by [`OverflowStore::iterate`].
///
/// The read cursor is persisted periodically and when the drain is dropped.
/// A fully read segment is deleted once the drain moves past its last record
/// or is dropped. A damaged record ends the segment: it is reported once as
/// [`StoreError::Corrupt`] and the rest of the segment is discarded.
pub struct SegmentDrain<'a> {
    store: &'a mut OverflowStore,
    segment: SegmentId,
    reader: Option<BufReader<File>>,
    last: Option<ReadCursor>,
    unpersisted: u64,
    done: bool,
}

impl SegmentDrain<'_> {
    /// Put the record most recently yielded back, ahead of everything else,
    /// and end the drain. Returns false if there was nothing to put back.
    pub fn requeue_last(&mut self) -> bool {
        let Some(previous) = self.last.take() else {
            return false;
        };
        self.store.cursor = previous;
        self.reader = None;
        self.done = true;
        self.unpersisted += 1;
        true
    }

    fn at_end(&self) -> bool {
        match self.store.segments.front() {
            Some(head) if head.id == self.segment => self.store.head_progress().0 >= head.len,
            _ => false,
        }
    }

    fn finish(&mut self) -> Option<Result<OutboundMessage, StoreError>> {
        self.done = true;
        self.reader = None;
        self.last = None;
        self.unpersisted = 0;
        self.store.finish_head().err().map(Err)
    }
}

impl Iterator for SegmentDrain<'_> {
    type Item = Result<OutboundMessage, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let seg_len = match self.store.segments.front() {
            Some(head) if head.id == self.segment => head.len,
            _ => {
                self.done = true;
                return None;
            },
        };
        let (offset, consumed) = self.store.head_progress();
        if offset >= seg_len {
            return self.finish();
        }

        if self.reader.is_none() {
            let path = self.store.segment_path(self.segment);
            let opened = File::open(&path).and_then(|mut file| {
                file.seek(SeekFrom::Start(offset))?;
                Ok(BufReader::new(file))
            });
            match opened {
                Ok(reader) => self.reader = Some(reader),
                Err(e) => {
                    self.done = true;
                    return Some(Err(StoreError::io(path, e)));
                },
            }
        }
        let reader = self.reader.as_mut()?;

        match record::decode_next(reader, seg_len - offset) {
            Ok(Decoded::Record(msg, len)) => {
                self.last = Some(ReadCursor {
                    segment: self.segment,
                    offset,
                    consumed,
                });
                self.store.cursor = ReadCursor {
                    segment: self.segment,
                    offset: offset + len,
                    consumed: consumed + 1,
                };
                self.unpersisted += 1;
                if self.unpersisted >= CURSOR_PERSIST_INTERVAL {
                    self.unpersisted = 0;
                    if let Err(e) = self.store.persist_cursor() {
                        warn!(error = %e, "Failed to persist read cursor");
                    }
                }
                Some(Ok(msg))
            },
            Ok(Decoded::End) => self.finish(),
            Ok(Decoded::Torn(reason)) => {
                let total = self.store.segments.front().map_or(0, |s| s.records);
                let lost_records = total.saturating_sub(consumed);
                error!(
                    segment = %self.segment,
                    offset,
                    reason,
                    lost_records,
                    "Corrupt overflow record, discarding rest of segment"
                );
                let corrupt = StoreError::Corrupt {
                    segment: self.segment.file_name(),
                    offset,
                    reason: reason.to_string(),
                    lost_records,
                };
                if let Some(Err(e)) = self.finish() {
                    warn!(error = %e, "Failed to remove corrupt segment");
                }
                Some(Err(corrupt))
            },
            Err(e) => {
                self.done = true;
                self.last = None;
                let path = self.store.segment_path(self.segment);
                Some(Err(StoreError::io(path, e)))
            },
        }
    }
}

impl Drop for SegmentDrain<'_> {
    fn drop(&mut self) {
        if !self.done && self.at_end() {
            if let Some(Err(e)) = self.finish() {
                warn!(segment = %self.segment, error = %e, "Failed to remove replayed segment");
            }
            return;
        }
        if self.unpersisted > 0 {
            if let Err(e) = self.store.persist_cursor() {
                warn!(error = %e, "Failed to persist read cursor");
            }
        }
    }
}
