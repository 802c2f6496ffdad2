// =============================================================================
// Append-only Log (WAL) — segmented, fsync-on-write record log
// =============================================================================
//
// Every record is `{index: u64, key: String, value: Vec<u8>}`. Indices are
// contiguous and strictly increasing per `Wal` instance. The core never
// rewrites a record; corrections are new records carrying the same key.
//
// Storage is segmented: a new segment file is started once the live segment
// exceeds `segment_threshold` records; segments beyond `max_segments` are
// deleted (bounded retention). On open, the log replays every retained
// segment to rebuild its in-memory index and tolerates a torn trailing
// record on the newest segment by truncating it away.
// =============================================================================

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

const SEGMENT_PREFIX: &str = "log_";

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal record at index {0} not found or has been retired")]
    NotFound(u64),
    #[error("wal append out of order: expected index {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
}

pub type Result<T> = std::result::Result<T, WalError>;

/// One committed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub index: u64,
    pub key: String,
    pub value: Vec<u8>,
}

/// Location of a record within the segment files, used for random access.
#[derive(Debug, Clone, Copy)]
struct RecordLocation {
    segment: u64,
    offset: u64,
    len: u64,
}

struct Segment {
    id: u64,
    path: PathBuf,
    record_count: usize,
}

struct WalInner {
    dir: PathBuf,
    segments: Vec<Segment>,
    writer: BufWriter<File>,
    current_index: u64,
    index_of: HashMap<u64, RecordLocation>,
}

/// A segmented, crash-safe append-only log.
pub struct Wal {
    inner: Mutex<WalInner>,
    sync: bool,
    segment_threshold: usize,
    max_segments: usize,
}

impl Wal {
    /// Open (or create) a WAL rooted at `dir`, replaying any existing
    /// segments. `sync` enables fsync-before-ack on every append (the
    /// default for the core).
    pub fn open(
        dir: impl AsRef<Path>,
        segment_threshold: usize,
        max_segments: usize,
        sync: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segment_ids = segment_ids_in(&dir)?;
        segment_ids.sort_unstable();

        let mut segments = Vec::new();
        let mut index_of = HashMap::new();
        let mut current_index = 0u64;

        for (pos, id) in segment_ids.iter().enumerate() {
            let path = segment_path(&dir, *id);
            let is_last = pos + 1 == segment_ids.len();
            let record_count =
                replay_segment(&path, *id, is_last, &mut index_of, &mut current_index)?;
            segments.push(Segment {
                id: *id,
                path,
                record_count,
            });
        }

        if segments.is_empty() {
            let id = 0;
            let path = segment_path(&dir, id);
            File::create(&path)?;
            segments.push(Segment {
                id,
                path,
                record_count: 0,
            });
        }

        let last_path = segments.last().expect("at least one segment").path.clone();
        let file = OpenOptions::new().append(true).open(&last_path)?;
        let writer = BufWriter::new(file);

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            current_index,
            "wal opened"
        );

        Ok(Self {
            inner: Mutex::new(WalInner {
                dir,
                segments,
                writer,
                current_index,
                index_of,
            }),
            sync,
            segment_threshold,
            max_segments,
        })
    }

    /// Persist `(key, value)` as the next record. Durable (and fsynced, when
    /// sync mode is on) before returning. Returns the assigned index.
    pub fn append(&self, key: &str, value: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let index = inner.current_index + 1;

        let mut buf = Vec::with_capacity(8 + 4 + key.len() + 4 + value.len());
        buf.extend_from_slice(&index.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(value);

        let segment_id = inner.segments.last().expect("at least one segment").id;
        let offset = inner.writer.stream_position()?;

        inner.writer.write_all(&buf)?;
        inner.writer.flush()?;
        if self.sync {
            inner.writer.get_ref().sync_data()?;
        }

        inner.current_index = index;
        inner.index_of.insert(
            index,
            RecordLocation {
                segment: segment_id,
                offset,
                len: buf.len() as u64,
            },
        );
        let last = inner
            .segments
            .last_mut()
            .expect("at least one segment");
        last.record_count += 1;

        debug!(key, index, bytes = buf.len(), "wal record appended");

        if last.record_count >= self.segment_threshold {
            self.rotate(&mut inner)?;
        }

        Ok(index)
    }

    /// Highest committed index (0 if the log is empty).
    pub fn current_index(&self) -> u64 {
        self.inner.lock().current_index
    }

    /// All retained records in index order.
    pub fn iterate(&self) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        for segment in &inner.segments {
            let mut f = File::open(&segment.path)?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)?;
            let mut cursor = 0usize;
            while let Some((record, consumed)) = parse_record(&buf[cursor..]) {
                records.push(record);
                cursor += consumed;
            }
        }
        Ok(records)
    }

    /// Random access to a still-retained record.
    pub fn get(&self, index: u64) -> Result<Option<(String, Vec<u8>)>> {
        let inner = self.inner.lock();
        let Some(loc) = inner.index_of.get(&index) else {
            return Ok(None);
        };
        let segment = inner
            .segments
            .iter()
            .find(|s| s.id == loc.segment)
            .ok_or(WalError::NotFound(index))?;
        let mut f = File::open(&segment.path)?;
        f.seek(SeekFrom::Start(loc.offset))?;
        let mut buf = vec![0u8; loc.len as usize];
        f.read_exact(&mut buf)?;
        match parse_record(&buf) {
            Some((record, _)) => Ok(Some((record.key, record.value))),
            None => Ok(None),
        }
    }

    /// Flush buffered writes. Called on graceful shutdown.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn rotate(&self, inner: &mut WalInner) -> Result<()> {
        inner.writer.flush()?;
        let next_id = inner.segments.last().expect("at least one segment").id + 1;
        let path = segment_path(&inner.dir, next_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        inner.writer = BufWriter::new(file);
        inner.segments.push(Segment {
            id: next_id,
            path,
            record_count: 0,
        });
        debug!(segment = next_id, "wal segment rotated");

        while inner.segments.len() > self.max_segments {
            let retired = inner.segments.remove(0);
            inner.index_of.retain(|_, loc| loc.segment != retired.id);
            if let Err(e) = fs::remove_file(&retired.path) {
                warn!(segment = retired.id, error = %e, "failed to delete retired wal segment");
            } else {
                debug!(segment = retired.id, "wal segment retired");
            }
        }

        Ok(())
    }
}

fn segment_ids_in(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(suffix) = name.strip_prefix(SEGMENT_PREFIX) {
            if let Ok(id) = suffix.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{id}"))
}

/// Parse one record from the front of `buf`. Returns the record and the
/// number of bytes consumed, or `None` if `buf` doesn't hold a complete
/// record (a torn trailing write).
fn parse_record(buf: &[u8]) -> Option<(Record, usize)> {
    if buf.len() < 16 {
        return None;
    }
    let index = u64::from_le_bytes(buf[0..8].try_into().ok()?);
    let key_len = u32::from_le_bytes(buf[8..12].try_into().ok()?) as usize;
    let key_start: usize = 12;
    let key_end = key_start.checked_add(key_len)?;
    if buf.len() < key_end + 4 {
        return None;
    }
    let key = std::str::from_utf8(&buf[key_start..key_end]).ok()?.to_string();
    let value_len_start = key_end;
    let value_len =
        u32::from_le_bytes(buf[value_len_start..value_len_start + 4].try_into().ok()?) as usize;
    let value_start = value_len_start + 4;
    let value_end = value_start.checked_add(value_len)?;
    if buf.len() < value_end {
        return None;
    }
    let value = buf[value_start..value_end].to_vec();
    Some((Record { index, key, value }, value_end))
}

/// Replay one segment file, folding its records into `index_of` and
/// advancing `current_index`. If `is_last` and the final bytes in the file
/// don't form a complete record, the file is truncated to the last valid
/// record boundary (tolerating a torn trailing write from a crash mid-append).
fn replay_segment(
    path: &Path,
    segment_id: u64,
    is_last: bool,
    index_of: &mut HashMap<u64, RecordLocation>,
    current_index: &mut u64,
) -> Result<usize> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;

    let mut cursor = 0usize;
    let mut record_count = 0usize;
    loop {
        match parse_record(&buf[cursor..]) {
            Some((record, consumed)) => {
                index_of.insert(
                    record.index,
                    RecordLocation {
                        segment: segment_id,
                        offset: cursor as u64,
                        len: consumed as u64,
                    },
                );
                if record.index > *current_index {
                    *current_index = record.index;
                }
                cursor += consumed;
                record_count += 1;
            }
            None => break,
        }
    }

    if cursor < buf.len() {
        if is_last {
            warn!(
                segment = segment_id,
                good_bytes = cursor,
                torn_bytes = buf.len() - cursor,
                "truncating torn trailing wal record"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(cursor as u64)?;
        } else {
            return Err(WalError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("corrupt non-trailing wal segment {segment_id}"),
            )));
        }
    }

    Ok(record_count)
}
