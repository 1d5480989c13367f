//! File-backed log device.
//!
//! Frame layout (little-endian):
//! ┌────────────┬────────────┬───────────┐
//! │ u32 len    │ u32 crc32  │ payload…  │
//! └────────────┴────────────┴───────────┘
//! - `len`    : number of bytes in payload
//! - `crc32`  : checksum of payload for corruption detection
//!
//! Records are buffered in memory until `flush`; the buffered tail is what
//! makes the in-place `compensate` primitive possible. An lsn→offset index
//! over the framed part of the file backs `fetch`.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crc32fast::Hasher;
use ferrolog_transaction::lsn::Lsn;
use log::warn;
use parking_lot::Mutex;

use super::{FRAME_HEADER as HEADER_SIZE, LogDevice, LogRecord};
use crate::error::{LogError, StorageError, StorageResult};

const FIRST_LSN: u64 = 1;
const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

/// Configuration for a [`FileLog`].
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    pub path: PathBuf,
    /// Global log-space budget in bytes, shared between outstanding
    /// reservations and written content.
    pub capacity: u64,
}

fn default_log_path() -> PathBuf {
    let tmp_dir = temp_dir::TempDir::new().unwrap();
    let path = tmp_dir.path().join("ferrolog-wal.log");
    tmp_dir.leak();
    path
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

struct Buffered {
    record: LogRecord,
    est: u64,
}

struct FileLogInner {
    writer: BufWriter<File>,
    /// Inserted but not yet framed out to the file, in LSN order.
    tail: VecDeque<Buffered>,
    /// lsn → frame offset for everything framed out.
    index: HashMap<u64, u64>,
    next_lsn: u64,
    min_lsn: u64,
    /// Logical end of the framed part of the file.
    end_offset: u64,
    /// Highest LSN framed out so far (durable once synced).
    framed: u64,
}

/// File-backed implementation of [`LogDevice`].
pub struct FileLog {
    inner: Mutex<FileLogInner>,
    reserved: AtomicU64,
    content: AtomicU64,
    durable: AtomicU64,
    capacity: u64,
    path: PathBuf,
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&checksum.to_le_bytes());
    data.extend_from_slice(payload);
    data
}

fn encode(record: &LogRecord) -> StorageResult<Vec<u8>> {
    postcard::to_allocvec(record)
        .map_err(|e| StorageError::Log(LogError::SerializationFailed(e.to_string())))
}

fn decode(payload: &[u8]) -> StorageResult<LogRecord> {
    postcard::from_bytes(payload)
        .map_err(|e| StorageError::Log(LogError::DeserializationFailed(e.to_string())))
}

/// Read one frame at the reader's position. `Ok(None)` is clean EOF.
fn read_frame(reader: &mut impl Read) -> StorageResult<Option<(LogRecord, u64)>> {
    let mut header = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(StorageError::Log(LogError::Io(e)));
    }
    let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| StorageError::Log(LogError::Io(e)))?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != checksum {
        return Err(StorageError::Log(LogError::ChecksumMismatch));
    }

    let record = decode(&payload)?;
    Ok(Some((record, (HEADER_SIZE + len) as u64)))
}

impl FileLog {
    /// Open an existing log or create a new one at the configured path.
    pub fn open(config: FileLogConfig) -> StorageResult<Self> {
        if let Some(parent) = config.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Log(LogError::Io(e)))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .read(true)
            .open(&config.path)
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;

        // Scan whatever the file already holds to rebuild the index.
        file.seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        let mut index = HashMap::new();
        let mut offset = 0u64;
        let mut min_lsn = 0u64;
        let mut max_lsn = 0u64;
        loop {
            match read_frame(&mut file) {
                Ok(Some((record, bytes))) => {
                    let raw = record.lsn.raw();
                    index.insert(raw, offset);
                    offset += bytes;
                    if min_lsn == 0 || raw < min_lsn {
                        min_lsn = raw;
                    }
                    max_lsn = max_lsn.max(raw);
                }
                Ok(None) => break,
                Err(e) => {
                    // A torn or corrupt tail ends the recoverable prefix.
                    warn!("log scan stopped at offset {offset}: {e}");
                    break;
                }
            }
        }
        file.set_len(offset)
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;

        let next_lsn = if max_lsn == 0 { FIRST_LSN } else { max_lsn + 1 };
        let min_lsn = if min_lsn == 0 { next_lsn } else { min_lsn };

        Ok(Self {
            inner: Mutex::new(FileLogInner {
                writer: BufWriter::new(file),
                tail: VecDeque::new(),
                index,
                next_lsn,
                min_lsn,
                end_offset: offset,
                framed: max_lsn,
            }),
            reserved: AtomicU64::new(0),
            content: AtomicU64::new(offset),
            durable: AtomicU64::new(max_lsn),
            capacity: config.capacity,
            path: config.path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frame out tail records with lsn <= upto. Does not sync.
    fn frame_out(&self, inner: &mut FileLogInner, upto: Lsn) -> StorageResult<()> {
        while let Some(front) = inner.tail.front() {
            if front.record.lsn > upto {
                break;
            }
            let buffered = inner.tail.pop_front().expect("front checked above");
            let payload = encode(&buffered.record)?;
            let data = frame(&payload);
            inner
                .writer
                .write_all(&data)
                .map_err(|e| StorageError::Log(LogError::Io(e)))?;
            inner.index.insert(buffered.record.lsn.raw(), inner.end_offset);
            inner.end_offset += data.len() as u64;
            inner.framed = buffered.record.lsn.raw();
            // Correct the content accounting if compensation resized the record.
            self.content.fetch_add(data.len() as u64, Ordering::AcqRel);
            self.content.fetch_sub(buffered.est, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Iterate every retained record in file order. Buffered records are
    /// framed out first so the scan sees them.
    pub fn iter(&self) -> StorageResult<FileLogIter> {
        let mut inner = self.inner.lock();
        self.frame_out(&mut inner, Lsn::MAX)?;
        inner
            .writer
            .flush()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        let mut reader = inner
            .writer
            .get_ref()
            .try_clone()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        drop(inner);
        Ok(FileLogIter { reader })
    }

    /// All retained records, sorted by LSN. Used by recovery consumers.
    pub fn read_all(&self) -> StorageResult<Vec<LogRecord>> {
        let mut records = Vec::new();
        for entry in self.iter()? {
            records.push(entry?);
        }
        records.sort_by_key(|record| record.lsn);
        Ok(records)
    }
}

/// Streaming reader over a [`FileLog`]'s frames.
pub struct FileLogIter {
    reader: File,
}

impl Iterator for FileLogIter {
    type Item = StorageResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match read_frame(&mut self.reader) {
            Ok(Some((record, _))) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl LogDevice for FileLog {
    fn insert(&self, mut record: LogRecord) -> StorageResult<(Lsn, u64)> {
        let mut inner = self.inner.lock();
        let lsn = Lsn::with_raw(inner.next_lsn);
        inner.next_lsn += 1;
        record.lsn = lsn;
        let est = (encode(&record)?.len() + HEADER_SIZE) as u64;
        inner.tail.push_back(Buffered { record, est });
        self.content.fetch_add(est, Ordering::AcqRel);
        Ok((lsn, est))
    }

    fn fetch(&self, lsn: Lsn) -> StorageResult<LogRecord> {
        let mut inner = self.inner.lock();
        if lsn.raw() < inner.min_lsn {
            return Err(StorageError::Log(LogError::Eof));
        }
        if let Some(front) = inner.tail.front() {
            let start = front.record.lsn.raw();
            if lsn.raw() >= start {
                let pos = (lsn.raw() - start) as usize;
                return inner
                    .tail
                    .get(pos)
                    .map(|b| b.record.clone())
                    .ok_or(StorageError::Log(LogError::NotFound(lsn)));
            }
        }
        let Some(&offset) = inner.index.get(&lsn.raw()) else {
            return Err(StorageError::Log(LogError::NotFound(lsn)));
        };
        // Push buffered frames to the OS so the read handle sees them.
        inner
            .writer
            .flush()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        let mut reader = inner
            .writer
            .get_ref()
            .try_clone()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        match read_frame(&mut reader)? {
            Some((record, _)) => Ok(record),
            None => Err(StorageError::Log(LogError::NotFound(lsn))),
        }
    }

    fn flush(&self, upto: Lsn, block: bool) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        self.frame_out(&mut inner, upto)?;
        if block {
            inner
                .writer
                .flush()
                .map_err(|e| StorageError::Log(LogError::Io(e)))?;
            inner
                .writer
                .get_ref()
                .sync_data()
                .map_err(|e| StorageError::Log(LogError::Io(e)))?;
            self.durable.store(inner.framed, Ordering::Release);
        }
        Ok(())
    }

    fn durable_lsn(&self) -> Lsn {
        Lsn::with_raw(self.durable.load(Ordering::Acquire))
    }

    fn reserve_space(&self, bytes: u64) -> bool {
        let mut cur = self.reserved.load(Ordering::Acquire);
        loop {
            let used = self.content.load(Ordering::Acquire);
            if self.capacity.saturating_sub(used.saturating_add(cur)) < bytes {
                return false;
            }
            match self.reserved.compare_exchange_weak(
                cur,
                cur + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    fn release_space(&self, bytes: u64) {
        let prev = self.reserved.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "log-space release underflow");
    }

    fn compensate(&self, target: Lsn, undo_nxt: Lsn) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        let Some(front) = inner.tail.front() else {
            return Err(());
        };
        let start = front.record.lsn.raw();
        if target.raw() < start {
            return Err(());
        }
        let pos = (target.raw() - start) as usize;
        match inner.tail.get_mut(pos) {
            Some(buffered) => {
                buffered.record.clr = true;
                buffered.record.undo_nxt = undo_nxt;
                Ok(())
            }
            None => Err(()),
        }
    }

    fn global_min_lsn(&self) -> Lsn {
        Lsn::with_raw(self.inner.lock().min_lsn)
    }

    fn space_left(&self) -> u64 {
        let taken = self
            .reserved
            .load(Ordering::Acquire)
            .saturating_add(self.content.load(Ordering::Acquire));
        self.capacity.saturating_sub(taken)
    }

    fn truncate_until(&self, lsn: Lsn) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        self.frame_out(&mut inner, Lsn::MAX)?;
        inner
            .writer
            .flush()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;

        // Collect the retained suffix.
        let mut reader = inner
            .writer
            .get_ref()
            .try_clone()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        let mut retained = Vec::new();
        while let Some((record, _)) = read_frame(&mut reader)? {
            if record.lsn >= lsn {
                retained.push(record);
            }
        }
        retained.sort_by_key(|record| record.lsn);

        // Rewrite the file with only the retained records.
        fs::remove_file(&self.path).map_err(|e| StorageError::Log(LogError::Io(e)))?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(true)
            .open(&self.path)
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        let mut writer = BufWriter::new(file);
        let mut index = HashMap::new();
        let mut offset = 0u64;
        let mut framed = 0u64;
        for record in &retained {
            let payload = encode(record)?;
            let data = frame(&payload);
            writer
                .write_all(&data)
                .map_err(|e| StorageError::Log(LogError::Io(e)))?;
            index.insert(record.lsn.raw(), offset);
            offset += data.len() as u64;
            framed = record.lsn.raw();
        }
        writer
            .flush()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;
        writer
            .get_ref()
            .sync_data()
            .map_err(|e| StorageError::Log(LogError::Io(e)))?;

        inner.writer = writer;
        inner.index = index;
        inner.end_offset = offset;
        inner.min_lsn = inner.min_lsn.max(lsn.raw());
        inner.framed = framed;
        self.content.store(offset, Ordering::Release);
        self.durable.store(framed, Ordering::Release);
        Ok(())
    }
}
