//! Write-ahead log frames backing the [`LogStore`](super::LogStore)
//!
//! Frame format: `[MAGIC][PAYLOAD_LEN u32][PAYLOAD][CRC32(PAYLOAD)]`, where the
//! payload is a bincode-encoded [`WalOp`]. The in-memory log is rebuilt by
//! replaying every frame in order; a torn or corrupted tail ends the replay
//! and is cut off before new frames are appended.

use crate::common::{crc32, Error, Result, WalSyncPolicy};
use crate::log::LogRecord;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

const WAL_MAGIC: [u8; 4] = [0x5A, 0x4C, 0x47, 0x31]; // "ZLG1"
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
const FRAME_OVERHEAD: u64 = 4 + 4 + 4;

/// One durable mutation of the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Append(LogRecord),
    /// Remove `from` and every later index
    Truncate { from: u64 },
    /// Record at `index` was executed against local storage
    Applied { index: u64 },
}

/// Appending side of the WAL
pub struct Wal {
    writer: BufWriter<File>,
    sync_policy: WalSyncPolicy,
    frames: u64,
}

impl Wal {
    /// Open for appending, cutting the file back to `valid_len` bytes
    /// (the end of the last intact frame found by [`WalReader`]).
    pub fn open(
        path: impl AsRef<Path>,
        sync_policy: WalSyncPolicy,
        valid_len: u64,
        frames: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "cutting torn WAL tail of {} at byte {}",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            writer: BufWriter::new(file),
            sync_policy,
            frames,
        })
    }

    /// Atomically replace the WAL at `path` with `ops` and open it for appending
    pub fn rewrite<'a>(
        path: impl AsRef<Path>,
        sync_policy: WalSyncPolicy,
        ops: impl IntoIterator<Item = &'a WalOp>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("wal.tmp");

        let mut frames = 0;
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for op in ops {
                write_frame(&mut writer, op)?;
                frames += 1;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        let len = std::fs::metadata(&path)?.len();
        Self::open(&path, sync_policy, len, frames)
    }

    /// Append one mutation
    pub fn append(&mut self, op: &WalOp) -> Result<()> {
        write_frame(&mut self.writer, op)?;
        self.frames += 1;
        self.maybe_sync()
    }

    /// Number of frames in the file
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()?;
            }
            WalSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            WalSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("WAL flush on close failed: {}", e);
        }
    }
}

fn write_frame<W: Write>(writer: &mut W, op: &WalOp) -> Result<()> {
    let payload = bincode::serialize(op)?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(Error::Wal(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }

    writer.write_all(&WAL_MAGIC)?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32(&payload).to_le_bytes())?;
    Ok(())
}

/// How a replay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayEnd {
    /// Byte offset after the last intact frame
    pub valid_len: u64,
    /// Frames read
    pub frames: u64,
    /// Replay stopped at a torn or corrupted frame
    pub torn: bool,
}

/// Lazy, single-pass iterator over the frames of a WAL file
pub struct WalReader {
    reader: Option<BufReader<File>>,
    offset: u64,
    frames: u64,
    torn: bool,
    error: Option<Error>,
    done: bool,
}

impl WalReader {
    /// A missing file replays as empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let reader = match File::open(path.as_ref()) {
            Ok(f) => Some(BufReader::new(f)),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            reader,
            offset: 0,
            frames: 0,
            torn: false,
            error: None,
            done: false,
        })
    }

    /// Drain the remaining frames and report where the replay ended.
    /// Fails only on I/O errors other than a torn tail.
    pub fn finish(mut self) -> Result<ReplayEnd> {
        while self.next().is_some() {}
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        Ok(ReplayEnd {
            valid_len: self.offset,
            frames: self.frames,
            torn: self.torn,
        })
    }

    fn read_frame(reader: &mut BufReader<File>) -> Result<Option<(WalOp, u64)>> {
        let mut magic = [0u8; 4];
        let mut filled = 0;
        while filled < magic.len() {
            match reader.read(&mut magic[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => return Ok(None),
            4 => {}
            _ => return Err(Error::Wal("torn frame header".into())),
        }
        if magic != WAL_MAGIC {
            return Err(Error::Corrupted("invalid WAL magic".into()));
        }

        let mut len_bytes = [0u8; 4];
        read_or_torn(reader, &mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            return Err(Error::Corrupted(format!("frame length {} too large", len)));
        }

        let mut payload = vec![0u8; len as usize];
        read_or_torn(reader, &mut payload)?;

        let mut crc_bytes = [0u8; 4];
        read_or_torn(reader, &mut crc_bytes)?;
        if crc32(&payload) != u32::from_le_bytes(crc_bytes) {
            return Err(Error::Corrupted("checksum mismatch".into()));
        }

        let op: WalOp = bincode::deserialize(&payload)
            .map_err(|e| Error::Corrupted(format!("undecodable frame: {}", e)))?;

        Ok(Some((op, FRAME_OVERHEAD + len as u64)))
    }
}

/// Distinguishes "file ended mid-frame" from real I/O failures
fn read_or_torn(reader: &mut BufReader<File>, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::Wal("torn frame".into()),
        _ => Error::Io(e),
    })
}

impl Iterator for WalReader {
    type Item = WalOp;

    fn next(&mut self) -> Option<WalOp> {
        if self.done {
            return None;
        }
        let reader = match self.reader.as_mut() {
            Some(r) => r,
            None => {
                self.done = true;
                return None;
            }
        };

        match Self::read_frame(reader) {
            Ok(Some((op, len))) => {
                self.offset += len;
                self.frames += 1;
                Some(op)
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(Error::Io(e)) => {
                self.error = Some(Error::Io(e));
                self.done = true;
                None
            }
            Err(e) => {
                tracing::warn!("WAL replay stopped at byte {}: {}", self.offset, e);
                self.torn = true;
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(index: u64, term: u32, sql: &str) -> LogRecord {
        LogRecord::new(index, term, sql, 0)
    }

    #[test]
    fn test_wal_basic() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path, WalSyncPolicy::Always, 0, 0).unwrap();
            wal.append(&WalOp::Append(record(1, 1, "INSERT A"))).unwrap();
            wal.append(&WalOp::Append(record(2, 1, "INSERT B"))).unwrap();
            wal.append(&WalOp::Truncate { from: 2 }).unwrap();
            wal.append(&WalOp::Applied { index: 1 }).unwrap();
            assert_eq!(wal.frames(), 4);
            wal.sync().unwrap();
        }

        let ops: Vec<WalOp> = WalReader::open(&wal_path).unwrap().collect();
        assert_eq!(ops.len(), 4);
        match &ops[0] {
            WalOp::Append(r) => {
                assert_eq!(r.index, 1);
                assert_eq!(r.sql, "INSERT A");
            }
            other => panic!("expected append, got {:?}", other),
        }
        assert_eq!(ops[2], WalOp::Truncate { from: 2 });
        assert_eq!(ops[3], WalOp::Applied { index: 1 });
    }

    #[test]
    fn test_missing_file_replays_empty() {
        let dir = tempdir().unwrap();
        let end = WalReader::open(dir.path().join("none.wal"))
            .unwrap()
            .finish()
            .unwrap();
        assert_eq!(end.valid_len, 0);
        assert_eq!(end.frames, 0);
        assert!(!end.torn);
    }

    #[test]
    fn test_torn_tail_is_cut() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("torn.wal");

        {
            let mut wal = Wal::open(&wal_path, WalSyncPolicy::Always, 0, 0).unwrap();
            wal.append(&WalOp::Append(record(1, 1, "INSERT A"))).unwrap();
            wal.append(&WalOp::Append(record(2, 1, "INSERT B"))).unwrap();
        }

        // chop the last frame in half
        let full = std::fs::metadata(&wal_path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
        file.set_len(full - 6).unwrap();
        drop(file);

        let end = WalReader::open(&wal_path).unwrap().finish().unwrap();
        assert!(end.torn);
        assert_eq!(end.frames, 1);

        // appending after the cut keeps the file readable
        {
            let mut wal =
                Wal::open(&wal_path, WalSyncPolicy::Always, end.valid_len, end.frames).unwrap();
            wal.append(&WalOp::Append(record(2, 2, "INSERT C"))).unwrap();
        }
        let ops: Vec<WalOp> = WalReader::open(&wal_path).unwrap().collect();
        assert_eq!(ops.len(), 2);
        match &ops[1] {
            WalOp::Append(r) => assert_eq!((r.index, r.term, r.sql.as_str()), (2, 2, "INSERT C")),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("rewrite.wal");

        {
            let mut wal = Wal::open(&wal_path, WalSyncPolicy::Always, 0, 0).unwrap();
            for i in 1..=5 {
                wal.append(&WalOp::Append(record(i, 1, "INSERT X"))).unwrap();
            }
            wal.append(&WalOp::Truncate { from: 3 }).unwrap();
        }

        let keep = vec![
            WalOp::Append(record(1, 1, "INSERT X")),
            WalOp::Append(record(2, 1, "INSERT X")),
        ];
        let wal = Wal::rewrite(&wal_path, WalSyncPolicy::Always, &keep).unwrap();
        assert_eq!(wal.frames(), 2);
        drop(wal);

        let ops: Vec<WalOp> = WalReader::open(&wal_path).unwrap().collect();
        assert_eq!(ops, keep);
    }
}
