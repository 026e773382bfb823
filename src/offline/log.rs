//! Durable log of requests that failed because the server was unreachable.
//!
//! Entries are appended as length-prefixed MessagePack frames with a CRC32
//! trailer. Settling an entry appends a commit marker instead of rewriting
//! the file; a torn frame at the tail is cut off when the log is opened.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::queue::QueuedRequest;
use crate::types::Timestamp;

/// Magic bytes for the pending log file.
const LOG_MAGIC: &[u8; 4] = b"PRL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Magic plus version byte.
const HEADER_LEN: u64 = 5;

/// Frames larger than this are treated as corruption.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Log entry status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryStatus {
    /// Request is waiting for replay.
    Pending,
    /// Marker: the entry with this sequence number was settled.
    Committed,
}

/// A single log frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number shared by a pending entry and its commit marker.
    pub seq: u64,
    /// Entry status.
    pub status: LogEntryStatus,
    /// Present on pending entries only.
    pub request: Option<QueuedRequest>,
    /// When the frame was written.
    pub timestamp: Timestamp,
}

/// Append-only pending-request log.
pub struct PendingRequestLog {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl PendingRequestLog {
    /// Create or open a log file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, writer) = if path.exists() {
            let file = OpenOptions::new().read(true).open(&path)?;
            let mut reader = BufReader::new(file);
            Self::read_header(&mut reader)?;

            let mut max_seq = 0u64;
            let mut valid_len = HEADER_LEN;
            while let Ok(entry) = Self::read_entry(&mut reader) {
                max_seq = max_seq.max(entry.seq);
                valid_len = reader.stream_position()?;
            }

            let file = OpenOptions::new().append(true).open(&path)?;
            let file_len = file.metadata()?.len();
            if file_len > valid_len {
                tracing::warn!(
                    path = %path.display(),
                    dropped = file_len - valid_len,
                    "truncating torn tail of pending request log"
                );
                file.set_len(valid_len)?;
            }
            (max_seq + 1, Some(BufWriter::new(file)))
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;

            (1, Some(BufWriter::new(file)))
        };

        tracing::debug!(path = %path.display(), next_seq, "opened pending request log");
        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a pending request, returning its sequence number.
    pub fn log(&self, request: &QueuedRequest) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        let entry = LogEntry {
            seq,
            status: LogEntryStatus::Pending,
            request: Some(request.clone()),
            timestamp: Timestamp::now(),
        };
        self.append(&entry)?;
        *next_seq += 1;
        Ok(seq)
    }

    /// Mark an entry as settled.
    pub fn commit(&self, seq: u64) -> Result<()> {
        let marker = LogEntry {
            seq,
            status: LogEntryStatus::Committed,
            request: None,
            timestamp: Timestamp::now(),
        };
        self.append(&marker)
    }

    /// Unsettled requests in the order they were logged.
    pub fn pending_entries(&self) -> Result<Vec<(u64, QueuedRequest)>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(file);

        let mut pending = BTreeMap::new();
        let mut committed = HashSet::new();
        while let Ok(entry) = Self::read_entry(&mut reader) {
            match (entry.status, entry.request) {
                (LogEntryStatus::Committed, _) => {
                    committed.insert(entry.seq);
                }
                (LogEntryStatus::Pending, Some(request)) => {
                    pending.insert(entry.seq, request);
                }
                (LogEntryStatus::Pending, None) => {
                    tracing::warn!(seq = entry.seq, "pending log entry without request");
                }
            }
        }

        Ok(pending
            .into_iter()
            .filter(|(seq, _)| !committed.contains(seq))
            .collect())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending_entries()?.is_empty())
    }

    /// Truncate to an empty log and restart numbering.
    pub fn clear(&self) -> Result<()> {
        let mut next_seq = self.next_seq.lock();
        let mut writer = self.writer.lock();
        *writer = None;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        *next_seq = 1;
        Ok(())
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut writer = self.writer.lock();
        let w = writer
            .as_mut()
            .ok_or_else(|| SyncError::InvalidOperation("pending log is closed".into()))?;
        Self::write_entry(w, entry)?;
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }

    fn read_header(reader: &mut BufReader<File>) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(SyncError::InvalidFormat("invalid pending log magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "unsupported pending log version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn write_entry(writer: &mut BufWriter<File>, entry: &LogEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;
        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok(())
    }

    fn read_entry(reader: &mut BufReader<File>) -> Result<LogEntry> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME {
            return Err(SyncError::Corruption("pending log frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}
