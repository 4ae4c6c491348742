//! Transaction journal for crash recovery.
//!
//! Every transaction batch is written here with a Pending marker before the
//! tables are touched, and a Committed marker after. Writes in this store
//! are all-or-nothing, so recovery never replays a pending batch: batches
//! without a Committed marker are discarded, and committed batches that
//! post-date the last snapshot are re-applied.

use crate::error::{Result, VaultError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"CVJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Journal entry status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum JournalEntryStatus {
    /// Batch written, tables not yet updated.
    Pending,
    /// Batch fully applied to the tables.
    Committed,
}

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct JournalEntry {
    /// Sequence number for this batch.
    pub seq: u64,
    /// Entry status.
    pub status: JournalEntryStatus,
    /// Serialized operation batch (empty for commit markers).
    pub payload: Vec<u8>,
    /// Seconds since epoch when the entry was written.
    pub timestamp: u64,
}

/// Append-only transaction journal.
pub(crate) struct Journal {
    /// Path to the journal file.
    path: PathBuf,
    /// Next sequence number to assign.
    next_seq: Mutex<u64>,
    /// Write handle.
    writer: Mutex<Option<BufWriter<File>>>,
}

impl Journal {
    /// Create or open a journal file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, writer) = if path.exists() {
            let file = OpenOptions::new().read(true).open(&path)?;
            let mut reader = BufReader::new(file);

            Self::read_header(&mut reader)?;

            // Read entries to find the highest sequence.
            let mut max_seq = 0u64;
            while let Ok(entry) = Self::read_entry(&mut reader) {
                max_seq = max_seq.max(entry.seq);
            }

            let file = OpenOptions::new().append(true).open(&path)?;
            (max_seq + 1, Some(BufWriter::new(file)))
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;

            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;

            (1, Some(BufWriter::new(file)))
        };

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(writer),
        })
    }

    /// Log a batch as pending (returns its sequence number).
    pub fn log(&self, payload: &[u8]) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;

        let entry = JournalEntry {
            seq,
            status: JournalEntryStatus::Pending,
            payload: payload.to_vec(),
            timestamp: now_secs(),
        };

        let mut writer = self.writer.lock();
        if let Some(ref mut w) = *writer {
            Self::write_entry(w, &entry)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }

        Ok(seq)
    }

    /// Mark a batch as committed.
    pub fn mark_committed(&self, seq: u64) -> Result<()> {
        let marker = JournalEntry {
            seq,
            status: JournalEntryStatus::Committed,
            payload: Vec::new(),
            timestamp: now_secs(),
        };

        let mut writer = self.writer.lock();
        if let Some(ref mut w) = *writer {
            Self::write_entry(w, &marker)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Payloads of committed batches, in sequence order.
    pub fn committed_batches(&self) -> Result<Vec<Vec<u8>>> {
        let entries = self.read_all()?;

        let committed: std::collections::HashSet<u64> = entries
            .iter()
            .filter(|e| e.status == JournalEntryStatus::Committed)
            .map(|e| e.seq)
            .collect();

        let mut batches: Vec<&JournalEntry> = entries
            .iter()
            .filter(|e| e.status == JournalEntryStatus::Pending && committed.contains(&e.seq))
            .collect();
        batches.sort_by_key(|e| e.seq);

        Ok(batches.into_iter().map(|e| e.payload.clone()).collect())
    }

    /// Number of batches that never got a commit marker.
    pub fn pending_count(&self) -> Result<usize> {
        let entries = self.read_all()?;

        let committed: std::collections::HashSet<u64> = entries
            .iter()
            .filter(|e| e.status == JournalEntryStatus::Committed)
            .map(|e| e.seq)
            .collect();

        Ok(entries
            .iter()
            .filter(|e| e.status == JournalEntryStatus::Pending && !committed.contains(&e.seq))
            .count())
    }

    /// Truncate the journal (called after a successful snapshot).
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));

        *self.next_seq.lock() = 1;

        Ok(())
    }

    fn read_all(&self) -> Result<Vec<JournalEntry>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        Self::read_header(&mut reader)?;

        let mut entries = Vec::new();
        while let Ok(entry) = Self::read_entry(&mut reader) {
            entries.push(entry);
        }
        Ok(entries)
    }

    fn read_header(reader: &mut BufReader<File>) -> Result<()> {
        reader.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(VaultError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(VaultError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn write_entry(writer: &mut BufWriter<File>, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        Ok(())
    }

    fn read_entry(reader: &mut BufReader<File>) -> Result<JournalEntry> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > 100 * 1024 * 1024 {
            // 100MB sanity check
            return Err(VaultError::Corruption("Journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(VaultError::Corruption("Journal checksum mismatch".into()));
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
