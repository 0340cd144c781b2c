//! Append-only journal of committed batches.
//!
//! On-disk format, one entry per committed unit of work:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized batch)]
//! ```
//!
//! Recovery reads front-to-back and stops at the first entry that is
//! truncated or fails its checksum: that entry is a torn write from a crash
//! and everything after it is discarded. Batches depend on their
//! predecessors, so skipping an entry in the middle is never safe.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: u64 = 8;

/// Flush/sync strategy for the journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every commit.
    EveryCommit,
    /// Flush to the OS and rely on page-cache write-back.
    #[default]
    OsDefault,
}

/// Journal configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub sync_mode: SyncMode,
}

/// An open journal file.
pub struct Journal {
    path: PathBuf,
    file: Mutex<JournalFile>,
    config: JournalConfig,
}

/// The file handle and the length of its intact prefix.
struct JournalFile {
    file: File,
    len: u64,
}

impl Journal {
    /// Open (or create) the journal at `path` and recover its entries.
    ///
    /// A torn tail is truncated away so later appends start on a clean
    /// boundary.
    pub fn open<T: DeserializeOwned>(path: &Path, config: JournalConfig) -> StoreResult<(Self, Vec<T>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let (entries, valid_len) = recover(&file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                discarded = file_len - valid_len,
                "truncating torn journal tail"
            );
            file.set_len(valid_len)?;
        }
        debug!(path = %path.display(), recovered = entries.len(), "journal opened");

        let journal = Self {
            path: path.to_path_buf(),
            file: Mutex::new(JournalFile { file, len: valid_len }),
            config,
        };
        Ok((journal, entries))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Returns the number of bytes written.
    ///
    /// A failed write or sync truncates the file back to its last intact
    /// entry, so a later append never lands behind a partial frame.
    pub fn append<T: Serialize>(&self, entry: &T) -> StoreResult<u64> {
        let payload = bincode::serialize(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let length = u32::try_from(payload.len())
            .map_err(|_| StoreError::Serialization(format!("journal entry too large: {} bytes", payload.len())))?;
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut guard = self
            .file
            .lock()
            .map_err(|e| StoreError::LockPoisoned(format!("journal: {e}")))?;
        let JournalFile { file, len } = &mut *guard;
        let offset = *len;
        if file.metadata()?.len() != offset {
            warn!(offset, "discarding bytes past the last journal entry");
            file.set_len(offset)?;
        }

        // Positioned write at the end; the handle is shared with recovery reads.
        let written = write_at_end(file, offset, &frame).and_then(|()| match self.config.sync_mode {
            SyncMode::EveryCommit => file.sync_data(),
            SyncMode::OsDefault => Ok(()),
        });
        if let Err(e) = written {
            if let Err(rollback) = file.set_len(offset) {
                warn!(offset, error = %rollback, "failed to truncate partial journal entry");
            }
            return Err(e.into());
        }
        *len += frame.len() as u64;

        debug!(offset, len = payload.len(), "journal append");
        Ok(frame.len() as u64)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("config", &self.config)
            .finish()
    }
}

fn write_at_end(file: &mut File, offset: u64, frame: &[u8]) -> io::Result<()> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(frame)?;
    file.flush()
}

/// Read every intact entry. Returns the entries and the byte length of the
/// intact prefix.
fn recover<T: DeserializeOwned>(file: &File) -> StoreResult<(Vec<T>, u64)> {
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut offset = 0u64;

    while offset + HEADER_SIZE <= file_len {
        let mut header = [0u8; HEADER_SIZE as usize];
        reader.read_exact(&mut header)?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if offset + HEADER_SIZE + length > file_len {
            warn!(offset, length, "truncated journal entry; stopping recovery");
            break;
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != expected_crc {
            warn!(offset, "journal entry failed CRC check; stopping recovery");
            break;
        }

        let entry = bincode::deserialize(&payload).map_err(|e| StoreError::CorruptJournal {
            entry: entries.len(),
            reason: e.to_string(),
        })?;
        entries.push(entry);
        offset += HEADER_SIZE + length;
    }

    Ok((entries, offset))
}
