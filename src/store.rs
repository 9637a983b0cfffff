//! Append-only transaction log.
//!
//! Deliberately a flat file, not a database: the log is `MAGIC` followed by
//! a stream of length-prefixed JSON [`proto::Record`] frames, written in the
//! order the Writer hands them off. Replay ([`Journal::replay`]) reads the
//! same frames back for offline sync and crash recovery.
//!
//! A single in-flight append failure does not stop the run; it is counted
//! and surfaced to the caller so the Writer can decide whether to keep
//! going, with a degraded check at shutdown.

use crate::framing::{self, FramingError};
use proto::Record;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};

/// Identifies the file as one of ours and pins the frame format version.
pub const MAGIC: &[u8; 4] = b"RTJ1";

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("file does not start with the expected magic header")]
    BadMagic,
    #[error("file is shorter than the magic header")]
    Truncated,
}

/// An open handle to the journal file, append-only from here on.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
    failed_appends: u64,
}

impl Journal {
    /// Open (creating if necessary) the journal at `path`, writing the magic
    /// header if the file is new, and positioning for append if it already
    /// exists and is well-formed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let is_new = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;

        if is_new {
            file.write_all(MAGIC).await?;
            file.flush().await?;
        } else {
            let mut header = [0u8; 4];
            match file.read_exact(&mut header).await {
                Ok(_) => {
                    if &header != MAGIC {
                        return Err(JournalError::BadMagic);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(JournalError::Truncated);
                }
                Err(e) => return Err(e.into()),
            }
        }
        file.seek(SeekFrom::End(0)).await?;

        Ok(Journal {
            path,
            writer: BufWriter::new(file),
            failed_appends: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. On failure the error is returned to the caller
    /// *and* counted internally so [`Journal::failed_append_count`] reflects
    /// the run's overall health at shutdown time.
    pub async fn append(&mut self, record: &Record) -> Result<(), JournalError> {
        match self.append_inner(record).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.failed_appends += 1;
                Err(e)
            }
        }
    }

    async fn append_inner(&mut self, record: &Record) -> Result<(), JournalError> {
        let payload = serde_json::to_vec(record)?;
        framing::write_frame(&mut self.writer, &payload).await?;
        Ok(())
    }

    pub fn failed_append_count(&self) -> u64 {
        self.failed_appends
    }

    pub async fn flush(&mut self) -> Result<(), JournalError> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Read every record from `path` in order, independent of any open
    /// writer. Used for offline sync and for tests that assert on recorded
    /// history after a crash.
    pub async fn replay(path: impl AsRef<Path>) -> Result<Vec<Record>, JournalError> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let mut reader = BufReader::new(file);

        let mut header = [0u8; 4];
        match reader.read_exact(&mut header).await {
            Ok(_) => {
                if &header != MAGIC {
                    return Err(JournalError::BadMagic);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(JournalError::Truncated);
            }
            Err(e) => return Err(e.into()),
        }

        let mut records = Vec::new();
        loop {
            match framing::read_frame(&mut reader).await {
                Ok(Some(payload)) => records.push(serde_json::from_slice(&payload)?),
                Ok(None) => break,
                // A trailing partial frame means the process crashed mid-append;
                // everything written before it is still valid history.
                Err(FramingError::Truncated) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(records)
    }
}
