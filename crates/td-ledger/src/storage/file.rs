use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use td_types::{LedgerError, LedgerResult};

use super::{JournalBackend, JournalOp, JournalStorage, StorageKind};

/// Journal stored as one JSON op per line. The cursor is a byte offset.
///
/// Every handle opens the file in append mode and writes a whole line with a
/// single `write_all`, so concurrent writers on a local filesystem never
/// interleave within a line. Readers only consume lines terminated by `\n`;
/// a line still being written is picked up on the next read.
#[derive(Debug, Clone)]
pub struct FileLog {
    path: PathBuf,
}

impl FileLog {
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Opened journal at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JournalBackend for FileLog {
    fn kind(&self) -> StorageKind {
        StorageKind::JournalFile
    }

    fn append(&self, op: &JournalOp) -> LedgerResult<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    fn read_from(&self, cursor: u64) -> LedgerResult<(Vec<JournalOp>, u64)> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok((Vec::new(), cursor)),
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(cursor))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let complete = match buffer.iter().rposition(|byte| *byte == b'\n') {
            Some(last_newline) => last_newline + 1,
            None => return Ok((Vec::new(), cursor)),
        };

        let mut ops = Vec::new();
        let mut offset = cursor;
        for line in buffer[..complete].split_inclusive(|byte| *byte == b'\n') {
            let body = &line[..line.len() - 1];
            if !body.is_empty() {
                let op: JournalOp = serde_json::from_slice(body).map_err(|err| LedgerError::CorruptJournal {
                    offset,
                    message: err.to_string(),
                })?;
                ops.push(op);
            }
            offset += line.len() as u64;
        }

        Ok((ops, cursor + complete as u64))
    }
}

impl JournalStorage<FileLog> {
    /// Open (creating if needed) the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        Ok(Self::with_backend(FileLog::open(path)?))
    }
}
