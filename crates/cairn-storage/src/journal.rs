//! Header journal backing LLT flushes.
//!
//! Before an LLT writes its frame headers in place, the whole batch is
//! written to `headers.journal` and synced. A crash part-way through the
//! in-place writes is repaired on the next open by replaying the batch; a
//! record torn by a crash during its own write is discarded, leaving the
//! previous consistent headers untouched.
//!
//! Record Layout:
//! ```text
//! +-----------+-----------+---------------------------------------+---------+
//! | magic u32 | count u32 | count x (file u32, pointer u64, 64B)  | crc u32 |
//! +-----------+-----------+---------------------------------------+---------+
//! ```

use bytes::{Buf, BufMut};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cairn_common::prelude::*;
use cairn_common::utils::{crc32, verify_crc32};

use crate::frame::FRAME_HEADER_SIZE;

/// "CJNL"
pub const JOURNAL_MAGIC: u32 = 0x434A_4E4C;

pub const JOURNAL_FILE_NAME: &str = "headers.journal";

const ENTRY_SIZE: usize = 4 + 8 + FRAME_HEADER_SIZE;

/// One journaled header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub frame: FrameId,
    pub header: [u8; FRAME_HEADER_SIZE],
}

fn io_err(e: std::io::Error) -> Error {
    Error::Storage(StorageError::IoError(e.to_string()))
}

pub fn encode_record(entries: &[JournalEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + entries.len() * ENTRY_SIZE + 4);
    buf.put_u32_le(JOURNAL_MAGIC);
    buf.put_u32_le(entries.len() as u32);
    for entry in entries {
        buf.put_u32_le(entry.frame.file.0);
        buf.put_u64_le(entry.frame.pointer);
        buf.put_slice(&entry.header);
    }
    let crc = crc32(&buf);
    buf.put_u32_le(crc);
    buf
}

pub fn decode_record(data: &[u8]) -> Result<Vec<JournalEntry>> {
    let torn = |reason: &str| Error::Storage(StorageError::JournalCorrupted(reason.to_string()));

    if data.len() < 12 {
        return Err(torn("record shorter than its fixed fields"));
    }
    let mut buf = data;
    if buf.get_u32_le() != JOURNAL_MAGIC {
        return Err(torn("bad magic"));
    }
    let count = buf.get_u32_le() as usize;
    let body_len = 8 + count * ENTRY_SIZE;
    if data.len() < body_len + 4 {
        return Err(torn("record truncated"));
    }
    let stored = (&data[body_len..body_len + 4]).get_u32_le();
    if !verify_crc32(&data[..body_len], stored) {
        return Err(torn("checksum mismatch"));
    }

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let file = FileId(buf.get_u32_le());
        let pointer = buf.get_u64_le();
        let mut header = [0u8; FRAME_HEADER_SIZE];
        buf.copy_to_slice(&mut header);
        entries.push(JournalEntry {
            frame: FrameId::new(file, pointer),
            header,
        });
    }
    Ok(entries)
}

/// The journal file of one engine
#[derive(Debug)]
pub struct HeaderJournal {
    path: PathBuf,
    file: File,
}

impl HeaderJournal {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back a pending batch, if any. A torn record is logged, cleared
    /// and reported as nothing to replay.
    pub fn recover(&mut self) -> Result<Option<Vec<JournalEntry>>> {
        let mut data = Vec::new();
        self.file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        self.file.read_to_end(&mut data).map_err(io_err)?;
        if data.is_empty() {
            return Ok(None);
        }
        match decode_record(&data) {
            Ok(entries) => Ok(Some(entries)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding torn header journal record");
                self.clear()?;
                Ok(None)
            }
        }
    }

    /// Durably record a batch before it is applied.
    pub fn write_batch(&mut self, entries: &[JournalEntry]) -> Result<()> {
        let record = encode_record(entries);
        self.file.set_len(0).map_err(io_err)?;
        self.file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        self.file.write_all(&record).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)
    }

    /// Forget the applied batch.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.file.metadata().map_err(io_err)?.len() == 0)
    }
}
