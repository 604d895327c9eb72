//! DataFile - a flat file of fixed-size frames
//!
//! Provides positioned frame I/O with:
//! - A validated system frame at offset 0 (magic, version, extent size, last pointer)
//! - Reuse-or-extend frame allocation, serialized per file
//! - Growth in whole extents
//! - Identity checks on every frame write
//!
//! File Layout:
//! ```text
//! +--------------------+  0x00
//! | system frame (64B) |
//! +--------------------+  0x40
//! | frame              |  size recorded in its own header
//! | frame              |
//! | ...                |
//! +--------------------+  last_pointer
//! | unused extent tail |
//! +--------------------+  file length (multiple of extent_size)
//! ```

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use cairn_common::config::SYSTEM_FRAME_SIZE;
use cairn_common::prelude::*;
use cairn_common::utils::{crc32, round_up, verify_crc32};

use crate::frame::{FrameHeader, FRAME_HEADER_SIZE};
use crate::free_list::FreeList;

/// "CAIR"
pub const FILE_MAGIC: u32 = 0x4341_4952;

/// On-disk format version written into every system frame
pub const FORMAT_VERSION: u16 = 1;

const SYSTEM_CRC_OFFSET: usize = 60;

/// Outcome of validating a data file before any frame I/O
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Ready,
    NotFound,
    VersionMismatch { found: u16 },
    Corrupt(String),
}

/// Contents of the system frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemHeader {
    pub version: u16,
    pub file_id: FileId,
    pub extent_size: u64,
    /// End of the last allocated frame
    pub last_pointer: u64,
}

impl SystemHeader {
    pub fn new(file_id: FileId, extent_size: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            file_id,
            extent_size,
            last_pointer: SYSTEM_FRAME_SIZE,
        }
    }

    pub fn encode(&self) -> [u8; SYSTEM_FRAME_SIZE as usize] {
        let mut out = [0u8; SYSTEM_FRAME_SIZE as usize];
        {
            let mut buf = &mut out[..];
            buf.put_u32_le(FILE_MAGIC);
            buf.put_u16_le(self.version);
            buf.put_u16_le(0);
            buf.put_u32_le(self.file_id.0);
            buf.put_u64_le(self.extent_size);
            buf.put_u64_le(self.last_pointer);
        }
        let crc = crc32(&out[..SYSTEM_CRC_OFFSET]);
        out[SYSTEM_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse and validate; the error carries the matching [`FileStatus`].
    pub fn decode(data: &[u8]) -> std::result::Result<Self, FileStatus> {
        if data.len() < SYSTEM_FRAME_SIZE as usize {
            return Err(FileStatus::Corrupt("system frame truncated".into()));
        }
        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != FILE_MAGIC {
            return Err(FileStatus::Corrupt(format!("bad magic {:#x}", magic)));
        }
        let stored = (&data[SYSTEM_CRC_OFFSET..SYSTEM_FRAME_SIZE as usize]).get_u32_le();
        if !verify_crc32(&data[..SYSTEM_CRC_OFFSET], stored) {
            return Err(FileStatus::Corrupt("system frame checksum mismatch".into()));
        }
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(FileStatus::VersionMismatch { found: version });
        }
        let _reserved = buf.get_u16_le();
        let file_id = FileId(buf.get_u32_le());
        let extent_size = buf.get_u64_le();
        let last_pointer = buf.get_u64_le();
        if extent_size == 0 || last_pointer < SYSTEM_FRAME_SIZE {
            return Err(FileStatus::Corrupt(format!(
                "extent size {} / last pointer {} out of range",
                extent_size, last_pointer
            )));
        }
        Ok(Self {
            version,
            file_id,
            extent_size,
            last_pointer,
        })
    }
}

fn io_err(e: std::io::Error) -> Error {
    Error::Storage(StorageError::IoError(e.to_string()))
}

impl From<FileStatus> for Error {
    fn from(status: FileStatus) -> Self {
        match status {
            FileStatus::Ready => Error::internal("file status Ready is not an error"),
            FileStatus::NotFound => Error::Storage(StorageError::FileNotFound(String::new())),
            FileStatus::VersionMismatch { found } => Error::Storage(StorageError::VersionMismatch {
                expected: FORMAT_VERSION,
                found,
            }),
            FileStatus::Corrupt(reason) => Error::Storage(StorageError::CorruptHeader(reason)),
        }
    }
}

/// Result of [`DataFile::allocate_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub frame: FrameId,
    /// Taken from the free list rather than carved from the file end
    pub reused: bool,
}

/// One data file
pub struct DataFile {
    id: FileId,
    path: PathBuf,
    file: Mutex<File>,
    /// Allocation is serialized on this lock
    system: Mutex<SystemHeader>,
    len: AtomicU64,
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("len", &self.len.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataFile {
    /// Validate the system frame of `path` without opening it for writing.
    pub fn check_file(path: &Path) -> FileStatus {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FileStatus::NotFound,
            Err(e) => return FileStatus::Corrupt(e.to_string()),
        };
        let mut buf = [0u8; SYSTEM_FRAME_SIZE as usize];
        if let Err(e) = file.read_exact(&mut buf) {
            return FileStatus::Corrupt(format!("cannot read system frame: {}", e));
        }
        match SystemHeader::decode(&buf) {
            Ok(_) => FileStatus::Ready,
            Err(status) => status,
        }
    }

    /// Create a new file holding only its system frame.
    pub fn create(path: &Path, id: FileId, extent_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_err)?;

        let system = SystemHeader::new(id, extent_size);
        let len = round_up(SYSTEM_FRAME_SIZE, extent_size);
        file.set_len(len).map_err(io_err)?;

        let data_file = Self {
            id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            system: Mutex::new(system),
            len: AtomicU64::new(len),
        };
        data_file.write_at(0, &system.encode())?;
        data_file.sync()?;
        debug!(file = id.0, path = %path.display(), "created data file");
        Ok(data_file)
    }

    /// Open an existing file after validating its system frame.
    pub fn open(path: &Path) -> Result<Self> {
        match Self::check_file(path) {
            FileStatus::Ready => {}
            FileStatus::NotFound => {
                return Err(Error::Storage(StorageError::FileNotFound(
                    path.display().to_string(),
                )))
            }
            other => return Err(other.into()),
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        let mut buf = [0u8; SYSTEM_FRAME_SIZE as usize];
        file.read_exact(&mut buf).map_err(io_err)?;
        let system = SystemHeader::decode(&buf).map_err(Error::from)?;
        let len = file.metadata().map_err(io_err)?.len();

        Ok(Self {
            id: system.file_id,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            system: Mutex::new(system),
            len: AtomicU64::new(len),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::SeqCst)
    }

    pub fn system_header(&self) -> SystemHeader {
        *self.system.lock()
    }

    pub fn last_pointer(&self) -> u64 {
        self.system.lock().last_pointer
    }

    /// Hand out a frame of `size` bytes: a passed free frame of this file
    /// and size if there is one, else fresh space at the end of the file.
    ///
    /// Fresh space gets an unallocated placeholder header before the system
    /// frame is advanced past it, so a scan can always step over it.
    pub fn allocate_frame(
        &self,
        free_list: &FreeList,
        size: u32,
        referenced: impl Fn(FrameId) -> bool,
    ) -> Result<Allocation> {
        let mut system = self.system.lock();

        if let Some(entry) = free_list.take(self.id, size, referenced) {
            return Ok(Allocation {
                frame: entry.frame,
                reused: true,
            });
        }

        let pointer = system.last_pointer;
        let end = pointer + size as u64;
        self.ensure_len(round_up(end, system.extent_size))?;

        let frame = FrameId::new(self.id, pointer);
        self.write_at(pointer, &FrameHeader::unallocated(frame, size).encode())?;

        system.last_pointer = end;
        self.write_at(0, &system.encode())?;

        Ok(Allocation {
            frame,
            reused: false,
        })
    }

    /// Advance the allocation end to cover `[pointer, pointer + size)`,
    /// used when a frame arrives from another node. Any gap before it
    /// becomes one unallocated placeholder.
    pub fn reserve(&self, pointer: u64, size: u32) -> Result<()> {
        let mut system = self.system.lock();
        let end = pointer + size as u64;
        if end <= system.last_pointer {
            return Ok(());
        }
        if pointer < system.last_pointer {
            return Err(Error::consistency(format!(
                "frame {}:{} overlaps allocation end {}",
                self.id.0, pointer, system.last_pointer
            )));
        }
        self.ensure_len(round_up(end, system.extent_size))?;
        let gap = pointer - system.last_pointer;
        if gap > 0 {
            if gap < FRAME_HEADER_SIZE as u64 || gap > u32::MAX as u64 {
                return Err(Error::consistency(format!(
                    "cannot describe a {} byte gap before {}:{}",
                    gap, self.id.0, pointer
                )));
            }
            let filler = FrameId::new(self.id, system.last_pointer);
            self.write_at(filler.pointer, &FrameHeader::unallocated(filler, gap as u32).encode())?;
        }
        system.last_pointer = end;
        self.write_at(0, &system.encode())?;
        Ok(())
    }

    /// Grow the file to at least `len` bytes.
    pub fn ensure_len(&self, len: u64) -> Result<()> {
        if len <= self.len() {
            return Ok(());
        }
        let file = self.file.lock();
        file.set_len(len).map_err(io_err)?;
        self.len.store(len, Ordering::SeqCst);
        debug!(file = self.id.0, len, "extended data file");
        Ok(())
    }

    /// Raw positioned read.
    pub fn read_data(&self, pointer: u64, len: usize) -> Result<Vec<u8>> {
        if pointer + len as u64 > self.len() {
            return Err(Error::frame_not_found(FrameId::new(self.id, pointer).to_u64()));
        }
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pointer)).map_err(io_err)?;
        file.read_exact(&mut buf).map_err(io_err)?;
        Ok(buf)
    }

    fn write_at(&self, pointer: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pointer)).map_err(io_err)?;
        file.write_all(data).map_err(io_err)?;
        Ok(())
    }

    /// The header about to be written must name this file and pointer.
    fn check_identity(&self, pointer: u64, data: &[u8]) -> Result<()> {
        let target = FrameId::new(self.id, pointer);
        let header = FrameHeader::decode(data)?;
        if header.id != target {
            error!(
                target_frame = %target,
                embedded = %header.id,
                "refusing frame write: embedded identity does not match target"
            );
            return Err(Error::corrupted(
                target.to_u64(),
                format!("embedded identity {} does not match write target", header.id),
            ));
        }
        if pointer < SYSTEM_FRAME_SIZE || pointer + data.len() as u64 > self.len() {
            return Err(Error::frame_not_found(target.to_u64()));
        }
        Ok(())
    }

    /// Write a whole frame (header and body).
    pub fn write_frame(&self, pointer: u64, data: &[u8]) -> Result<()> {
        self.check_identity(pointer, data)?;
        self.write_at(pointer, data)
    }

    /// Write only the 64-byte frame header.
    pub fn write_header(&self, pointer: u64, header: &[u8]) -> Result<()> {
        self.check_identity(pointer, header)?;
        self.write_at(pointer, &header[..FRAME_HEADER_SIZE])
    }

    pub fn read_header(&self, pointer: u64) -> Result<FrameHeader> {
        FrameHeader::decode(&self.read_data(pointer, FRAME_HEADER_SIZE)?)
    }

    /// Every frame header between the system frame and the allocation end.
    pub fn scan_headers(&self) -> Result<Vec<FrameHeader>> {
        let end = self.last_pointer();
        let mut headers = Vec::new();
        let mut pointer = SYSTEM_FRAME_SIZE;
        while pointer < end {
            let header = self.read_header(pointer)?;
            if header.id != FrameId::new(self.id, pointer) || header.size == 0 {
                return Err(Error::corrupted(
                    FrameId::new(self.id, pointer).to_u64(),
                    format!("scan found header for {} of size {}", header.id, header.size),
                ));
            }
            pointer += header.size as u64;
            headers.push(header);
        }
        Ok(headers)
    }

    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all().map_err(io_err)
    }
}
