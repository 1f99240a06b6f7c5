//! Log Device
//!
//! Append-only file holding the part of the log that left memory.
//!
//! ## Frame Format
//! ```text
//! ┌──────────────┬─────────┬─────────┬─────────────────────────┐
//! │ Address (8)  │ CRC (4) │ Len (4) │ bincode(LogRecord)      │
//! └──────────────┴─────────┴─────────┴─────────────────────────┘
//! ```
//! The CRC covers the address bytes and the payload.
//!
//! The device keeps a logical length separate from the physical file size:
//! bytes past the logical end (left over from a previous run that never
//! reached a checkpoint) are cut off before the next append.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{EpochError, Result};

use super::LogRecord;

/// Device file name inside the connection directory
pub const DEVICE_FILENAME: &str = "hlog.log";

/// Address (8) + CRC (4) + Len (4)
pub const FRAME_HEADER_SIZE: u64 = 16;

/// Upper bound on a single frame payload (64 MB)
const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Append-only record file
pub struct LogDevice {
    path: PathBuf,
    file: File,

    /// Logical end of the device
    len: u64,

    /// Physical file may hold stale bytes past `len`
    stale_tail: bool,
}

impl LogDevice {
    /// Open or create the device file in `dir`.
    ///
    /// The device starts logically empty; `restore` adopts existing content.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(DEVICE_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let physical = file.metadata()?.len();

        Ok(Self {
            path,
            file,
            len: 0,
            stale_tail: physical > 0,
        })
    }

    /// Adopt the first `len` bytes of the file as the device content and
    /// discard everything after them
    pub fn restore(&mut self, len: u64) -> Result<()> {
        let physical = self.file.metadata()?.len();
        if physical < len {
            return Err(EpochError::Corruption(format!(
                "Device {} holds {} bytes, checkpoint expects {}",
                self.path.display(),
                physical,
                len
            )));
        }

        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.len = len;
        self.stale_tail = false;
        Ok(())
    }

    /// Append a record frame; returns the frame's offset
    pub fn append(&mut self, address: u64, record: &LogRecord) -> Result<u64> {
        if self.stale_tail {
            self.file.set_len(self.len)?;
            self.stale_tail = false;
        }

        let payload = bincode::serialize(record)?;
        if payload.len() > MAX_FRAME_PAYLOAD as usize {
            return Err(EpochError::Engine(format!(
                "Record of {} bytes exceeds the frame limit",
                payload.len()
            )));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&address.to_le_bytes());
        frame.extend_from_slice(&frame_crc(address, &payload).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);

        let offset = self.len;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&frame)?;
        self.len += frame.len() as u64;

        Ok(offset)
    }

    /// Read the frame at `offset`, returning its address and record
    pub fn read_at(&mut self, offset: u64) -> Result<(u64, LogRecord)> {
        let (address, record, _) = self.read_frame(offset)?;
        Ok((address, record))
    }

    /// Walk every frame from the start of the device.
    ///
    /// Returns `(address, offset)` pairs in device order.
    pub fn frames(&mut self) -> Result<Vec<(u64, u64)>> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < self.len {
            let (address, _, frame_len) = self.read_frame(offset)?;
            frames.push((address, offset));
            offset += frame_len;
        }

        Ok(frames)
    }

    /// Force device content to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Logical length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn read_frame(&mut self, offset: u64) -> Result<(u64, LogRecord, u64)> {
        if offset + FRAME_HEADER_SIZE > self.len {
            return Err(EpochError::Corruption(format!(
                "Frame header at {} runs past device end {}",
                offset, self.len
            )));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        self.file.read_exact(&mut header)?;

        let address = u64::from_le_bytes(header_field(&header[0..8]));
        let stored_crc = u32::from_le_bytes(header_field(&header[8..12]));
        let payload_len = u32::from_le_bytes(header_field(&header[12..16]));

        let frame_len = FRAME_HEADER_SIZE + payload_len as u64;
        if payload_len > MAX_FRAME_PAYLOAD || offset + frame_len > self.len {
            return Err(EpochError::Corruption(format!(
                "Frame at {} has invalid length {}",
                offset, payload_len
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        self.file.read_exact(&mut payload)?;

        if frame_crc(address, &payload) != stored_crc {
            return Err(EpochError::Corruption(format!(
                "CRC mismatch for frame at {} (address {})",
                offset, address
            )));
        }

        let record: LogRecord = bincode::deserialize(&payload).map_err(|e| {
            EpochError::Corruption(format!("Undecodable frame at {}: {}", offset, e))
        })?;

        Ok((address, record, frame_len))
    }
}

fn frame_crc(address: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&address.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Copy a fixed-size header field out of a slice whose length is known
fn header_field<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut field = [0u8; N];
    field.copy_from_slice(bytes);
    field
}
