//! Checkpoint files
//!
//! ## File Format
//! ```text
//! ┌──────────┬────────────┬─────────┬──────────┬──────────────────────────┐
//! │Magic (4) │ Version(2) │ CRC (4) │ Len (8)  │ bincode(CheckpointMeta)  │
//! └──────────┴────────────┴─────────┴──────────┴──────────────────────────┘
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EpochError, Result};

/// Checkpoint metadata file name inside a checkpoint directory
pub const CHECKPOINT_FILENAME: &str = "checkpoint.bin";

const MAGIC: &[u8; 4] = b"EKCP";
const FORMAT_VERSION: u16 = 1;

/// Magic (4) + Version (2) + CRC (4) + Len (8)
const HEADER_SIZE: usize = 18;

/// Engine state captured by a checkpoint
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CheckpointMeta {
    pub begin_address: u64,
    pub tail_address: u64,
    pub safe_read_only_address: u64,
    pub device_len: u64,
    pub index: Vec<(Vec<u8>, u64)>,
}

/// Summary of a written or recovered checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub begin_address: u64,
    pub tail_address: u64,
    pub device_len: u64,
    pub index_entries: usize,
}

impl CheckpointMeta {
    pub fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            begin_address: self.begin_address,
            tail_address: self.tail_address,
            device_len: self.device_len,
            index_entries: self.index.len(),
        }
    }
}

/// Write `meta` into `dir` and sync it
pub(crate) fn write_meta(dir: &Path, meta: &CheckpointMeta) -> Result<CheckpointInfo> {
    let payload = bincode::serialize(meta)?;
    let crc = crc32fast::hash(&payload);

    let mut file = File::create(dir.join(CHECKPOINT_FILENAME))?;
    file.write_all(MAGIC)?;
    file.write_all(&FORMAT_VERSION.to_le_bytes())?;
    file.write_all(&crc.to_le_bytes())?;
    file.write_all(&(payload.len() as u64).to_le_bytes())?;
    file.write_all(&payload)?;
    file.sync_all()?;

    Ok(meta.info())
}

/// Read and validate the checkpoint in `dir`
pub(crate) fn read_meta(dir: &Path) -> Result<CheckpointMeta> {
    let path = dir.join(CHECKPOINT_FILENAME);
    let mut bytes = Vec::new();
    File::open(&path)?.read_to_end(&mut bytes)?;

    if bytes.len() < HEADER_SIZE {
        return Err(EpochError::Corruption(format!(
            "Checkpoint {} is truncated",
            path.display()
        )));
    }

    if &bytes[0..4] != MAGIC {
        return Err(EpochError::Corruption(format!(
            "Invalid checkpoint magic in {}: {:?}",
            path.display(),
            &bytes[0..4]
        )));
    }

    let mut version = [0u8; 2];
    version.copy_from_slice(&bytes[4..6]);
    let version = u16::from_le_bytes(version);
    if version != FORMAT_VERSION {
        return Err(EpochError::Checkpoint(format!(
            "Unsupported checkpoint version: {}",
            version
        )));
    }

    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[6..10]);
    let crc = u32::from_le_bytes(crc);

    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[10..18]);
    let len = u64::from_le_bytes(len) as usize;

    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != len {
        return Err(EpochError::Corruption(format!(
            "Checkpoint {} payload is {} bytes, header says {}",
            path.display(),
            payload.len(),
            len
        )));
    }

    if crc32fast::hash(payload) != crc {
        return Err(EpochError::Corruption(format!(
            "Checkpoint {} failed CRC validation",
            path.display()
        )));
    }

    bincode::deserialize(payload)
        .map_err(|e| EpochError::Corruption(format!("Undecodable checkpoint: {}", e)))
}
