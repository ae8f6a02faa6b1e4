//! On-disk identity header.
//!
//! Layout, relative to the start of the raw device:
//!
//! | field     | offset      | size     |
//! |-----------|-------------|----------|
//! | magic     | 0           | 8        |
//! | device id | `ID_OFFSET` | `ID_LEN` |
//!
//! The first `RESERVED_BYTES` are never part of the encrypted payload, the
//! dm-crypt mapping starts right after them.

use super::{DeviceId, ID_LEN};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAGIC_LEN: usize = 8;
pub const MAGIC: &[u8; MAGIC_LEN] = b"NODECRYP";
pub const ID_OFFSET: u64 = 4096;
pub const RESERVED_BYTES: u64 = 1 << 20;
pub const SECTOR_SIZE: u64 = 512;

const _: () = assert!(ID_OFFSET >= MAGIC_LEN as u64);
const _: () = assert!(ID_OFFSET + ID_LEN as u64 <= RESERVED_BYTES);
const _: () = assert!(RESERVED_BYTES % SECTOR_SIZE == 0);

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("failed to open `{path}`: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = HeaderError> = core::result::Result<T, E>;

/// Offset of the encrypted payload in 512-byte sectors.
pub fn payload_offset_sectors() -> u64 {
    RESERVED_BYTES / SECTOR_SIZE
}

/// Returns the identity stored on `dev`, or `None` when no magic is present.
///
/// A device too short to hold the header counts as unenrolled, any other
/// I/O failure is an error.
pub fn read_identity<D: Read + Seek>(dev: &mut D) -> Result<Option<DeviceId>> {
    let mut magic = [0u8; MAGIC_LEN];
    dev.seek(SeekFrom::Start(0))?;
    if !read_fully(dev, &mut magic)? || &magic != MAGIC {
        return Ok(None);
    }

    let mut id = [0u8; ID_LEN];
    dev.seek(SeekFrom::Start(ID_OFFSET))?;
    if !read_fully(dev, &mut id)? {
        return Ok(None);
    }
    Ok(Some(DeviceId::from_bytes(id)))
}

/// Writes the header. The id lands before the magic so a torn write never
/// leaves a magic pointing at a missing id.
pub fn write_identity<D: Write + Seek>(dev: &mut D, id: &DeviceId) -> Result<()> {
    dev.seek(SeekFrom::Start(ID_OFFSET))?;
    dev.write_all(id.as_bytes())?;
    dev.flush()?;

    dev.seek(SeekFrom::Start(0))?;
    dev.write_all(MAGIC)?;
    dev.flush()?;
    Ok(())
}

/// Zeroes the magic so the device reads back as unenrolled.
pub fn clear_identity<D: Write + Seek>(dev: &mut D) -> Result<()> {
    dev.seek(SeekFrom::Start(0))?;
    dev.write_all(&[0u8; MAGIC_LEN])?;
    dev.flush()?;
    Ok(())
}

pub fn read_identity_at(path: &Path) -> Result<Option<DeviceId>> {
    let mut file = File::open(path).map_err(|source| HeaderError::Open {
        path: path.to_owned(),
        source,
    })?;
    read_identity(&mut file)
}

pub fn write_identity_at(path: &Path, id: &DeviceId) -> Result<()> {
    let mut file = open_rw(path)?;
    write_identity(&mut file, id)?;
    file.sync_all()?;
    log::debug!("wrote identity {} to {}", id, path.display());
    Ok(())
}

pub fn clear_identity_at(path: &Path) -> Result<()> {
    let mut file = open_rw(path)?;
    clear_identity(&mut file)?;
    file.sync_all()?;
    Ok(())
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| HeaderError::Open {
            path: path.to_owned(),
            source,
        })
}

// false on EOF before `buf` is full
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
