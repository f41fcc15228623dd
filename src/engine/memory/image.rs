//! On-disk image of a database's column families
//!
//! File layout:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Header (18 bytes)                             │
//! │   Magic: "ATKN" (4 bytes)                     │
//! │   Version: u16 (2 bytes)                      │
//! │   Payload length: u64 (8 bytes)               │
//! │   Payload CRC32: u32 (4 bytes)                │
//! ├───────────────────────────────────────────────┤
//! │ Payload (bincode)                             │
//! │   [(column family, [(key, value), ...]), ...] │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Images are written to a temporary file and renamed into place, so a
//! crash mid-write leaves the previous image intact.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::table::Table;

/// Magic bytes at the start of every image
pub const MAGIC: &[u8; 4] = b"ATKN";

/// Current image format version
pub const VERSION: u16 = 1;

/// Header size: magic(4) + version(2) + payload_len(8) + crc(4)
pub const HEADER_SIZE: usize = 18;

/// Image file name inside the database directory
pub const IMAGE_FILE: &str = "IMAGE";

#[derive(Serialize, Deserialize)]
struct Payload {
    column_families: Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)>,
}

pub fn image_path(dir: &Path) -> PathBuf {
    dir.join(IMAGE_FILE)
}

/// Write every table to `dir`, replacing any previous image
pub fn write(dir: &Path, tables: &HashMap<String, Table>) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let mut column_families: Vec<_> = tables
        .iter()
        .map(|(name, table)| {
            let entries = table
                .entries()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect();
            (name.clone(), entries)
        })
        .collect();
    column_families.sort_by(|a, b| a.0.cmp(&b.0));

    let payload = bincode::serialize(&Payload { column_families })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    let tmp = dir.join(format!("{}.tmp", IMAGE_FILE));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;

    let mut writer = BufWriter::new(file);
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    fs::rename(&tmp, image_path(dir))?;

    tracing::debug!(dir = %dir.display(), bytes = payload.len(), "image written");
    Ok(())
}

/// Load the image in `dir`, or `None` if there is none
pub fn read(dir: &Path) -> io::Result<Option<HashMap<String, Table>>> {
    let path = image_path(dir);
    if !path.is_file() {
        return Ok(None);
    }

    let mut file = File::open(&path)?;
    let file_len = file.metadata()?.len();
    if file_len < HEADER_SIZE as u64 {
        return Err(corruption(format!(
            "image {} is {} bytes, shorter than its header",
            path.display(),
            file_len
        )));
    }

    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;

    if &header[0..4] != MAGIC {
        return Err(corruption(format!(
            "bad magic in {}: {:?}",
            path.display(),
            &header[0..4]
        )));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(corruption(format!("unsupported image version {}", version)));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[6..14]);
    let payload_len = u64::from_le_bytes(len_bytes);

    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&header[14..18]);
    let expected_crc = u32::from_le_bytes(crc_bytes);

    // The length field is untrusted until it matches the file
    let available = file_len - HEADER_SIZE as u64;
    if payload_len != available {
        return Err(corruption(format!(
            "image length mismatch: header says {} bytes, found {}",
            payload_len, available
        )));
    }

    let mut payload = Vec::with_capacity(available as usize);
    file.read_to_end(&mut payload)?;

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(corruption(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected_crc, actual_crc
        )));
    }

    let decoded: Payload = bincode::deserialize(&payload)
        .map_err(|e| corruption(format!("undecodable image: {}", e)))?;

    let tables = decoded
        .column_families
        .into_iter()
        .map(|(name, entries)| {
            let table = Table::from_entries(
                entries
                    .into_iter()
                    .map(|(k, v)| (Bytes::from(k), Bytes::from(v))),
            );
            (name, table)
        })
        .collect();

    Ok(Some(tables))
}

fn corruption(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("Corruption: {}", msg))
}
