//! Versioned, checksummed, atomically-renamed file persistence.
//!
//! Grounded in the teacher's `persistence.rs` (`AtomicWriter`/`FileHeader`/
//! CRC32 scheme); reused here by both the small-map store's on-disk
//! snapshot and the manifest (spec §3 supplemental: "on-disk format for
//! the small-map snapshot and the manifest").
//!
//! Features:
//! - Format versioning for safe evolution
//! - Checksum validation for data integrity
//! - Atomic writes to prevent corruption (temp file + `sync_all` + rename)

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const FORMAT_VERSION: u32 = 1;
const MAGIC: &[u8; 8] = b"COMBOKV1";

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    magic: [u8; 8],
    version: u32,
    file_size: u64,
    checksum: u32,
    record_count: usize,
}

impl FileHeader {
    fn new(file_size: u64, checksum: u32, record_count: usize) -> Self {
        Self {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            file_size,
            checksum,
            record_count,
        }
    }

    fn validate(&self) -> Result<(), StoreError> {
        if &self.magic != MAGIC {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "invalid file format: expected magic {:?}, got {:?}",
                    MAGIC, self.magic
                ),
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "incompatible format version: expected {}, got {}",
                    FORMAT_VERSION, self.version
                ),
            )));
        }
        Ok(())
    }
}

/// Generic persisted payload: used both for the small-map store's
/// `Vec<(u64, u64)>` snapshot and the manifest's small record. `record_count`
/// in the header is whatever the caller considers meaningful (key count for
/// the small-map, always 1 for the manifest).
#[derive(Serialize, Deserialize)]
pub struct PersistedData<T> {
    pub payload: T,
    pub record_count: usize,
}

/// Writer for atomic file operations: write to `<path>.tmp`, `fsync`, then
/// rename over `path`. If the writer is dropped before `commit`, the temp
/// file is removed.
pub struct AtomicWriter {
    temp_path: std::path::PathBuf,
    final_path: std::path::PathBuf,
    writer: BufWriter<File>,
}

impl AtomicWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let final_path = path.as_ref().to_path_buf();
        let temp_path = final_path.with_extension("tmp");

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path,
            final_path,
            writer: BufWriter::new(file),
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), StoreError> {
        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        std::fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.temp_path);
    }
}

pub fn calculate_checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Write `data` with a versioned, checksummed header, atomically.
pub fn write_with_integrity<T, P>(
    path: P,
    data: &PersistedData<T>,
) -> Result<(), StoreError>
where
    T: Serialize,
    P: AsRef<Path>,
{
    let data_bytes = bincode::serialize(data)?;
    let checksum = calculate_checksum(&data_bytes);
    let header = FileHeader::new(
        (std::mem::size_of::<FileHeader>() + data_bytes.len()) as u64,
        checksum,
        data.record_count,
    );
    let header_bytes = bincode::serialize(&header)?;

    let mut writer = AtomicWriter::new(path)?;
    writer.write_all(&header_bytes)?;
    writer.write_all(&data_bytes)?;
    writer.commit()?;
    Ok(())
}

/// Read and validate a file written by `write_with_integrity`.
pub fn read_with_validation<T, P>(path: P) -> Result<PersistedData<T>, StoreError>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let header: FileHeader = bincode::deserialize_from(&mut reader)?;
    header.validate()?;

    let mut data_bytes = Vec::new();
    reader.read_to_end(&mut data_bytes)?;

    let actual_checksum = calculate_checksum(&data_bytes);
    if actual_checksum != header.checksum {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "checksum mismatch: expected {}, got {}",
                header.checksum, actual_checksum
            ),
        )));
    }

    let data: PersistedData<T> = bincode::deserialize(&data_bytes)?;
    if data.record_count != header.record_count {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "record count mismatch: header says {}, got {}",
                header.record_count, data.record_count
            ),
        )));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn checksum_is_stable_and_sensitive() {
        let data1 = b"hello world";
        let data2 = b"hello world";
        let data3 = b"hello world!";
        assert_eq!(calculate_checksum(data1), calculate_checksum(data2));
        assert_ne!(calculate_checksum(data1), calculate_checksum(data3));
    }

    #[test]
    fn atomic_write_commits_and_renames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");
        let mut writer = AtomicWriter::new(&path).unwrap();
        writer.write_all(b"test data").unwrap();
        writer.commit().unwrap();
        assert!(path.exists());
        assert_eq!(fs::read(&path).unwrap(), b"test data");
    }

    #[test]
    fn atomic_write_rolls_back_without_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");
        {
            let mut writer = AtomicWriter::new(&path).unwrap();
            writer.write_all(b"test data").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        let original = PersistedData {
            payload: vec![(1u64, 100u64), (2, 200)],
            record_count: 2,
        };
        write_with_integrity(&path, &original).unwrap();
        let loaded: PersistedData<Vec<(u64, u64)>> = read_with_validation(&path).unwrap();
        assert_eq!(loaded.payload, original.payload);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.bin");
        let data = PersistedData {
            payload: vec![(1u64, 1u64)],
            record_count: 1,
        };
        write_with_integrity(&path, &data).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let result: Result<PersistedData<Vec<(u64, u64)>>, _> = read_with_validation(&path);
        assert!(result.is_err());
    }
}
