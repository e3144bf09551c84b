//! The mount descriptor: a small binary file in every case directory
//! enumerating the block-file drivers that serve it.
//!
//! Layout, all little-endian: `magic: u32`, `version: i32`, then zero or
//! more records `(category: i32, driver_id: i32, info_len: u32,
//! info: [u8])` until end of file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::storage::StorageError;

pub const MOUNT_MAGIC: u32 = 0x4452_4D46;
pub const MOUNT_VERSION: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverCategory {
    Parameter,
    DynamicForecast,
    Index,
}

impl DriverCategory {
    pub fn code(self) -> i32 {
        match self {
            DriverCategory::Parameter => 1,
            DriverCategory::DynamicForecast => 3,
            DriverCategory::Index => 4,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, StorageError> {
        match code {
            1 => Ok(DriverCategory::Parameter),
            3 => Ok(DriverCategory::DynamicForecast),
            4 => Ok(DriverCategory::Index),
            other => Err(StorageError::UnknownCategory(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRecord {
    pub category: DriverCategory,
    pub driver_id: i32,
    pub info: Vec<u8>,
}

pub fn write_mount_file(path: &Path, records: &[MountRecord]) -> Result<(), StorageError> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&MOUNT_MAGIC.to_le_bytes())?;
    out.write_all(&MOUNT_VERSION.to_le_bytes())?;
    for record in records {
        out.write_all(&record.category.code().to_le_bytes())?;
        out.write_all(&record.driver_id.to_le_bytes())?;
        out.write_all(&(record.info.len() as u32).to_le_bytes())?;
        out.write_all(&record.info)?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_mount_file(path: &Path) -> Result<Vec<MountRecord>, StorageError> {
    let mut input = BufReader::new(File::open(path)?);

    let magic = read_u32(&mut input)?
        .ok_or_else(|| StorageError::Corrupt("empty mount file".to_owned()))?;
    if magic != MOUNT_MAGIC {
        return Err(StorageError::BadMagic { found: magic });
    }
    let version = read_i32(&mut input)?
        .ok_or_else(|| StorageError::Corrupt("truncated mount header".to_owned()))?;
    if version != MOUNT_VERSION {
        return Err(StorageError::BadVersion { found: version });
    }

    let mut records = Vec::new();
    loop {
        let Some(code) = read_i32(&mut input)? else {
            break;
        };
        let category = DriverCategory::from_code(code)?;
        let driver_id = read_i32(&mut input)?
            .ok_or_else(|| StorageError::Corrupt("truncated driver record".to_owned()))?;
        let info_len = read_u32(&mut input)?
            .ok_or_else(|| StorageError::Corrupt("truncated driver record".to_owned()))?;
        let mut info = vec![0u8; info_len as usize];
        input.read_exact(&mut info)?;
        records.push(MountRecord {
            category,
            driver_id,
            info,
        });
    }
    Ok(records)
}

fn read_exact_opt<R: Read>(input: &mut R, buf: &mut [u8]) -> Result<bool, StorageError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(StorageError::Corrupt("truncated mount record".to_owned()));
        }
        filled += n;
    }
    Ok(true)
}

fn read_u32<R: Read>(input: &mut R) -> Result<Option<u32>, StorageError> {
    let mut buf = [0u8; 4];
    Ok(read_exact_opt(input, &mut buf)?.then(|| u32::from_le_bytes(buf)))
}

fn read_i32<R: Read>(input: &mut R) -> Result<Option<i32>, StorageError> {
    let mut buf = [0u8; 4];
    Ok(read_exact_opt(input, &mut buf)?.then(|| i32::from_le_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_records_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount");
        let records = vec![
            MountRecord {
                category: DriverCategory::Parameter,
                driver_id: 7,
                info: b"Ensemble/4".to_vec(),
            },
            MountRecord {
                category: DriverCategory::DynamicForecast,
                driver_id: 8,
                info: vec![],
            },
            MountRecord {
                category: DriverCategory::Index,
                driver_id: 9,
                info: b"Index/1".to_vec(),
            },
        ];
        write_mount_file(&path, &records).unwrap();
        assert_eq!(read_mount_file(&path).unwrap(), records);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(
            read_mount_file(&path),
            Err(StorageError::BadMagic { .. })
        ));
    }

    #[test]
    fn unknown_category_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mount");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MOUNT_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&MOUNT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_mount_file(&path),
            Err(StorageError::UnknownCategory(2))
        ));
    }
}
