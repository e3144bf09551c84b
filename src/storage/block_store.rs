//! Sharded append-only blob store.
//!
//! Each store maps `(node_key, report_step, realization)` to an opaque byte
//! blob. Blobs land in `mod_<i>` shard files selected by
//! `realization % shard_count`; a shard file is a sequence of
//! `(key_len: u32, key, blob_len: u32, blob)` records, little-endian. The
//! in-memory index is rebuilt by scanning at open time, last record wins, so
//! rewrites are plain appends and a torn trailing record from a crash is
//! dropped rather than fatal.

use ahash::AHashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::StorageError;

struct Shard {
    path: PathBuf,
    file: Option<File>,
    index: AHashMap<String, (u64, u32)>,
    end: u64,
}

pub struct BlockStore {
    shards: Vec<Shard>,
    read_only: bool,
}

fn blob_key(node_key: &str, report_step: usize, iens: usize) -> String {
    format!("{node_key}.{report_step}.{iens}")
}

impl BlockStore {
    /// Open (or create) a store of `shard_count` shard files under `dir`.
    /// Missing shard files are an empty store in read-only mode and are
    /// created otherwise.
    pub fn open(dir: &Path, shard_count: usize, read_only: bool) -> Result<Self, StorageError> {
        assert!(shard_count > 0, "a block store needs at least one shard");
        if !read_only {
            std::fs::create_dir_all(dir)?;
        }
        let mut shards = Vec::with_capacity(shard_count);
        for i in 0..shard_count {
            let path = dir.join(format!("mod_{i}"));
            let (file, index, end) = if path.exists() {
                let (index, end) = scan_shard(&path)?;
                let file = if read_only {
                    Some(File::open(&path)?)
                } else {
                    Some(OpenOptions::new().read(true).write(true).open(&path)?)
                };
                (file, index, end)
            } else if read_only {
                (None, AHashMap::new(), 0)
            } else {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;
                (Some(file), AHashMap::new(), 0)
            };
            shards.push(Shard {
                path,
                file,
                index,
                end,
            });
        }
        Ok(Self { shards, read_only })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn shard_index(&self, iens: usize) -> usize {
        iens % self.shards.len()
    }

    pub fn write_blob(
        &mut self,
        node_key: &str,
        report_step: usize,
        iens: usize,
        blob: &[u8],
    ) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        let shard_idx = self.shard_index(iens);
        let shard = &mut self.shards[shard_idx];
        let file = shard.file.as_mut().expect("writable shard has a file");
        let key = blob_key(node_key, report_step, iens);

        file.seek(SeekFrom::Start(shard.end))?;
        file.write_all(&(key.len() as u32).to_le_bytes())?;
        file.write_all(key.as_bytes())?;
        file.write_all(&(blob.len() as u32).to_le_bytes())?;
        file.write_all(blob)?;

        let record_len = 8 + key.len() as u64 + blob.len() as u64;
        let payload_offset = shard.end + 8 + key.len() as u64;
        shard.index.insert(key, (payload_offset, blob.len() as u32));
        shard.end += record_len;
        Ok(())
    }

    pub fn read_blob(
        &mut self,
        node_key: &str,
        report_step: usize,
        iens: usize,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let shard_idx = self.shard_index(iens);
        let shard = &mut self.shards[shard_idx];
        let key = blob_key(node_key, report_step, iens);
        let Some(&(offset, len)) = shard.index.get(&key) else {
            return Ok(None);
        };
        let file = shard.file.as_mut().expect("indexed shard has a file");
        file.seek(SeekFrom::Start(offset))?;
        let mut blob = vec![0u8; len as usize];
        file.read_exact(&mut blob)?;
        Ok(Some(blob))
    }

    pub fn has_blob(&self, node_key: &str, report_step: usize, iens: usize) -> bool {
        let shard = &self.shards[self.shard_index(iens)];
        shard
            .index
            .contains_key(&blob_key(node_key, report_step, iens))
    }

    /// Every stored key, shard by shard.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.shards
            .iter()
            .flat_map(|s| s.index.keys().map(String::as_str))
    }

    /// Push buffered data to disk. Called at case-sync points, not per blob.
    pub fn fsync(&mut self) -> Result<(), StorageError> {
        for shard in &mut self.shards {
            if let Some(file) = &mut shard.file {
                file.sync_all()?;
            }
        }
        Ok(())
    }
}

fn scan_shard(path: &Path) -> Result<(AHashMap<String, (u64, u32)>, u64), StorageError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut index = AHashMap::new();
    let mut offset = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut reader, &mut len_buf) {
            ScanRead::Eof => break,
            ScanRead::Torn => {
                log::warn!("{}: dropping torn trailing record", path.display());
                break;
            }
            ScanRead::Ok => {}
        }
        let key_len = u32::from_le_bytes(len_buf) as usize;
        let mut key_bytes = vec![0u8; key_len];
        if !matches!(read_exact_or_eof(&mut reader, &mut key_bytes), ScanRead::Ok) {
            log::warn!("{}: dropping torn trailing record", path.display());
            break;
        }
        if !matches!(read_exact_or_eof(&mut reader, &mut len_buf), ScanRead::Ok) {
            log::warn!("{}: dropping torn trailing record", path.display());
            break;
        }
        let blob_len = u32::from_le_bytes(len_buf);
        let payload_offset = offset + 8 + key_len as u64;
        let mut remaining = blob_len as u64;
        let mut skip_buf = [0u8; 4096];
        let mut torn = false;
        while remaining > 0 {
            let chunk = remaining.min(skip_buf.len() as u64) as usize;
            if !matches!(
                read_exact_or_eof(&mut reader, &mut skip_buf[..chunk]),
                ScanRead::Ok
            ) {
                torn = true;
                break;
            }
            remaining -= chunk as u64;
        }
        if torn {
            log::warn!("{}: dropping torn trailing record", path.display());
            break;
        }
        let key = String::from_utf8(key_bytes)
            .map_err(|_| StorageError::Corrupt(format!("non-utf8 key in {}", path.display())))?;
        index.insert(key, (payload_offset, blob_len));
        offset = payload_offset + blob_len as u64;
    }
    Ok((index, offset))
}

enum ScanRead {
    Ok,
    Eof,
    Torn,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> ScanRead {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return if filled == 0 { ScanRead::Eof } else { ScanRead::Torn },
            Ok(n) => filled += n,
            Err(_) => return ScanRead::Torn,
        }
    }
    ScanRead::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blobs_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = BlockStore::open(dir.path(), 4, false).unwrap();
            store.write_blob("PORO", 0, 0, b"alpha").unwrap();
            store.write_blob("PORO", 0, 5, b"beta").unwrap();
            store.write_blob("WOPR", 3, 1, b"gamma").unwrap();
            store.fsync().unwrap();
        }
        let mut store = BlockStore::open(dir.path(), 4, false).unwrap();
        assert_eq!(store.read_blob("PORO", 0, 0).unwrap().unwrap(), b"alpha");
        assert_eq!(store.read_blob("PORO", 0, 5).unwrap().unwrap(), b"beta");
        assert_eq!(store.read_blob("WOPR", 3, 1).unwrap().unwrap(), b"gamma");
        assert_eq!(store.read_blob("WOPR", 3, 2).unwrap(), None);
    }

    #[test]
    fn rewrites_last_record_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BlockStore::open(dir.path(), 2, false).unwrap();
        store.write_blob("PORO", 0, 3, b"old").unwrap();
        store.write_blob("PORO", 0, 3, b"new").unwrap();
        assert_eq!(store.read_blob("PORO", 0, 3).unwrap().unwrap(), b"new");

        drop(store);
        let mut reopened = BlockStore::open(dir.path(), 2, false).unwrap();
        assert_eq!(reopened.read_blob("PORO", 0, 3).unwrap().unwrap(), b"new");
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = BlockStore::open(dir.path(), 1, false).unwrap();
            store.write_blob("PORO", 0, 0, b"x").unwrap();
        }
        let mut store = BlockStore::open(dir.path(), 1, true).unwrap();
        assert!(store.is_read_only());
        assert_eq!(store.read_blob("PORO", 0, 0).unwrap().unwrap(), b"x");
        assert!(matches!(
            store.write_blob("PORO", 0, 0, b"y"),
            Err(StorageError::ReadOnly)
        ));
    }

    #[test]
    fn torn_trailing_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = BlockStore::open(dir.path(), 1, false).unwrap();
            store.write_blob("PORO", 0, 0, b"whole").unwrap();
        }
        // Append garbage that looks like the start of a record.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join("mod_0"))
                .unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"trunc").unwrap();
        }
        let mut store = BlockStore::open(dir.path(), 1, false).unwrap();
        assert_eq!(store.read_blob("PORO", 0, 0).unwrap().unwrap(), b"whole");
    }

    #[test]
    fn sharding_spreads_realizations() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = BlockStore::open(dir.path(), 2, false).unwrap();
        store.write_blob("K", 0, 0, b"even").unwrap();
        store.write_blob("K", 0, 1, b"odd").unwrap();
        drop(store);
        let even = std::fs::metadata(dir.path().join("mod_0")).unwrap().len();
        let odd = std::fs::metadata(dir.path().join("mod_1")).unwrap().len();
        assert!(even > 0 && odd > 0);
    }
}
