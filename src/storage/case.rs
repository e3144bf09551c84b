//! One mounted case: block-file drivers resolved through the mount
//! descriptor, a single-writer lock file, and the auxiliary singletons.
//!
//! The first opener of a case takes an advisory `flock` on
//! `<case>/<case>.lock` and becomes the writer; later openers fall back to
//! read-only. Auxiliary state is persisted best-effort — a failed save is
//! logged and swallowed, the in-memory copy stays authoritative for the run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::misfit::MisfitEnsemble;
use crate::storage::block_store::BlockStore;
use crate::storage::mount::{read_mount_file, write_mount_file, DriverCategory, MountRecord};
use crate::storage::StorageError;

const MOUNT_FILE: &str = "mount-info";
const TIME_MAP_FILE: &str = "time-map";
const STATE_MAP_FILE: &str = "state-map";
const SUMMARY_KEY_FILE: &str = "summary-key-set";
const MISFIT_FILE: &str = "misfit-ensemble";

/// Where a realization stands in the current case.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealizationState {
    #[default]
    Undefined,
    Initialized,
    HasData,
    LoadFailure,
    ParentFailure,
}

/// Per-realization states; the source of the next iteration's ensemble mask.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateMap {
    states: Vec<RealizationState>,
}

impl StateMap {
    pub fn with_size(ens_size: usize) -> Self {
        Self {
            states: vec![RealizationState::Undefined; ens_size],
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, iens: usize) -> RealizationState {
        self.states.get(iens).copied().unwrap_or_default()
    }

    pub fn set(&mut self, iens: usize, state: RealizationState) {
        if self.states.len() <= iens {
            self.states.resize(iens + 1, RealizationState::Undefined);
        }
        self.states[iens] = state;
    }

    /// Ensemble mask excluding realizations whose forward model or load
    /// failed: these sit out the next update.
    pub fn active_mask(&self) -> Vec<bool> {
        self.states
            .iter()
            .map(|s| matches!(s, RealizationState::Initialized | RealizationState::HasData))
            .collect()
    }
}

/// Report-step to timestamp map; a step may only ever carry one time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimeMap {
    times: Vec<Option<i64>>,
}

impl TimeMap {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn get(&self, step: usize) -> Option<i64> {
        self.times.get(step).copied().flatten()
    }

    pub fn update(&mut self, step: usize, time: i64) -> Result<(), StorageError> {
        if self.times.len() <= step {
            self.times.resize(step + 1, None);
        }
        match self.times[step] {
            Some(stored) if stored != time => Err(StorageError::TimeMapConflict {
                step,
                stored,
                incoming: time,
            }),
            _ => {
                self.times[step] = Some(time);
                Ok(())
            }
        }
    }
}

/// The summary keys this case has seen, kept sorted for stable reports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SummaryKeySet {
    keys: BTreeSet<String>,
}

impl SummaryKeySet {
    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.keys.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct CaseFs {
    case_dir: PathBuf,
    read_only: bool,
    /// Keeps the advisory lock alive for the lifetime of the case.
    _lock_file: Option<File>,

    parameter: BlockStore,
    dynamic_forecast: BlockStore,
    index: BlockStore,

    pub time_map: TimeMap,
    pub state_map: StateMap,
    pub summary_keys: SummaryKeySet,
    pub misfit: MisfitEnsemble,
}

fn encode_driver_info(dir: &str, shards: u32) -> Vec<u8> {
    let mut info = Vec::with_capacity(8 + dir.len());
    info.extend_from_slice(&shards.to_le_bytes());
    info.extend_from_slice(&(dir.len() as u32).to_le_bytes());
    info.extend_from_slice(dir.as_bytes());
    info
}

fn decode_driver_info(info: &[u8]) -> Result<(String, u32), StorageError> {
    if info.len() < 8 {
        return Err(StorageError::Corrupt("short driver info".to_owned()));
    }
    let shards = u32::from_le_bytes(info[0..4].try_into().expect("4 bytes"));
    let dir_len = u32::from_le_bytes(info[4..8].try_into().expect("4 bytes")) as usize;
    if info.len() != 8 + dir_len {
        return Err(StorageError::Corrupt("ragged driver info".to_owned()));
    }
    let dir = String::from_utf8(info[8..].to_vec())
        .map_err(|_| StorageError::Corrupt("non-utf8 driver path".to_owned()))?;
    Ok((dir, shards))
}

fn try_lock(path: &Path) -> Result<Option<File>, StorageError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(Some(file))
    } else {
        Ok(None)
    }
}

fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            log::warn!("{}: unreadable, starting fresh: {err}", path.display());
            T::default()
        }),
        Err(_) => T::default(),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) {
    let result = serde_json::to_vec(value)
        .map_err(std::io::Error::other)
        .and_then(|bytes| std::fs::write(path, bytes));
    if let Err(err) = result {
        // In-memory state stays authoritative; persistence is best-effort.
        log::warn!("failed to persist {}: {err}", path.display());
    }
}

impl CaseFs {
    /// Create a fresh case directory with its mount descriptor and empty
    /// stores, then mount it.
    pub fn create(root: &Path, case_name: &str, shard_count: u32) -> Result<Self, StorageError> {
        let case_dir = root.join(case_name);
        std::fs::create_dir_all(&case_dir)?;
        let records = vec![
            MountRecord {
                category: DriverCategory::Parameter,
                driver_id: 1,
                info: encode_driver_info("Ensemble", shard_count),
            },
            MountRecord {
                category: DriverCategory::DynamicForecast,
                driver_id: 2,
                info: encode_driver_info("Ensemble", shard_count),
            },
            MountRecord {
                category: DriverCategory::Index,
                driver_id: 3,
                info: encode_driver_info("Index", 1),
            },
        ];
        write_mount_file(&case_dir.join(MOUNT_FILE), &records)?;
        Self::mount(root, case_name)
    }

    /// Mount an existing case. Takes the writer lock if nobody holds it,
    /// otherwise opens everything read-only.
    pub fn mount(root: &Path, case_name: &str) -> Result<Self, StorageError> {
        let case_dir = root.join(case_name);
        let records = read_mount_file(&case_dir.join(MOUNT_FILE))?;

        let lock_path = case_dir.join(format!("{case_name}.lock"));
        let lock_file = try_lock(&lock_path)?;
        let read_only = lock_file.is_none();
        if read_only {
            log::info!(
                "case {case_name}: lock held elsewhere, continuing read-only"
            );
        }

        let open_store = |category: DriverCategory| -> Result<BlockStore, StorageError> {
            let record = records
                .iter()
                .find(|r| r.category == category)
                .ok_or(StorageError::MissingDriver(category))?;
            let (dir, shards) = decode_driver_info(&record.info)?;
            let store_dir = match category {
                DriverCategory::Parameter => case_dir.join(dir).join("parameter"),
                DriverCategory::DynamicForecast => case_dir.join(dir).join("forecast"),
                DriverCategory::Index => case_dir.join(dir),
            };
            BlockStore::open(&store_dir, shards as usize, read_only)
        };

        let parameter = open_store(DriverCategory::Parameter)?;
        let dynamic_forecast = open_store(DriverCategory::DynamicForecast)?;
        let index = open_store(DriverCategory::Index)?;

        Ok(Self {
            time_map: load_json(&case_dir.join(TIME_MAP_FILE)),
            state_map: load_json(&case_dir.join(STATE_MAP_FILE)),
            summary_keys: load_json(&case_dir.join(SUMMARY_KEY_FILE)),
            misfit: load_json(&case_dir.join(MISFIT_FILE)),
            case_dir,
            read_only,
            _lock_file: lock_file,
            parameter,
            dynamic_forecast,
            index,
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn case_dir(&self) -> &Path {
        &self.case_dir
    }

    fn store(&mut self, category: DriverCategory) -> &mut BlockStore {
        match category {
            DriverCategory::Parameter => &mut self.parameter,
            DriverCategory::DynamicForecast => &mut self.dynamic_forecast,
            DriverCategory::Index => &mut self.index,
        }
    }

    /// Store one serialized node. Parameter nodes exist only at report step
    /// zero; anything else is a caller bug.
    pub fn write_node(
        &mut self,
        category: DriverCategory,
        node_key: &str,
        report_step: usize,
        iens: usize,
        blob: &[u8],
    ) -> Result<(), StorageError> {
        if category == DriverCategory::Parameter {
            assert_eq!(
                report_step, 0,
                "parameter node '{node_key}' written at report step {report_step}"
            );
        }
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.store(category)
            .write_blob(node_key, report_step, iens, blob)
    }

    pub fn read_node(
        &mut self,
        category: DriverCategory,
        node_key: &str,
        report_step: usize,
        iens: usize,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.store(category).read_blob(node_key, report_step, iens)
    }

    pub fn has_node(
        &self,
        category: DriverCategory,
        node_key: &str,
        report_step: usize,
        iens: usize,
    ) -> bool {
        let store = match category {
            DriverCategory::Parameter => &self.parameter,
            DriverCategory::DynamicForecast => &self.dynamic_forecast,
            DriverCategory::Index => &self.index,
        };
        store.has_blob(node_key, report_step, iens)
    }

    /// Flush blob stores and persist the auxiliary singletons. Auxiliary
    /// save failures are logged, not propagated.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        if self.read_only {
            return Ok(());
        }
        self.parameter.fsync()?;
        self.dynamic_forecast.fsync()?;
        self.index.fsync()?;
        save_json(&self.case_dir.join(TIME_MAP_FILE), &self.time_map);
        save_json(&self.case_dir.join(STATE_MAP_FILE), &self.state_map);
        save_json(&self.case_dir.join(SUMMARY_KEY_FILE), &self.summary_keys);
        save_json(&self.case_dir.join(MISFIT_FILE), &self.misfit);
        Ok(())
    }
}

impl Drop for CaseFs {
    fn drop(&mut self) {
        if !self.read_only {
            if let Err(err) = self.sync() {
                log::warn!("case sync on close failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_mount_and_roundtrip_nodes() {
        let root = tempfile::tempdir().unwrap();
        {
            let mut case = CaseFs::create(root.path(), "prior", 4).unwrap();
            assert!(!case.is_read_only());
            case.write_node(DriverCategory::Parameter, "PORO", 0, 2, b"perm")
                .unwrap();
            case.write_node(DriverCategory::DynamicForecast, "WOPR", 5, 2, b"resp")
                .unwrap();
            case.state_map.set(2, RealizationState::HasData);
            case.time_map.update(5, 1_700_000_000).unwrap();
            case.summary_keys.insert("WOPR");
            case.sync().unwrap();
        }
        let mut case = CaseFs::mount(root.path(), "prior").unwrap();
        assert_eq!(
            case.read_node(DriverCategory::Parameter, "PORO", 0, 2)
                .unwrap()
                .unwrap(),
            b"perm"
        );
        assert!(case.has_node(DriverCategory::DynamicForecast, "WOPR", 5, 2));
        assert_eq!(case.state_map.get(2), RealizationState::HasData);
        assert_eq!(case.time_map.get(5), Some(1_700_000_000));
        assert!(case.summary_keys.contains("WOPR"));
    }

    #[test]
    fn second_opener_is_read_only() {
        let root = tempfile::tempdir().unwrap();
        let writer = CaseFs::create(root.path(), "prior", 2).unwrap();
        assert!(!writer.is_read_only());

        let mut reader = CaseFs::mount(root.path(), "prior").unwrap();
        assert!(reader.is_read_only());
        assert!(matches!(
            reader.write_node(DriverCategory::Index, "K", 0, 0, b"x"),
            Err(StorageError::ReadOnly)
        ));

        drop(writer);
        let second_writer = CaseFs::mount(root.path(), "prior").unwrap();
        assert!(!second_writer.is_read_only());
    }

    #[test]
    #[should_panic(expected = "parameter node")]
    fn parameter_write_beyond_step_zero_aborts() {
        let root = tempfile::tempdir().unwrap();
        let mut case = CaseFs::create(root.path(), "prior", 2).unwrap();
        let _ = case.write_node(DriverCategory::Parameter, "PORO", 1, 0, b"bad");
    }

    #[test]
    fn time_map_rejects_conflicting_rewrites() {
        let mut map = TimeMap::default();
        map.update(3, 100).unwrap();
        map.update(3, 100).unwrap();
        assert!(matches!(
            map.update(3, 200),
            Err(StorageError::TimeMapConflict { step: 3, .. })
        ));
    }

    #[test]
    fn state_map_mask_excludes_failures() {
        let mut map = StateMap::with_size(4);
        map.set(0, RealizationState::HasData);
        map.set(1, RealizationState::LoadFailure);
        map.set(2, RealizationState::Initialized);
        assert_eq!(map.active_mask(), vec![true, false, true, false]);
    }
}
