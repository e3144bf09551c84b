//! Per-case ensemble storage: a binary mount descriptor, sharded blob
//! stores for serialized ensemble nodes, and the auxiliary singletons that
//! live beside them.

pub mod block_store;
pub mod case;
pub mod mount;

pub use block_store::BlockStore;
pub use case::{CaseFs, RealizationState, StateMap, SummaryKeySet, TimeMap};
pub use mount::{DriverCategory, MountRecord};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a mount file (magic {found:#010x})")]
    BadMagic { found: u32 },
    #[error("unsupported mount file version {found}")]
    BadVersion { found: i32 },
    #[error("unknown driver category {0}")]
    UnknownCategory(i32),
    #[error("mount file does not describe a {0:?} driver")]
    MissingDriver(DriverCategory),
    #[error("case is open read-only (lock held elsewhere)")]
    ReadOnly,
    #[error("time map conflict at step {step}: stored {stored}, incoming {incoming}")]
    TimeMapConflict { step: usize, stored: i64, incoming: i64 },
    #[error("corrupt store: {0}")]
    Corrupt(String),
}
