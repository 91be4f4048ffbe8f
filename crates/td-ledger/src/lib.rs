//! # td-ledger
//!
//! The shared study ledger for Tandem.
//!
//! Provides journal-backed storages (in-memory and file), a random sampler,
//! the [`Study`] and [`Trial`] handles objectives work with, and the study run
//! loop with its trial budget, timeout, parallelism and catch policy.

mod run;
mod sampler;
pub mod storage;
mod study;
mod trial;

pub use run::{CatchPolicy, RunConfig};
pub use sampler::{RandomSampler, Sampler};
pub use storage::{
    FileLog, InMemoryStorage, JournalBackend, JournalFileStorage, JournalOp, JournalStorage,
    MemoryLog, Storage, StorageKind,
};
pub use study::Study;
pub use trial::Trial;
