//! Shared persistent key-value stores
//!
//! This crate mediates all access to the memory-mapped databases the
//! agent fleet keeps on disk:
//!
//! - [`engine`]: a thin adapter over the embedded ordered KV engine
//!   (LMDB via `heed`) — environments, transactions, cursors, usage
//!   accounting and the engine error taxonomy
//! - [`registry`]: the process-wide refcounted handle cache, with
//!   advisory lockfiles serialising database creation across processes,
//!   move-aside recovery of corrupt stores, and migration dispatch
//! - [`load`]: a multi-thread/multi-process load-simulation harness for
//!   stress testing the above
//!
//! Deadlock discipline: the registry mutex is never held while calling
//! into the engine; a handle's own mutex is acquired only after the
//! registry mutex has been released.

pub mod engine;
pub mod load;
mod migrate;
pub mod registry;

pub use engine::{Engine, EngineOptions, RawCursor, DEFAULT_MAP_SIZE, MAX_KEY_SIZE};
pub use load::{
    fill, ChildLoad, Filament, Interval, IterLoad, LoadSimulation, LoadSpec, ReadLoad, WriteLoad,
};
pub use registry::{
    close_all, open, open_sub, set_max_concurrent_transactions, Db,
};
