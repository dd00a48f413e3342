//! Core types for the fleetstate persistent state subsystem
//!
//! This crate holds everything the other crates agree on:
//! - [`Error`]: the unified error taxonomy surfaced by the store layer
//! - [`DbId`]: the fixed enumeration of logical databases and their
//!   on-disk path resolution through [`StateLayout`]
//! - the decoded record schemas ([`QPoint`], [`KeyHostSeen`], [`LockData`],
//!   [`Averages`], [`PersistentClassInfo`]) with their native-layout byte
//!   codecs
//! - the observable name table used by the dump tooling

pub mod cstr;
pub mod error;
pub mod ids;
pub mod observables;
pub mod records;

pub use error::{Error, Result};
pub use ids::{DbId, StateLayout, FILE_EXTENSION};
pub use records::{
    Averages, ClassStatePolicy, KeyHostSeen, LockData, PersistentClassInfo, QPoint,
};
