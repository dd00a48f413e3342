//! Database inspection, validation and repair tooling
//!
//! The pieces behind the `fleetstate` maintenance tool:
//!
//! - [`codes`]: the closed set of per-file status codes, usable as
//!   process exit codes
//! - [`dump`]: schema-aware JSON dumpers for the state databases
//! - [`validate`]: per-store invariant checkers
//! - [`diagnose`]: the fork-isolated health check driver with an
//!   optional write probe
//! - [`discover`]: default database discovery under a state directory

pub mod codes;
pub mod diagnose;
pub mod discover;
pub mod dump;
pub mod validate;

pub use codes::CheckCode;
pub use diagnose::{diagnose_files, DiagnoseOptions};
pub use discover::default_db_files;
pub use dump::{dump_file, dump_files, DumpMode};
pub use validate::{validate_file, validate_file_strict};
