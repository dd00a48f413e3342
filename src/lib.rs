//! # Fleetstate
//!
//! The persistent state subsystem of a configuration-management agent
//! fleet: the on-disk key-value databases that record host identity,
//! peer observations, promise-lock state and operational metrics, and
//! the tooling that inspects, validates and repairs them.
//!
//! # Quick Start
//!
//! ```no_run
//! use fleetstate::{lastseen, store, DbId, StateLayout};
//!
//! fn main() -> fleetstate::Result<()> {
//!     let layout = StateLayout::under_workdir("/var/fleetstate");
//!
//!     // Shared, refcounted database handles.
//!     let db = store::open(&layout, DbId::Classes)?;
//!     db.write_string("linux", "defined")?;
//!
//!     // The lastseen registry keeps both directions of peer lookup.
//!     lastseen::record(
//!         &layout,
//!         "SHA=....",
//!         "10.0.0.1",
//!         lastseen::Role::Incoming,
//!         1_700_000_000,
//!     )?;
//!     Ok(())
//! }
//! ```
//!
//! # Components
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | [`store`] | KV-engine adapter, handle registry, load harness |
//! | [`lastseen`] | host-key <-> address index with quality statistics |
//! | [`check`] | dumpers, validators, fork-isolated diagnosis |
//! | [`template`] | mustache renderer for dump output |

pub use fleetstate_core::{
    cstr, error, ids, observables, records, DbId, Error, Result, StateLayout,
};

pub use fleetstate_check as check;
pub use fleetstate_lastseen as lastseen;
pub use fleetstate_store as store;
pub use fleetstate_template as template;
