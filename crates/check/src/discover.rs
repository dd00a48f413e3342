//! Default database discovery
//!
//! When the tool is given no filenames it operates on every default
//! database that actually exists under the configured layout.

use std::path::PathBuf;

use fleetstate_core::{DbId, StateLayout};

/// All default database files present on disk, in id order
pub fn default_db_files(layout: &StateLayout) -> Vec<PathBuf> {
    DbId::ALL
        .iter()
        .map(|&id| layout.db_path(id))
        .filter(|path| path.exists())
        .collect()
}
