//! Logical database identities and on-disk path resolution
//!
//! Every database the agent fleet persists is named by a [`DbId`]. Each id
//! maps to a filename stem under the state directory, and optionally to a
//! legacy stem under the work directory for pre-migration installations.
//! We never create a database at the legacy location; it is a read-only
//! fallback used only when the old file is still present.

use std::path::{Path, PathBuf};

/// File extension used by the embedded engine
pub const FILE_EXTENSION: &str = "lmdb";

/// The fixed enumeration of logical databases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DbId {
    Classes,
    Variables,
    Performance,
    Checksums,
    Filestats,
    Changes,
    Observations,
    State,
    Lastseen,
    Audit,
    Locks,
    History,
    Measure,
    Static,
    Scalars,
    WindowsRegistry,
    Cache,
    License,
    Value,
    AgentExecution,
    Bundles,
    PackagesInstalled,
    PackagesUpdates,
}

impl DbId {
    /// All logical ids, in declaration order
    pub const ALL: [DbId; 23] = [
        DbId::Classes,
        DbId::Variables,
        DbId::Performance,
        DbId::Checksums,
        DbId::Filestats,
        DbId::Changes,
        DbId::Observations,
        DbId::State,
        DbId::Lastseen,
        DbId::Audit,
        DbId::Locks,
        DbId::History,
        DbId::Measure,
        DbId::Static,
        DbId::Scalars,
        DbId::WindowsRegistry,
        DbId::Cache,
        DbId::License,
        DbId::Value,
        DbId::AgentExecution,
        DbId::Bundles,
        DbId::PackagesInstalled,
        DbId::PackagesUpdates,
    ];

    /// Filename stem under the state directory (canonical location)
    pub fn state_stem(self) -> &'static str {
        match self {
            DbId::Classes => "cf_classes",
            DbId::Variables => "cf_variables",
            DbId::Performance => "performance",
            DbId::Checksums => "checksum_digests",
            DbId::Filestats => "stats",
            DbId::Changes => "cf_changes",
            DbId::Observations => "cf_observations",
            DbId::State => "cf_state",
            DbId::Lastseen => "cf_lastseen",
            DbId::Audit => "cf_audit",
            DbId::Locks => "cf_lock",
            DbId::History => "history",
            DbId::Measure => "nova_measures",
            DbId::Static => "nova_static",
            DbId::Scalars => "nova_pscalar",
            DbId::WindowsRegistry => "mswin",
            DbId::Cache => "nova_cache",
            DbId::License => "nova_track",
            DbId::Value => "nova_value",
            DbId::AgentExecution => "nova_agent_execution",
            DbId::Bundles => "bundles",
            DbId::PackagesInstalled => "packages_installed",
            DbId::PackagesUpdates => "packages_updates",
        }
    }

    /// Legacy stem under the work directory, for databases that predate
    /// the state directory split. `None` means the database always lived
    /// in the state directory.
    pub fn legacy_stem(self) -> Option<&'static str> {
        match self {
            DbId::Classes => Some("cf_classes"),
            DbId::Performance => Some("performance"),
            DbId::Checksums => Some("checksum_digests"),
            DbId::Filestats => Some("stats"),
            DbId::Lastseen => Some("cf_lastseen"),
            DbId::Audit => Some("cf_audit"),
            DbId::WindowsRegistry => Some("mswin"),
            DbId::Cache => Some("nova_cache"),
            DbId::License => Some("nova_track"),
            DbId::Value => Some("nova_value"),
            DbId::AgentExecution => Some("nova_agent_execution"),
            DbId::Bundles => Some("bundles"),
            _ => None,
        }
    }
}

/// Where the databases live on disk
///
/// An explicit value rather than a process global so that tools and tests
/// can point different registries at different directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
    work_dir: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        StateLayout {
            state_dir: state_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Layout with the state directory nested under the work directory
    /// (`<work>/state`), the default installation shape.
    pub fn under_workdir(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        StateLayout {
            state_dir: work_dir.join("state"),
            work_dir,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Resolve the file for a logical database.
    ///
    /// If a legacy file still exists under the work directory it wins;
    /// otherwise the state-directory path is used.
    pub fn db_path(&self, id: DbId) -> PathBuf {
        if let Some(stem) = id.legacy_stem() {
            let legacy = self
                .work_dir
                .join(format!("{}.{}", stem, FILE_EXTENSION));
            if legacy.exists() {
                return legacy;
            }
        }
        self.state_dir
            .join(format!("{}.{}", id.state_stem(), FILE_EXTENSION))
    }

    /// Path for a named sub-database of a logical id
    /// (`<stem>_<sub>.<ext>` under the state directory).
    pub fn sub_db_path(&self, id: DbId, sub_name: &str) -> PathBuf {
        self.state_dir.join(format!(
            "{}_{}.{}",
            id.state_stem(),
            sub_name,
            FILE_EXTENSION
        ))
    }

    /// Default location of the observable name table
    pub fn tskey_path(&self) -> PathBuf {
        self.state_dir.join("ts_key")
    }
}
