//! Process-wide database handle registry
//!
//! Opening the same database file twice must share one engine
//! environment: the engine forbids a second environment on the same
//! path within a process, and cross-process sharing happens through the
//! memory-mapped file. The registry keeps one refcounted handle per
//! resolved path and hands out [`Db`] references.
//!
//! First open of a handle:
//! 1. resolve the filename (legacy work-dir file wins when present)
//! 2. take the advisory `<file>.lock` so only one process creates the
//!    database
//! 3. open the engine; on corruption, rename the file to
//!    `<file>.broken` and retry once
//! 4. run the migrator for the logical id
//! 5. drop the advisory lock, bump the refcount
//!
//! The registry mutex guards only the handle table; it is released
//! before the handle's own mutex is taken and never held during engine
//! I/O.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use fleetstate_core::cstr::{from_loose_c_bytes, to_c_bytes};
use fleetstate_core::{DbId, Error, Result, StateLayout};

use crate::engine::{Engine, EngineOptions, RawCursor, DEFAULT_MAX_READERS};
use crate::migrate;

/// Open handles by resolved database path
static OPEN_HANDLES: Lazy<Mutex<HashMap<PathBuf, Arc<DbHandle>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registry-wide limit on concurrent transactions, applied to
/// environments opened after it is set
static MAX_CONCURRENT_TXNS: Lazy<Mutex<u32>> = Lazy::new(|| Mutex::new(DEFAULT_MAX_READERS));

struct HandleInner {
    refcount: u32,
    engine: Option<Engine>,
}

/// One registry slot: the handle owns the engine environment, its mutex
/// guards the refcount and the environment pointer (nothing else).
struct DbHandle {
    path: PathBuf,
    inner: Mutex<HandleInner>,
}

/// A shared, open reference to a logical database
///
/// Dropping the reference releases it; the engine environment closes
/// when the last reference goes away.
pub struct Db {
    handle: Arc<DbHandle>,
    /// Always `Some` until drop, where it must be destroyed before the
    /// refcount is released so a concurrent re-open never sees a stale
    /// environment on the same path.
    engine: Option<Engine>,
    id: DbId,
}

/// Record the maximum number of concurrent transactions, expected to be
/// set by agents as they start up. Best-effort: environments that are
/// already open keep their current limit, with a warning.
pub fn set_max_concurrent_transactions(max_txns: u32) {
    *MAX_CONCURRENT_TXNS.lock() = max_txns;

    let handles: Vec<Arc<DbHandle>> = OPEN_HANDLES.lock().values().cloned().collect();
    for handle in handles {
        if handle.inner.lock().engine.is_some() {
            warn!(
                "max concurrent transactions set to {max_txns} while '{}' is open; \
                 the new limit applies when it is next opened",
                handle.path.display()
            );
        }
    }
}

/// Open a shared handle to a logical database
pub fn open(layout: &StateLayout, id: DbId) -> Result<Db> {
    open_at(layout.db_path(id), id)
}

/// Open a shared handle to a named sub-database of a logical id
pub fn open_sub(layout: &StateLayout, id: DbId, sub_name: &str) -> Result<Db> {
    open_at(layout.sub_db_path(id, sub_name), id)
}

fn open_at(path: PathBuf, id: DbId) -> Result<Db> {
    let handle = {
        let mut handles = OPEN_HANDLES.lock();
        handles
            .entry(path.clone())
            .or_insert_with(|| {
                Arc::new(DbHandle {
                    path: path.clone(),
                    inner: Mutex::new(HandleInner {
                        refcount: 0,
                        engine: None,
                    }),
                })
            })
            .clone()
    };

    let mut inner = handle.inner.lock();

    if inner.engine.is_none() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create '{}'", parent.display()), e))?;
        }

        let _path_lock = PathLock::acquire(&path)?;

        let options = EngineOptions {
            max_readers: *MAX_CONCURRENT_TXNS.lock(),
            ..Default::default()
        };

        let engine = match Engine::open(&path, &options) {
            Ok(engine) => engine,
            Err(err) if err.is_corruption() => {
                warn!(
                    "database '{}' is broken ({err}), moving it aside and recreating",
                    path.display()
                );
                move_broken(&path)?;
                Engine::open(&path, &options)
                    .map_err(|_| Error::PermanentCorrupt { path: path.clone() })?
            }
            Err(err) => return Err(err),
        };

        migrate::run(&engine, id)?;
        inner.engine = Some(engine);
    }

    let engine = match inner.engine.clone() {
        Some(engine) => engine,
        None => return Err(Error::internal("open handle without engine")),
    };
    inner.refcount += 1;

    drop(inner);
    Ok(Db {
        handle,
        engine: Some(engine),
        id,
    })
}

fn release(handle: &DbHandle) {
    let mut inner = handle.inner.lock();
    if inner.refcount == 0 {
        error!(
            "closing database '{}' which is not open",
            handle.path.display()
        );
        return;
    }
    inner.refcount -= 1;
    if inner.refcount == 0 {
        inner.engine = None;
    }
}

/// Wait for all users of all databases to finish, then close the
/// environments. The registry mutex is left locked so no background
/// thread can open a database mid-teardown; call this last, at process
/// exit.
pub fn close_all() {
    let handles = OPEN_HANDLES.lock();
    for handle in handles.values() {
        close_handle(handle);
    }
    std::mem::forget(handles);
}

fn close_handle(handle: &DbHandle) {
    // Wait until refcount drains, or a threshold is reached.
    let mut waited = 0;
    loop {
        let mut inner = handle.inner.lock();
        if inner.refcount == 0 {
            inner.engine = None;
            return;
        }
        if waited >= 1000 {
            error!(
                "database '{}' refcount is still not zero ({}), forcing close",
                handle.path.display(),
                inner.refcount
            );
            inner.engine = None;
            return;
        }
        drop(inner);
        std::thread::sleep(Duration::from_millis(10));
        waited += 1;
    }
}

impl Db {
    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.handle.path
    }

    /// The underlying engine, for callers that need transactions or
    /// cursors spanning several operations
    pub fn engine(&self) -> &Engine {
        self.engine.as_ref().expect("engine present until drop")
    }

    /// Read the value stored under a string key
    pub fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.engine().get_copy(&to_c_bytes(key))
    }

    /// Read a value expected to be a stored string
    pub fn read_string(&self, key: &str) -> Result<Option<String>> {
        match self.read(key)? {
            Some(bytes) => Ok(from_loose_c_bytes(&bytes).map(|s| s.to_string())),
            None => Ok(None),
        }
    }

    pub fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.engine().put_one(&to_c_bytes(key), value)
    }

    /// Store a string value in its on-disk form (trailing NUL)
    pub fn write_string(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, &to_c_bytes(value))
    }

    /// Delete a string key; `false` when it was absent
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.engine().del_one(&to_c_bytes(key))
    }

    pub fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.read(key)?.is_some())
    }

    /// Size of the stored value, or `None` when the key is absent
    pub fn value_size(&self, key: &str) -> Result<Option<usize>> {
        Ok(self.read(key)?.map(|v| v.len()))
    }

    // Raw-key variants for stores whose keys are not strings.

    pub fn read_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.engine().get_copy(key)
    }

    pub fn write_raw(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine().put_one(key, value)
    }

    pub fn delete_raw(&self, key: &[u8]) -> Result<bool> {
        self.engine().del_one(key)
    }

    /// Truncate the database to empty (maintenance)
    pub fn clean(&self) -> Result<()> {
        self.engine().clear_all()
    }

    /// Open a cursor over all entries
    pub fn cursor(&self) -> Result<RawCursor<'_>> {
        self.engine().cursor()
    }

    /// Snapshot the whole database into an ordered map
    pub fn load_to_map(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut map = BTreeMap::new();
        self.engine().scan(|key, value| {
            map.insert(key.to_vec(), value.to_vec());
            Ok(())
        })?;
        Ok(map)
    }

    pub fn usage_percentage(&self) -> Result<i32> {
        self.engine().usage_percentage()
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Our environment clone must go before the refcount does, so a
        // zero refcount really means the environment is closed.
        self.engine = None;
        release(&self.handle);
    }
}

/// Advisory lock serialising database creation across processes,
/// held only for the duration of a handle's first open.
struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    fn acquire(db_path: &Path) -> Result<PathLock> {
        let path = suffixed(db_path, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io(format!("open database lock file '{}'", path.display()), e))?;
        file.lock_exclusive()
            .map_err(|e| Error::io(format!("lock database lock file '{}'", path.display()), e))?;
        Ok(PathLock { file, path })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            error!(
                "could not unlock database lock file '{}': {err}",
                self.path.display()
            );
        }
    }
}

fn move_broken(path: &Path) -> Result<()> {
    let broken = suffixed(path, ".broken");
    match fs::rename(path, &broken) {
        Ok(()) => {
            info!(
                "moved broken database to '{}'",
                broken.display()
            );
            Ok(())
        }
        Err(e) => Err(Error::io(
            format!("move broken database '{}' aside", path.display()),
            e,
        )),
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_layout() -> (tempfile::TempDir, StateLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::under_workdir(dir.path());
        (dir, layout)
    }

    #[test]
    fn open_write_read_close() {
        let (_dir, layout) = temp_layout();

        let db = open(&layout, DbId::Classes).unwrap();
        db.write_string("linux", "context").unwrap();
        assert_eq!(db.read_string("linux").unwrap().as_deref(), Some("context"));
        assert!(db.has_key("linux").unwrap());
        assert!(!db.has_key("windows").unwrap());
        assert_eq!(db.value_size("linux").unwrap(), Some("context".len() + 1));
        drop(db);

        // Reopen sees the same data.
        let db = open(&layout, DbId::Classes).unwrap();
        assert_eq!(db.read_string("linux").unwrap().as_deref(), Some("context"));
    }

    #[test]
    fn handles_are_shared_and_refcounted() {
        let (_dir, layout) = temp_layout();

        let first = open(&layout, DbId::Performance).unwrap();
        let second = open(&layout, DbId::Performance).unwrap();
        assert!(Arc::ptr_eq(&first.handle, &second.handle));
        assert_eq!(first.handle.inner.lock().refcount, 2);

        drop(first);
        assert_eq!(second.handle.inner.lock().refcount, 1);
        let handle = second.handle.clone();
        drop(second);
        assert_eq!(handle.inner.lock().refcount, 0);
        assert!(handle.inner.lock().engine.is_none());
    }

    #[test]
    fn excess_release_is_harmless() {
        let (_dir, layout) = temp_layout();
        let db = open(&layout, DbId::Filestats).unwrap();
        let handle = db.handle.clone();
        drop(db);

        // An unmatched release logs an error and leaves the slot sane.
        release(&handle);
        assert_eq!(handle.inner.lock().refcount, 0);

        let db = open(&layout, DbId::Filestats).unwrap();
        assert_eq!(db.handle.inner.lock().refcount, 1);
    }

    #[test]
    fn sub_databases_get_their_own_files() {
        let (_dir, layout) = temp_layout();

        let main = open(&layout, DbId::State).unwrap();
        let sub = open_sub(&layout, DbId::State, "node1").unwrap();
        assert_ne!(main.path(), sub.path());

        sub.write_string("only", "here").unwrap();
        assert!(!main.has_key("only").unwrap());
    }

    #[test]
    fn clean_truncates() {
        let (_dir, layout) = temp_layout();
        let db = open(&layout, DbId::Changes).unwrap();
        db.write_string("a", "1").unwrap();
        db.write_string("b", "2").unwrap();
        db.clean().unwrap();
        assert!(db.load_to_map().unwrap().is_empty());
    }

    #[test]
    fn corrupt_store_is_moved_aside() {
        let (_dir, layout) = temp_layout();
        let path = layout.db_path(DbId::Cache);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"this is not a database").unwrap();

        let db = open(&layout, DbId::Cache).unwrap();
        db.write_string("fresh", "start").unwrap();

        let broken = suffixed(&path, ".broken");
        assert!(broken.exists());
        assert_eq!(fs::read(&broken).unwrap(), b"this is not a database");
    }

    #[test]
    fn lock_file_appears_next_to_database() {
        let (_dir, layout) = temp_layout();
        let db = open(&layout, DbId::Audit).unwrap();
        assert!(suffixed(db.path(), ".lock").exists());
    }

    #[test]
    fn raw_keys_roundtrip() {
        let (_dir, layout) = temp_layout();
        let db = open(&layout, DbId::Checksums).unwrap();

        let key = 123123123i32.to_ne_bytes();
        db.write_raw(&key, b"digest").unwrap();
        assert_eq!(db.read_raw(&key).unwrap(), Some(b"digest".to_vec()));
        assert!(db.delete_raw(&key).unwrap());
    }
}
