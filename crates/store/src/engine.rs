//! KV-engine adapter
//!
//! A minimal, engine-agnostic contract over the embedded ordered
//! key-value store (LMDB through `heed`): environment lifecycle,
//! single-writer/multi-reader transactions, cursors, and usage
//! accounting. Everything above this module speaks the
//! [`fleetstate_core::Error`] taxonomy; the LMDB error codes are mapped
//! here and nowhere else.
//!
//! Ownership is arena-style: the [`Engine`] owns the environment,
//! transactions borrow from the engine, and a [`RawCursor`] borrows the
//! engine for its own write transaction. No back-pointers are stored;
//! lifetimes are enforced at call boundaries.

use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, MdbError, RoTxn, RwTxn};
use tracing::warn;

use fleetstate_core::{Error, Result};

/// Suffix used by the engine's database files
pub const FILE_EXTENSION: &str = fleetstate_core::FILE_EXTENSION;

/// Engine limit on key length in bytes
pub const MAX_KEY_SIZE: usize = 511;

/// Default memory-map size for a database environment
pub const DEFAULT_MAP_SIZE: usize = 100 * 1024 * 1024;

/// Default limit on concurrent read transactions
pub const DEFAULT_MAX_READERS: u32 = 126;

/// Options for opening a database environment
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Open the file read-only (it must already exist)
    pub read_only: bool,
    /// Size of the memory map, an upper bound on the database size
    pub map_size: usize,
    /// Limit on concurrent read transactions
    pub max_readers: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            read_only: false,
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

/// An open database environment bound to one on-disk file
///
/// Cheap to clone; clones share the same environment. The environment
/// is multi-reader-safe without additional locking, writers serialise
/// on the engine's internal writer mutex.
#[derive(Clone)]
pub struct Engine {
    env: Env,
    db: Database<Bytes, Bytes>,
    path: PathBuf,
}

impl Engine {
    /// Open (and for writable environments, create) the single-file
    /// database at `path`.
    pub fn open(path: &Path, options: &EngineOptions) -> Result<Engine> {
        let mut builder = EnvOpenOptions::new();
        builder
            .map_size(options.map_size)
            .max_readers(options.max_readers);

        let mut flags = EnvFlags::NO_SUB_DIR;
        if options.read_only {
            flags |= EnvFlags::READ_ONLY;
        }
        unsafe {
            builder.flags(flags);
        }

        let env = unsafe { builder.open(path) }.map_err(|e| map_error(path, "open", e))?;

        let db = if options.read_only {
            let rtxn = env.read_txn().map_err(|e| map_error(path, "read_txn", e))?;
            env.open_database::<Bytes, Bytes>(&rtxn, None)
                .map_err(|e| map_error(path, "open_database", e))?
                .ok_or_else(|| Error::Corrupt {
                    path: path.to_path_buf(),
                    message: "main database missing from environment".into(),
                })?
        } else {
            let mut wtxn = env.write_txn().map_err(|e| map_error(path, "write_txn", e))?;
            let db = env
                .create_database::<Bytes, Bytes>(&mut wtxn, None)
                .map_err(|e| map_error(path, "create_database", e))?;
            wtxn.commit().map_err(|e| map_error(path, "commit", e))?;
            db
        };

        Ok(Engine {
            env,
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a read transaction (a snapshot; does not block writers)
    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        self.env
            .read_txn()
            .map_err(|e| self.err("read_txn", e))
    }

    /// Begin the (single) write transaction
    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        self.env
            .write_txn()
            .map_err(|e| self.err("write_txn", e))
    }

    /// Commit a write transaction
    pub fn commit(&self, txn: RwTxn<'_>) -> Result<()> {
        txn.commit().map_err(|e| self.err("commit", e))
    }

    /// Abort a write transaction, discarding its effects
    pub fn abort(&self, txn: RwTxn<'_>) {
        txn.abort();
    }

    // =========================================================================
    // Keyed operations within a caller-owned transaction
    // =========================================================================

    pub fn get<'t>(&self, txn: &'t RoTxn<'_>, key: &[u8]) -> Result<Option<&'t [u8]>> {
        self.db
            .get(txn, key)
            .map_err(|e| self.keyed_err("get", key, None, e))
    }

    pub fn put(&self, txn: &mut RwTxn<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        self.db
            .put(txn, key, value)
            .map_err(|e| self.keyed_err("put", key, Some(value.len()), e))
    }

    /// Delete a key; `false` when it was absent
    pub fn del(&self, txn: &mut RwTxn<'_>, key: &[u8]) -> Result<bool> {
        self.db
            .delete(txn, key)
            .map_err(|e| self.keyed_err("del", key, None, e))
    }

    /// All entries visible to `txn`, in key order
    pub fn entries_in(&self, txn: &RoTxn<'_>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        let iter = self.db.iter(txn).map_err(|e| self.err("iter", e))?;
        for item in iter {
            let (key, value) = item.map_err(|e| self.err("iter", e))?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    // =========================================================================
    // Single-shot operations (one transaction per call)
    // =========================================================================

    pub fn get_copy(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let rtxn = self.read_txn()?;
        Ok(self.get(&rtxn, key)?.map(|v| v.to_vec()))
    }

    pub fn put_one(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut wtxn = self.write_txn()?;
        self.put(&mut wtxn, key, value)?;
        self.commit(wtxn)
    }

    pub fn del_one(&self, key: &[u8]) -> Result<bool> {
        let mut wtxn = self.write_txn()?;
        let removed = self.del(&mut wtxn, key)?;
        self.commit(wtxn)?;
        Ok(removed)
    }

    /// Iterate all entries under one read snapshot
    pub fn scan(&self, mut f: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        let rtxn = self.read_txn()?;
        let iter = self.db.iter(&rtxn).map_err(|e| self.err("iter", e))?;
        for item in iter {
            let (key, value) = item.map_err(|e| self.err("iter", e))?;
            f(key, value)?;
        }
        Ok(())
    }

    /// First entry in key order, if any
    pub fn first_entry(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let rtxn = self.read_txn()?;
        Ok(self
            .db
            .first(&rtxn)
            .map_err(|e| self.err("first", e))?
            .map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    /// Number of entries
    pub fn len(&self) -> Result<u64> {
        let rtxn = self.read_txn()?;
        self.db.len(&rtxn).map_err(|e| self.err("len", e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry
    pub fn clear_all(&self) -> Result<()> {
        let mut wtxn = self.write_txn()?;
        self.db.clear(&mut wtxn).map_err(|e| self.err("clear", e))?;
        self.commit(wtxn)
    }

    /// Open a write cursor over the whole database
    pub fn cursor(&self) -> Result<RawCursor<'_>> {
        let txn = self.write_txn()?;
        Ok(RawCursor {
            engine: self,
            txn: Some(txn),
            current: None,
            exhausted: false,
        })
    }

    /// Estimated `used_bytes / map_size * 100`, or -1 when unknown
    pub fn usage_percentage(&self) -> Result<i32> {
        let rtxn = self.read_txn()?;
        let stat = self.db.stat(&rtxn).map_err(|e| self.err("stat", e))?;
        let map_size = self.env.info().map_size;
        if map_size == 0 {
            return Ok(-1);
        }
        let used =
            (stat.branch_pages + stat.leaf_pages + stat.overflow_pages) * stat.page_size as usize;
        Ok(((used * 100) / map_size) as i32)
    }

    fn err(&self, op: &str, err: heed::Error) -> Error {
        map_error(&self.path, op, err)
    }

    /// A size complaint from the engine is about the offered key or
    /// value; report the real lengths rather than a bare code. The key
    /// is the culprit when it is empty or over the limit, otherwise the
    /// value was refused.
    fn keyed_err(
        &self,
        op: &str,
        key: &[u8],
        value_len: Option<usize>,
        err: heed::Error,
    ) -> Error {
        if !matches!(err, heed::Error::Mdb(MdbError::BadValSize)) {
            return map_error(&self.path, op, err);
        }
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Error::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            };
        }
        match value_len {
            Some(size) => Error::ValueTooLarge { size },
            None => Error::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            },
        }
    }
}

/// A cursor over the database, holding its own write transaction.
///
/// Stepping is by ordered key lookup, so deleting or overwriting the
/// current entry never invalidates the iteration position. All cursor
/// mutations live in one transaction, committed when the cursor is
/// closed (or dropped).
pub struct RawCursor<'e> {
    engine: &'e Engine,
    txn: Option<RwTxn<'e>>,
    current: Option<Vec<u8>>,
    exhausted: bool,
}

impl<'e> RawCursor<'e> {
    /// Advance to the next entry, returning its key and value
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.exhausted {
            return Ok(None);
        }
        let found = {
            let txn = self.txn.as_ref().ok_or(Error::BadTxn)?;
            let engine = self.engine;
            let next = match self.current.as_deref() {
                None => engine.db.first(txn),
                Some(key) => engine.db.get_greater_than(txn, key),
            }
            .map_err(|e| engine.err("cursor_next", e))?;
            next.map(|(k, v)| (k.to_vec(), v.to_vec()))
        };
        match found {
            Some((key, value)) => {
                self.current = Some(key.clone());
                Ok(Some((key, value)))
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Delete the entry last returned by [`RawCursor::next_entry`]
    pub fn delete_current(&mut self) -> Result<()> {
        let engine = self.engine;
        let key = self.current.clone().ok_or(Error::BadTxn)?;
        let txn = self.txn.as_mut().ok_or(Error::BadTxn)?;
        engine
            .db
            .delete(txn, &key)
            .map_err(|e| engine.keyed_err("cursor_delete", &key, None, e))?;
        Ok(())
    }

    /// Overwrite the value of the entry last returned by
    /// [`RawCursor::next_entry`]
    pub fn put_current(&mut self, value: &[u8]) -> Result<()> {
        let engine = self.engine;
        let key = self.current.clone().ok_or(Error::BadTxn)?;
        let txn = self.txn.as_mut().ok_or(Error::BadTxn)?;
        engine
            .db
            .put(txn, &key, value)
            .map_err(|e| engine.keyed_err("cursor_put", &key, Some(value.len()), e))?;
        Ok(())
    }

    /// Commit the cursor's transaction
    pub fn close(mut self) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn.commit().map_err(|e| self.engine.err("cursor_close", e)),
            None => Ok(()),
        }
    }
}

impl Drop for RawCursor<'_> {
    fn drop(&mut self) {
        // Closing a cursor commits its transaction; explicit close() is
        // only needed when the caller wants the error.
        if let Some(txn) = self.txn.take() {
            if let Err(err) = txn.commit() {
                warn!(
                    "commit of cursor transaction on '{}' failed: {err}",
                    self.engine.path.display()
                );
            }
        }
    }
}

fn map_error(path: &Path, op: &str, err: heed::Error) -> Error {
    match err {
        heed::Error::Io(e) => Error::io(format!("{op} '{}'", path.display()), e),
        heed::Error::Mdb(mdb) => match mdb {
            MdbError::NotFound => Error::NotFound,
            MdbError::Corrupted | MdbError::PageNotFound | MdbError::Invalid | MdbError::Panic => {
                Error::Corrupt {
                    path: path.to_path_buf(),
                    message: mdb.to_string(),
                }
            }
            MdbError::MapFull => Error::MapFull {
                path: path.to_path_buf(),
            },
            MdbError::TxnFull => Error::TxnFull,
            MdbError::ReadersFull | MdbError::TlsFull => Error::ReadersFull,
            MdbError::DbsFull => Error::DbsFull,
            MdbError::CursorFull => Error::CursorFull,
            MdbError::BadTxn | MdbError::BadRslot | MdbError::BadDbi => Error::BadTxn,
            MdbError::VersionMismatch => Error::VersionMismatch,
            MdbError::Incompatible | MdbError::MapResized => Error::Incompatible,
            // BadValSize carries no size of its own; the keyed call
            // sites translate it with the real lengths in scope.
            other => Error::internal(format!("{op} '{}': {other}", path.display())),
        },
        other => Error::internal(format!("{op} '{}': {other}", path.display())),
    }
}
