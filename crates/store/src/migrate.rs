//! On-disk schema migration
//!
//! Migrators run once per process for each database, during the first
//! open, while the advisory path lock is still held. A failed migration
//! fails the open.
//!
//! Only the lastseen database has ever changed layout. Schema version 0
//! kept one entry per direction and host, `<direction><hostkey>` mapping
//! to an address plus quality statistics; version 1 splits that into the
//! `q[io]*` / `k*` / `a*` key families so that both directions of lookup
//! are single reads. The rewrite happens inside one write transaction:
//! a crash mid-migration leaves the version 0 file intact.

use tracing::info;

use fleetstate_core::cstr::{from_c_bytes, to_c_bytes};
use fleetstate_core::records::{KeyHostSeen, QPoint};
use fleetstate_core::{DbId, Error, Result};

use crate::engine::Engine;

const VERSION_KEY: &[u8] = b"version\0";
const CURRENT_VERSION: &[u8] = b"1\0";

/// Size of the fixed address field in a version 0 value
const V0_ADDRESS_SIZE: usize = 128;
/// lastseen timestamp + address field + quality point
const V0_VALUE_SIZE: usize = 8 + V0_ADDRESS_SIZE + QPoint::SIZE;

pub(crate) fn run(engine: &Engine, id: DbId) -> Result<()> {
    match id {
        DbId::Lastseen => migrate_lastseen(engine),
        _ => Ok(()),
    }
}

struct V0Entry {
    incoming: bool,
    hostkey: String,
    address: String,
    seen: KeyHostSeen,
}

fn parse_v0(key: &[u8], value: &[u8]) -> Option<V0Entry> {
    let (&direction, rest) = key.split_first()?;
    let incoming = match direction {
        b'i' => true,
        b'o' => false,
        _ => return None,
    };
    let hostkey = from_c_bytes(rest)?.to_string();

    if value.len() != V0_VALUE_SIZE {
        return None;
    }
    let lastseen = i64::from_ne_bytes(value[0..8].try_into().ok()?);
    let address_field = &value[8..8 + V0_ADDRESS_SIZE];
    let nul = address_field.iter().position(|&b| b == 0)?;
    let address = std::str::from_utf8(&address_field[..nul]).ok()?.to_string();
    let q = QPoint::from_bytes(&value[8 + V0_ADDRESS_SIZE..])?;

    Some(V0Entry {
        incoming,
        hostkey,
        address,
        seen: KeyHostSeen { lastseen, q },
    })
}

fn migrate_lastseen(engine: &Engine) -> Result<()> {
    let mut wtxn = engine.write_txn()?;

    let version = engine.get(&wtxn, VERSION_KEY)?.map(|v| v.to_vec());
    if version.as_deref() == Some(CURRENT_VERSION) {
        engine.abort(wtxn);
        return Ok(());
    }
    match version.as_deref() {
        None | Some(b"0\0") => {}
        Some(other) => {
            return Err(Error::Migration {
                path: engine.path().to_path_buf(),
                message: format!(
                    "unknown lastseen schema version {:?}",
                    String::from_utf8_lossy(other)
                ),
            });
        }
    }

    let entries: Vec<(Vec<u8>, Vec<u8>)> = engine
        .entries_in(&wtxn)?
        .into_iter()
        .filter(|(key, _)| key.as_slice() != VERSION_KEY)
        .collect();

    if entries.is_empty() {
        // Fresh database: stamp the current version and be done.
        engine.put(&mut wtxn, VERSION_KEY, CURRENT_VERSION)?;
        return engine.commit(wtxn);
    }

    let mut parsed = Vec::with_capacity(entries.len());
    for (key, value) in &entries {
        match parse_v0(key, value) {
            Some(entry) => parsed.push(entry),
            None => {
                return Err(Error::Migration {
                    path: engine.path().to_path_buf(),
                    message: format!(
                        "entry {:?} does not match the version 0 layout",
                        String::from_utf8_lossy(key)
                    ),
                });
            }
        }
    }

    // The forward entry records the most recently seen address per key.
    let mut latest: std::collections::HashMap<&str, (i64, &str)> = std::collections::HashMap::new();
    for entry in &parsed {
        let slot = latest
            .entry(entry.hostkey.as_str())
            .or_insert((entry.seen.lastseen, entry.address.as_str()));
        if entry.seen.lastseen > slot.0 {
            *slot = (entry.seen.lastseen, entry.address.as_str());
        }
    }

    for entry in &parsed {
        let direction = if entry.incoming { 'i' } else { 'o' };
        let quality_key = to_c_bytes(&format!("q{}{}", direction, entry.hostkey));
        engine.put(&mut wtxn, &quality_key, &entry.seen.to_bytes())?;

        let address_key = to_c_bytes(&format!("a{}", entry.address));
        engine.put(&mut wtxn, &address_key, &to_c_bytes(&entry.hostkey))?;
    }
    for (hostkey, (_, address)) in &latest {
        let hostkey_key = to_c_bytes(&format!("k{hostkey}"));
        engine.put(&mut wtxn, &hostkey_key, &to_c_bytes(address))?;
    }

    for (key, _) in &entries {
        engine.del(&mut wtxn, key)?;
    }
    engine.put(&mut wtxn, VERSION_KEY, CURRENT_VERSION)?;
    engine.commit(wtxn)?;

    info!(
        "migrated lastseen database '{}' from schema version 0 to 1 ({} entries)",
        engine.path().display(),
        parsed.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;

    fn v0_value(lastseen: i64, address: &str, q: QPoint) -> Vec<u8> {
        let mut value = Vec::with_capacity(V0_VALUE_SIZE);
        value.extend_from_slice(&lastseen.to_ne_bytes());
        let mut field = [0u8; V0_ADDRESS_SIZE];
        field[..address.len()].copy_from_slice(address.as_bytes());
        value.extend_from_slice(&field);
        value.extend_from_slice(&q.to_bytes());
        value
    }

    fn temp_engine() -> (tempfile::TempDir, Engine) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf_lastseen.lmdb");
        let engine = Engine::open(&path, &EngineOptions::default()).unwrap();
        (dir, engine)
    }

    #[test]
    fn fresh_database_is_stamped() {
        let (_dir, engine) = temp_engine();
        run(&engine, DbId::Lastseen).unwrap();
        assert_eq!(
            engine.get_copy(VERSION_KEY).unwrap(),
            Some(CURRENT_VERSION.to_vec())
        );
    }

    #[test]
    fn migration_is_idempotent() {
        let (_dir, engine) = temp_engine();
        run(&engine, DbId::Lastseen).unwrap();
        let before = engine.len().unwrap();
        run(&engine, DbId::Lastseen).unwrap();
        assert_eq!(engine.len().unwrap(), before);
    }

    #[test]
    fn v0_entries_are_split_into_key_families() {
        let (_dir, engine) = temp_engine();
        let hostkey = format!("SHA={}", "1".repeat(64));

        engine
            .put_one(
                &to_c_bytes(&format!("i{hostkey}")),
                &v0_value(600, "10.0.0.1", QPoint::definite(0.0)),
            )
            .unwrap();
        engine
            .put_one(
                &to_c_bytes(&format!("o{hostkey}")),
                &v0_value(700, "10.0.0.2", QPoint::definite(5.0)),
            )
            .unwrap();

        run(&engine, DbId::Lastseen).unwrap();

        let qi = engine
            .get_copy(&to_c_bytes(&format!("qi{hostkey}")))
            .unwrap()
            .unwrap();
        assert_eq!(KeyHostSeen::from_bytes(&qi).unwrap().lastseen, 600);

        // The forward entry keeps the most recently seen address.
        let forward = engine
            .get_copy(&to_c_bytes(&format!("k{hostkey}")))
            .unwrap()
            .unwrap();
        assert_eq!(from_c_bytes(&forward), Some("10.0.0.2"));

        // Both reverse entries exist.
        assert!(engine.get_copy(&to_c_bytes("a10.0.0.1")).unwrap().is_some());
        assert!(engine.get_copy(&to_c_bytes("a10.0.0.2")).unwrap().is_some());

        // The old direction-prefixed keys are gone.
        assert!(engine
            .get_copy(&to_c_bytes(&format!("i{hostkey}")))
            .unwrap()
            .is_none());
        assert_eq!(
            engine.get_copy(VERSION_KEY).unwrap(),
            Some(CURRENT_VERSION.to_vec())
        );
    }

    #[test]
    fn unparseable_store_fails_the_open() {
        let (_dir, engine) = temp_engine();
        engine.put_one(b"garbage\0", b"not a v0 record").unwrap();

        let err = run(&engine, DbId::Lastseen).unwrap_err();
        assert!(matches!(err, Error::Migration { .. }));

        // Nothing was changed.
        assert!(engine.get_copy(VERSION_KEY).unwrap().is_none());
        assert!(engine.get_copy(b"garbage\0").unwrap().is_some());
    }

    #[test]
    fn other_ids_have_no_migrator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf_classes.lmdb");
        let engine = Engine::open(&path, &EngineOptions::default()).unwrap();
        run(&engine, DbId::Classes).unwrap();
        assert_eq!(engine.len().unwrap(), 0);
    }
}
