//! Dump, validate and diagnose against stores built through the API.

use std::path::PathBuf;

use fleetstate_check::{diagnose_files, dump_file, validate_file, DiagnoseOptions, DumpMode};
use fleetstate_core::{DbId, StateLayout};
use fleetstate_lastseen as lastseen;
use fleetstate_lastseen::Role;
use fleetstate_store as store;

fn temp_layout() -> (tempfile::TempDir, StateLayout) {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::under_workdir(dir.path());
    (dir, layout)
}

fn sha(fill: char) -> String {
    format!("SHA={}", fill.to_string().repeat(64))
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn populated_lastseen() -> (tempfile::TempDir, StateLayout, PathBuf) {
    let (dir, layout) = temp_layout();
    let t = now() - 1000;
    lastseen::record(&layout, &sha('a'), "10.0.0.1", Role::Incoming, t).unwrap();
    lastseen::record(&layout, &sha('a'), "10.0.0.1", Role::Outgoing, t + 10).unwrap();
    lastseen::record(&layout, &sha('b'), "10.0.0.2", Role::Incoming, t + 20).unwrap();
    let path = layout.db_path(DbId::Lastseen);
    (dir, layout, path)
}

#[test]
fn api_built_lastseen_store_validates_clean() {
    let (_dir, _layout, path) = populated_lastseen();

    let mut out = Vec::new();
    let errors = validate_file(&path, &mut out).unwrap();
    assert_eq!(
        errors,
        0,
        "validator output: {}",
        String::from_utf8_lossy(&out)
    );
}

#[test]
fn nice_dump_decodes_an_api_built_store() {
    let (_dir, _layout, path) = populated_lastseen();

    let mut out = Vec::new();
    dump_file(&path, DumpMode::Nice, None, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert!(text.starts_with("{\n"));
    assert!(text.contains(&format!("\"k{}\": \"10.0.0.1\"", sha('a'))));
    assert!(text.contains(&format!("\"a10.0.0.2\": \"{}\"", sha('b'))));
    assert!(text.contains("\"lastseen\":"));
    assert!(text.contains("\"version\": \"1\""));
    assert!(text.ends_with("}\n"));
}

#[test]
fn portable_dump_keeps_terminators_visible() {
    let (_dir, _layout, path) = populated_lastseen();

    let mut out = Vec::new();
    dump_file(&path, DumpMode::Portable, None, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    // String values keep their trailing NUL in portable mode.
    assert!(text.contains("\"10.0.0.1\\u0000\""));
    // Quality structs still decode.
    assert!(text.contains("\"expect\":"));
}

#[test]
fn diagnose_counts_only_unhealthy_files() {
    let (_dir, layout, lastseen_path) = populated_lastseen();

    // A second, healthy database.
    let db = store::open(&layout, DbId::Classes).unwrap();
    db.write_string("linux", "yes").unwrap();
    drop(db);
    let classes_path = layout.db_path(DbId::Classes);

    // And one file of garbage.
    let garbage = layout.state_dir().join("cf_audit.lmdb");
    std::fs::write(&garbage, b"certainly not a database").unwrap();

    let options = DiagnoseOptions {
        foreground: true,
        ..Default::default()
    };
    let corrupt = diagnose_files(
        &[lastseen_path.clone(), classes_path, garbage.clone()],
        options,
    );
    assert_eq!(corrupt, vec![garbage]);
}

#[cfg(unix)]
#[test]
fn forked_diagnosis_matches_foreground() {
    let (_dir, _layout, path) = populated_lastseen();

    let foreground = diagnose_files(
        &[path.clone()],
        DiagnoseOptions {
            foreground: true,
            validate: true,
            ..Default::default()
        },
    );
    let forked = diagnose_files(
        &[path],
        DiagnoseOptions {
            foreground: false,
            validate: true,
            ..Default::default()
        },
    );
    assert!(foreground.is_empty());
    assert!(forked.is_empty());
}

#[test]
fn write_probe_preserves_the_key_set() {
    let (_dir, _layout, path) = populated_lastseen();

    let before = {
        let db = fleetstate_store::Engine::open(
            &path,
            &fleetstate_store::EngineOptions::default(),
        )
        .unwrap();
        let mut keys = Vec::new();
        db.scan(|k, _| {
            keys.push(k.to_vec());
            Ok(())
        })
        .unwrap();
        keys
    };

    let corrupt = diagnose_files(
        &[path.clone()],
        DiagnoseOptions {
            foreground: true,
            test_write: true,
            ..Default::default()
        },
    );
    assert!(corrupt.is_empty());

    let after = {
        let db = fleetstate_store::Engine::open(
            &path,
            &fleetstate_store::EngineOptions::default(),
        )
        .unwrap();
        let mut keys = Vec::new();
        db.scan(|k, _| {
            keys.push(k.to_vec());
            Ok(())
        })
        .unwrap();
        keys
    };
    assert_eq!(before, after);
}
