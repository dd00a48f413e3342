//! End-to-end scenarios for the lastseen registry.

use fleetstate_core::records::KeyHostSeen;
use fleetstate_core::{DbId, StateLayout};
use fleetstate_lastseen as lastseen;
use fleetstate_lastseen::{LocalNode, Role};
use fleetstate_store as store;

fn temp_layout() -> (tempfile::TempDir, StateLayout) {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::under_workdir(dir.path());
    (dir, layout)
}

fn sha(fill: char) -> String {
    format!("SHA={}", fill.to_string().repeat(64))
}

fn read_quality(layout: &StateLayout, key: &str) -> Option<KeyHostSeen> {
    let db = store::open(layout, DbId::Lastseen).unwrap();
    db.read(key).unwrap().and_then(|v| KeyHostSeen::from_bytes(&v))
}

#[test]
fn single_record_writes_forward_reverse_and_quality() {
    let (_dir, layout) = temp_layout();
    let hostkey = format!("SHA-{}", "1".repeat(64));

    lastseen::record(&layout, &hostkey, "127.0.0.64", Role::Incoming, 666).unwrap();

    let db = store::open(&layout, DbId::Lastseen).unwrap();
    assert_eq!(
        db.read_string(&format!("k{hostkey}")).unwrap().as_deref(),
        Some("127.0.0.64")
    );
    assert_eq!(
        db.read_string("a127.0.0.64").unwrap().as_deref(),
        Some(hostkey.as_str())
    );
    drop(db);

    let quality = read_quality(&layout, &format!("qi{hostkey}")).unwrap();
    assert_eq!(quality.lastseen, 666);
    assert_eq!(quality.q.q, 0.0);
    assert_eq!(quality.q.expect, 0.0);
    assert_eq!(quality.q.var, 0.0);
    assert_eq!(quality.q.dq, 0.0);

    // Only the incoming entry exists.
    assert!(read_quality(&layout, &format!("qo{hostkey}")).is_none());
}

#[test]
fn update_smooths_quality() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('2');

    lastseen::record(&layout, &hostkey, "10.0.0.2", Role::Incoming, 555).unwrap();
    lastseen::record(&layout, &hostkey, "10.0.0.2", Role::Incoming, 1110).unwrap();

    let quality = read_quality(&layout, &format!("qi{hostkey}")).unwrap();
    assert_eq!(quality.lastseen, 1110);
    assert_eq!(quality.q.q, 555.0);
    assert_eq!(quality.q.expect, 222.0);
    assert_eq!(quality.q.var, 123210.0);
    assert_eq!(quality.q.dq, 555.0);
}

#[test]
fn multi_address_single_key_stays_coherent() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('3');

    lastseen::record(&layout, &hostkey, "10.0.0.1", Role::Incoming, 100).unwrap();
    lastseen::record(&layout, &hostkey, "10.0.0.2", Role::Incoming, 200).unwrap();
    lastseen::record(&layout, &hostkey, "10.0.0.3", Role::Incoming, 300).unwrap();

    let db = store::open(&layout, DbId::Lastseen).unwrap();
    for address in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        assert_eq!(
            db.read_string(&format!("a{address}")).unwrap().as_deref(),
            Some(hostkey.as_str())
        );
    }
    // The forward entry records only the most recent address.
    assert_eq!(
        db.read_string(&format!("k{hostkey}")).unwrap().as_deref(),
        Some("10.0.0.3")
    );
    drop(db);

    assert!(lastseen::is_coherent(&layout));
}

#[test]
fn injected_inconsistency_is_detected() {
    let (_dir, layout) = temp_layout();
    let key1 = sha('1');
    let key2 = sha('2');

    // Bypass the API: aIP1 -> K1 with kK1 present, aIP2 -> K2 without kK2.
    let db = store::open(&layout, DbId::Lastseen).unwrap();
    db.write_string("a10.0.0.1", &key1).unwrap();
    db.write_string(&format!("k{key1}"), "10.0.0.1").unwrap();
    db.write_string("a10.0.0.2", &key2).unwrap();
    drop(db);

    assert!(!lastseen::is_coherent(&layout));
}

#[test]
fn delete_by_hostkey_removes_all_four_entries() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('4');

    lastseen::record(&layout, &hostkey, "10.0.4.1", Role::Incoming, 555).unwrap();
    lastseen::record(&layout, &hostkey, "10.0.4.1", Role::Outgoing, 556).unwrap();

    let removed = lastseen::delete_by_hostkey(&layout, &hostkey).unwrap();
    assert_eq!(removed.as_deref(), Some("10.0.4.1"));

    let db = store::open(&layout, DbId::Lastseen).unwrap();
    for key in [
        format!("k{hostkey}"),
        "a10.0.4.1".to_string(),
        format!("qi{hostkey}"),
        format!("qo{hostkey}"),
    ] {
        assert!(!db.has_key(&key).unwrap(), "{key} should be gone");
    }
}

#[test]
fn delete_by_address_is_idempotent() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('5');

    lastseen::record(&layout, &hostkey, "10.0.5.1", Role::Incoming, 555).unwrap();

    assert_eq!(
        lastseen::delete_by_address(&layout, "10.0.5.1")
            .unwrap()
            .as_deref(),
        Some(hostkey.as_str())
    );
    // Second delete finds nothing and changes nothing.
    assert_eq!(lastseen::delete_by_address(&layout, "10.0.5.1").unwrap(), None);
    assert_eq!(lastseen::hostkey_count(&layout).unwrap(), 0);
}

#[test]
fn delete_refuses_when_companion_is_missing() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('6');

    lastseen::record(&layout, &hostkey, "10.0.6.1", Role::Incoming, 600).unwrap();

    // Break the pair: remove the forward entry behind the API's back.
    let db = store::open(&layout, DbId::Lastseen).unwrap();
    assert!(db.delete(&format!("k{hostkey}")).unwrap());
    drop(db);

    assert_eq!(lastseen::delete_by_address(&layout, "10.0.6.1").unwrap(), None);

    // The reverse entry is still there; nothing was half-deleted.
    let db = store::open(&layout, DbId::Lastseen).unwrap();
    assert!(db.has_key("a10.0.6.1").unwrap());
    assert!(db.has_key(&format!("qi{hostkey}")).unwrap());
}

#[test]
fn resolve_missing_address_fails() {
    let (_dir, layout) = temp_layout();
    assert_eq!(
        lastseen::resolve_address_to_hostkey(&layout, None, "127.0.0.64"),
        None
    );
}

#[test]
fn resolve_returns_reverse_entry_despite_inconsistency() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('7');

    lastseen::record(&layout, &hostkey, "10.0.7.1", Role::Incoming, 700).unwrap();

    // Overwrite the reverse entry with a different key.
    let db = store::open(&layout, DbId::Lastseen).unwrap();
    db.write_string("a10.0.7.1", "SHA=98765").unwrap();
    drop(db);

    // Resolution returns the reverse entry and is not bothered by the
    // missing forward companion (a warning is logged).
    assert_eq!(
        lastseen::resolve_address_to_hostkey(&layout, None, "10.0.7.1").as_deref(),
        Some("SHA=98765")
    );

    let db = store::open(&layout, DbId::Lastseen).unwrap();
    assert!(db.has_key("a10.0.7.1").unwrap());
    assert!(db.has_key(&format!("k{hostkey}")).unwrap());
    assert!(!db.has_key("kSHA=98765").unwrap());
}

#[test]
fn resolve_loopback_uses_local_identity() {
    let (_dir, layout) = temp_layout();
    let node = LocalNode {
        fingerprint: sha('f'),
        addresses: vec!["192.168.1.10".to_string()],
    };

    assert_eq!(
        lastseen::resolve_address_to_hostkey(&layout, Some(&node), "127.0.0.1").as_deref(),
        Some(node.fingerprint.as_str())
    );
    assert_eq!(
        lastseen::resolve_address_to_hostkey(&layout, Some(&node), "192.168.1.10").as_deref(),
        Some(node.fingerprint.as_str())
    );
    // Without a local identity, loopback cannot be resolved.
    assert_eq!(
        lastseen::resolve_address_to_hostkey(&layout, None, "::1"),
        None
    );
}

#[test]
fn ipv4_mapped_addresses_collapse() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('8');

    lastseen::record(&layout, &hostkey, "::ffff:10.0.8.1", Role::Incoming, 800).unwrap();

    assert_eq!(
        lastseen::resolve_address_to_hostkey(&layout, None, "10.0.8.1").as_deref(),
        Some(hostkey.as_str())
    );
}

#[test]
fn scan_quality_visits_both_directions() {
    let (_dir, layout) = temp_layout();
    let hostkey = sha('9');

    lastseen::record(&layout, &hostkey, "10.0.9.1", Role::Incoming, 900).unwrap();
    lastseen::record(&layout, &hostkey, "10.0.9.1", Role::Outgoing, 901).unwrap();

    let mut seen = Vec::new();
    lastseen::scan_quality(&layout, |key, address, incoming, quality| {
        seen.push((key.to_string(), address.to_string(), incoming, quality.lastseen));
        true
    })
    .unwrap();

    assert_eq!(seen.len(), 2);
    assert!(seen.iter().any(|(_, _, incoming, t)| *incoming && *t == 900));
    assert!(seen.iter().any(|(_, _, incoming, t)| !*incoming && *t == 901));
    assert!(seen.iter().all(|(k, a, _, _)| k == &hostkey && a == "10.0.9.1"));
}

#[test]
fn purge_honours_the_coherence_requirement() {
    let (_dir, layout) = temp_layout();
    let key1 = sha('1');
    let key2 = sha('2');

    lastseen::record(&layout, &key1, "10.1.0.1", Role::Incoming, 100).unwrap();

    // Coherent database: purge by digest works and reports the address.
    let outcome = lastseen::purge(&layout, &key1, true);
    assert_eq!(outcome.code, 0);
    assert_eq!(outcome.equivalent.as_deref(), Some("10.1.0.1"));

    // Make it incoherent and require coherence: refusal.
    let db = store::open(&layout, DbId::Lastseen).unwrap();
    db.write_string("a10.1.0.2", &key2).unwrap();
    drop(db);

    let outcome = lastseen::purge(&layout, "10.1.0.2", true);
    assert_eq!(outcome.code, 254);

    // Without the requirement the purge is attempted; the dangling
    // reverse entry has no forward companion, so it fails.
    let outcome = lastseen::purge(&layout, "10.1.0.2", false);
    assert_eq!(outcome.code, 253);

    // Purging something that was never recorded fails with the digest code.
    let outcome = lastseen::purge(&layout, &sha('a'), false);
    assert_eq!(outcome.code, 252);
}

#[test]
fn hostkey_count_counts_forward_entries() {
    let (_dir, layout) = temp_layout();

    assert_eq!(lastseen::hostkey_count(&layout).unwrap(), 0);
    lastseen::record(&layout, &sha('a'), "10.2.0.1", Role::Incoming, 10).unwrap();
    lastseen::record(&layout, &sha('b'), "10.2.0.2", Role::Incoming, 20).unwrap();
    lastseen::record(&layout, &sha('b'), "10.2.0.3", Role::Incoming, 30).unwrap();

    assert_eq!(lastseen::hostkey_count(&layout).unwrap(), 2);
}
