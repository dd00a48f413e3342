//! Per-store invariant checkers
//!
//! Walks every record of a database, accumulating state, then checks
//! structural and cross-entry consistency. The validator never mutates
//! the store; it reports each defect as one `Error in <path>: ...` line
//! and returns the defect count (zero means healthy).
//!
//! Modes, selected by filename:
//! - `Lastseen`: full per-entry and cross-entry lastseen checks
//! - `Minimal`: only verify each record can be read (stores with
//!   non-string keys)
//! - `Unknown`: keys must be non-empty NUL-terminated strings and
//!   values non-empty; no schema beyond that

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use fleetstate_core::cstr::from_c_bytes;
use fleetstate_core::records::KeyHostSeen;
use fleetstate_core::{Error, Result};
use fleetstate_store::engine::{Engine, EngineOptions};

/// Timestamps before 1993-01-01 are assumed corrupt
pub const BIRTH: i64 = 725_846_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValidatorMode {
    Minimal,
    Lastseen,
    Unknown,
}

fn mode_for(path: &Path) -> ValidatorMode {
    let name = path.to_string_lossy();
    if name.ends_with("cf_lastseen.lmdb") {
        ValidatorMode::Lastseen
    } else if name.ends_with("cf_changes.lmdb") {
        ValidatorMode::Minimal
    } else {
        ValidatorMode::Unknown
    }
}

#[derive(Default)]
struct LastseenState {
    hostkey_to_address: HashMap<String, String>,
    address_to_hostkey: HashMap<String, String>,
    quality_incoming_hostkeys: HashSet<String>,
    quality_outgoing_hostkeys: HashSet<String>,
}

struct Validator<'o> {
    path: String,
    mode: ValidatorMode,
    errors: usize,
    now: i64,
    keys: HashSet<Vec<u8>>,
    lastseen: LastseenState,
    out: &'o mut dyn Write,
}

impl<'o> Validator<'o> {
    fn new(path: &Path, out: &'o mut dyn Write) -> Validator<'o> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Validator {
            path: path.display().to_string(),
            mode: mode_for(path),
            errors: 0,
            now,
            keys: HashSet::new(),
            lastseen: LastseenState::default(),
            out,
        }
    }

    fn report(&mut self, message: impl AsRef<str>) {
        let _ = writeln!(self.out, "Error in {}: {}", self.path, message.as_ref());
        self.errors += 1;
    }

    /// A value that should be a non-empty NUL-terminated string
    fn check_string<'a>(&mut self, bytes: &'a [u8]) -> Option<&'a str> {
        match from_c_bytes(bytes) {
            Some("") => {
                self.report("Invalid string - empty");
                None
            }
            Some(s) => Some(s),
            None => {
                self.report(format!(
                    "Invalid string - '{}'",
                    String::from_utf8_lossy(bytes)
                ));
                None
            }
        }
    }

    fn check_hostkey(&mut self, hostkey: &str) -> bool {
        if hostkey.is_empty() {
            self.report(format!("Empty hostkey - '{hostkey}'"));
            return false;
        }
        let hex_tail = |prefix: &str, len: usize| {
            hostkey
                .strip_prefix(prefix)
                .map(|tail| tail.len() == len && tail.bytes().all(|b| b.is_ascii_hexdigit()))
        };
        match hex_tail("SHA=", 64).or_else(|| hex_tail("MD5=", 32)) {
            Some(true) => true,
            Some(false) => {
                self.report(format!("Bad length for hostkey - '{hostkey}'"));
                false
            }
            None => {
                self.report(format!("Unknown format of hostkey - '{hostkey}'"));
                false
            }
        }
    }

    fn check_address(&mut self, address: &str) -> bool {
        if address.is_empty() {
            self.report(format!("Empty IP address - '{address}'"));
            return false;
        }
        true
    }

    fn update(&mut self, key: &[u8], value: &[u8]) {
        if self.mode == ValidatorMode::Minimal {
            // Stores with non-string keys: just make sure the data can
            // be read out of the mapped pages.
            let _key_copy = key.to_vec();
            let _value_copy = value.to_vec();
            return;
        }

        if key.is_empty() {
            self.report("0 size key");
            return;
        }
        let key_string = match self.check_string(key) {
            Some(s) => s.to_string(),
            None => return,
        };
        if value.is_empty() {
            self.report("0 size value");
            return;
        }

        if !self.keys.insert(key.to_vec()) {
            self.report(format!("Duplicate key - '{key_string}'"));
            return;
        }

        if self.mode == ValidatorMode::Lastseen {
            self.update_lastseen(&key_string, value);
        }
    }

    fn update_lastseen(&mut self, key_string: &str, value: &[u8]) {
        if let Some(hostkey) = key_string.strip_prefix('k') {
            if let Some(address) = self.check_string(value) {
                let address = address.to_string();
                self.lastseen
                    .hostkey_to_address
                    .insert(hostkey.to_string(), address);
            }
        } else if let Some(address) = key_string.strip_prefix('a') {
            if let Some(hostkey) = self.check_string(value) {
                let hostkey = hostkey.to_string();
                self.lastseen
                    .address_to_hostkey
                    .insert(address.to_string(), hostkey);
            }
        } else if let Some(hostkey) = key_string.strip_prefix("qo") {
            self.lastseen
                .quality_outgoing_hostkeys
                .insert(hostkey.to_string());
        } else if let Some(hostkey) = key_string.strip_prefix("qi") {
            self.lastseen
                .quality_incoming_hostkeys
                .insert(hostkey.to_string());
        }

        if key_string.starts_with('q') {
            if !(key_string.starts_with("qi") || key_string.starts_with("qo")) {
                self.report(format!("Unexpected quality-entry key: {key_string}"));
                return;
            }
            let seen = match KeyHostSeen::from_bytes(value) {
                Some(seen) => seen,
                None => {
                    self.report(format!(
                        "Wrong size for quality entry '{key_string}' ({} bytes)",
                        value.len()
                    ));
                    return;
                }
            };
            if self.now < BIRTH {
                self.report(format!("Current time ({}) is before 1993-01-01", self.now));
            } else if seen.lastseen < BIRTH {
                self.report(format!(
                    "Last seen time ({}) is before 1993-01-01 ({key_string})",
                    seen.lastseen
                ));
            } else if seen.lastseen > self.now {
                self.report(format!(
                    "Future timestamp in last seen database: {} > {} ({key_string})",
                    seen.lastseen, self.now
                ));
            }
        }
    }

    /// Cross-entry checks, run after the whole store has been scanned
    fn finalize(&mut self) {
        if self.mode != ValidatorMode::Lastseen {
            return;
        }

        let forward: Vec<(String, String)> = self
            .lastseen
            .hostkey_to_address
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (hostkey, address) in forward {
            if !self.check_hostkey(&hostkey) || !self.check_address(&address) {
                continue;
            }
            match self.lastseen.address_to_hostkey.get(&address).cloned() {
                None => self.report(format!("Missing address entry for '{address}'")),
                Some(reverse) if reverse != hostkey => self.report(format!(
                    "Bad hostkey->address->hostkey reverse lookup '{hostkey}' != '{reverse}'"
                )),
                Some(_) => {}
            }
        }

        let reverse: Vec<(String, String)> = self
            .lastseen
            .address_to_hostkey
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (address, hostkey) in reverse {
            if !self.check_address(&address) || !self.check_hostkey(&hostkey) {
                continue;
            }
            match self.lastseen.hostkey_to_address.get(&hostkey).cloned() {
                None => self.report(format!("Missing hostkey entry for '{hostkey}'")),
                Some(forward) if forward != address => self.report(format!(
                    "Bad address->hostkey->address reverse lookup '{address}' != '{forward}'"
                )),
                Some(_) => {}
            }
        }

        let incoming: Vec<String> = self
            .lastseen
            .quality_incoming_hostkeys
            .iter()
            .cloned()
            .collect();
        for hostkey in incoming {
            if !self.lastseen.hostkey_to_address.contains_key(&hostkey) {
                self.report(format!("Missing hostkey from quality-in entry '{hostkey}'"));
            }
        }
        let outgoing: Vec<String> = self
            .lastseen
            .quality_outgoing_hostkeys
            .iter()
            .cloned()
            .collect();
        for hostkey in outgoing {
            if !self.lastseen.hostkey_to_address.contains_key(&hostkey) {
                self.report(format!("Missing hostkey from quality-out entry '{hostkey}'"));
            }
        }
    }
}

/// Validate one database file, writing one line per defect to `out`.
///
/// Returns the number of defects; engine-level failures (unreadable or
/// corrupt file) are returned as errors instead.
pub fn validate_file(path: &Path, out: &mut dyn Write) -> Result<usize> {
    let options = EngineOptions {
        read_only: true,
        ..Default::default()
    };
    let engine = Engine::open(path, &options)?;

    let mut validator = Validator::new(path, out);
    engine.scan(|key, value| {
        validator.update(key, value);
        Ok(())
    })?;
    validator.finalize();

    Ok(validator.errors)
}

/// Like [`validate_file`], but folds a non-zero defect count into
/// [`Error::ValidateFailed`].
pub fn validate_file_strict(path: &Path, out: &mut dyn Write) -> Result<()> {
    match validate_file(path, out)? {
        0 => Ok(()),
        errors => Err(Error::ValidateFailed { errors }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetstate_core::cstr::to_c_bytes;
    use fleetstate_core::records::QPoint;

    fn lastseen_engine(dir: &tempfile::TempDir) -> Engine {
        let path = dir.path().join("cf_lastseen.lmdb");
        Engine::open(&path, &EngineOptions::default()).unwrap()
    }

    fn validate(dir: &tempfile::TempDir, name: &str) -> (usize, String) {
        let mut out = Vec::new();
        let errors = validate_file(&dir.path().join(name), &mut out).unwrap();
        (errors, String::from_utf8(out).unwrap())
    }

    fn seen(lastseen: i64) -> Vec<u8> {
        KeyHostSeen {
            lastseen,
            q: QPoint::definite(0.0),
        }
        .to_bytes()
        .to_vec()
    }

    fn sha_key(fill: char) -> String {
        format!("SHA={}", fill.to_string().repeat(64))
    }

    #[test]
    fn healthy_lastseen_store_passes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = lastseen_engine(&dir);
        let hostkey = sha_key('a');

        engine.put_one(b"version\0", b"1\0").unwrap();
        engine
            .put_one(&to_c_bytes(&format!("k{hostkey}")), &to_c_bytes("10.0.0.1"))
            .unwrap();
        engine
            .put_one(&to_c_bytes("a10.0.0.1"), &to_c_bytes(&hostkey))
            .unwrap();
        engine
            .put_one(&to_c_bytes(&format!("qi{hostkey}")), &seen(BIRTH + 1000))
            .unwrap();
        drop(engine);

        let (errors, output) = validate(&dir, "cf_lastseen.lmdb");
        assert_eq!(errors, 0, "unexpected output: {output}");
    }

    #[test]
    fn dangling_reverse_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = lastseen_engine(&dir);
        let hostkey = sha_key('b');

        engine
            .put_one(&to_c_bytes("a10.0.0.2"), &to_c_bytes(&hostkey))
            .unwrap();
        drop(engine);

        let (errors, output) = validate(&dir, "cf_lastseen.lmdb");
        assert_eq!(errors, 1);
        assert!(output.contains("Missing hostkey entry"));
        assert!(output.contains("cf_lastseen.lmdb"));
    }

    #[test]
    fn broken_round_trip_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = lastseen_engine(&dir);
        let key_a = sha_key('a');
        let key_b = sha_key('b');

        // kA -> IP, but aIP -> B.
        engine
            .put_one(&to_c_bytes(&format!("k{key_a}")), &to_c_bytes("10.0.0.3"))
            .unwrap();
        engine
            .put_one(&to_c_bytes("a10.0.0.3"), &to_c_bytes(&key_b))
            .unwrap();
        engine
            .put_one(&to_c_bytes(&format!("k{key_b}")), &to_c_bytes("10.0.0.3"))
            .unwrap();
        drop(engine);

        let (_, output) = validate(&dir, "cf_lastseen.lmdb");
        assert!(output.contains("Bad hostkey->address->hostkey reverse lookup"));
    }

    #[test]
    fn quality_without_forward_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = lastseen_engine(&dir);
        let hostkey = sha_key('c');
        engine
            .put_one(&to_c_bytes(&format!("qo{hostkey}")), &seen(BIRTH + 5))
            .unwrap();
        drop(engine);

        let (errors, output) = validate(&dir, "cf_lastseen.lmdb");
        assert_eq!(errors, 1);
        assert!(output.contains("Missing hostkey from quality-out entry"));
    }

    #[test]
    fn timestamps_outside_bounds_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = lastseen_engine(&dir);
        let hostkey = sha_key('d');

        engine
            .put_one(&to_c_bytes(&format!("k{hostkey}")), &to_c_bytes("10.0.0.4"))
            .unwrap();
        engine
            .put_one(&to_c_bytes("a10.0.0.4"), &to_c_bytes(&hostkey))
            .unwrap();
        // One prehistoric, one from the future.
        engine
            .put_one(&to_c_bytes(&format!("qi{hostkey}")), &seen(100))
            .unwrap();
        engine
            .put_one(&to_c_bytes(&format!("qo{hostkey}")), &seen(i64::MAX / 2))
            .unwrap();
        drop(engine);

        let (errors, output) = validate(&dir, "cf_lastseen.lmdb");
        assert_eq!(errors, 2);
        assert!(output.contains("before 1993-01-01"));
        assert!(output.contains("Future timestamp"));
    }

    #[test]
    fn malformed_hostkey_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = lastseen_engine(&dir);

        engine
            .put_one(&to_c_bytes("kSHA=tooshort"), &to_c_bytes("10.0.0.5"))
            .unwrap();
        engine
            .put_one(&to_c_bytes("a10.0.0.5"), &to_c_bytes("SHA=tooshort"))
            .unwrap();
        drop(engine);

        let (errors, output) = validate(&dir, "cf_lastseen.lmdb");
        assert!(errors >= 2);
        assert!(output.contains("Bad length for hostkey"));
    }

    #[test]
    fn unknown_mode_checks_string_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf_classes.lmdb");
        let engine = Engine::open(&path, &EngineOptions::default()).unwrap();
        engine.put_one(&to_c_bytes("good"), &to_c_bytes("1")).unwrap();
        engine.put_one(b"unterminated", b"x\0").unwrap();
        drop(engine);

        let (errors, output) = validate(&dir, "cf_classes.lmdb");
        assert_eq!(errors, 1);
        assert!(output.contains("Invalid string"));
    }

    #[test]
    fn minimal_mode_accepts_binary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cf_changes.lmdb");
        let engine = Engine::open(&path, &EngineOptions::default()).unwrap();
        engine
            .put_one(&42i32.to_ne_bytes(), b"arbitrary binary")
            .unwrap();
        drop(engine);

        let (errors, _) = validate(&dir, "cf_changes.lmdb");
        assert_eq!(errors, 0);
    }

    #[test]
    fn strict_wrapper_maps_defects_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = lastseen_engine(&dir);
        engine
            .put_one(&to_c_bytes("a10.0.0.9"), &to_c_bytes(&sha_key('e')))
            .unwrap();
        drop(engine);

        let mut out = Vec::new();
        let err = validate_file_strict(&dir.path().join("cf_lastseen.lmdb"), &mut out).unwrap_err();
        assert!(matches!(err, Error::ValidateFailed { errors: 1 }));
    }
}
