//! Lastseen registry
//!
//! Records, for every peer we talk to, when and how we last saw it, and
//! makes both directions of lookup fast:
//!
//! | Key shape | Value | Meaning |
//! |---|---|---|
//! | `k<hostkey>` | address | forward: key -> address |
//! | `a<address>` | hostkey | reverse: address -> key |
//! | `qi<hostkey>` | [`KeyHostSeen`] | incoming connection quality |
//! | `qo<hostkey>` | [`KeyHostSeen`] | outgoing connection quality |
//! | `version` | `"1"` | schema version |
//!
//! Coherence deliberately stops short of bijectivity: several addresses
//! may map to the same key (`a*` entries sharing a value), while the
//! forward `k*` entry records only the most recently seen address. What
//! must hold is that every value is anchored: `aKEYS` is a subset of
//! `kKEYS` and `kIPS` a subset of `aIPS`. Orphaned reverse entries are
//! tolerated; [`is_coherent`] checks exactly these rules and nothing
//! stricter.

use tracing::{debug, error, info, warn};

use fleetstate_core::cstr::{from_c_bytes, to_c_bytes};
use fleetstate_core::records::{KeyHostSeen, QPoint};
use fleetstate_core::{DbId, Result, StateLayout};
use fleetstate_store::registry;

/// Smoothing factor for the inter-arrival running average
const SMOOTHING: f64 = 0.4;

/// Which side initiated the connection being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Incoming,
    Outgoing,
}

impl Role {
    fn direction(self) -> char {
        match self {
            Role::Incoming => 'i',
            Role::Outgoing => 'o',
        }
    }
}

/// This host's own identity, used to short-circuit lookups of loopback
/// and self addresses to the local public-key fingerprint.
#[derive(Debug, Clone)]
pub struct LocalNode {
    /// `SHA=...` / `MD5=...` fingerprint of the local public key
    pub fingerprint: String,
    /// Addresses this host considers its own
    pub addresses: Vec<String>,
}

/// Outcome of a [`purge`] call, mirroring the tool exit-code contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// 0 on success, 254 when coherence was required but absent,
    /// 253/252 when the address/digest removal failed
    pub code: i32,
    /// The removed record's counterpart: the digest when an address was
    /// purged, the address when a digest was
    pub equivalent: Option<String>,
}

fn quality_key(role: Role, hostkey: &str) -> String {
    format!("q{}{}", role.direction(), hostkey)
}

fn hostkey_key(hostkey: &str) -> String {
    format!("k{hostkey}")
}

fn address_key(address: &str) -> String {
    format!("a{address}")
}

/// Strip the IPv4-mapped-IPv6 prefix so both notations of an address
/// land on the same reverse entry.
fn map_address(address: &str) -> &str {
    address.strip_prefix("::ffff:").unwrap_or(address)
}

/// Whether purge input names a key digest rather than an address
fn is_digest(input: &str) -> bool {
    input.starts_with("SHA=") || input.starts_with("MD5=")
}

/// Record that a peer was seen at `now`.
///
/// Updates the quality entry for the connection direction with an
/// exponentially-weighted average of the inter-arrival time, and both
/// direction mappings. All three writes share a single transaction, so
/// partial observability is impossible.
pub fn record(
    layout: &StateLayout,
    hostkey: &str,
    address: &str,
    role: Role,
    now: i64,
) -> Result<()> {
    if address.is_empty() {
        info!("lastseen record for empty address, hostkey {hostkey}, ignored");
        return Ok(());
    }
    let address = map_address(address);

    let db = registry::open(layout, DbId::Lastseen)?;
    let engine = db.engine();

    let mut wtxn = engine.write_txn()?;

    let q_key = to_c_bytes(&quality_key(role, hostkey));
    let previous = engine
        .get(&wtxn, &q_key)?
        .and_then(KeyHostSeen::from_bytes);

    let updated = match previous {
        Some(old) => KeyHostSeen {
            lastseen: now,
            q: old.q.average((now - old.lastseen) as f64, SMOOTHING),
        },
        None => KeyHostSeen {
            lastseen: now,
            q: QPoint::definite(0.0),
        },
    };
    engine.put(&mut wtxn, &q_key, &updated.to_bytes())?;

    engine.put(
        &mut wtxn,
        &to_c_bytes(&hostkey_key(hostkey)),
        &to_c_bytes(address),
    )?;
    engine.put(
        &mut wtxn,
        &to_c_bytes(&address_key(address)),
        &to_c_bytes(hostkey),
    )?;

    engine.commit(wtxn)
}

/// Resolve an address to the hostkey we last saw it use.
///
/// Loopback and the local node's own addresses short-circuit to the
/// local fingerprint. A missing forward entry for a resolved key is
/// logged as an inconsistency but does not fail the lookup.
pub fn resolve_address_to_hostkey(
    layout: &StateLayout,
    local: Option<&LocalNode>,
    address: &str,
) -> Option<String> {
    let address = map_address(address);

    let is_self = address == "127.0.0.1"
        || address == "::1"
        || local
            .map(|node| node.addresses.iter().any(|a| map_address(a) == address))
            .unwrap_or(false);
    if is_self {
        debug!("returning local key for address {address}");
        return match local {
            Some(node) => Some(node.fingerprint.clone()),
            None => {
                debug!("local key not known, cannot resolve {address}");
                None
            }
        };
    }

    let db = match registry::open(layout, DbId::Lastseen) {
        Ok(db) => db,
        Err(err) => {
            error!("unable to open lastseen database: {err}");
            return None;
        }
    };

    let hostkey = match db.read_string(&address_key(address)) {
        Ok(Some(hostkey)) => hostkey,
        Ok(None) => {
            debug!("key digest for address '{address}' not found in lastseen database");
            return None;
        }
        Err(err) => {
            error!("lastseen lookup for '{address}' failed: {err}");
            return None;
        }
    };

    // The reverse entry was found; report the forward inconsistency but
    // keep the success.
    match db.has_key(&hostkey_key(&hostkey)) {
        Ok(true) => {}
        Ok(false) => warn!(
            "lastseen db inconsistency: no key entry 'k{hostkey}' for existing \
             host entry 'a{address}'"
        ),
        Err(err) => warn!("lastseen consistency probe for '{hostkey}' failed: {err}"),
    }

    Some(hostkey)
}

/// Remove all four entries recorded for the peer behind `address`.
///
/// Returns the removed hostkey. When the reverse entry is missing, or
/// its forward companion is (which would make a blind delete deepen the
/// incoherence), nothing is removed and `None` is returned.
pub fn delete_by_address(layout: &StateLayout, address: &str) -> Result<Option<String>> {
    let address = map_address(address);
    let db = registry::open(layout, DbId::Lastseen)?;

    let hostkey = match db.read_string(&address_key(address))? {
        Some(hostkey) => hostkey,
        None => return Ok(None),
    };
    if !db.has_key(&hostkey_key(&hostkey))? {
        return Ok(None);
    }

    let engine = db.engine();
    let mut wtxn = engine.write_txn()?;
    engine.del(&mut wtxn, &to_c_bytes(&hostkey_key(&hostkey)))?;
    engine.del(&mut wtxn, &to_c_bytes(&address_key(address)))?;
    engine.del(&mut wtxn, &to_c_bytes(&quality_key(Role::Incoming, &hostkey)))?;
    engine.del(&mut wtxn, &to_c_bytes(&quality_key(Role::Outgoing, &hostkey)))?;
    engine.commit(wtxn)?;

    Ok(Some(hostkey))
}

/// Remove all four entries recorded for the peer with key `hostkey`.
///
/// Returns the removed address; the same companion rule as
/// [`delete_by_address`] applies.
pub fn delete_by_hostkey(layout: &StateLayout, hostkey: &str) -> Result<Option<String>> {
    let db = registry::open(layout, DbId::Lastseen)?;

    let address = match db.read_string(&hostkey_key(hostkey))? {
        Some(address) => address,
        None => return Ok(None),
    };
    if !db.has_key(&address_key(&address))? {
        return Ok(None);
    }

    let engine = db.engine();
    let mut wtxn = engine.write_txn()?;
    engine.del(&mut wtxn, &to_c_bytes(&address_key(&address)))?;
    engine.del(&mut wtxn, &to_c_bytes(&hostkey_key(hostkey)))?;
    engine.del(&mut wtxn, &to_c_bytes(&quality_key(Role::Incoming, hostkey)))?;
    engine.del(&mut wtxn, &to_c_bytes(&quality_key(Role::Outgoing, hostkey)))?;
    engine.commit(wtxn)?;

    Ok(Some(address))
}

/// Call `callback(hostkey, address, is_incoming, quality)` for every
/// quality entry whose host has a forward mapping. Returning `false`
/// stops the scan.
pub fn scan_quality(
    layout: &StateLayout,
    mut callback: impl FnMut(&str, &str, bool, &KeyHostSeen) -> bool,
) -> Result<()> {
    let db = registry::open(layout, DbId::Lastseen)?;
    let snapshot = db.load_to_map()?;

    let mut hostkeys = Vec::new();
    for key in snapshot.keys() {
        if let Some(key) = from_c_bytes(key) {
            if let Some(hostkey) = key.strip_prefix('k') {
                hostkeys.push(hostkey.to_string());
            }
        }
    }

    'hosts: for hostkey in &hostkeys {
        let address = match snapshot
            .get(&to_c_bytes(&hostkey_key(hostkey)))
            .and_then(|v| from_c_bytes(v))
        {
            Some(address) => address,
            None => {
                error!("failed to read address for key '{hostkey}'");
                continue;
            }
        };

        for role in [Role::Incoming, Role::Outgoing] {
            let quality = snapshot
                .get(&to_c_bytes(&quality_key(role, hostkey)))
                .and_then(|v| KeyHostSeen::from_bytes(v));
            if let Some(quality) = quality {
                if !callback(hostkey, address, role == Role::Incoming, &quality) {
                    break 'hosts;
                }
            }
        }
    }
    Ok(())
}

/// Number of `k*` forward entries
pub fn hostkey_count(layout: &StateLayout) -> Result<usize> {
    let db = registry::open(layout, DbId::Lastseen)?;
    let mut count = 0;
    db.engine().scan(|key, value| {
        if key.first() == Some(&b'k') && !value.is_empty() {
            count += 1;
        }
        Ok(())
    })?;
    Ok(count)
}

/// Check the coherence rules over one snapshot of the database.
///
/// Every divergence is logged at warning level; `true` only when none
/// was found. Open or scan failures also count as incoherent.
pub fn is_coherent(layout: &StateLayout) -> bool {
    let db = match registry::open(layout, DbId::Lastseen) {
        Ok(db) => db,
        Err(err) => {
            error!("unable to open lastseen database: {err}");
            return false;
        }
    };

    let mut a_ips: Vec<String> = Vec::new();
    let mut a_keys: Vec<String> = Vec::new();
    let mut k_keys: Vec<String> = Vec::new();
    let mut k_ips: Vec<String> = Vec::new();

    let mut coherent = true;
    let scanned = db.engine().scan(|key, value| {
        let key = match from_c_bytes(key) {
            Some(key) => key,
            None => {
                warn!("lastseen db inconsistency, unreadable key {key:?}");
                coherent = false;
                return Ok(());
            }
        };

        let expected = key == "version"
            || key.starts_with("qi")
            || key.starts_with("qo")
            || key.starts_with('k')
            || key.starts_with('a');
        if !expected {
            warn!("lastseen db inconsistency, unexpected key: {key}");
            coherent = false;
        }

        if (key.starts_with("kSHA=") || key.starts_with("kMD5=")) && !value.is_empty() {
            push_unique(&mut k_keys, &key[1..]);
            if let Some(ip) = from_c_bytes(value) {
                push_unique(&mut k_ips, ip);
            }
        }
        if let Some(ip) = key.strip_prefix('a') {
            push_unique(&mut a_ips, ip);
            if let Some(hostkey) = from_c_bytes(value) {
                push_unique(&mut a_keys, hostkey);
            }
        }
        Ok(())
    });
    if let Err(err) = scanned {
        error!("unable to scan lastseen database: {err}");
        return false;
    }

    // Every kKEY -> IP value must exist as an aIP entry.
    for ip in &k_ips {
        if !a_ips.contains(ip) {
            warn!(
                "lastseen db inconsistency, found kKEY -> '{ip}' entry, \
                 but no 'a{ip}' -> any key entry exists!"
            );
            coherent = false;
        }
    }
    // Every aIP -> KEY value must exist as a kKEY entry.
    for hostkey in &a_keys {
        if !k_keys.contains(hostkey) {
            warn!(
                "lastseen db inconsistency, found aIP -> '{hostkey}' entry, \
                 but no 'k{hostkey}' -> any ip entry exists!"
            );
            coherent = false;
        }
    }

    coherent
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

/// Remove the record named by `input` (a `SHA=`/`MD5=` digest or an
/// address) from the registry.
///
/// When `require_coherent` is set, refuses to act on an incoherent
/// database.
pub fn purge(layout: &StateLayout, input: &str, require_coherent: bool) -> PurgeOutcome {
    if require_coherent && !is_coherent(layout) {
        error!(
            "lastseen database is incoherent and coherence is enforced; \
             will not remove entries from it"
        );
        return PurgeOutcome {
            code: 254,
            equivalent: None,
        };
    }

    if is_digest(input) {
        info!("removing digest '{input}' from lastseen database");
        match delete_by_hostkey(layout, input) {
            Ok(Some(address)) => PurgeOutcome {
                code: 0,
                equivalent: Some(address),
            },
            Ok(None) => {
                error!("unable to remove digest from lastseen database");
                PurgeOutcome {
                    code: 252,
                    equivalent: None,
                }
            }
            Err(err) => {
                error!("unable to remove digest from lastseen database: {err}");
                PurgeOutcome {
                    code: 252,
                    equivalent: None,
                }
            }
        }
    } else {
        info!("removing host '{input}' from lastseen database");
        match delete_by_address(layout, input) {
            Ok(Some(hostkey)) => PurgeOutcome {
                code: 0,
                equivalent: Some(hostkey),
            },
            Ok(None) => {
                error!("unable to remove host from lastseen database");
                PurgeOutcome {
                    code: 253,
                    equivalent: None,
                }
            }
            Err(err) => {
                error!("unable to remove host from lastseen database: {err}");
                PurgeOutcome {
                    code: 253,
                    equivalent: None,
                }
            }
        }
    }
}
