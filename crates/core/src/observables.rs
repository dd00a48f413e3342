//! Observable name table for the monitoring databases
//!
//! The observations and history stores index their [`crate::QPoint`]
//! arrays by observable slot. Slot names come from a `ts_key` file (one
//! name per line, one line per slot) when present; otherwise the built-in
//! table below is used. Unassigned slots are called `spare`.

use std::fs;
use std::path::Path;

use tracing::debug;

/// Fixed number of observable channels
pub const OBSERVABLES: usize = 100;

/// Built-in names for the well-known slots; everything beyond is `spare`.
const BUILTIN_NAMES: &[&str] = &[
    "users",
    "rootprocs",
    "otherprocs",
    "diskfree",
    "loadavg",
    "netbiosns_in",
    "netbiosns_out",
    "netbiosdgm_in",
    "netbiosdgm_out",
    "netbiosssn_in",
    "netbiosssn_out",
    "imap_in",
    "imap_out",
    "fleet_in",
    "fleet_out",
    "nfsd_in",
    "nfsd_out",
    "smtp_in",
    "smtp_out",
    "www_in",
    "www_out",
    "ftp_in",
    "ftp_out",
    "ssh_in",
    "ssh_out",
    "wwws_in",
    "wwws_out",
    "icmp_in",
    "icmp_out",
    "udp_in",
    "udp_out",
    "dns_in",
    "dns_out",
    "tcpsyn_in",
    "tcpsyn_out",
    "tcpack_in",
    "tcpack_out",
    "tcpfin_in",
    "tcpfin_out",
    "tcpmisc_in",
    "tcpmisc_out",
    "webaccess",
    "weberrors",
    "syslog",
    "messages",
    "temp0",
    "temp1",
    "temp2",
    "temp3",
    "cpuall",
    "cpu0",
    "cpu1",
    "cpu2",
    "cpu3",
];

/// Load the observable name table.
///
/// Reads one name per line from `tskey_file` when given and readable;
/// falls back to the built-in table otherwise. The result always has
/// exactly [`OBSERVABLES`] entries.
pub fn names(tskey_file: Option<&Path>) -> Vec<String> {
    if let Some(path) = tskey_file {
        match fs::read_to_string(path) {
            Ok(content) => {
                let mut names: Vec<String> = content
                    .lines()
                    .map(|line| line.trim().to_string())
                    .take(OBSERVABLES)
                    .collect();
                pad_spare(&mut names);
                return names;
            }
            Err(err) => {
                debug!(
                    "could not read observable names from '{}', using built-in list ({err})",
                    path.display()
                );
            }
        }
    }

    let mut names: Vec<String> = BUILTIN_NAMES.iter().map(|s| s.to_string()).collect();
    pad_spare(&mut names);
    names
}

fn pad_spare(names: &mut Vec<String>) {
    while names.len() < OBSERVABLES {
        names.push("spare".to_string());
    }
}
