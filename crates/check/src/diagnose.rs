//! Fork-isolated database health checks
//!
//! Runs a smoke dump (or the full validator) against each file, by
//! default in a forked child so that an engine crash on a corrupt
//! memory map takes down the child, not the agent: the child's death
//! signal is folded into the per-file status code. An optional write
//! probe inserts and removes one synthetic record to prove the store
//! accepts writes.
//!
//! Symlinked database files are followed one level; a dangling link is
//! healthy (`OK_DOES_NOT_EXIST`) because the agent will recreate the
//! store on next use.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::{error, info};

use fleetstate_core::{Error, Result};
use fleetstate_store::engine::{Engine, EngineOptions};

use crate::codes::CheckCode;
use crate::dump::{dump_file, DumpMode};
use crate::validate::validate_file;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnoseOptions {
    /// Run in the current process instead of forking (less safe)
    pub foreground: bool,
    /// Run the full validator instead of the smoke dump
    pub validate: bool,
    /// Additionally probe that the store accepts writes
    pub test_write: bool,
}

/// Diagnose each file, print one status line per file and a summary,
/// and return the list of corrupted files.
pub fn diagnose_files(filenames: &[PathBuf], options: DiagnoseOptions) -> Vec<PathBuf> {
    let mut corrupt = Vec::new();

    for filename in filenames {
        let (target, symlinked) = follow_symlink(filename);

        let code = if let Some(code) = missing_target_code(&target, symlinked) {
            code
        } else if options.foreground {
            run_in_process(&target, options)
        } else {
            fork_and_diagnose(&target, options)
        };

        if symlinked {
            println!(
                "Status of '{}' -> '{}': {}",
                filename.display(),
                target.display(),
                code.name()
            );
        } else {
            println!("Status of '{}': {}", target.display(), code.name());
        }

        if !code.is_healthy() {
            corrupt.push(target);
        }
    }

    if corrupt.is_empty() {
        println!("All {} databases healthy", filenames.len());
    } else {
        eprintln!(
            "Problems detected in {}/{} databases",
            corrupt.len(),
            filenames.len()
        );
    }
    corrupt
}

/// Resolve one level of symlink. Returns the path to diagnose and
/// whether it came from a link.
fn follow_symlink(path: &Path) -> (PathBuf, bool) {
    match fs::read_link(path) {
        Ok(target) => {
            let resolved = if target.is_absolute() {
                target
            } else {
                path.parent().unwrap_or(Path::new(".")).join(target)
            };
            (resolved, true)
        }
        Err(_) => (path.to_path_buf(), false),
    }
}

/// A dangling symlink target is healthy: the agent recreates missing
/// databases on demand. A missing plain file is left for the engine to
/// report.
fn missing_target_code(target: &Path, symlinked: bool) -> Option<CheckCode> {
    if symlinked && !target.exists() {
        Some(CheckCode::OkDoesNotExist)
    } else {
        None
    }
}

/// The actual check, run either in-process or inside the forked child.
/// The dump smoke test writes into a null sink; only the validator's
/// defect lines are meant for the user.
fn run_in_process(path: &Path, options: DiagnoseOptions) -> CheckCode {
    let code = if options.validate {
        match validate_file(path, &mut io::stdout()) {
            Ok(0) => CheckCode::Ok,
            Ok(_) => CheckCode::ValidateFailed,
            Err(err) => CheckCode::from_error(&err),
        }
    } else {
        match dump_file(path, DumpMode::Values, None, &mut io::sink()) {
            Ok(()) => CheckCode::Ok,
            Err(err) => CheckCode::from_error(&err),
        }
    };

    if code == CheckCode::Ok && options.test_write {
        return match write_probe(path) {
            Ok(()) => CheckCode::Ok,
            Err(err) => {
                error!("write probe on '{}' failed: {err}", path.display());
                CheckCode::from_error(&err)
            }
        };
    }
    code
}

#[cfg(unix)]
fn fork_and_diagnose(path: &Path, options: DiagnoseOptions) -> CheckCode {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    // SAFETY: the child only diagnoses and exits; it inherits no locks
    // we depend on afterwards.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = run_in_process(path, options);
            std::process::exit(code.exit_code());
        }
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, status)) => CheckCode::from_exit(status),
            Ok(WaitStatus::Signaled(_, signal, _)) => CheckCode::from_signal(signal),
            Ok(_) | Err(_) => CheckCode::PidError,
        },
        Err(err) => {
            error!("could not fork diagnosis child for '{}': {err}", path.display());
            CheckCode::PidError
        }
    }
}

#[cfg(not(unix))]
fn fork_and_diagnose(path: &Path, options: DiagnoseOptions) -> CheckCode {
    // No fork isolation on this platform.
    run_in_process(path, options)
}

/// Insert one synthetic record shaped like an existing one, commit,
/// reopen, remove it again. An empty store has nothing to mimic and is
/// skipped.
fn write_probe(path: &Path) -> Result<()> {
    info!("trying to write data into '{}'", path.display());

    let engine = Engine::open(path, &EngineOptions::default())?;
    let (template_key, template_value) = match engine.first_entry()? {
        Some(entry) => entry,
        None => {
            info!(
                "'{}' is empty, no data to use as a template, cannot test writing",
                path.display()
            );
            return Ok(());
        }
    };

    let mut rng = rand::thread_rng();
    let mut probe_key = vec![0u8; template_key.len()];
    let mut probe_value = vec![0u8; template_value.len()];
    rng.fill_bytes(&mut probe_key);
    rng.fill_bytes(&mut probe_value);

    engine.put_one(&probe_key, &probe_value)?;
    drop(engine);

    let engine = Engine::open(path, &EngineOptions::default())?;
    if !engine.del_one(&probe_key)? {
        return Err(Error::internal(format!(
            "probe record vanished from '{}' between commits",
            path.display()
        )));
    }
    Ok(())
}
