//! fleetstate — diagnose and dump the agent state databases.
//!
//! Exit codes: 0 on success, 1 on usage errors, 2 for unrecognised
//! options; `diagnose` otherwise exits with the number of unhealthy
//! stores, `dump` with the first engine error's status code.

mod commands;

use std::io;
use std::path::PathBuf;
use std::process;

use clap::error::ErrorKind;
use clap::ArgMatches;
use tracing_subscriber::EnvFilter;

use fleetstate_check::{
    default_db_files, diagnose_files, dump_files, CheckCode, DiagnoseOptions, DumpMode,
};
use fleetstate_core::StateLayout;

use commands::build_cli;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let matches = match build_cli().try_get_matches() {
        Ok(matches) => matches,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = err.print();
                process::exit(0);
            }
            ErrorKind::UnknownArgument | ErrorKind::InvalidSubcommand => {
                let _ = err.print();
                process::exit(2);
            }
            _ => {
                let _ = err.print();
                process::exit(1);
            }
        },
    };

    let layout = layout_from(&matches);

    let code = match matches.subcommand() {
        Some(("diagnose", sub)) => run_diagnose(&layout, sub),
        Some(("dump", sub)) => run_dump(&layout, sub),
        _ => 1,
    };
    process::exit(code);
}

fn layout_from(matches: &ArgMatches) -> StateLayout {
    let work_dir = matches
        .get_one::<String>("work-dir")
        .cloned()
        .or_else(|| std::env::var("FLEETSTATE_WORK_DIR").ok())
        .unwrap_or_else(|| "/var/fleetstate".to_string());
    let state_dir = matches
        .get_one::<String>("state-dir")
        .cloned()
        .or_else(|| std::env::var("FLEETSTATE_STATE_DIR").ok());

    match state_dir {
        Some(state_dir) => StateLayout::new(state_dir, work_dir),
        None => StateLayout::under_workdir(work_dir),
    }
}

fn file_args(layout: &StateLayout, matches: &ArgMatches) -> Vec<PathBuf> {
    let named: Vec<PathBuf> = matches
        .get_many::<String>("files")
        .map(|files| files.map(PathBuf::from).collect())
        .unwrap_or_default();
    if named.is_empty() {
        default_db_files(layout)
    } else {
        named
    }
}

fn run_diagnose(layout: &StateLayout, matches: &ArgMatches) -> i32 {
    let files = file_args(layout, matches);
    if files.is_empty() {
        eprintln!("No database files to diagnose");
        return 1;
    }

    let options = DiagnoseOptions {
        foreground: matches.get_flag("no-fork"),
        validate: matches.get_flag("validate"),
        test_write: matches.get_flag("test-write"),
    };

    let corrupt = diagnose_files(&files, options);
    corrupt.len().min(255) as i32
}

fn run_dump(layout: &StateLayout, matches: &ArgMatches) -> i32 {
    let files = file_args(layout, matches);
    if files.is_empty() {
        eprintln!("No database files to dump");
        return 1;
    }

    let mode = if matches.get_flag("keys") {
        DumpMode::Keys
    } else if matches.get_flag("values") {
        DumpMode::Values
    } else if matches.get_flag("simple") {
        DumpMode::Simple
    } else if matches.get_flag("portable") {
        DumpMode::Portable
    } else {
        DumpMode::Nice
    };

    // Fall back to the state directory's ts_key file when present.
    let tskey = matches
        .get_one::<String>("tskey")
        .map(PathBuf::from)
        .or_else(|| {
            let default = layout.tskey_path();
            default.exists().then_some(default)
        });

    let template = match matches.get_one::<String>("template") {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(template) => Some(template),
            Err(err) => {
                eprintln!("Cannot read template '{path}': {err}");
                return 1;
            }
        },
        None => None,
    };

    match dump_files(
        &files,
        mode,
        tskey.as_deref(),
        template.as_deref(),
        &mut io::stdout(),
    ) {
        Ok(()) => 0,
        Err(err) => CheckCode::from_error(&err).exit_code().min(255),
    }
}
