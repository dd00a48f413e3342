//! Clap command tree definition.

use clap::{Arg, ArgGroup, Command};

/// Build the complete CLI command tree.
pub fn build_cli() -> Command {
    Command::new("fleetstate")
        .about("Inspect, validate and repair the agent state databases")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .help("State directory holding the databases (default: $FLEETSTATE_STATE_DIR)")
                .global(true),
        )
        .arg(
            Arg::new("work-dir")
                .long("work-dir")
                .help("Work directory checked for pre-migration databases")
                .global(true),
        )
        .subcommand(build_diagnose())
        .subcommand(build_dump())
}

fn build_diagnose() -> Command {
    Command::new("diagnose")
        .about("Check database files for corruption")
        .arg(
            Arg::new("no-fork")
                .long("no-fork")
                .short('F')
                .help("Run checks in this process instead of a forked child")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("validate")
                .long("validate")
                .short('v')
                .help("Run the full schema validator instead of the smoke dump")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-write")
                .long("test-write")
                .short('w')
                .help("Also probe that each store accepts writes")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("files")
                .help("Database files to diagnose (default: all databases in the state directory)")
                .num_args(0..),
        )
}

fn build_dump() -> Command {
    Command::new("dump")
        .about("Dump database contents as JSON")
        .arg(
            Arg::new("keys")
                .long("keys")
                .short('k')
                .help("Print only keys")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("values")
                .long("values")
                .short('v')
                .help("Print only values")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("nice")
                .long("nice")
                .short('n')
                .help("Print strings in a nice way and decode known structs")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("simple")
                .long("simple")
                .short('s')
                .help("Print everything as simple escaped binary data")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("portable")
                .long("portable")
                .short('p')
                .help("Print unambiguously with structs and raw strings")
                .action(clap::ArgAction::SetTrue),
        )
        .group(
            ArgGroup::new("mode")
                .args(["keys", "values", "nice", "simple", "portable"])
                .multiple(false),
        )
        .arg(
            Arg::new("tskey")
                .long("tskey")
                .short('t')
                .help("Use FILE as the list of observable names")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("template")
                .long("template")
                .help("Render the dumped tree through a mustache template FILE")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("files")
                .help("Database files to dump (default: all databases in the state directory)")
                .num_args(0..),
        )
}
