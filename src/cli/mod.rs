pub mod actions;
pub mod config;

use clap::{Arg, ArgMatches, Command};

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

pub fn build_command() -> Command {
    Command::new("diapoll")
        .about("Poll field devices and report their health")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Engine configuration file (.json or .toml)")
                .value_name("FILE")
                .required_unless_present("list-ports"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Print published values, states and faults as JSON lines")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration, print it resolved and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
}
