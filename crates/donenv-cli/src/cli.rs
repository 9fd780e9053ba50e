//! Command-line surface

use crate::config::TopologyPreset;
use clap::{value_parser, Arg, ArgAction, Command};
use std::path::PathBuf;
use std::time::Duration;

/// Parsed `env start` arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartArgs {
    /// Preset used when the config declares no node sets
    pub topology: TopologyPreset,
    /// Delay before cleanup after a failed start
    pub wait_on_error_timeout: Duration,
    /// Host ports to expose on node containers
    pub extra_allowed_ports: Vec<u16>,
    /// Optional TOML config
    pub config: Option<PathBuf>,
}

/// What to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Provision an environment
    Start(StartArgs),
    /// Remove everything a previous start left behind
    Stop,
}

/// Parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    /// JSON log lines instead of text
    pub log_json: bool,
    /// Selected action
    pub action: Action,
}

/// The `donenv` command
#[must_use]
pub fn command() -> Command {
    Command::new("donenv")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Ephemeral multi-chain DON test environments")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(
            Command::new("env")
                .about("Manage the local test environment")
                .subcommand_required(true)
                .subcommand(
                    Command::new("start")
                        .visible_alias("restart")
                        .about("Start chains, contracts, DONs and the Job Distributor")
                        .arg(
                            Arg::new("topology")
                                .long("topology")
                                .short('t')
                                .default_value("simplified")
                                .value_parser(|value: &str| value.parse::<TopologyPreset>())
                                .help("DON layout: simplified or full"),
                        )
                        .arg(
                            Arg::new("wait-on-error-timeout")
                                .long("wait-on-error-timeout")
                                .short('w')
                                .default_value("15s")
                                .value_parser(humantime::parse_duration)
                                .help("Time to wait before removing containers after a failed start"),
                        )
                        .arg(
                            Arg::new("extra-allowed-ports")
                                .long("extra-allowed-ports")
                                .short('e')
                                .value_delimiter(',')
                                .value_parser(value_parser!(u16))
                                .help("Extra host ports exposed on node containers, comma separated"),
                        )
                        .arg(
                            Arg::new("config")
                                .long("config")
                                .short('c')
                                .value_parser(value_parser!(PathBuf))
                                .help("Environment config file (TOML)"),
                        ),
                )
                .subcommand(Command::new("stop").about("Remove all test containers and their volumes")),
        )
}

/// Parse arguments
///
/// # Errors
/// Returns the clap error for invalid input, `--help` and `--version`.
pub fn parse_from<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let mut command = command();
    let matches = command.try_get_matches_from_mut(args)?;
    let log_json = matches.get_flag("log-json");

    let action = match matches.subcommand() {
        Some(("env", env)) => match env.subcommand() {
            Some(("start", start)) => Action::Start(StartArgs {
                topology: start
                    .get_one::<TopologyPreset>("topology")
                    .copied()
                    .unwrap_or(TopologyPreset::Simplified),
                wait_on_error_timeout: start
                    .get_one::<Duration>("wait-on-error-timeout")
                    .copied()
                    .unwrap_or_default(),
                extra_allowed_ports: start
                    .get_many::<u16>("extra-allowed-ports")
                    .map(|ports| ports.copied().collect())
                    .unwrap_or_default(),
                config: start.get_one::<PathBuf>("config").cloned(),
            }),
            Some(("stop", _)) => Action::Stop,
            _ => return Err(command.error(clap::error::ErrorKind::MissingSubcommand, "missing env subcommand")),
        },
        _ => return Err(command.error(clap::error::ErrorKind::MissingSubcommand, "missing subcommand")),
    };

    Ok(Cli { log_json, action })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn start_defaults() {
        let cli = parse_from(["donenv", "env", "start"]).unwrap();
        assert!(!cli.log_json);
        assert_eq!(
            cli.action,
            Action::Start(StartArgs {
                topology: TopologyPreset::Simplified,
                wait_on_error_timeout: Duration::from_secs(15),
                extra_allowed_ports: Vec::new(),
                config: None,
            })
        );
    }

    #[test]
    fn restart_alias_with_all_flags() {
        let cli = parse_from([
            "donenv",
            "--log-json",
            "env",
            "restart",
            "--topology",
            "full",
            "--wait-on-error-timeout",
            "2m",
            "--extra-allowed-ports",
            "8080,9090",
            "--config",
            "env.toml",
        ])
        .unwrap();

        assert!(cli.log_json);
        let Action::Start(args) = cli.action else {
            panic!("expected start");
        };
        assert_eq!(args.topology, TopologyPreset::Full);
        assert_eq!(args.wait_on_error_timeout, Duration::from_secs(120));
        assert_eq!(args.extra_allowed_ports, vec![8080, 9090]);
        assert_eq!(args.config, Some(PathBuf::from("env.toml")));
    }

    #[test]
    fn stop_parses() {
        assert_eq!(parse_from(["donenv", "env", "stop"]).unwrap().action, Action::Stop);
    }

    #[test]
    fn unknown_topology_is_rejected() {
        assert!(parse_from(["donenv", "env", "start", "--topology", "tiny"]).is_err());
    }

    #[test]
    fn command_is_well_formed() {
        command().debug_assert();
    }
}
