//! tether: render templates from Consul and keep them current.
//!
//! # Usage
//!
//! ```text
//! tether --template in.tmpl:/etc/app.conf[:command] [--once] [--dry]
//! tether --config tether.yaml [--consul-addr host:port] [--wait 5s:30s]
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning                                  |
//! |------|------------------------------------------|
//! | 0    | once mode finished, or kill signal       |
//! | 11   | unexpected error                         |
//! | 12   | interrupted (SIGINT/SIGTERM)             |
//! | 13   | invalid flags or extra arguments         |
//! | 14   | runner failed                            |
//! | 15   | invalid configuration or template        |

mod args;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use args::Cli;
use tether_core::ConfigError;
use tether_daemon::{start_blocking, DaemonError, RunOutcome};

const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 11;
const EXIT_INTERRUPT: u8 = 12;
const EXIT_PARSE_FLAGS: u8 = 13;
const EXIT_RUNNER: u8 = 14;
const EXIT_CONFIG: u8 = 15;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version come through here too.
            let code = if err.use_stderr() {
                EXIT_PARSE_FLAGS
            } else {
                EXIT_OK
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };
    if !cli.extra.is_empty() {
        eprintln!("tether: extra args: {}", cli.extra.join(" "));
        return ExitCode::from(EXIT_PARSE_FLAGS);
    }

    match run(cli) {
        Ok(RunOutcome::Completed | RunOutcome::Stopped) => ExitCode::from(EXIT_OK),
        Ok(RunOutcome::Interrupted) => ExitCode::from(EXIT_INTERRUPT),
        Err(err) => {
            eprintln!("tether: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(cli: Cli) -> Result<RunOutcome> {
    let config = cli.load().context("invalid configuration")?;
    // Reloads re-read the file and re-apply the same flags.
    let source = move || cli.load();
    let outcome = start_blocking(config, source).context("runner exited with error")?;
    Ok(outcome)
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    match err.downcast_ref::<DaemonError>() {
        Some(e) if e.is_config() => EXIT_CONFIG,
        Some(_) => EXIT_RUNNER,
        None => EXIT_ERROR,
    }
}
