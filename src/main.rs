mod config;
mod convert;
mod normalizer;
mod output;
mod parsers;

use anyhow::{Result, anyhow};
use clap::{ArgAction, Parser};
use config::ConvertConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Convert the retention scorer's peer groups from a pickle file to JSON",
    long_about = None
)]
struct Args {
    /// Pickle file holding the retention scorer state
    #[arg(value_name = "SOURCE", default_value = config::DEFAULT_SOURCE)]
    source: PathBuf,

    /// JSON file to write
    #[arg(value_name = "DEST", default_value = config::DEFAULT_DESTINATION)]
    destination: PathBuf,

    /// Log more detail to stderr (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Print stage timings to stderr
    #[arg(long)]
    benchmark: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    output::print_banner();

    let config = ConvertConfig {
        source: args.source,
        destination: args.destination,
    };
    match convert::convert(&config) {
        Ok(report) => {
            output::print_summary(&report);
            output::print_next_steps(&config.destination, report.total_peer_groups());
            if args.benchmark {
                output::print_timings(&report.timings);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::debug!(error = ?err, "conversion failed");
            output::print_failure(&err);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_logging(verbose: u8) -> Result<()> {
    let default_directive = match verbose {
        0 => "pkl2json=warn",
        1 => "pkl2json=debug",
        _ => "pkl2json=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("failed to initialize tracing subscriber: {err}"))
}
