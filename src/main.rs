mod archiver;
mod carm;
mod cli;
mod config;
mod cpu;
mod error;
mod filter;
mod ingest;
mod probe;
mod session;
mod subclient;
mod transport;

use std::path::PathBuf;

use clap::Parser;

use archiver::ConcatArchiver;
use error::AdaptystError;

const DEFAULT_SYSTEM_CONFIG: &str = "/etc/adaptyst.conf";
const DEFAULT_LOCAL_CONFIG: &str = ".adaptyst.conf";

fn main() {
    let cli = cli::Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();

    ctrlc::set_handler(|| {
        log::warn!("interrupted; probes and the profiled command are left to the session's own teardown");
    })
    .expect("failed to install Ctrl-C handler");

    std::process::exit(run(cli));
}

fn run(cli: cli::Cli) -> i32 {
    let tool_config = match config::load_tool_config(
        &PathBuf::from(DEFAULT_SYSTEM_CONFIG),
        &PathBuf::from(DEFAULT_LOCAL_CONFIG),
    ) {
        Ok(tool_config) => tool_config,
        Err(e) => {
            log::error!("{e}");
            return exit_code_for(&e);
        }
    };

    let session_config = match cli.into_session_config(
        tool_config.perf_path,
        tool_config.carm_tool_path,
        tool_config.roofline_benchmark_path,
    ) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return exit_code_for(&e);
        }
    };

    let working_dir = match tempfile::Builder::new().prefix("adaptyst-").tempdir() {
        Ok(dir) => dir.into_path(),
        Err(e) => {
            log::error!("could not create working directory: {e}");
            return AdaptystError::Connection(format!("tempdir: {e}")).exit_code();
        }
    };

    log::info!("working directory: {}", working_dir.display());

    let archiver = ConcatArchiver;
    let outcome = session::run(&session_config, &working_dir, "result", Some(&archiver));

    if let Some(result_dir) = &outcome.result_dir {
        log::info!("results written to {}", result_dir.display());
    } else {
        log::warn!("session ended without producing a result directory; working directory preserved at {}", working_dir.display());
    }

    outcome.exit_code
}

fn exit_code_for(e: &AdaptystError) -> i32 {
    e.exit_code()
}
