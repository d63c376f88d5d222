use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use spmfilter::{
    config::{DEFAULT_CONFIG_FILE, Settings},
    controller::Controller,
    internal, logging,
};

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

/// Mail filtering gateway with pluggable filter modules
#[derive(Parser, Debug)]
#[command(name = "spmfilter")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    file: PathBuf,

    /// Log everything, whatever the configuration says
    #[arg(short, long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::load(&cli.file) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    settings.global.debug |= cli.debug;
    logging::init(settings.global.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            internal!(level = ERROR, "Unable to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(Controller::new(settings).run()) {
        Ok(status) => ExitCode::from(u8::try_from(status).unwrap_or(1)),
        Err(err) => {
            internal!(level = ERROR, "{err:#}");
            ExitCode::FAILURE
        }
    }
}
