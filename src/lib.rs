// slcand: serve the slcan serial protocol on a tty and bridge it to a
// SocketCAN network interface.

#[macro_use]
mod logging;

pub mod bridge;
pub mod cli;
pub mod daemon;
pub mod frame;
pub mod io;
pub mod settings;

use std::process::ExitCode;

use clap::Parser;

use crate::cli::Args;
use crate::settings::DaemonSettings;

/// Exit status for command line misuse and invalid settings.
const EXIT_USAGE: u8 = 2;

pub fn run() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if args.list_ports {
        return match daemon::print_ports(args.json) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tlog!("[slcand] {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            tlog!("[slcand] {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if let Some(dir) = &settings.logging.log_dir {
        if let Err(e) = logging::init_file_logging(dir) {
            tlog!("[slcand] {}", e);
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tlog!("[slcand] Failed to start runtime: {}", e);
            logging::stop_file_logging();
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(daemon::serve(settings));
    let status = match result {
        Ok(()) => {
            tlog!("[slcand] Stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tlog!("[slcand] Fatal: {}", e);
            ExitCode::FAILURE
        }
    };
    logging::stop_file_logging();
    status
}

fn load_settings(args: &Args) -> Result<DaemonSettings, io::IoError> {
    let mut settings = DaemonSettings::load(args.config.as_deref())?;
    args.apply(&mut settings);
    settings.validate()?;
    Ok(settings)
}
