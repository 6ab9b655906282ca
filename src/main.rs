use std::process::ExitCode;

use log::LevelFilter;
use simple_logger::SimpleLogger;

use mstar::args::Options;
use mstar::driver;

fn main() -> ExitCode {
    SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .env()
        .init()
        .unwrap();

    let opts = match Options::from_args(std::env::args().skip(1)) {
        Some(opts) => opts,
        None => {
            // `-help` and a missing `-in`/`-out` both print usage and succeed.
            Options::print_usage();
            return ExitCode::SUCCESS;
        }
    };

    match driver::run(&opts) {
        Ok(driver::Status::Compiled) => ExitCode::SUCCESS,
        // Diagnostics have already been printed.
        Ok(driver::Status::Rejected) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}
