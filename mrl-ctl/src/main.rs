mod args;
use args::{parse_args, Commands};

mod submit;

use std::process::ExitCode;

use common::error::ErrorKind;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match parse_args() {
        Commands::Workloads => {
            for name in workload::NAMES {
                println!("{name}");
            }
            ExitCode::SUCCESS
        }
        Commands::Submit(args) => {
            let config = match submit::job_config(&args) {
                Ok(config) => config,
                Err(e) => {
                    error!("{e:#}");
                    return ExitCode::from(2);
                }
            };

            let report = submit::submit(config, submit::storage(&args.storage)).await;
            if let Some(path) = &args.report {
                if let Err(e) = submit::write_report(&report, path) {
                    error!("{e:#}");
                }
            }

            if report.is_success() {
                print!("{report}");
                ExitCode::SUCCESS
            } else {
                eprint!("{report}");
                match report.error_kind() {
                    Some(ErrorKind::Config) => ExitCode::from(2),
                    _ => ExitCode::from(1),
                }
            }
        }
    }
}
