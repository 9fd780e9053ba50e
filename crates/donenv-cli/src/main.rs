//! `donenv` binary

use donenv_cli::{logging, Action, StartOutcome};
use donenv_core::prelude::{DockerCleaner, ProcessShell};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match donenv_cli::parse_from(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };

    if let Err(err) = logging::init(cli.log_json) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match cli.action {
        Action::Start(args) => match donenv_cli::start(args).await {
            Ok(StartOutcome::Ready) => ExitCode::SUCCESS,
            Ok(StartOutcome::Failed | StartOutcome::Interrupted) => ExitCode::FAILURE,
            Err(err) => {
                eprintln!("Error: {err:#}");
                ExitCode::FAILURE
            }
        },
        Action::Stop => {
            let cleaner = DockerCleaner::new(Arc::new(ProcessShell::new()));
            match donenv_cli::stop(&cleaner).await {
                Ok(0) => {
                    println!("No test containers running");
                    ExitCode::SUCCESS
                }
                Ok(count) => {
                    println!("Removed {count} test containers and their volumes");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("Error: {err:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
