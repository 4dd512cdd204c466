use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use psj_app::scenarios;
use psj_harness_lib::bootstrap::{init_tracing_subscriber, Cli, Commands};
use psj_harness_lib::runner;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_tracing_subscriber(cli.verbose) {
        eprintln!("Failed to initialize tracing: {err}");
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "psj-runner aborted");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    match cli.command() {
        Commands::List => {
            for scenario in scenarios::all() {
                println!("{}", scenario.name);
            }
            Ok(true)
        }
        Commands::Run { scenarios } => {
            let config = psj_infra::config::load_config(cli.config.as_deref())?;
            let selected = runner::select(&scenarios)?;
            tracing::info!(count = selected.len(), "running scenarios");

            let outcomes = runner::run_all(&selected, &config).await;
            for outcome in &outcomes {
                println!("{outcome}");
            }
            let failed = outcomes.iter().filter(|o| !o.passed()).count();
            println!("{} passed, {} failed", outcomes.len() - failed, failed);
            Ok(failed == 0)
        }
    }
}
