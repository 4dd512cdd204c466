use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "psj-runner")]
#[command(about = "Run partial-state join scenarios against simulated homeservers", long_about = None)]
pub struct Cli {
    /// TOML config file layered over the built-in defaults
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log harness internals at trace level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List scenario names
    List,
    /// Run scenarios (all of them when none are named)
    Run {
        /// Scenario to run; repeatable
        #[arg(short, long = "scenario")]
        scenarios: Vec<String>,
    },
}

impl Cli {
    /// The command to execute; a bare invocation runs everything.
    pub fn command(&self) -> Commands {
        match &self.command {
            Some(Commands::List) => Commands::List,
            Some(Commands::Run { scenarios }) => Commands::Run {
                scenarios: scenarios.clone(),
            },
            None => Commands::Run {
                scenarios: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_invocation_runs_all() {
        let cli = Cli::try_parse_from(["psj-runner"]).unwrap();
        match cli.command() {
            Commands::Run { scenarios } => assert!(scenarios.is_empty()),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_repeated_scenario_flags() {
        let cli = Cli::try_parse_from([
            "psj-runner",
            "--config",
            "harness.toml",
            "run",
            "-s",
            "sync_blocks_during_partial_state_join",
            "--scenario",
            "gappy_sync_after_partial_state_synced",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("harness.toml")));
        match cli.command() {
            Commands::Run { scenarios } => assert_eq!(
                scenarios,
                vec![
                    "sync_blocks_during_partial_state_join".to_string(),
                    "gappy_sync_after_partial_state_synced".to_string(),
                ]
            ),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_list_subcommand() {
        let cli = Cli::try_parse_from(["psj-runner", "list"]).unwrap();
        assert!(matches!(cli.command(), Commands::List));
    }
}
