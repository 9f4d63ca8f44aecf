//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `ordo`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ordo",
    version,
    about = "Run dependency-aware, prioritized, delayed and recurring tasks.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `$ORDO_CONFIG`, else `Ordo.toml` if it exists, else built-in
    /// defaults.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `ORDO_LOG` (an `EnvFilter` directive) or `info` is used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Load a tasks file, submit every task and work until all have settled.
    Run(RunArgs),
    /// Print the execution order of a tasks file, or the cycle that prevents one.
    Order(OrderArgs),
    /// Submit one test task and process it.
    Submit(SubmitArgs),
    /// Check that the queue and the task store are reachable.
    Health,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Tasks file (TOML, one `[task.<name>]` table per task).
    #[arg(value_name = "TASKS")]
    pub tasks: PathBuf,

    /// Number of workers; overrides `worker.count`.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Give up waiting after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct OrderArgs {
    #[arg(value_name = "TASKS")]
    pub tasks: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct SubmitArgs {
    #[arg(long, default_value = "Test Task")]
    pub title: String,

    /// 1 (low) to 3 (high).
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=3))]
    pub priority: u8,

    /// Simulated failures before the task succeeds.
    #[arg(long, default_value_t = 0)]
    pub fail_times: u32,

    /// Overrides `tasks.default_max_retries`.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_global_flags_after_subcommand() {
        let args = CliArgs::try_parse_from([
            "ordo",
            "run",
            "tasks.toml",
            "--workers",
            "3",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.tasks, PathBuf::from("tasks.toml"));
                assert_eq!(run.workers, Some(3));
                assert!(!run.json);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn submit_rejects_out_of_range_priority() {
        assert!(CliArgs::try_parse_from(["ordo", "submit", "--priority", "4"]).is_err());

        let args = CliArgs::try_parse_from(["ordo", "submit"]).unwrap();
        match args.command {
            Command::Submit(submit) => {
                assert_eq!(submit.title, "Test Task");
                assert_eq!(submit.priority, 2);
            }
            other => panic!("expected submit, got {other:?}"),
        }
    }
}
