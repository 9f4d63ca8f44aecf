pub mod cli;
pub mod commands;
pub mod executor;
pub mod logging;
pub mod tasks_file;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use ordo_core::config::{OrdoConfig, default_config_path, load_and_validate};

use crate::cli::{CliArgs, Command};

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Run(run) => {
            let tasks = tasks_file::load_tasks(&run.tasks)?;
            let workers = run.workers.unwrap_or(config.worker.count).max(1);
            let timeout = run.timeout.map(Duration::from_secs);
            let report = commands::run_tasks(config, &tasks, workers, timeout).await?;
            if run.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
        }
        Command::Order(order) => {
            let tasks = tasks_file::load_tasks(&order.tasks)?;
            for (i, name) in commands::execution_order(config, &tasks)
                .await?
                .iter()
                .enumerate()
            {
                println!("{:>3}. {}", i + 1, name);
            }
        }
        Command::Submit(submit) => {
            let task = commands::submit_test_task(config, &submit).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Command::Health => {
            let report = commands::check_health(config).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                return Err(anyhow!("unhealthy"));
            }
        }
    }
    Ok(())
}

/// An explicit `--config` must exist; the default path is optional.
fn load_config(path: Option<&Path>) -> Result<OrdoConfig> {
    match path {
        Some(path) => load_and_validate(path)
            .with_context(|| format!("loading config from {:?}", path)),
        None => {
            let path = default_config_path();
            if path.exists() {
                load_and_validate(&path).with_context(|| format!("loading config from {:?}", path))
            } else {
                Ok(OrdoConfig::default())
            }
        }
    }
}
