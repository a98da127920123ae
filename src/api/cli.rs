use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::build_simulate_response;
use crate::core::{Plan, PlanError, SolveError, SpendingSolveConfig, solve_max_spending};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("failed to read plan {path}: {source}")]
    ReadPlan {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error("failed to write output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

#[derive(Debug, Parser)]
#[command(name = "nestegg", about = "Monte Carlo retirement projections")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    #[command(flatten)]
    Offline(OfflineCommand),
}

/// Subcommands that run once against a plan file and exit.
#[derive(Debug, Subcommand)]
pub enum OfflineCommand {
    /// Run the Monte Carlo projection for a plan file.
    Simulate(SimulateArgs),
    /// Find the highest baseline spending that meets a success target.
    Solve(SolveArgs),
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[arg(long, help = "Path to a plan JSON document")]
    pub plan: PathBuf,
    #[arg(long, help = "Number of paths; defaults to the plan's simulations")]
    pub paths: Option<u32>,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Debug, Args)]
pub struct SolveArgs {
    #[arg(long, help = "Path to a plan JSON document")]
    pub plan: PathBuf,
    #[arg(long, help = "Target success probability, e.g. 0.9")]
    pub target: f64,
    #[arg(long, default_value_t = 0.0)]
    pub search_min: f64,
    #[arg(long, default_value_t = 250_000.0)]
    pub search_max: f64,
    #[arg(long, default_value_t = 100.0)]
    pub tolerance: f64,
    #[arg(long, default_value_t = 30)]
    pub max_iterations: u32,
    #[arg(long, default_value_t = 500, help = "Paths per binary-search probe")]
    pub paths: u32,
    #[arg(long, default_value_t = 1_000)]
    pub final_paths: u32,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    #[arg(long)]
    pub pretty: bool,
}

impl SolveArgs {
    fn config(&self) -> SpendingSolveConfig {
        SpendingSolveConfig {
            target_success: self.target,
            search_min: self.search_min,
            search_max: self.search_max,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
            paths_per_iteration: self.paths,
            final_paths: self.final_paths,
            seed: self.seed,
        }
    }
}

/// Runs the offline subcommands and prints their JSON to stdout.
pub fn run(command: OfflineCommand) -> Result<(), CliError> {
    match command {
        OfflineCommand::Simulate(args) => {
            let plan = read_plan(&args.plan)?;
            let n_paths = args.paths.unwrap_or(plan.simulations);
            log::info!("simulating {} with {n_paths} paths", args.plan.display());
            let response = build_simulate_response(&plan, n_paths, args.seed);
            print_json(&response, args.pretty)
        }
        OfflineCommand::Solve(args) => {
            let plan = read_plan(&args.plan)?;
            let result = solve_max_spending(&plan, args.config())?;
            print_json(&result, args.pretty)
        }
    }
}

pub fn read_plan(path: &Path) -> Result<Plan, CliError> {
    let json = fs::read_to_string(path).map_err(|source| CliError::ReadPlan {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Plan::from_json(&json)?)
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<(), CliError> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}
