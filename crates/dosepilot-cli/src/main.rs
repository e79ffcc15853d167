//! Command-line interface for the dosepilot pump command queue.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dosepilot_core::config::{env_vars, QueueConfig};
use dosepilot_testing::GlucoseScenario;

mod simulate;

use simulate::{SimulationOptions, Simulator};

/// dosepilot - Serialized pump command queue for closed-loop dosing.
#[derive(Parser, Debug)]
#[command(name = "dosepilot")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Queue configuration file (TOML). Falls back to $DOSEPILOT_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run a closed loop against the simulated pump.
    Simulate {
        /// Number of loop cycles.
        #[arg(short = 'n', long, default_value_t = 12)]
        cycles: u32,
        /// Seed for glucose traces and pump faults.
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
        /// Probability of a pump fault on each connect and command.
        #[arg(short, long, default_value_t = 0.0)]
        fault_rate: f64,
        /// Glucose scenario driving the dosing engine.
        #[arg(long, value_enum, default_value_t = ScenarioArg::Mixed)]
        scenario: ScenarioArg,
        /// Simulated pump latency per command in milliseconds.
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the effective queue configuration as TOML.
    Config,
}

/// Glucose scenarios selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioArg {
    InRange,
    Rising,
    Falling,
    Overnight,
    /// Rotate through all scenarios
    Mixed,
}

impl ScenarioArg {
    /// Scenario for loop cycle `cycle`.
    pub fn for_cycle(self, cycle: u32) -> GlucoseScenario {
        match self {
            ScenarioArg::InRange => GlucoseScenario::InRange,
            ScenarioArg::Rising => GlucoseScenario::RisingAfterMeal,
            ScenarioArg::Falling => GlucoseScenario::FallingToLow,
            ScenarioArg::Overnight => GlucoseScenario::Overnight,
            ScenarioArg::Mixed => match cycle % 4 {
                0 => GlucoseScenario::RisingAfterMeal,
                1 => GlucoseScenario::InRange,
                2 => GlucoseScenario::FallingToLow,
                _ => GlucoseScenario::Overnight,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Check if JSON logging is requested (for production/container environments)
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if args.verbose { "dosepilot=debug" } else { "dosepilot=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr so stdout stays machine readable
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Simulate {
            cycles,
            seed,
            fault_rate,
            scenario,
            latency_ms,
            json,
        } => {
            if !(0.0..=1.0).contains(&fault_rate) {
                anyhow::bail!("--fault-rate must be between 0 and 1, got {}", fault_rate);
            }
            let options = SimulationOptions {
                cycles,
                seed,
                fault_rate,
                scenario,
                latency_ms,
            };
            let summary = Simulator::new(config, options)?.run().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                summary.print();
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Config file from the flag or `DOSEPILOT_CONFIG`, then environment overrides.
fn load_config(path: Option<&PathBuf>) -> Result<QueueConfig> {
    let path = path
        .cloned()
        .or_else(|| std::env::var(env_vars::CONFIG_PATH).ok().map(PathBuf::from));

    let config = match path {
        Some(path) => QueueConfig::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => QueueConfig::default(),
    };
    config
        .with_env_overrides()
        .context("Invalid DOSEPILOT_* environment override")
}
