//! Closed-loop simulation.
//!
//! Every cycle generates a glucose trace, asks the reference dosing engine
//! for a recommendation and pushes it through the command queue to the
//! simulated pump, waiting for each result before the next cycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use dosepilot_commands::{
    AlertSeverity, CommandSource, MemoryNotifier, PumpAlert, PumpCommandQueue, PumpEnactResult,
    QueueStats,
};
use dosepilot_core::config::QueueConfig;
use dosepilot_core::dosing::DosingEngine;
use dosepilot_core::therapy::BasalProfile;
use dosepilot_testing::{SimulatedPump, TargetDosingEngine, TestDataGenerator};

use crate::ScenarioArg;

/// Share of insulin on board left after one cycle.
const IOB_DECAY: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub cycles: u32,
    pub seed: u64,
    pub fault_rate: f64,
    pub scenario: ScenarioArg,
    pub latency_ms: u64,
}

/// Outcome counts of a simulation run.
#[derive(Debug, Default, Serialize)]
pub struct SimulationSummary {
    pub cycles: u32,
    pub commands: usize,
    pub succeeded: usize,
    pub enacted: usize,
    pub superseded: usize,
    pub failed: usize,
    pub unverified: usize,
    pub insulin_delivered: f64,
    pub connect_attempts: u32,
    pub reservoir_units: f64,
    pub temp_basal_rate: Option<f64>,
    pub alerts: Vec<AlertLine>,
    pub queue: Option<QueueStats>,
}

#[derive(Debug, Serialize)]
pub struct AlertLine {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
}

impl From<PumpAlert> for AlertLine {
    fn from(alert: PumpAlert) -> Self {
        Self {
            severity: alert.severity,
            title: alert.title,
            message: alert.message,
        }
    }
}

impl SimulationSummary {
    fn tally(&mut self, result: &PumpEnactResult) {
        self.commands += 1;
        self.insulin_delivered += result.bolus_delivered;
        if result.success {
            self.succeeded += 1;
            if result.enacted {
                self.enacted += 1;
            }
        } else if result.is_unverified() {
            self.unverified += 1;
        } else if result.code() == "superseded" {
            self.superseded += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn urgent_alerts(&self) -> usize {
        self.alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Urgent)
            .count()
    }

    pub fn print(&self) {
        println!(
            "Simulation finished: {} cycles, {} commands",
            self.cycles, self.commands
        );
        println!("  succeeded:  {} (enacted {})", self.succeeded, self.enacted);
        println!("  superseded: {}", self.superseded);
        println!("  failed:     {}", self.failed);
        println!("  unverified: {}", self.unverified);
        println!(
            "  alerts:     {} (urgent {})",
            self.alerts.len(),
            self.urgent_alerts()
        );
        println!("  insulin delivered: {:.2} U", self.insulin_delivered);
        match self.temp_basal_rate {
            Some(rate) => println!(
                "  pump: reservoir {:.2} U, temp basal {:.2} U/h",
                self.reservoir_units, rate
            ),
            None => println!(
                "  pump: reservoir {:.2} U, scheduled basal",
                self.reservoir_units
            ),
        }
        for alert in &self.alerts {
            println!("  ! [{}] {}: {}", alert.severity, alert.title, alert.message);
        }
    }
}

/// Closed loop wired to a simulated pump.
pub struct Simulator {
    options: SimulationOptions,
    queue: PumpCommandQueue,
    pump: Arc<SimulatedPump>,
    alerts: Arc<MemoryNotifier>,
    engine: TargetDosingEngine,
    profile: BasalProfile,
}

impl Simulator {
    pub fn new(config: QueueConfig, options: SimulationOptions) -> Result<Self> {
        let pump = Arc::new(
            SimulatedPump::new()
                .with_name("sim")
                .with_fault_rate(options.fault_rate, options.seed)
                .with_latency(Duration::from_millis(options.latency_ms)),
        );
        let engine = TargetDosingEngine {
            max_smb: config.limits.max_smb,
            max_basal_rate: config.limits.max_basal_rate,
            ..Default::default()
        };
        let alerts = Arc::new(MemoryNotifier::new());
        let queue = PumpCommandQueue::builder()
            .config(config)
            .driver(pump.clone())
            .notifier(alerts.clone())
            .build()?;

        Ok(Self {
            options,
            queue,
            pump,
            alerts,
            engine,
            profile: BasalProfile::flat("simulation", 1.0),
        })
    }

    pub async fn run(self) -> Result<SimulationSummary> {
        tracing::info!(
            cycles = self.options.cycles,
            seed = self.options.seed,
            fault_rate = self.options.fault_rate,
            engine = self.engine.name(),
            "Starting simulation"
        );
        self.queue.start()?;

        // Profile upload ahead of the first cycle, as a pump setup would
        let setup = self
            .queue
            .set_profile(self.profile.clone(), CommandSource::system("simulation setup"));

        let mut summary = SimulationSummary {
            cycles: self.options.cycles,
            ..Default::default()
        };
        summary.tally(&setup.result().await);

        let mut iob = 0.0;
        for cycle in 0..self.options.cycles {
            let scenario = self.options.scenario.for_cycle(cycle);
            let trace = TestDataGenerator::with_seed(self.options.seed.wrapping_add(u64::from(cycle)))
                .scenario(scenario);
            let recommendation = self.engine.compute_dosing(&trace, iob, 0.0, &self.profile);
            tracing::info!(cycle, ?scenario, reason = %recommendation.reason, "Loop cycle");

            for submission in self.queue.apply_recommendation(&recommendation) {
                let result = submission.result().await;
                tracing::debug!(cycle, code = result.code(), comment = %result.comment, "Command resolved");
                iob += result.bolus_delivered;
                summary.tally(&result);
            }
            iob *= IOB_DECAY;
        }

        summary.queue = Some(self.queue.stats());
        self.queue.shutdown("simulation finished").await;

        let state = self.pump.state();
        summary.connect_attempts = self.pump.connect_attempts();
        summary.reservoir_units = state.reservoir_units;
        summary.temp_basal_rate = state.temp_basal.and_then(|t| t.absolute_rate);
        summary.alerts = self.alerts.alerts().into_iter().map(AlertLine::from).collect();
        Ok(summary)
    }
}
