//! Closed-loop tests.
//!
//! Glucose traces feed the reference dosing engine, its recommendations go
//! through the command queue and land on the simulated pump.

use std::sync::Arc;
use std::time::Duration;

use dosepilot_commands::{
    AlertSeverity, CommandKind, MemoryAuditSink, MemoryNotifier, PumpCommandQueue, PumpEnactResult,
};
use dosepilot_core::config::{QueueConfig, RetryPolicy};
use dosepilot_core::dosing::{BasalAction, DosingEngine};
use dosepilot_core::therapy::BasalProfile;
use dosepilot_testing::{GlucoseScenario, SimulatedPump, TargetDosingEngine, TestDataGenerator};

/// Helper to create a queue config suited to simulations.
fn sim_config() -> QueueConfig {
    QueueConfig {
        connect_timeout_ms: 200,
        execute_timeout_ms: 300,
        bolus_timeout_per_unit_ms: 0,
        status_timeout_ms: 200,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 2,
            backoff_multiplier: 2.0,
            max_delay_ms: 10,
        },
        ..Default::default()
    }
}

struct Loop {
    queue: PumpCommandQueue,
    pump: Arc<SimulatedPump>,
    audit: Arc<MemoryAuditSink>,
    alerts: Arc<MemoryNotifier>,
    engine: TargetDosingEngine,
    profile: BasalProfile,
}

impl Loop {
    fn new(pump: SimulatedPump) -> anyhow::Result<Self> {
        let pump = Arc::new(pump);
        let audit = Arc::new(MemoryAuditSink::new());
        let alerts = Arc::new(MemoryNotifier::new());
        let queue = PumpCommandQueue::builder()
            .config(sim_config())
            .driver(pump.clone())
            .audit_sink(audit.clone())
            .notifier(alerts.clone())
            .build()?;
        queue.start()?;
        Ok(Self {
            queue,
            pump,
            audit,
            alerts,
            engine: TargetDosingEngine::default(),
            profile: BasalProfile::flat("test", 1.0),
        })
    }

    /// One loop cycle: compute, enqueue, wait for every result.
    async fn cycle(&self, scenario: GlucoseScenario, seed: u64) -> anyhow::Result<Vec<PumpEnactResult>> {
        let trace = TestDataGenerator::with_seed(seed).scenario(scenario);
        let recommendation = self.engine.compute_dosing(&trace, 0.0, 0.0, &self.profile);

        let mut results = Vec::new();
        for submission in self.queue.apply_recommendation(&recommendation) {
            results.push(tokio::time::timeout(Duration::from_secs(5), submission.result()).await?);
        }
        Ok(results)
    }
}

#[tokio::test]
async fn test_falling_glucose_suspends_basal() -> anyhow::Result<()> {
    let sim = Loop::new(SimulatedPump::new())?;

    let results = sim.cycle(GlucoseScenario::FallingToLow, 1).await?;
    assert_eq!(results.len(), 1);
    assert!(results[0].success);
    assert_eq!(results[0].absolute_rate, Some(0.0));

    let temp = sim.pump.state().temp_basal.expect("zero temp running");
    assert_eq!(temp.absolute_rate, Some(0.0));
    assert_eq!(sim.pump.execution_count(CommandKind::SmbBolus), 0);

    sim.queue.shutdown("test done").await;
    Ok(())
}

#[tokio::test]
async fn test_rising_glucose_raises_basal_and_boluses() -> anyhow::Result<()> {
    let sim = Loop::new(SimulatedPump::new())?;
    let reservoir_before = sim.pump.state().reservoir_units;

    let results = sim.cycle(GlucoseScenario::RisingAfterMeal, 1).await?;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.success && r.enacted));

    let state = sim.pump.state();
    assert!(state.temp_basal.and_then(|t| t.absolute_rate).is_some_and(|r| r > 1.0));
    let delivered = reservoir_before - state.reservoir_units;
    assert!(delivered > 0.0 && delivered <= sim.engine.max_smb + 1e-9);

    sim.queue.shutdown("test done").await;
    Ok(())
}

#[tokio::test]
async fn test_in_range_glucose_sends_nothing() -> anyhow::Result<()> {
    let sim = Loop::new(SimulatedPump::new())?;

    let results = sim.cycle(GlucoseScenario::InRange, 9).await?;
    assert!(results.is_empty());
    assert!(sim.pump.executions().is_empty());

    sim.queue.shutdown("test done").await;
    Ok(())
}

#[tokio::test]
async fn test_repeated_cycles_do_not_reissue_the_same_temp() -> anyhow::Result<()> {
    let sim = Loop::new(SimulatedPump::new())?;

    let first = sim.cycle(GlucoseScenario::FallingToLow, 1).await?;
    let second = sim.cycle(GlucoseScenario::FallingToLow, 1).await?;
    assert!(first[0].enacted);
    assert!(second[0].success);
    assert!(!second[0].enacted);

    sim.queue.shutdown("test done").await;
    Ok(())
}

#[tokio::test]
async fn test_faulty_pump_never_hides_unverified_dosing() -> anyhow::Result<()> {
    let sim = Loop::new(SimulatedPump::new().with_fault_rate(0.3, 17))?;
    let scenarios = [
        GlucoseScenario::RisingAfterMeal,
        GlucoseScenario::FallingToLow,
        GlucoseScenario::Overnight,
        GlucoseScenario::InRange,
    ];

    let mut unverified = 0;
    let mut resolved = 0;
    for cycle in 0..24u64 {
        let scenario = scenarios[(cycle % 4) as usize];
        for result in sim.cycle(scenario, cycle).await? {
            resolved += 1;
            // A success never carries an error, a failure always does
            assert_eq!(result.success, result.error.is_none());
            if result.is_unverified() {
                unverified += 1;
            }
        }
    }

    sim.queue.shutdown("test done").await;

    assert_eq!(sim.pump.max_in_flight(), 1);
    let urgent = sim
        .alerts
        .alerts()
        .iter()
        .filter(|a| a.severity == AlertSeverity::Urgent)
        .count();
    assert_eq!(urgent, unverified);
    assert!(resolved > 0);
    assert_eq!(sim.audit.count(), resolved);
    Ok(())
}

#[tokio::test]
async fn test_engine_and_queue_agree_on_limits() {
    let engine = TargetDosingEngine::default();
    let config = QueueConfig::default();
    let profile = BasalProfile::flat("limits", 1.0);

    for scenario in [
        GlucoseScenario::RisingAfterMeal,
        GlucoseScenario::FallingToLow,
        GlucoseScenario::Overnight,
        GlucoseScenario::InRange,
    ] {
        let trace = TestDataGenerator::with_seed(3).scenario(scenario);
        let recommendation = engine.compute_dosing(&trace, 0.0, 0.0, &profile);
        if let BasalAction::SetTemp { rate, .. } = recommendation.basal {
            assert!(rate <= config.limits.max_basal_rate);
        }
        if let Some(units) = recommendation.smb_units {
            assert!(units <= config.limits.max_smb);
        }
    }
}
