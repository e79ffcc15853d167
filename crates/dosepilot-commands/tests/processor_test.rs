//! Queue executor tests.
//!
//! Runs the full queue against the simulated pump: merge behaviour before
//! start, serialization, retries, reconciliation after failures, shutdown
//! and the audit trail.

use std::sync::Arc;
use std::time::Duration;

use dosepilot_commands::{
    ActiveTempBasal, Admission, AlertSeverity, CommandError, CommandEventType, CommandKind,
    CommandSource, ConnectivityState, ExecutorState, MemoryAuditSink, MemoryNotifier, PumpCommand,
    PumpCommandQueue, PumpEnactResult, RejectReason, Submission,
};
use dosepilot_core::config::{DisconnectPolicy, QueueConfig, RetryPolicy};
use dosepilot_testing::{ConnectFault, ExecuteFault, SimulatedPump};

/// Helper to create a config with short timeouts and quick retries.
fn fast_config() -> QueueConfig {
    QueueConfig {
        connect_timeout_ms: 200,
        execute_timeout_ms: 300,
        bolus_timeout_per_unit_ms: 0,
        status_timeout_ms: 200,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 5,
            backoff_multiplier: 2.0,
            max_delay_ms: 20,
        },
        ..Default::default()
    }
}

/// Queue wired to `pump` with in-memory audit and alerts.
struct Harness {
    queue: PumpCommandQueue,
    pump: Arc<SimulatedPump>,
    audit: Arc<MemoryAuditSink>,
    alerts: Arc<MemoryNotifier>,
}

fn harness_with(pump: SimulatedPump, config: QueueConfig) -> Harness {
    let pump = Arc::new(pump);
    let audit = Arc::new(MemoryAuditSink::new());
    let alerts = Arc::new(MemoryNotifier::new());
    let queue = PumpCommandQueue::builder()
        .config(config)
        .driver(pump.clone())
        .audit_sink(audit.clone())
        .notifier(alerts.clone())
        .build()
        .expect("valid test config");
    Harness {
        queue,
        pump,
        audit,
        alerts,
    }
}

fn harness(pump: SimulatedPump) -> Harness {
    harness_with(pump, fast_config())
}

fn loop_source() -> CommandSource {
    CommandSource::system("test-loop")
}

/// Wait for a submission's result, failing the test if it never comes.
async fn resolve(submission: Submission) -> PumpEnactResult {
    tokio::time::timeout(Duration::from_secs(5), submission.result())
        .await
        .expect("command resolved in time")
}

/// Poll `condition` until it holds.
async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn test_newer_temp_basal_supersedes_before_start() {
    let h = harness(SimulatedPump::new());

    let high = h.queue.temp_basal_absolute(1.2, 30, false, loop_source());
    let zero = h.queue.temp_basal_absolute(0.0, 30, false, loop_source());
    assert!(matches!(zero.admission, Admission::Replaced { .. }));

    h.queue.start().unwrap();

    let high = resolve(high).await;
    assert_eq!(high.code(), "superseded");
    assert!(!high.enacted);

    let zero = resolve(zero).await;
    assert!(zero.success);
    assert!(zero.enacted);
    assert_eq!(zero.absolute_rate, Some(0.0));

    assert_eq!(h.pump.execution_count(CommandKind::TempBasalAbsolute), 1);
    let running = h.pump.state().temp_basal.unwrap();
    assert_eq!(running.absolute_rate, Some(0.0));

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_cancel_wins_over_pending_temp_basal() {
    let pump = SimulatedPump::new();
    pump.update_state(|s| {
        s.temp_basal = Some(ActiveTempBasal {
            absolute_rate: Some(2.0),
            percent: None,
            duration_min: 60,
            started_at: chrono::Utc::now(),
        })
    });
    let h = harness(pump);

    let set = h.queue.temp_basal_absolute(1.5, 30, false, loop_source());
    let cancel = h.queue.cancel_temp_basal(false, loop_source());
    h.queue.start().unwrap();

    assert_eq!(resolve(set).await.code(), "superseded");
    let cancel = resolve(cancel).await;
    assert!(cancel.success);
    assert!(cancel.enacted);
    assert!(cancel.is_temp_cancel);
    assert!(h.pump.state().temp_basal.is_none());
    assert_eq!(h.pump.execution_count(CommandKind::TempBasalAbsolute), 0);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_cancel_without_running_temp_is_not_enacted() {
    let h = harness(SimulatedPump::new());
    h.queue.start().unwrap();

    let result = resolve(h.queue.cancel_temp_basal(false, loop_source())).await;
    assert!(result.success);
    assert!(!result.enacted);
    assert!(result.is_temp_cancel);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_status_reads_share_one_execution() {
    let h = harness(SimulatedPump::new());

    let reads: Vec<Submission> = ["loop", "ui", "sync"]
        .into_iter()
        .map(|reason| h.queue.read_status(reason, loop_source()))
        .collect();
    assert_eq!(h.queue.len(), 1);

    h.queue.start().unwrap();
    for read in reads {
        let result = resolve(read).await;
        assert!(result.success);
    }
    assert_eq!(h.pump.execution_count(CommandKind::ReadStatus), 1);

    h.queue.shutdown("test done").await;
    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].callers, 3);
}

#[tokio::test]
async fn test_bolus_timeout_without_history_is_unverified() {
    let pump = SimulatedPump::new().with_bolus_history(false);
    pump.fail_next(
        Some(CommandKind::Bolus),
        ExecuteFault::Timeout {
            partial: false,
            applied: true,
        },
    );
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.bolus(1.5, 0.0, loop_source())).await;
    assert!(!result.success);
    assert!(result.is_unverified());
    assert_eq!(result.code(), "delivery_unverified");

    // Exactly one reconciliation read and no bolus retry
    assert_eq!(h.pump.execution_count(CommandKind::ReadStatus), 1);
    assert_eq!(h.pump.execution_count(CommandKind::Bolus), 1);

    h.queue.shutdown("test done").await;
    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Urgent);
    assert_eq!(alerts[0].kind, CommandKind::Bolus);
}

#[tokio::test]
async fn test_bolus_timeout_confirmed_by_history() {
    let pump = SimulatedPump::new();
    pump.fail_next(
        Some(CommandKind::Bolus),
        ExecuteFault::Timeout {
            partial: false,
            applied: true,
        },
    );
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.bolus(1.0, 12.0, loop_source())).await;
    assert!(result.success);
    assert!(result.enacted);
    assert!((result.bolus_delivered - 1.0).abs() < 1e-9);
    assert!(result.comment.contains("confirmed"));

    h.queue.shutdown("test done").await;
    assert_eq!(h.alerts.count(), 0);
}

#[tokio::test]
async fn test_interrupted_bolus_reports_partial_delivery() {
    let pump = SimulatedPump::new();
    pump.fail_next(
        Some(CommandKind::Bolus),
        ExecuteFault::PartialBolus { delivered: 0.4 },
    );
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.bolus(1.0, 0.0, loop_source())).await;
    assert!(!result.success);
    assert!(result.enacted);
    assert!((result.bolus_delivered - 0.4).abs() < 1e-9);
    assert_eq!(result.code(), "execution_failed");

    h.queue.shutdown("test done").await;
    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Warning);
}

#[tokio::test]
async fn test_hung_temp_basal_not_applied_is_a_clean_timeout() {
    let pump = SimulatedPump::new();
    pump.fail_next(
        Some(CommandKind::TempBasalPercent),
        ExecuteFault::Hang { applied: false },
    );
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.temp_basal_percent(150, 30, false, loop_source())).await;
    assert!(!result.success);
    assert!(!result.enacted);
    assert_eq!(result.error, Some(CommandError::Timeout { partial: false }));
    assert!(h.pump.state().temp_basal.is_none());

    // Later commands still run
    let next = resolve(h.queue.load_events(loop_source())).await;
    assert!(next.success);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_connection_retries_are_bounded() {
    let pump = SimulatedPump::new();
    for _ in 0..3 {
        pump.fail_connect(ConnectFault::Fail("no answer".into()));
    }
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.load_tdds(loop_source())).await;
    assert!(!result.success);
    assert!(matches!(
        result.error,
        Some(CommandError::ConnectionFailed { attempts: 3, .. })
    ));
    assert_eq!(h.pump.connect_attempts(), 3);
    assert_eq!(h.pump.execution_count(CommandKind::LoadTdds), 0);

    // The budget is per command
    let result = resolve(h.queue.load_tdds(loop_source())).await;
    assert!(result.success);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_busy_pump_is_retried() {
    let pump = SimulatedPump::new();
    pump.fail_connect(ConnectFault::Busy("menu open".into()));
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.load_events(loop_source())).await;
    assert!(result.success);
    assert_eq!(h.pump.connect_attempts(), 2);
    assert!(h.queue.status().last_connected_at.is_some());

    h.queue.shutdown("test done").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_never_overlap_at_the_pump() {
    let pump = SimulatedPump::new().with_latency(Duration::from_millis(2));
    let h = harness(pump);
    h.queue.start().unwrap();

    let mut producers = Vec::new();
    for producer in 0..6u8 {
        let queue = h.queue.clone();
        producers.push(tokio::spawn(async move {
            let mut submissions = Vec::new();
            for i in 0..5u8 {
                let source = CommandSource::system(format!("producer-{}", producer));
                submissions.push(match i % 3 {
                    0 => queue.bolus(0.1, 0.0, source),
                    1 => queue.temp_basal_absolute(f64::from(i) * 0.1, 30, false, source),
                    _ => queue.load_history(producer, source),
                });
                tokio::task::yield_now().await;
            }
            futures::future::join_all(submissions.into_iter().map(resolve)).await
        }));
    }

    let mut resolved = 0;
    for producer in producers {
        let results = producer.await.unwrap();
        for result in &results {
            assert!(
                result.success || result.code() == "superseded",
                "unexpected result {:?}",
                result
            );
        }
        resolved += results.len();
    }

    assert_eq!(resolved, 30);
    assert_eq!(h.pump.max_in_flight(), 1);
    assert_eq!(h.pump.execution_count(CommandKind::Bolus), 12);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_in_flight_command_is_never_displaced() {
    let config = QueueConfig {
        execute_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = harness_with(SimulatedPump::new(), config);
    h.pump.hold();
    h.queue.start().unwrap();

    let running = h.queue.temp_basal_absolute(0.5, 30, false, loop_source());
    h.pump.wait_parked().await;
    assert!(h.queue.is_running(CommandKind::TempBasalAbsolute));

    // A newer temp basal only displaces pending commands
    let newer = h.queue.temp_basal_absolute(0.8, 30, false, loop_source());
    assert!(matches!(newer.admission, Admission::Accepted { .. }));
    assert_eq!(h.queue.clear_all("user reset"), 1);
    assert_eq!(resolve(newer).await.code(), "cancelled");

    h.pump.release();
    let running = resolve(running).await;
    assert!(running.success);
    assert_eq!(running.absolute_rate, Some(0.5));

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_and_lets_in_flight_finish() {
    let config = QueueConfig {
        execute_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = harness_with(SimulatedPump::new(), config);
    h.pump.hold();
    h.queue.start().unwrap();

    let bolus = h.queue.bolus(2.0, 30.0, loop_source());
    h.pump.wait_parked().await;
    let pending = h.queue.load_events(loop_source());

    let queue = h.queue.clone();
    let shutdown = tokio::spawn(async move { queue.shutdown("app closing").await });

    let pending = resolve(pending).await;
    assert_eq!(pending.code(), "cancelled");
    assert!(pending.comment.contains("app closing"));

    h.pump.release();
    let bolus = resolve(bolus).await;
    assert!(bolus.success);
    assert_eq!(shutdown.await.unwrap(), 1);

    assert!(!h.queue.is_started());
    assert!(!h.pump.is_connected());
    assert_eq!(h.queue.current_status(), ConnectivityState::Disconnected);

    let late = h.queue.read_status("late", loop_source());
    assert!(matches!(
        late.admission,
        Admission::Rejected {
            reason: RejectReason::Closed,
            ..
        }
    ));
    assert_eq!(resolve(late).await.code(), "rejected");
}

#[tokio::test]
async fn test_suspended_pump_refuses_boluses() {
    let h = harness(SimulatedPump::new());
    h.queue.start().unwrap();

    assert!(resolve(h.queue.stop_pump(loop_source())).await.success);
    assert_eq!(h.queue.current_status(), ConnectivityState::Suspended);

    let bolus = h.queue.bolus(1.0, 0.0, loop_source());
    assert!(matches!(
        bolus.admission,
        Admission::Rejected {
            reason: RejectReason::PumpSuspended,
            ..
        }
    ));
    // Temp basals are still accepted while suspended
    assert!(h
        .queue
        .temp_basal_absolute(0.0, 30, false, loop_source())
        .is_admitted());

    assert!(resolve(h.queue.start_pump(loop_source())).await.success);
    assert!(!h.queue.status().suspended);
    assert!(resolve(h.queue.bolus(1.0, 0.0, loop_source())).await.success);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_disconnect_after_each_command() {
    let config = QueueConfig {
        disconnect_policy: DisconnectPolicy::AfterEachCommand,
        ..fast_config()
    };
    let h = harness_with(SimulatedPump::new(), config);
    h.queue.start().unwrap();

    assert!(resolve(h.queue.load_events(loop_source())).await.success);
    let pump = h.pump.clone();
    wait_for(move || pump.disconnects() == 1).await;

    assert!(resolve(h.queue.load_tdds(loop_source())).await.success);
    let pump = h.pump.clone();
    wait_for(move || pump.disconnects() == 2).await;
    assert_eq!(h.pump.connect_attempts(), 2);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_disconnect_when_idle_keeps_link_for_backlog() {
    let config = QueueConfig {
        disconnect_policy: DisconnectPolicy::WhenIdle,
        ..fast_config()
    };
    let h = harness_with(SimulatedPump::new(), config);

    let submissions = vec![
        h.queue.load_events(loop_source()),
        h.queue.load_tdds(loop_source()),
        h.queue.load_history(1, loop_source()),
    ];
    h.queue.start().unwrap();
    for submission in submissions {
        assert!(resolve(submission).await.success);
    }

    let pump = h.pump.clone();
    wait_for(move || pump.disconnects() == 1).await;
    assert_eq!(h.pump.connect_attempts(), 1);
    assert!(!h.pump.is_connected());

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_lifecycle_events_in_order() {
    let h = harness(SimulatedPump::new());
    h.queue.start().unwrap();

    let submission = h.queue.extended_bolus(2.0, 60, loop_source());
    let id = submission.id().to_string();
    assert!(resolve(submission).await.success);

    let events = h.queue.events();
    let watched = events.clone();
    let watched_id = id.clone();
    wait_for(move || {
        watched
            .for_command(&watched_id)
            .iter()
            .any(|e| e.event_type == CommandEventType::Completed)
    })
    .await;

    let types: Vec<CommandEventType> = events
        .for_command(&id)
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            CommandEventType::Queued,
            CommandEventType::Connecting,
            CommandEventType::Executing,
            CommandEventType::Completed,
        ]
    );

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_callback_receives_result() {
    let h = harness(SimulatedPump::new());
    h.queue.start().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let admission = h.queue.enqueue_with_callback(
        PumpCommand::VendorSpecificNotification {
            key: "low_reservoir".into(),
            enabled: true,
        },
        loop_source(),
        move |result| {
            let _ = tx.send(result);
        },
    );
    assert!(admission.is_admitted());

    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback ran")
        .expect("callback sent");
    assert!(result.success);
    assert_eq!(h.pump.state().notifications.get("low_reservoir"), Some(&true));

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_every_resolution_is_audited_once() {
    let h = harness(SimulatedPump::new());

    let first = h.queue.temp_basal_absolute(1.2, 30, false, loop_source());
    let second = h.queue.temp_basal_absolute(0.6, 30, false, loop_source());
    let invalid = h.queue.bolus(-1.0, 0.0, loop_source());
    assert!(matches!(
        invalid.admission,
        Admission::Rejected {
            reason: RejectReason::Invalid(_),
            ..
        }
    ));

    h.queue.start().unwrap();
    let first_id = first.id().to_string();
    assert_eq!(resolve(first).await.code(), "superseded");
    assert!(resolve(second).await.success);
    assert_eq!(resolve(invalid).await.code(), "rejected");

    h.queue.shutdown("test done").await;

    assert_eq!(h.audit.count(), 3);
    assert_eq!(h.audit.for_command(&first_id).len(), 1);
    assert_eq!(h.alerts.count(), 0);

    let stats = h.queue.stats();
    assert_eq!(stats.superseded, 1);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.processed, 1);
}

#[tokio::test]
async fn test_audit_flushed_when_never_started() {
    let h = harness(SimulatedPump::new());
    let pending = h.queue.load_events(loop_source());

    assert_eq!(h.queue.shutdown("never started").await, 1);
    assert_eq!(resolve(pending).await.code(), "cancelled");
    assert_eq!(h.audit.count(), 1);
    assert_eq!(h.pump.connect_attempts(), 0);
}

#[tokio::test]
async fn test_apply_recommendation_enqueues_basal_then_smb() {
    use dosepilot_core::dosing::{BasalAction, DosingRecommendation};

    let h = harness(SimulatedPump::new());
    let recommendation = DosingRecommendation::keep("high")
        .with_basal(BasalAction::SetTemp {
            rate: 2.0,
            duration_min: 30,
        })
        .with_smb(0.3);

    let submissions = h.queue.apply_recommendation(&recommendation);
    assert_eq!(submissions.len(), 2);
    assert!(submissions.iter().all(|s| s.is_admitted()));

    h.queue.start().unwrap();
    for submission in submissions {
        assert!(resolve(submission).await.success);
    }
    assert_eq!(h.pump.execution_count(CommandKind::SmbBolus), 1);
    assert_eq!(
        h.pump.state().temp_basal.and_then(|t| t.absolute_rate),
        Some(2.0)
    );

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_running_temp_from_before_dispatch_is_not_taken_as_applied() {
    let pump = SimulatedPump::new();
    pump.update_state(|s| {
        s.temp_basal = Some(ActiveTempBasal {
            absolute_rate: Some(1.2),
            percent: None,
            duration_min: 30,
            started_at: chrono::Utc::now() - chrono::Duration::minutes(25),
        })
    });
    pump.fail_next(
        Some(CommandKind::TempBasalAbsolute),
        ExecuteFault::Hang { applied: false },
    );
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.temp_basal_absolute(1.2, 120, true, loop_source())).await;
    assert!(!result.success);
    assert!(!result.enacted);
    assert_ne!(result.duration_min, Some(120));
    assert_eq!(result.error, Some(CommandError::Timeout { partial: false }));
    assert_eq!(h.pump.execution_count(CommandKind::ReadStatus), 1);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_clean_timeout_of_history_load_is_retried() {
    let pump = SimulatedPump::new();
    pump.fail_next(
        Some(CommandKind::LoadHistory),
        ExecuteFault::Hang { applied: false },
    );
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.load_history(1, loop_source())).await;
    assert!(result.success, "unexpected result {:?}", result);
    assert_eq!(h.pump.execution_count(CommandKind::LoadHistory), 2);
    // The hung link is dropped and re-established for the second attempt
    assert_eq!(h.pump.connect_attempts(), 2);
    // Nothing dose related, so no reconciliation read
    assert_eq!(h.pump.execution_count(CommandKind::ReadStatus), 0);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_timeout_retries_share_the_attempt_budget() {
    let pump = SimulatedPump::new();
    for _ in 0..3 {
        pump.fail_next(Some(CommandKind::LoadEvents), ExecuteFault::Hang { applied: false });
    }
    let h = harness(pump);
    h.queue.start().unwrap();

    let result = resolve(h.queue.load_events(loop_source())).await;
    assert_eq!(result.error, Some(CommandError::Timeout { partial: false }));
    assert_eq!(h.pump.execution_count(CommandKind::LoadEvents), 3);

    // Budget is per command
    assert!(resolve(h.queue.load_events(loop_source())).await.success);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_status_read_joins_the_read_in_progress() {
    let config = QueueConfig {
        execute_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = harness_with(SimulatedPump::new(), config);
    h.pump.hold();
    h.queue.start().unwrap();

    let first = h.queue.read_status("loop", loop_source());
    h.pump.wait_parked().await;

    let later: Vec<Submission> = ["ui", "sync"]
        .into_iter()
        .map(|reason| h.queue.read_status(reason, loop_source()))
        .collect();
    for submission in &later {
        assert_eq!(
            submission.admission,
            Admission::Coalesced {
                id: submission.id().to_string(),
                into: first.id().to_string(),
            }
        );
    }
    assert!(h.queue.is_empty());

    h.pump.release();
    assert!(resolve(first).await.success);
    for submission in later {
        assert!(resolve(submission).await.success);
    }
    assert_eq!(h.pump.execution_count(CommandKind::ReadStatus), 1);

    h.queue.shutdown("test done").await;
    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].callers, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_status_reads_during_a_read_share_it() {
    let config = QueueConfig {
        execute_timeout_ms: 5_000,
        ..fast_config()
    };
    let h = harness_with(SimulatedPump::new(), config);
    h.pump.hold();
    h.queue.start().unwrap();

    let first = h.queue.read_status("loop", loop_source());
    h.pump.wait_parked().await;

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let queue = h.queue.clone();
            tokio::spawn(async move {
                queue.read_status(
                    format!("reader-{}", producer),
                    CommandSource::system(format!("producer-{}", producer)),
                )
            })
        })
        .collect();

    let mut later = Vec::new();
    for producer in producers {
        let submission = producer.await.unwrap();
        assert!(
            matches!(&submission.admission, Admission::Coalesced { into, .. } if into == first.id()),
            "unexpected admission {:?}",
            submission.admission
        );
        later.push(submission);
    }

    h.pump.release();
    assert!(resolve(first).await.success);
    for result in futures::future::join_all(later.into_iter().map(resolve)).await {
        assert!(result.success);
    }
    assert_eq!(h.pump.execution_count(CommandKind::ReadStatus), 1);
    assert_eq!(h.queue.stats().coalesced, 4);

    h.queue.shutdown("test done").await;
}

/// Enqueue through `submit` and check admission was decided at once,
/// without waiting on the pump.
fn enqueue_now(submit: impl FnOnce() -> Submission) -> Submission {
    let started = std::time::Instant::now();
    let mut submission = submit();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(50),
        "enqueue took {:?}",
        elapsed
    );
    assert!(submission.is_admitted(), "unexpected admission {:?}", submission.admission);
    assert!(submission.ticket.try_result().is_none());
    submission
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enqueue_never_waits_for_the_pump() {
    let pump = SimulatedPump::new();
    pump.fail_connect(ConnectFault::Hang);
    pump.fail_next(None, ExecuteFault::Hang { applied: false });
    let h = harness(pump);
    h.queue.start().unwrap();

    let tdds = enqueue_now(|| h.queue.load_tdds(loop_source()));

    let queue = h.queue.clone();
    wait_for(move || queue.status().executor == ExecutorState::Connecting).await;
    let bolus = enqueue_now(|| h.queue.bolus(0.5, 0.0, loop_source()));
    let temp = enqueue_now(|| h.queue.temp_basal_absolute(0.8, 30, false, loop_source()));
    let read = enqueue_now(|| h.queue.read_status("ui", loop_source()));

    let queue = h.queue.clone();
    wait_for(move || queue.status().executor == ExecutorState::Executing).await;
    let events = enqueue_now(|| h.queue.load_events(loop_source()));
    let percent = enqueue_now(|| h.queue.temp_basal_percent(120, 30, false, loop_source()));
    let history = enqueue_now(|| h.queue.load_history(3, loop_source()));

    assert!(resolve(tdds).await.success);
    assert!(resolve(bolus).await.success);
    assert_eq!(resolve(temp).await.code(), "superseded");
    assert!(resolve(read).await.success);
    assert!(resolve(events).await.success);
    assert!(resolve(percent).await.success);
    assert!(resolve(history).await.success);

    h.queue.shutdown("test done").await;
}

#[tokio::test]
async fn test_bolus_queued_before_suspend_is_refused_by_pump() {
    let h = harness(SimulatedPump::new());

    let bolus = h.queue.bolus(1.0, 0.0, loop_source());
    let stop = h.queue.stop_pump(loop_source());
    assert!(bolus.is_admitted());
    h.queue.start().unwrap();

    assert!(resolve(stop).await.success);
    let bolus = resolve(bolus).await;
    assert!(!bolus.success);
    assert!(!bolus.enacted);
    assert_eq!(bolus.code(), "execution_failed");
    assert_eq!(bolus.bolus_delivered, 0.0);
    assert!(h.pump.state().last_bolus.is_none());

    h.queue.shutdown("test done").await;
}
