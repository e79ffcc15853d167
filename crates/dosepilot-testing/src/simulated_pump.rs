//! Simulated insulin pump
//!
//! A [`PumpDriver`] backed by in-memory pump state. Faults can be scripted
//! for the next connection or the next command of a given kind, or drawn
//! at random from a seeded generator. Every call is recorded so tests can
//! assert on what actually reached the pump.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};

use dosepilot_commands::{
    ActiveExtendedBolus, ActiveTempBasal, BolusRecord, CommandKind, DeviceResponse, DriverError,
    Observed, PumpCommand, PumpDriver, PumpSnapshot,
};

/// Scripted outcome of the next connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectFault {
    Fail(String),
    Busy(String),
    /// Never answer; the caller's timeout fires.
    Hang,
}

/// Scripted outcome of a command.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteFault {
    /// Pump refuses the command cleanly.
    Reject(String),
    /// Driver-level timeout. `applied` decides whether the pump acted.
    Timeout { partial: bool, applied: bool },
    /// Radio link drops after sending.
    LinkLost { applied: bool },
    /// Never answer; the executor's timeout fires.
    Hang { applied: bool },
    /// Bolus interrupted after `delivered` units.
    PartialBolus { delivered: f64 },
}

/// Internal pump state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PumpState {
    pub suspended: bool,
    pub reservoir_units: f64,
    pub battery_percent: u8,
    pub base_basal_rate: f64,
    pub temp_basal: Option<ActiveTempBasal>,
    pub extended_bolus: Option<ActiveExtendedBolus>,
    pub last_bolus: Option<BolusRecord>,
    pub profile_name: String,
    pub user_settings: BTreeMap<String, String>,
    pub notifications: BTreeMap<String, bool>,
}

impl Default for PumpState {
    fn default() -> Self {
        Self {
            suspended: false,
            reservoir_units: 200.0,
            battery_percent: 80,
            base_basal_rate: 1.0,
            temp_basal: None,
            extended_bolus: None,
            last_bolus: None,
            profile_name: "default".to_string(),
            user_settings: BTreeMap::new(),
            notifications: BTreeMap::new(),
        }
    }
}

/// One call to `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub kind: CommandKind,
    pub description: String,
    pub at: DateTime<Utc>,
    /// `"enacted"`, `"ok"` or the error text
    pub outcome: String,
}

struct FaultScript {
    connect: VecDeque<ConnectFault>,
    execute: Vec<(Option<CommandKind>, ExecuteFault)>,
}

/// Simulated pump driver.
pub struct SimulatedPump {
    name: String,
    state: Mutex<PumpState>,
    script: Mutex<FaultScript>,
    rng: Mutex<StdRng>,
    fault_rate: f64,
    latency: Duration,
    report_bolus_history: bool,
    connected: AtomicBool,
    gate: watch::Sender<bool>,
    parked: Notify,
    executions: Mutex<Vec<ExecutionRecord>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connect_attempts: AtomicU32,
    disconnects: AtomicU32,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedPump {
    /// A healthy pump: no latency, no faults, bolus history reported.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            name: "simulated-pump".to_string(),
            state: Mutex::new(PumpState::default()),
            script: Mutex::new(FaultScript {
                connect: VecDeque::new(),
                execute: Vec::new(),
            }),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            fault_rate: 0.0,
            latency: Duration::ZERO,
            report_bolus_history: true,
            connected: AtomicBool::new(false),
            gate,
            parked: Notify::new(),
            executions: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connect_attempts: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Delay before every command takes effect.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Probability of a random fault on each connect and execute.
    pub fn with_fault_rate(mut self, rate: f64, seed: u64) -> Self {
        self.fault_rate = rate.clamp(0.0, 1.0);
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Whether status reads include the last bolus record.
    pub fn with_bolus_history(mut self, report: bool) -> Self {
        self.report_bolus_history = report;
        self
    }

    pub fn with_state(self, state: PumpState) -> Self {
        *self.state.lock() = state;
        self
    }

    /// Script the outcome of the next connection attempt.
    pub fn fail_connect(&self, fault: ConnectFault) {
        self.script.lock().connect.push_back(fault);
    }

    /// Script a fault for the next command of `kind`, or the next command
    /// of any kind when `None`.
    pub fn fail_next(&self, kind: Option<CommandKind>, fault: ExecuteFault) {
        self.script.lock().execute.push((kind, fault));
    }

    /// Park every following `execute` until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(true);
    }

    pub fn release(&self) {
        self.gate.send_replace(false);
    }

    /// Wait until an `execute` call is parked at the gate.
    pub async fn wait_parked(&self) {
        self.parked.notified().await;
    }

    pub fn state(&self) -> PumpState {
        self.state.lock().clone()
    }

    pub fn update_state<F: FnOnce(&mut PumpState)>(&self, f: F) {
        f(&mut self.state.lock());
    }

    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().clone()
    }

    /// Number of `execute` calls for `kind`.
    pub fn execution_count(&self, kind: CommandKind) -> usize {
        self.executions
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Highest number of simultaneous `execute` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// What a status read would report right now.
    pub fn snapshot(&self) -> PumpSnapshot {
        let state = self.state.lock();
        PumpSnapshot {
            read_at: Utc::now(),
            suspended: state.suspended,
            reservoir_units: Some(state.reservoir_units),
            battery_percent: Some(state.battery_percent),
            base_basal_rate: Some(state.base_basal_rate),
            temp_basal: observed(&state.temp_basal),
            extended_bolus: observed(&state.extended_bolus),
            last_bolus: if self.report_bolus_history {
                observed(&state.last_bolus)
            } else {
                Observed::Unknown
            },
            profile_name: Some(state.profile_name.clone()),
        }
    }

    fn take_execute_fault(&self, kind: CommandKind) -> Option<ExecuteFault> {
        let mut script = self.script.lock();
        let position = script
            .execute
            .iter()
            .position(|(k, _)| k.map_or(true, |k| k == kind));
        if let Some(index) = position {
            return Some(script.execute.remove(index).1);
        }
        drop(script);

        if self.fault_rate > 0.0 {
            let mut rng = self.rng.lock();
            if rng.gen_bool(self.fault_rate) {
                let applied = rng.gen_bool(0.5);
                return Some(match rng.gen_range(0..3) {
                    0 => ExecuteFault::Timeout {
                        partial: false,
                        applied,
                    },
                    1 => ExecuteFault::LinkLost { applied },
                    _ => ExecuteFault::Reject("pump busy processing".to_string()),
                });
            }
        }
        None
    }

    fn record(&self, command: &PumpCommand, outcome: impl Into<String>) {
        self.executions.lock().push(ExecutionRecord {
            kind: command.kind(),
            description: command.describe(),
            at: Utc::now(),
            outcome: outcome.into(),
        });
    }

    /// Apply `command` to the pump state.
    fn apply(&self, command: &PumpCommand) -> DeviceResponse {
        let now = Utc::now();
        let mut state = self.state.lock();
        match command {
            PumpCommand::ReadStatus { .. } => {
                drop(state);
                DeviceResponse::ok("status read").with_snapshot(self.snapshot())
            }
            PumpCommand::Bolus(bolus) | PumpCommand::SmbBolus(bolus) => {
                state.reservoir_units = (state.reservoir_units - bolus.insulin).max(0.0);
                state.last_bolus = Some(BolusRecord {
                    amount: bolus.insulin,
                    at: now,
                });
                DeviceResponse {
                    bolus_delivered: bolus.insulin,
                    ..DeviceResponse::enacted(format!("delivered {:.2}U", bolus.insulin))
                }
            }
            PumpCommand::ExtendedBolus {
                insulin,
                duration_min,
            } => {
                state.extended_bolus = Some(ActiveExtendedBolus {
                    insulin: *insulin,
                    duration_min: *duration_min,
                    started_at: now,
                });
                DeviceResponse {
                    duration_min: Some(*duration_min),
                    ..DeviceResponse::enacted("extended bolus started")
                }
            }
            PumpCommand::CancelExtendedBolus => {
                if state.extended_bolus.take().is_some() {
                    DeviceResponse::enacted("extended bolus cancelled")
                } else {
                    DeviceResponse::ok("no extended bolus running")
                }
            }
            PumpCommand::TempBasalAbsolute {
                rate,
                duration_min,
                enforce_new,
            } => {
                let same = state
                    .temp_basal
                    .as_ref()
                    .is_some_and(|t| t.absolute_rate == Some(*rate));
                let response = if same && !enforce_new {
                    DeviceResponse::ok("temp basal already running")
                } else {
                    state.temp_basal = Some(ActiveTempBasal {
                        absolute_rate: Some(*rate),
                        percent: None,
                        duration_min: *duration_min,
                        started_at: now,
                    });
                    DeviceResponse::enacted(format!("temp basal {:.2}U/h", rate))
                };
                DeviceResponse {
                    absolute_rate: Some(*rate),
                    duration_min: Some(*duration_min),
                    ..response
                }
            }
            PumpCommand::TempBasalPercent {
                percent,
                duration_min,
                enforce_new,
            } => {
                let same = state
                    .temp_basal
                    .as_ref()
                    .is_some_and(|t| t.percent == Some(*percent));
                let response = if same && !enforce_new {
                    DeviceResponse::ok("temp basal already running")
                } else {
                    state.temp_basal = Some(ActiveTempBasal {
                        absolute_rate: None,
                        percent: Some(*percent),
                        duration_min: *duration_min,
                        started_at: now,
                    });
                    DeviceResponse::enacted(format!("temp basal {}%", percent))
                };
                DeviceResponse {
                    percent: Some(*percent),
                    duration_min: Some(*duration_min),
                    ..response
                }
            }
            PumpCommand::CancelTempBasal { .. } => {
                let response = if state.temp_basal.take().is_some() {
                    DeviceResponse::enacted("temp basal cancelled")
                } else {
                    DeviceResponse::ok("no temp basal running")
                };
                DeviceResponse {
                    is_temp_cancel: true,
                    ..response
                }
            }
            PumpCommand::SetProfile(profile) => {
                state.profile_name = profile.name.clone();
                state.base_basal_rate = profile.rate_at(0);
                DeviceResponse::enacted(format!("profile {} set", profile.name))
            }
            PumpCommand::StartPump => {
                state.suspended = false;
                DeviceResponse::enacted("pump running")
            }
            PumpCommand::StopPump => {
                state.suspended = true;
                state.temp_basal = None;
                state.extended_bolus = None;
                DeviceResponse::enacted("pump suspended")
            }
            PumpCommand::LoadHistory { record_type } => {
                DeviceResponse::ok(format!("history type {} loaded", record_type))
            }
            PumpCommand::LoadEvents => DeviceResponse::ok("events loaded"),
            PumpCommand::LoadTdds => DeviceResponse::ok("TDDs loaded"),
            PumpCommand::SetUserSettings { settings } => {
                state.user_settings.extend(settings.clone());
                DeviceResponse::enacted("user settings stored")
            }
            PumpCommand::VendorSpecificNotification { key, enabled } => {
                state.notifications.insert(key.clone(), *enabled);
                DeviceResponse::enacted(format!("notification {} set", key))
            }
        }
    }

    async fn run_fault(&self, command: &PumpCommand, fault: ExecuteFault) -> DriverError {
        match fault {
            ExecuteFault::Reject(message) => DriverError::Rejected(message),
            ExecuteFault::Timeout { partial, applied } => {
                if applied {
                    self.apply(command);
                }
                DriverError::Timeout { partial }
            }
            ExecuteFault::LinkLost { applied } => {
                if applied {
                    self.apply(command);
                }
                self.connected.store(false, Ordering::SeqCst);
                DriverError::LinkLost("radio link dropped".to_string())
            }
            ExecuteFault::Hang { applied } => {
                if applied {
                    self.apply(command);
                }
                self.connected.store(false, Ordering::SeqCst);
                std::future::pending::<()>().await;
                DriverError::Timeout { partial: false }
            }
            ExecuteFault::PartialBolus { delivered } => {
                if let Some(requested) = command.bolus_units() {
                    let mut state = self.state.lock();
                    let amount = delivered.min(requested);
                    state.reservoir_units = (state.reservoir_units - amount).max(0.0);
                    state.last_bolus = Some(BolusRecord {
                        amount,
                        at: Utc::now(),
                    });
                }
                self.connected.store(false, Ordering::SeqCst);
                DriverError::LinkLost("bolus interrupted".to_string())
            }
        }
    }
}

fn observed<T: Clone>(value: &Option<T>) -> Observed<T> {
    match value {
        Some(v) => Observed::Present(v.clone()),
        None => Observed::Absent,
    }
}

impl Default for SimulatedPump {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PumpDriver for SimulatedPump {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, _timeout: Duration) -> Result<(), DriverError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let scripted = self.script.lock().connect.pop_front();
        match scripted {
            Some(ConnectFault::Fail(message)) => return Err(DriverError::ConnectionFailed(message)),
            Some(ConnectFault::Busy(message)) => return Err(DriverError::Busy(message)),
            Some(ConnectFault::Hang) => {
                std::future::pending::<()>().await;
            }
            None => {}
        }

        if self.fault_rate > 0.0 && self.rng.lock().gen_bool(self.fault_rate) {
            return Err(DriverError::ConnectionFailed("no answer from pump".to_string()));
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::trace!(pump = %self.name, "Connected");
        Ok(())
    }

    async fn execute(&self, command: &PumpCommand) -> Result<DeviceResponse, DriverError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        if *gate.borrow_and_update() {
            self.parked.notify_one();
            while *gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }

        if !self.is_connected() {
            self.record(command, "not connected");
            return Err(DriverError::NotConnected);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.take_execute_fault(command.kind()) {
            Some(fault) => {
                self.record(command, format!("fault: {:?}", fault));
                Err(self.run_fault(command, fault).await)
            }
            None if delivers_insulin(command) && self.state.lock().suspended => {
                self.record(command, "rejected: suspended");
                Err(DriverError::Rejected("pump suspended".to_string()))
            }
            None => {
                let response = self.apply(command);
                self.record(command, if response.enacted { "enacted" } else { "ok" });
                Ok(response)
            }
        }
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            tracing::trace!(pump = %self.name, "Disconnected");
        }
    }
}

fn delivers_insulin(command: &PumpCommand) -> bool {
    matches!(
        command,
        PumpCommand::Bolus(_) | PumpCommand::SmbBolus(_) | PumpCommand::ExtendedBolus { .. }
    )
}
