//! The thermostat poll cycle.
//!
//! Each cycle reads the sensor, records a sample, applies hysteresis against
//! the current state, then reconciles the recorded `heat_on` with the relay.
//! Between cycles the loop waits on its command channel, so button presses
//! and shutdown requests are executed here, one at a time.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Instant;
use thiserror::Error;

use crate::config::ControlSettings;
use crate::db::event_log::{EventLog, EventLogError};
use crate::db::models::{NewSample, Sample, StateUpdate};
use crate::hardware::{Button, HardwareError, RelayPort, SensorPort};
use crate::services::dispatch::{ButtonDispatcher, Command};

#[derive(Debug, Error)]
pub enum ControlError {
    /// A single hardware operation failed.
    #[error("hardware error: {0}")]
    Hardware(HardwareError),
    /// Hardware kept failing for this many consecutive cycles.
    #[error("hardware unavailable for {consecutive} consecutive cycles: {source}")]
    HardwareUnavailable {
        consecutive: u32,
        #[source]
        source: HardwareError,
    },
    #[error("event log: {0}")]
    EventLog(#[from] EventLogError),
    /// The event log kept failing for this many consecutive cycles.
    #[error("event log unavailable for {consecutive} consecutive cycles: {source}")]
    EventLogUnavailable {
        consecutive: u32,
        #[source]
        source: EventLogError,
    },
}

/// Outcome of the hysteresis step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No state row exists yet.
    NoTarget,
    /// Set point disabled; the relay is left alone.
    Manual,
    HeatOn,
    HeatOff,
    /// Inside the window, or already in the wanted state.
    Hold,
    SensorUnavailable,
}

/// Outcome of comparing recorded state with the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Verified,
    Corrected {
        recorded: bool,
        physical: bool,
        stale_since: DateTime<Utc>,
    },
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub sample: Option<Sample>,
    pub decision: Decision,
    pub reconciliation: Reconciliation,
}

/// What [`ControlLoop::process_pending`] drained from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pending {
    pub handled: usize,
    pub shutdown: bool,
}

pub struct ControlLoop<L, S, R> {
    log: L,
    sensor: S,
    relay: R,
    settings: ControlSettings,
    consecutive_failures: u32,
}

impl<L: EventLog, S: SensorPort, R: RelayPort> ControlLoop<L, S, R> {
    pub fn new(log: L, sensor: S, relay: R, settings: ControlSettings) -> Self {
        ControlLoop {
            log,
            sensor,
            relay,
            settings,
            consecutive_failures: 0,
        }
    }

    pub fn event_log(&mut self) -> &mut L {
        &mut self.log
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    /// Disable the set point and switch the heat off.
    pub fn reset(&mut self) -> Result<(), ControlError> {
        info!("Resetting state.");
        self.relay.off().map_err(ControlError::Hardware)?;
        if self.log.latest_state()?.is_none() {
            info!("No state recorded yet; nothing to reset");
            return Ok(());
        }
        if self.log.update_state(StateUpdate::SetPointEnabled(false))? {
            info!("Disabling set point");
        }
        self.log.update_state(StateUpdate::HeatOn(false))?;
        Ok(())
    }

    /// One poll/decide/reconcile pass.
    ///
    /// Hardware and event-log errors are counted, not returned, until they
    /// persist for `max_sensor_failures` cycles in a row.
    pub fn run_cycle(&mut self) -> Result<CycleReport, ControlError> {
        let mut failure: Option<ControlError> = None;
        let mut sample = None;
        let mut decision = Decision::SensorUnavailable;

        match self.sensor.read() {
            Ok((temp, pressure)) => {
                let row = NewSample::now(temp, Some(pressure), self.settings.location.clone());
                match self.log.append_sample(row) {
                    Ok(s) => sample = Some(s),
                    Err(e) => {
                        error!("Recording sample failed: {}", e);
                        failure = Some(e.into());
                    }
                }
                match self.decide(temp) {
                    Ok(d) => decision = d,
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            Err(e) => {
                error!("Sensor read failed: {}", e);
                failure = Some(ControlError::Hardware(e));
            }
        }

        let reconciliation = match self.reconcile() {
            Ok(r) => r,
            Err(e) => {
                failure.get_or_insert(e);
                Reconciliation::Skipped
            }
        };

        match failure {
            Some(e) => self.note_failure(e)?,
            None => self.consecutive_failures = 0,
        }

        Ok(CycleReport {
            sample,
            decision,
            reconciliation,
        })
    }

    fn note_failure(&mut self, e: ControlError) -> Result<(), ControlError> {
        self.consecutive_failures += 1;
        let limit = self.settings.max_sensor_failures.get();
        if self.consecutive_failures >= limit {
            let consecutive = self.consecutive_failures;
            return Err(match e {
                ControlError::Hardware(source) => ControlError::HardwareUnavailable { consecutive, source },
                ControlError::EventLog(source) => ControlError::EventLogUnavailable { consecutive, source },
                other => other,
            });
        }
        warn!(
            "Cycle failure {}/{} ({}); retrying next cycle",
            self.consecutive_failures, limit, e
        );
        Ok(())
    }

    fn decide(&mut self, temp: f64) -> Result<Decision, ControlError> {
        let Some(state) = self.log.latest_state()? else {
            info!("Not performing thermostat control; no target found");
            return Ok(Decision::NoTarget);
        };
        info!("Target {}; temp {:.2}", state.set_point, temp);
        if !state.set_point_enabled {
            return Ok(Decision::Manual);
        }

        let window = self.settings.temp_window;
        if temp < state.set_point - window && !state.heat_on {
            if self.log.update_state(StateUpdate::HeatOn(true))? {
                info!("Target {}; temp {:.2}: THERM ON", state.set_point, temp);
                self.relay.on().map_err(ControlError::Hardware)?;
                return Ok(Decision::HeatOn);
            }
        } else if temp > state.set_point + window
            && state.heat_on
            && self.log.update_state(StateUpdate::HeatOn(false))?
        {
            info!("Target {}; temp {:.2}: THERM OFF", state.set_point, temp);
            self.relay.off().map_err(ControlError::Hardware)?;
            return Ok(Decision::HeatOff);
        }
        Ok(Decision::Hold)
    }

    /// Make the recorded `heat_on` match the relay; the relay wins.
    fn reconcile(&mut self) -> Result<Reconciliation, ControlError> {
        let Some(state) = self.log.latest_state()? else {
            return Ok(Reconciliation::Skipped);
        };
        let physical = self.relay.is_on().map_err(ControlError::Hardware)?;
        if state.heat_on != physical {
            warn!(
                "DB state (heat_on = {} as of {}) does not match relay state is_on={}. Updating DB.",
                state.heat_on,
                state.time.to_rfc3339(),
                physical
            );
            self.log.update_state(StateUpdate::HeatOn(physical))?;
            return Ok(Reconciliation::Corrected {
                recorded: state.heat_on,
                physical,
                stale_since: state.time,
            });
        }
        let refreshed = self.log.refresh()?;
        debug!("State verified: {}", refreshed);
        Ok(Reconciliation::Verified)
    }

    /// Failed presses are logged and dropped; the next press or cycle
    /// starts from whatever the log holds.
    fn press(&mut self, dispatcher: &ButtonDispatcher, button: Button) {
        if let Err(e) = dispatcher.handle(button, &mut self.log, &mut self.relay) {
            error!("Button {} failed: {}", button, e);
        }
    }

    /// Execute commands already queued without waiting. Stops at a shutdown
    /// request and reports it.
    pub fn process_pending(&mut self, dispatcher: &ButtonDispatcher, commands: &Receiver<Command>) -> Pending {
        let mut pending = Pending::default();
        loop {
            match commands.try_recv() {
                Ok(Command::Press(button)) => {
                    self.press(dispatcher, button);
                    pending.handled += 1;
                }
                Ok(Command::Shutdown) => {
                    pending.shutdown = true;
                    return pending;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return pending,
            }
        }
    }

    /// Cycle until a [`Command::Shutdown`] arrives or an unrecoverable error.
    pub fn run(&mut self, dispatcher: &ButtonDispatcher, commands: &Receiver<Command>) -> Result<(), ControlError> {
        loop {
            let tick_start = Instant::now();
            let report = self.run_cycle()?;
            debug!("Cycle: {:?}, {:?}", report.decision, report.reconciliation);
            if self.process_pending(dispatcher, commands).shutdown {
                info!("Shutdown requested; stopping poll loop");
                return Ok(());
            }

            // Maintain steady cadence while serving queued presses
            let deadline = tick_start + self.settings.poll_interval;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match commands.recv_timeout(remaining) {
                    Ok(Command::Press(button)) => self.press(dispatcher, button),
                    Ok(Command::Shutdown) => {
                        info!("Shutdown requested; stopping poll loop");
                        return Ok(());
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        thread::sleep(remaining);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryEventLog;
    use crate::services::testing::{FakeButtons, FakeRelay, FakeSensor, FlakyLog, seed_state};
    use std::num::NonZeroU32;
    use std::sync::mpsc;
    use std::time::Duration;

    fn settings() -> ControlSettings {
        ControlSettings {
            max_sensor_failures: NonZeroU32::new(3).unwrap(),
            ..ControlSettings::default()
        }
    }

    fn control(
        log: MemoryEventLog,
        sensor: FakeSensor,
        relay: FakeRelay,
    ) -> ControlLoop<MemoryEventLog, FakeSensor, FakeRelay> {
        ControlLoop::new(log, sensor, relay, settings())
    }

    #[test]
    fn cold_room_turns_heat_on_once() {
        let mut ctl = control(seed_state(72.0, true, false), FakeSensor::steady(60.0), FakeRelay::default());
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.decision, Decision::HeatOn);
        assert_eq!(report.reconciliation, Reconciliation::Verified);
        assert_eq!(report.sample.unwrap().temp, 60.0);
        assert!(ctl.event_log().require_latest_state().unwrap().heat_on);
        assert_eq!(ctl.relay().on_calls, 1);

        for _ in 0..3 {
            assert_eq!(ctl.run_cycle().unwrap().decision, Decision::Hold);
        }
        assert_eq!(ctl.relay().on_calls, 1);
        assert_eq!(ctl.relay().off_calls, 0);
    }

    #[test]
    fn within_window_takes_no_action() {
        let mut ctl = control(seed_state(72.0, true, false), FakeSensor::steady(73.0), FakeRelay::default());
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.decision, Decision::Hold);
        let state = ctl.event_log().require_latest_state().unwrap();
        assert!(!state.heat_on);
        assert_eq!(state.set_point, 72.0);
        assert_eq!(ctl.relay().on_calls + ctl.relay().off_calls, 0);
    }

    #[test]
    fn warm_room_turns_heat_off() {
        let mut ctl = control(seed_state(72.0, true, true), FakeSensor::steady(73.5), FakeRelay::switched_on());
        assert_eq!(ctl.run_cycle().unwrap().decision, Decision::HeatOff);
        assert!(!ctl.event_log().require_latest_state().unwrap().heat_on);
        assert_eq!(ctl.relay().off_calls, 1);
        assert!(!ctl.relay().on);
    }

    #[test]
    fn manual_mode_leaves_relay_alone() {
        let mut ctl = control(seed_state(72.0, false, false), FakeSensor::steady(50.0), FakeRelay::default());
        assert_eq!(ctl.run_cycle().unwrap().decision, Decision::Manual);
        assert_eq!(ctl.relay().on_calls, 0);
        assert!(!ctl.event_log().require_latest_state().unwrap().heat_on);
    }

    #[test]
    fn no_target_records_sample_only() {
        let mut ctl = control(MemoryEventLog::new(), FakeSensor::steady(60.0), FakeRelay::default());
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.decision, Decision::NoTarget);
        assert_eq!(report.reconciliation, Reconciliation::Skipped);
        assert_eq!(ctl.event_log().sample_count(), 1);
        assert_eq!(ctl.event_log().state_count(), 0);
        assert_eq!(ctl.relay().on_calls, 0);
    }

    #[test]
    fn physical_relay_state_wins() {
        let mut log = seed_state(72.0, true, false);
        let stale = log.require_latest_state().unwrap();
        let mut ctl = control(log, FakeSensor::steady(72.0), FakeRelay::switched_on());
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.decision, Decision::Hold);
        assert_eq!(
            report.reconciliation,
            Reconciliation::Corrected {
                recorded: false,
                physical: true,
                stale_since: stale.time,
            }
        );
        assert!(ctl.event_log().require_latest_state().unwrap().heat_on);
        assert_eq!(ctl.relay().on_calls + ctl.relay().off_calls, 0);
        assert!(ctl.relay().on);
    }

    #[test]
    fn agreement_refreshes_without_changing_state() {
        let mut ctl = control(seed_state(72.0, true, false), FakeSensor::steady(72.0), FakeRelay::default());
        let before = ctl.event_log().require_latest_state().unwrap();
        assert_eq!(ctl.run_cycle().unwrap().reconciliation, Reconciliation::Verified);
        let after = ctl.event_log().require_latest_state().unwrap();
        assert_ne!(after.id, before.id);
        assert!(after.same_attributes(&before));
        assert_eq!(ctl.event_log().state_count(), 2);
    }

    #[test]
    fn transient_sensor_failures_are_retried() {
        let sensor = FakeSensor::script(&[None, None, Some(60.0), None, None, Some(60.0)]);
        let mut ctl = control(seed_state(72.0, true, false), sensor, FakeRelay::default());
        for _ in 0..6 {
            ctl.run_cycle().unwrap();
        }
        assert_eq!(ctl.event_log().sample_count(), 2);
        assert_eq!(ctl.sensor().reads, 6);
    }

    #[test]
    fn persistent_sensor_failure_is_fatal() {
        let sensor = FakeSensor::script(&[None, None, None]);
        let mut ctl = control(seed_state(72.0, true, false), sensor, FakeRelay::default());
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.decision, Decision::SensorUnavailable);
        assert!(report.sample.is_none());
        ctl.run_cycle().unwrap();
        match ctl.run_cycle() {
            Err(ControlError::HardwareUnavailable { consecutive, .. }) => assert_eq!(consecutive, 3),
            other => panic!("expected fatal hardware error, got {:?}", other),
        }
    }

    #[test]
    fn broken_relay_counts_as_hardware_failure() {
        let relay = FakeRelay {
            broken: true,
            ..FakeRelay::default()
        };
        let mut ctl = control(seed_state(72.0, true, false), FakeSensor::steady(60.0), relay);
        ctl.run_cycle().unwrap();
        ctl.run_cycle().unwrap();
        assert!(matches!(ctl.run_cycle(), Err(ControlError::HardwareUnavailable { .. })));
    }

    #[test]
    fn reset_disables_set_point_and_heat() {
        let mut ctl = control(seed_state(72.0, true, true), FakeSensor::steady(60.0), FakeRelay::switched_on());
        ctl.reset().unwrap();
        let state = ctl.event_log().require_latest_state().unwrap();
        assert!(!state.set_point_enabled);
        assert!(!state.heat_on);
        assert!(!ctl.relay().on);
    }

    #[test]
    fn up_pressed_on_foreign_thread_runs_on_control_loop() {
        let (tx, rx) = mpsc::channel();
        let dispatcher = ButtonDispatcher::new(0.5);
        let mut registration = dispatcher.register(FakeButtons::default(), &tx).unwrap();
        let up = registration.port_mut().callbacks.remove(&Button::Up).unwrap();
        let mut ctl = control(seed_state(72.0, false, false), FakeSensor::steady(72.0), FakeRelay::default());

        std::thread::spawn(move || up()).join().unwrap();
        // nothing has touched the log until the loop drains its queue
        assert_eq!(ctl.event_log().require_latest_state().unwrap().set_point, 72.0);

        assert_eq!(
            ctl.process_pending(&dispatcher, &rx),
            Pending {
                handled: 1,
                shutdown: false
            }
        );
        let state = ctl.event_log().require_latest_state().unwrap();
        assert_eq!(state.set_point, 72.5);
        assert!(state.set_point_enabled);
    }

    #[test]
    fn run_serves_presses_in_order_until_shutdown() {
        let (tx, rx) = mpsc::channel();
        let dispatcher = ButtonDispatcher::new(0.5);
        let settings = ControlSettings {
            poll_interval: Duration::from_secs(30),
            ..settings()
        };
        let mut ctl = ControlLoop::new(
            seed_state(72.0, true, false),
            FakeSensor::steady(72.0),
            FakeRelay::default(),
            settings,
        );
        tx.send(Command::Press(Button::Up)).unwrap();
        tx.send(Command::Press(Button::Up)).unwrap();
        tx.send(Command::Press(Button::Down)).unwrap();
        tx.send(Command::Shutdown).unwrap();

        let started = Instant::now();
        ctl.run(&dispatcher, &rx).unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(ctl.sensor().reads, 1);
        assert_eq!(ctl.event_log().require_latest_state().unwrap().set_point, 72.5);
    }

    #[test]
    fn queued_shutdown_is_reported_after_presses() {
        let (tx, rx) = mpsc::channel();
        let dispatcher = ButtonDispatcher::new(0.5);
        let mut ctl = control(seed_state(72.0, true, false), FakeSensor::steady(72.0), FakeRelay::default());
        tx.send(Command::Press(Button::Up)).unwrap();
        tx.send(Command::Shutdown).unwrap();
        tx.send(Command::Press(Button::Up)).unwrap();

        let pending = ctl.process_pending(&dispatcher, &rx);
        assert_eq!(
            pending,
            Pending {
                handled: 1,
                shutdown: true
            }
        );
        assert_eq!(ctl.event_log().require_latest_state().unwrap().set_point, 72.5);

        let (tx, rx) = mpsc::channel();
        tx.send(Command::Shutdown).unwrap();
        assert_eq!(
            ctl.process_pending(&dispatcher, &rx),
            Pending {
                handled: 0,
                shutdown: true
            }
        );
    }

    #[test]
    fn failed_refresh_does_not_stop_the_loop() {
        let log = FlakyLog {
            refresh_failures: 1,
            ..FlakyLog::new(seed_state(72.0, true, false))
        };
        let mut ctl = ControlLoop::new(log, FakeSensor::steady(72.0), FakeRelay::default(), settings());
        let report = ctl.run_cycle().unwrap();
        assert_eq!(report.reconciliation, Reconciliation::Skipped);
        assert!(report.sample.is_some());
        assert_eq!(ctl.run_cycle().unwrap().reconciliation, Reconciliation::Verified);
        assert_eq!(ctl.event_log().inner.state_count(), 2);
    }

    #[test]
    fn run_survives_event_log_error_until_shutdown() {
        let (tx, rx) = mpsc::channel();
        let dispatcher = ButtonDispatcher::new(0.5);
        let log = FlakyLog {
            refresh_failures: 1,
            append_failures: 1,
            ..FlakyLog::new(seed_state(72.0, true, false))
        };
        let mut ctl = ControlLoop::new(log, FakeSensor::steady(72.0), FakeRelay::default(), settings());
        tx.send(Command::Shutdown).unwrap();
        ctl.run(&dispatcher, &rx).unwrap();
        assert_eq!(ctl.sensor().reads, 1);
        assert_eq!(ctl.event_log().inner.sample_count(), 0);
    }

    #[test]
    fn persistent_event_log_failure_is_fatal() {
        let log = FlakyLog {
            refresh_failures: u32::MAX,
            ..FlakyLog::new(seed_state(72.0, true, false))
        };
        let mut ctl = ControlLoop::new(log, FakeSensor::steady(72.0), FakeRelay::default(), settings());
        ctl.run_cycle().unwrap();
        ctl.run_cycle().unwrap();
        match ctl.run_cycle() {
            Err(ControlError::EventLogUnavailable { consecutive, .. }) => assert_eq!(consecutive, 3),
            other => panic!("expected fatal event log error, got {:?}", other),
        }
    }

    #[test]
    fn failed_press_is_logged_not_fatal() {
        let (tx, rx) = mpsc::channel();
        let dispatcher = ButtonDispatcher::new(0.5);
        let relay = FakeRelay {
            broken: true,
            ..FakeRelay::default()
        };
        let mut ctl = control(seed_state(72.0, true, false), FakeSensor::steady(72.0), relay);
        tx.send(Command::Press(Button::OnOff)).unwrap();
        tx.send(Command::Press(Button::Up)).unwrap();
        let pending = ctl.process_pending(&dispatcher, &rx);
        assert_eq!(pending.handled, 2);
        assert_eq!(ctl.event_log().require_latest_state().unwrap().set_point, 72.5);
    }
}
