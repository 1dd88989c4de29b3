//! Port fakes shared by the service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use diesel::result::{DatabaseErrorKind, Error as DieselError};

use crate::db::event_log::{EventLog, EventLogError};
use crate::db::memory::MemoryEventLog;
use crate::db::models::{NewSample, NewState, Sample, State, StateUpdate};
use crate::hardware::{Button, ButtonCallback, ButtonPort, HardwareError, RelayPort, SensorPort};

pub fn seed_state(set_point: f64, set_point_enabled: bool, heat_on: bool) -> MemoryEventLog {
    let mut log = MemoryEventLog::new();
    log.insert_state(NewState {
        heat_on,
        ..NewState::initial(set_point, set_point_enabled)
    })
    .unwrap();
    log
}

/// Memory log whose writes fail a set number of times before succeeding.
pub struct FlakyLog {
    pub inner: MemoryEventLog,
    pub append_failures: u32,
    pub refresh_failures: u32,
}

impl FlakyLog {
    pub fn new(inner: MemoryEventLog) -> Self {
        FlakyLog {
            inner,
            append_failures: 0,
            refresh_failures: 0,
        }
    }
}

fn fail_once(remaining: &mut u32) -> Result<(), EventLogError> {
    if *remaining == 0 {
        return Ok(());
    }
    *remaining -= 1;
    Err(EventLogError::Database(DieselError::DatabaseError(
        DatabaseErrorKind::ClosedConnection,
        Box::new("connection reset".to_string()),
    )))
}

impl EventLog for FlakyLog {
    fn append_sample(&mut self, sample: NewSample) -> Result<Sample, EventLogError> {
        fail_once(&mut self.append_failures)?;
        self.inner.append_sample(sample)
    }

    fn latest_samples(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<Sample>, EventLogError> {
        self.inner.latest_samples(limit, location)
    }

    fn samples_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Sample>, EventLogError> {
        self.inner.samples_since(t_min, t_max, limit)
    }

    fn insert_state(&mut self, state: NewState) -> Result<State, EventLogError> {
        self.inner.insert_state(state)
    }

    fn latest_states(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<State>, EventLogError> {
        self.inner.latest_states(limit, location)
    }

    fn states_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<State>, EventLogError> {
        self.inner.states_since(t_min, t_max, limit)
    }

    fn state_at(&mut self, time: DateTime<Utc>) -> Result<Option<State>, EventLogError> {
        self.inner.state_at(time)
    }

    fn update_state(&mut self, update: StateUpdate) -> Result<bool, EventLogError> {
        self.inner.update_state(update)
    }

    fn refresh(&mut self) -> Result<State, EventLogError> {
        fail_once(&mut self.refresh_failures)?;
        self.inner.refresh()
    }
}

/// Replays scripted readings, then repeats the last successful temperature.
pub struct FakeSensor {
    script: VecDeque<Result<f64, ()>>,
    last: f64,
    pub reads: usize,
}

impl FakeSensor {
    pub fn steady(temp: f64) -> Self {
        FakeSensor {
            script: VecDeque::new(),
            last: temp,
            reads: 0,
        }
    }

    /// `None` entries fail.
    pub fn script(readings: &[Option<f64>]) -> Self {
        FakeSensor {
            script: readings.iter().map(|r| r.ok_or(())).collect(),
            last: readings.iter().flatten().next().copied().unwrap_or(70.0),
            reads: 0,
        }
    }
}

impl SensorPort for FakeSensor {
    fn read(&mut self) -> Result<(f64, f64), HardwareError> {
        self.reads += 1;
        match self.script.pop_front() {
            Some(Ok(temp)) => {
                self.last = temp;
                Ok((temp, 101.0))
            }
            Some(Err(())) => Err(HardwareError::Bus("sensor unreachable".into())),
            None => Ok((self.last, 101.0)),
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeRelay {
    pub on: bool,
    pub on_calls: usize,
    pub off_calls: usize,
    pub broken: bool,
}

impl FakeRelay {
    pub fn switched_on() -> Self {
        FakeRelay {
            on: true,
            ..Default::default()
        }
    }

    fn check(&self) -> Result<(), HardwareError> {
        if self.broken {
            Err(HardwareError::Gpio("relay unreachable".into()))
        } else {
            Ok(())
        }
    }
}

impl RelayPort for FakeRelay {
    fn on(&mut self) -> Result<(), HardwareError> {
        self.check()?;
        self.on_calls += 1;
        self.on = true;
        Ok(())
    }

    fn off(&mut self) -> Result<(), HardwareError> {
        self.check()?;
        self.off_calls += 1;
        self.on = false;
        Ok(())
    }

    fn is_on(&mut self) -> Result<bool, HardwareError> {
        self.check()?;
        Ok(self.on)
    }
}

#[derive(Default)]
pub struct FakeButtons {
    pub callbacks: HashMap<Button, ButtonCallback>,
    pub cleaned: Arc<AtomicBool>,
}

impl FakeButtons {
    pub fn press(&self, button: Button) {
        if let Some(callback) = self.callbacks.get(&button) {
            callback();
        }
    }
}

impl ButtonPort for FakeButtons {
    fn register(&mut self, button: Button, callback: ButtonCallback) -> Result<(), HardwareError> {
        self.callbacks.insert(button, callback);
        Ok(())
    }

    fn cleanup(&mut self) {
        self.callbacks.clear();
        self.cleaned.store(true, Ordering::SeqCst);
    }
}
