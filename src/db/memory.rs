//! In-process [`EventLog`] with the same ordering and update semantics as the
//! PostgreSQL one. Backs the test suite and `poll --memory`.

use chrono::{DateTime, Utc};

use crate::db::event_log::{EventLog, EventLogError, next_timestamp};
use crate::db::models::{NewSample, NewState, Sample, State, StateUpdate};

#[derive(Debug, Default)]
pub struct MemoryEventLog {
    samples: Vec<Sample>,
    states: Vec<State>,
    next_sample_id: i64,
    next_state_id: i64,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    fn current_state(&self) -> Option<&State> {
        self.states.iter().max_by_key(|s| (s.time, s.id))
    }

    fn push_state(&mut self, row: NewState) -> State {
        self.next_state_id += 1;
        let state = State {
            id: self.next_state_id,
            time: row.time,
            set_point: row.set_point,
            set_point_enabled: row.set_point_enabled,
            heat_on: row.heat_on,
            location: row.location,
        };
        self.states.push(state.clone());
        state
    }
}

/// The last `limit` rows by (time, id), oldest first.
fn latest_of<T: Clone, K: Ord>(rows: impl Iterator<Item = T>, limit: i64, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|r| key(r));
    let keep = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
    let skip = rows.len().saturating_sub(keep);
    rows.split_off(skip)
}

fn in_range(time: DateTime<Utc>, t_min: DateTime<Utc>, t_max: Option<DateTime<Utc>>) -> bool {
    time >= t_min && t_max.is_none_or(|t_max| time < t_max)
}

fn capped(limit: i64) -> usize {
    usize::try_from(limit.max(0)).unwrap_or(usize::MAX)
}

impl EventLog for MemoryEventLog {
    fn append_sample(&mut self, sample: NewSample) -> Result<Sample, EventLogError> {
        self.next_sample_id += 1;
        let row = Sample {
            id: self.next_sample_id,
            time: sample.time,
            temp: sample.temp,
            pressure: sample.pressure,
            location: sample.location,
        };
        self.samples.push(row.clone());
        Ok(row)
    }

    fn latest_samples(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<Sample>, EventLogError> {
        let rows = self
            .samples
            .iter()
            .filter(|s| location.is_none_or(|loc| s.location.as_deref() == Some(loc)))
            .cloned();
        Ok(latest_of(rows, limit, |s| (s.time, s.id)))
    }

    fn samples_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Sample>, EventLogError> {
        let mut rows: Vec<Sample> = self
            .samples
            .iter()
            .filter(|s| in_range(s.time, t_min, t_max))
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.time, s.id));
        rows.truncate(capped(limit));
        Ok(rows)
    }

    fn insert_state(&mut self, state: NewState) -> Result<State, EventLogError> {
        Ok(self.push_state(state))
    }

    fn latest_states(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<State>, EventLogError> {
        let rows = self
            .states
            .iter()
            .filter(|s| location.is_none_or(|loc| s.location.as_deref() == Some(loc)))
            .cloned();
        Ok(latest_of(rows, limit, |s| (s.time, s.id)))
    }

    fn states_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<State>, EventLogError> {
        let mut rows: Vec<State> = self
            .states
            .iter()
            .filter(|s| in_range(s.time, t_min, t_max))
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.time, s.id));
        rows.truncate(capped(limit));
        Ok(rows)
    }

    fn state_at(&mut self, time: DateTime<Utc>) -> Result<Option<State>, EventLogError> {
        Ok(self
            .states
            .iter()
            .filter(|s| s.time <= time)
            .max_by_key(|s| (s.time, s.id))
            .cloned())
    }

    fn update_state(&mut self, update: StateUpdate) -> Result<bool, EventLogError> {
        let current = self.current_state().ok_or(EventLogError::NotFound("state"))?;
        match update.next_row(current, next_timestamp(Some(current.time))) {
            Some(row) => {
                self.push_state(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn refresh(&mut self) -> Result<State, EventLogError> {
        let current = self.current_state().ok_or(EventLogError::NotFound("state"))?;
        let row = current.successor(next_timestamp(Some(current.time)));
        Ok(self.push_state(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0).unwrap()
    }

    fn seeded() -> MemoryEventLog {
        let mut log = MemoryEventLog::new();
        log.insert_state(NewState {
            time: start(),
            set_point: 72.0,
            set_point_enabled: true,
            heat_on: false,
            location: None,
        })
        .unwrap();
        log
    }

    fn sample_at(minutes: i64, temp: f64) -> NewSample {
        NewSample {
            time: start() + Duration::minutes(minutes),
            temp,
            pressure: None,
            location: None,
        }
    }

    #[test]
    fn latest_on_empty_log_is_absent() {
        let mut log = MemoryEventLog::new();
        assert!(log.latest_state().unwrap().is_none());
        assert!(log.latest_sample(None).unwrap().is_none());
        assert!(matches!(log.require_latest_state(), Err(EventLogError::NotFound("state"))));
    }

    #[test]
    fn repeated_identical_writes_do_not_append() {
        let mut log = seeded();
        let before = log.require_latest_state().unwrap();
        for _ in 0..5 {
            assert!(!log.update_state(StateUpdate::SetPoint(72.0)).unwrap());
            assert!(!log.update_state(StateUpdate::SetPointEnabled(true)).unwrap());
            assert!(!log.update_state(StateUpdate::HeatOn(false)).unwrap());
        }
        assert_eq!(log.state_count(), 1);
        assert_eq!(log.require_latest_state().unwrap(), before);
    }

    #[test]
    fn distinct_writes_append_one_row_each() {
        let mut log = seeded();
        let updates = [
            StateUpdate::HeatOn(true),
            StateUpdate::SetPoint(68.5),
            StateUpdate::SetPointEnabled(false),
            StateUpdate::HeatOn(false),
            StateUpdate::SetPoint(70.0),
        ];
        for (i, update) in updates.iter().enumerate() {
            assert!(log.update_state(*update).unwrap());
            assert_eq!(log.state_count(), i + 2);
            let latest = log.require_latest_state().unwrap();
            assert!(update.is_noop_for(&latest), "latest should hold {}", update);
        }
        let latest = log.require_latest_state().unwrap();
        assert_eq!(latest.set_point, 70.0);
        assert!(!latest.set_point_enabled);
        assert!(!latest.heat_on);
    }

    #[test]
    fn update_without_state_is_not_found() {
        let mut log = MemoryEventLog::new();
        assert!(matches!(
            log.update_state(StateUpdate::HeatOn(true)),
            Err(EventLogError::NotFound("state"))
        ));
        assert_eq!(log.state_count(), 0);
    }

    #[test]
    fn refresh_appends_identical_attributes() {
        let mut log = seeded();
        let before = log.require_latest_state().unwrap();
        let refreshed = log.refresh().unwrap();
        assert_eq!(log.state_count(), 2);
        assert_ne!(refreshed.id, before.id);
        assert!(refreshed.time >= before.time);
        assert!(refreshed.same_attributes(&before));
        assert_eq!(log.require_latest_state().unwrap().id, refreshed.id);
    }

    #[test]
    fn latest_many_is_oldest_first() {
        let mut log = MemoryEventLog::new();
        for i in 0..20 {
            log.append_sample(sample_at(i * 10, 60.0 + i as f64)).unwrap();
        }
        let latest = log.latest_samples(5, None).unwrap();
        let temps: Vec<f64> = latest.iter().map(|s| s.temp).collect();
        assert_eq!(temps, vec![75.0, 76.0, 77.0, 78.0, 79.0]);
        assert_eq!(log.latest_sample(None).unwrap().unwrap().temp, 79.0);
    }

    #[test]
    fn latest_ties_break_on_highest_id() {
        let mut log = MemoryEventLog::new();
        log.append_sample(sample_at(0, 60.0)).unwrap();
        log.append_sample(sample_at(0, 61.0)).unwrap();
        assert_eq!(log.latest_sample(None).unwrap().unwrap().temp, 61.0);
    }

    #[test]
    fn latest_filters_by_location() {
        let mut log = MemoryEventLog::new();
        let mut attic = sample_at(0, 50.0);
        attic.location = Some("attic".into());
        log.append_sample(attic).unwrap();
        log.append_sample(sample_at(5, 70.0)).unwrap();
        assert_eq!(log.latest_sample(Some("attic")).unwrap().unwrap().temp, 50.0);
        assert!(log.latest_sample(Some("cellar")).unwrap().is_none());
    }

    #[test]
    fn since_is_half_open_ascending_and_capped() {
        let mut log = MemoryEventLog::new();
        for i in (0..10).rev() {
            log.append_sample(sample_at(i * 10, i as f64)).unwrap();
        }
        let rows = log
            .samples_since(start() + Duration::minutes(20), Some(start() + Duration::minutes(60)), 100)
            .unwrap();
        let temps: Vec<f64> = rows.iter().map(|s| s.temp).collect();
        assert_eq!(temps, vec![2.0, 3.0, 4.0, 5.0]);

        let capped = log.samples_since(start(), None, 3).unwrap();
        assert_eq!(capped.len(), 3);
        assert_eq!(capped[0].temp, 0.0);
    }

    #[test]
    fn state_at_is_latest_at_or_before() {
        let mut log = seeded();
        log.insert_state(NewState {
            time: start() + Duration::minutes(30),
            set_point: 68.0,
            set_point_enabled: true,
            heat_on: false,
            location: None,
        })
        .unwrap();
        assert!(log.state_at(start() - Duration::minutes(1)).unwrap().is_none());
        assert_eq!(log.state_at(start()).unwrap().unwrap().set_point, 72.0);
        assert_eq!(log.state_at(start() + Duration::minutes(29)).unwrap().unwrap().set_point, 72.0);
        assert_eq!(log.state_at(start() + Duration::hours(5)).unwrap().unwrap().set_point, 68.0);
    }
}
