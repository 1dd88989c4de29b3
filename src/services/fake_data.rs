use crate::db::event_log::{EventLog, EventLogError};
use crate::db::models::{NewSample, NewState};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::info;
use rand::Rng;

const HOURS: i64 = 10;
const FINE_PER_HOUR: i64 = 5;
const FINE_STEP_MINUTES: i64 = 10;
const DEMO_SET_POINT: f64 = 72.0;

/// What [`populate`] wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Populated {
    pub samples: usize,
    pub states: usize,
}

pub fn demo_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 6, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Demo history: hourly base temperatures, each spread into jittered
/// ten-minute samples, plus one enabled set point.
pub fn demo_samples<R: Rng>(rng: &mut R, start: DateTime<Utc>, location: Option<&str>) -> Vec<NewSample> {
    let mut rows = Vec::with_capacity((HOURS * FINE_PER_HOUR) as usize);
    for hour in 0..HOURS {
        let base_time = start + Duration::hours(hour);
        let base_temp = f64::from(rng.random_range(40..80));
        for i in 1..=FINE_PER_HOUR {
            let jitter = rng.random_range(-4..4);
            rows.push(NewSample {
                time: base_time + Duration::minutes(FINE_STEP_MINUTES * i + jitter),
                temp: base_temp + rng.random::<f64>(),
                pressure: None,
                location: location.map(str::to_string),
            });
        }
    }
    rows
}

pub fn populate<L: EventLog, R: Rng>(
    log: &mut L,
    rng: &mut R,
    location: Option<&str>,
) -> Result<Populated, EventLogError> {
    let start = demo_start();
    let samples = demo_samples(rng, start, location);
    for sample in &samples {
        log.append_sample(sample.clone())?;
    }
    info!("Fake data: added {} samples from {}", samples.len(), start);

    let state = log.insert_state(NewState {
        time: start,
        location: location.map(str::to_string),
        ..NewState::initial(DEMO_SET_POINT, true)
    })?;
    info!("Fake data: added 1 state {}", state);

    Ok(Populated {
        samples: samples.len(),
        states: 1,
    })
}
