//! The append-only history of samples and control states.
//!
//! [`EventLog`] is the only write path for both tables. `update_state` is the
//! single read-modify-write primitive: it compares one attribute of the
//! current state against the requested value and appends a copy only when
//! they differ. Implementations must make that compare-and-append atomic.

use chrono::{DateTime, Utc};
use diesel::result::DatabaseErrorKind;
use log::warn;
use thiserror::Error;

use crate::db::models::{NewSample, NewState, Sample, State, StateUpdate};

/// Default row cap for range queries.
pub const SINCE_LIMIT: i64 = 10_000;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("database connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("applying database migrations failed: {0}")]
    Migration(String),
    /// A strict lookup found no row in the named table.
    #[error("no {0} row found")]
    NotFound(&'static str),
}

impl EventLogError {
    /// A concurrent writer won a SERIALIZABLE conflict; the transaction may be retried.
    pub fn is_serialization_failure(&self) -> bool {
        matches!(
            self,
            EventLogError::Database(diesel::result::Error::DatabaseError(
                DatabaseErrorKind::SerializationFailure,
                _
            ))
        )
    }
}

/// Attempts made by [`retry_serializable`] before giving up.
pub const SERIALIZABLE_ATTEMPTS: u32 = 5;

/// Run `transaction` again while it loses serialization conflicts, up to
/// [`SERIALIZABLE_ATTEMPTS`] times. Other errors are returned at once.
pub fn retry_serializable<T>(mut transaction: impl FnMut() -> Result<T, EventLogError>) -> Result<T, EventLogError> {
    let mut attempt = 1;
    loop {
        match transaction() {
            Err(e) if e.is_serialization_failure() && attempt < SERIALIZABLE_ATTEMPTS => {
                warn!("Serialization conflict (attempt {}/{}); retrying", attempt, SERIALIZABLE_ATTEMPTS);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Timestamp for a row appended after `previous`; never earlier than it.
pub fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev > now => prev,
        _ => now,
    }
}

pub trait EventLog {
    fn append_sample(&mut self, sample: NewSample) -> Result<Sample, EventLogError>;

    /// Up to `limit` most recent samples, returned oldest first.
    fn latest_samples(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<Sample>, EventLogError>;

    /// Samples with `t_min <= time < t_max`, oldest first.
    fn samples_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Sample>, EventLogError>;

    /// Append a state row as given. Used to seed the first state.
    fn insert_state(&mut self, state: NewState) -> Result<State, EventLogError>;

    /// Up to `limit` most recent states, returned oldest first.
    fn latest_states(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<State>, EventLogError>;

    fn states_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<State>, EventLogError>;

    /// The state in force at `time`: the latest row at or before it.
    fn state_at(&mut self, time: DateTime<Utc>) -> Result<Option<State>, EventLogError>;

    /// Append a copy of the current state with one attribute replaced.
    ///
    /// Returns `false` without writing when the attribute already holds the
    /// value. Fails with [`EventLogError::NotFound`] when no state exists.
    fn update_state(&mut self, update: StateUpdate) -> Result<bool, EventLogError>;

    /// Re-append the current state unchanged with a fresh timestamp.
    fn refresh(&mut self) -> Result<State, EventLogError>;

    fn latest_sample(&mut self, location: Option<&str>) -> Result<Option<Sample>, EventLogError> {
        Ok(self.latest_samples(1, location)?.pop())
    }

    fn latest_state(&mut self) -> Result<Option<State>, EventLogError> {
        Ok(self.latest_states(1, None)?.pop())
    }

    fn require_latest_state(&mut self) -> Result<State, EventLogError> {
        self.latest_state()?.ok_or(EventLogError::NotFound("state"))
    }
}
