//! Diesel model structs for the two append-only tables.
//!
//! Rows are never updated in place. A control-state change is always a new
//! `state` row built from the current one (see [`StateUpdate`]).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schema;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::sample)]
pub struct Sample {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub temp: f64,
    pub pressure: Option<f64>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::sample)]
pub struct NewSample {
    pub time: DateTime<Utc>,
    pub temp: f64,
    pub pressure: Option<f64>,
    pub location: Option<String>,
}

impl NewSample {
    /// A sample stamped with the current time.
    pub fn now(temp: f64, pressure: Option<f64>, location: Option<String>) -> Self {
        NewSample {
            time: Utc::now(),
            temp,
            pressure,
            location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::state)]
pub struct State {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub set_point: f64,
    pub set_point_enabled: bool,
    pub heat_on: bool,
    pub location: Option<String>,
}

impl State {
    /// Copy every attribute except the surrogate key into a row stamped `time`.
    pub fn successor(&self, time: DateTime<Utc>) -> NewState {
        NewState {
            time,
            set_point: self.set_point,
            set_point_enabled: self.set_point_enabled,
            heat_on: self.heat_on,
            location: self.location.clone(),
        }
    }

    /// True when both rows carry the same logical attributes.
    pub fn same_attributes(&self, other: &State) -> bool {
        self.set_point == other.set_point
            && self.set_point_enabled == other.set_point_enabled
            && self.heat_on == other.heat_on
            && self.location == other.location
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<State {}: Set {}, Set temp {}, Heat on {}>",
            self.time.format("%Y-%m-%d %H:%M"),
            self.set_point_enabled,
            self.set_point,
            self.heat_on
        )
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::state)]
pub struct NewState {
    pub time: DateTime<Utc>,
    pub set_point: f64,
    pub set_point_enabled: bool,
    pub heat_on: bool,
    pub location: Option<String>,
}

impl NewState {
    pub fn initial(set_point: f64, set_point_enabled: bool) -> Self {
        NewState {
            time: Utc::now(),
            set_point,
            set_point_enabled,
            heat_on: false,
            location: None,
        }
    }
}

/// The closed set of mutations a `state` row can undergo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateUpdate {
    SetPoint(f64),
    SetPointEnabled(bool),
    HeatOn(bool),
}

impl StateUpdate {
    /// Whether `current` already holds this value.
    pub fn is_noop_for(&self, current: &State) -> bool {
        match *self {
            StateUpdate::SetPoint(v) => current.set_point == v,
            StateUpdate::SetPointEnabled(v) => current.set_point_enabled == v,
            StateUpdate::HeatOn(v) => current.heat_on == v,
        }
    }

    /// The row to append, or `None` when the value is unchanged.
    pub fn next_row(&self, current: &State, time: DateTime<Utc>) -> Option<NewState> {
        if self.is_noop_for(current) {
            return None;
        }
        let mut row = current.successor(time);
        match *self {
            StateUpdate::SetPoint(v) => row.set_point = v,
            StateUpdate::SetPointEnabled(v) => row.set_point_enabled = v,
            StateUpdate::HeatOn(v) => row.heat_on = v,
        }
        Some(row)
    }
}

impl fmt::Display for StateUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateUpdate::SetPoint(v) => write!(f, "set_point = {}", v),
            StateUpdate::SetPointEnabled(v) => write!(f, "set_point_enabled = {}", v),
            StateUpdate::HeatOn(v) => write!(f, "heat_on = {}", v),
        }
    }
}
