//! PostgreSQL-backed [`EventLog`].

use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::info;

use crate::db::event_log::{EventLog, EventLogError, next_timestamp, retry_serializable};
use crate::db::models::{NewSample, NewState, Sample, State, StateUpdate};
use crate::schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub struct PgEventLog {
    conn: PgConnection,
}

impl PgEventLog {
    pub fn connect(database_url: &str) -> Result<Self, EventLogError> {
        let conn = PgConnection::establish(database_url)?;
        Ok(PgEventLog { conn })
    }

    pub fn apply_migrations(&mut self) -> Result<(), EventLogError> {
        let applied = self
            .conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| EventLogError::Migration(e.to_string()))?;
        if applied.is_empty() {
            info!("Database schema is up to date; no migrations were applied");
        } else {
            let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
            info!("Applied {} database migration(s): {}", applied.len(), names);
        }
        Ok(())
    }

    /// Revert every applied migration, dropping both tables.
    pub fn drop_schema(&mut self) -> Result<usize, EventLogError> {
        let reverted = self
            .conn
            .revert_all_migrations(MIGRATIONS)
            .map_err(|e| EventLogError::Migration(e.to_string()))?;
        let names = reverted.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Reverted {} database migration(s): {}", reverted.len(), names);
        Ok(reverted.len())
    }

    /// Delete every row from both tables. Returns (samples, states) removed.
    pub fn truncate(&mut self) -> Result<(usize, usize), EventLogError> {
        self.conn.transaction(|conn| {
            let samples = diesel::delete(schema::sample::table).execute(conn)?;
            let states = diesel::delete(schema::state::table).execute(conn)?;
            Ok((samples, states))
        })
    }
}

fn load_latest_states(conn: &mut PgConnection, limit: i64, location: Option<&str>) -> QueryResult<Vec<State>> {
    use schema::state::dsl as T;

    let mut query = T::state
        .select(State::as_select())
        .order((T::time.desc(), T::id.desc()))
        .limit(limit)
        .into_boxed();
    if let Some(loc) = location {
        query = query.filter(T::location.eq(loc));
    }
    let mut rows = query.load::<State>(conn)?;
    rows.reverse();
    Ok(rows)
}

fn insert_state_row(conn: &mut PgConnection, row: &NewState) -> QueryResult<State> {
    diesel::insert_into(schema::state::table)
        .values(row)
        .returning(State::as_returning())
        .get_result(conn)
}

impl EventLog for PgEventLog {
    fn append_sample(&mut self, sample: NewSample) -> Result<Sample, EventLogError> {
        let row = diesel::insert_into(schema::sample::table)
            .values(&sample)
            .returning(Sample::as_returning())
            .get_result(&mut self.conn)?;
        Ok(row)
    }

    fn latest_samples(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<Sample>, EventLogError> {
        use schema::sample::dsl as S;

        let mut query = S::sample
            .select(Sample::as_select())
            .order((S::time.desc(), S::id.desc()))
            .limit(limit)
            .into_boxed();
        if let Some(loc) = location {
            query = query.filter(S::location.eq(loc));
        }
        let mut rows = query.load::<Sample>(&mut self.conn)?;
        rows.reverse();
        Ok(rows)
    }

    fn samples_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Sample>, EventLogError> {
        use schema::sample::dsl as S;

        let mut query = S::sample
            .select(Sample::as_select())
            .filter(S::time.ge(t_min))
            .order((S::time.asc(), S::id.asc()))
            .limit(limit)
            .into_boxed();
        if let Some(t_max) = t_max {
            query = query.filter(S::time.lt(t_max));
        }
        Ok(query.load::<Sample>(&mut self.conn)?)
    }

    fn insert_state(&mut self, state: NewState) -> Result<State, EventLogError> {
        Ok(insert_state_row(&mut self.conn, &state)?)
    }

    fn latest_states(&mut self, limit: i64, location: Option<&str>) -> Result<Vec<State>, EventLogError> {
        Ok(load_latest_states(&mut self.conn, limit, location)?)
    }

    fn states_since(
        &mut self,
        t_min: DateTime<Utc>,
        t_max: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<State>, EventLogError> {
        use schema::state::dsl as T;

        let mut query = T::state
            .select(State::as_select())
            .filter(T::time.ge(t_min))
            .order((T::time.asc(), T::id.asc()))
            .limit(limit)
            .into_boxed();
        if let Some(t_max) = t_max {
            query = query.filter(T::time.lt(t_max));
        }
        Ok(query.load::<State>(&mut self.conn)?)
    }

    fn state_at(&mut self, time: DateTime<Utc>) -> Result<Option<State>, EventLogError> {
        use schema::state::dsl as T;

        Ok(T::state
            .select(State::as_select())
            .filter(T::time.le(time))
            .order((T::time.desc(), T::id.desc()))
            .first::<State>(&mut self.conn)
            .optional()?)
    }

    fn update_state(&mut self, update: StateUpdate) -> Result<bool, EventLogError> {
        // SERIALIZABLE so two writers cannot both append from the same current row.
        retry_serializable(|| {
            self.conn.build_transaction().serializable().run(|conn| {
                let current = load_latest_states(conn, 1, None)?
                    .pop()
                    .ok_or(EventLogError::NotFound("state"))?;
                match update.next_row(&current, next_timestamp(Some(current.time))) {
                    Some(row) => {
                        insert_state_row(conn, &row)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
        })
    }

    fn refresh(&mut self) -> Result<State, EventLogError> {
        retry_serializable(|| {
            self.conn.build_transaction().serializable().run(|conn| {
                let current = load_latest_states(conn, 1, None)?
                    .pop()
                    .ok_or(EventLogError::NotFound("state"))?;
                let row = current.successor(next_timestamp(Some(current.time)));
                Ok(insert_state_row(conn, &row)?)
            })
        })
    }
}
