use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use super::table::{schema_sql, BatchTable, ACTIONS_TABLE, DATA_TABLE};
use super::{BatchCodec, Error, TimeseriesConfig};
use crate::query::Transforms;

/// Batched timeseries storage over a single SQLite connection.
///
/// Reads, inserts and deletes each run in their own transaction. Callers writing to the same series
/// from several threads must serialize those writes themselves.
pub struct TimeseriesDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) config: TimeseriesConfig,
    pub(crate) codec: Arc<BatchCodec>,
    pub(crate) transforms: Transforms,
}

impl TimeseriesDB {
    pub fn open(path: impl AsRef<Path>, config: TimeseriesConfig) -> Result<Self, Error> {
        Self::from_connection(Connection::open(path)?, config)
    }

    pub fn open_in_memory(config: TimeseriesConfig) -> Result<Self, Error> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    pub fn from_connection(conn: Connection, config: TimeseriesConfig) -> Result<Self, Error> {
        config.validate()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            codec: Arc::new(BatchCodec::new(config.compression)),
            config,
            transforms: Transforms::standard(),
        };
        db.create_schema()?;
        Ok(db)
    }

    /// Replaces the registry consulted by `Query::transform`.
    pub fn with_transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    /// Creates the owner table (if missing) and both batch tables. Safe to run repeatedly.
    pub fn create_schema(&self) -> Result<(), Error> {
        let owner = &self.config.owner_table;
        let mut sql = format!("CREATE TABLE IF NOT EXISTS {owner} (id VARCHAR PRIMARY KEY NOT NULL);\n");
        sql.push_str(&schema_sql(DATA_TABLE, owner));
        sql.push('\n');
        sql.push_str(&schema_sql(ACTIONS_TABLE, owner));
        self.conn.lock().execute_batch(&sql)?;
        Ok(())
    }

    pub fn config(&self) -> &TimeseriesConfig {
        &self.config
    }

    /// Number of datapoints stored in the series.
    pub fn length(&self, tsid: &str, actions: bool) -> Result<u64, Error> {
        BatchTable::new(tsid, actions).length(&self.conn.lock())
    }

    /// Sizes of the rows backing the series, in timestamp order.
    pub fn batch_lengths(&self, tsid: &str, actions: bool) -> Result<Vec<i64>, Error> {
        BatchTable::new(tsid, actions).batch_lengths(&self.conn.lock())
    }

    /// Runs `f` with the underlying connection locked, e.g. to maintain the owner table.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        f(&mut self.conn.lock())
    }
}
