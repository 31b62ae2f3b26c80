use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{BatchCodec, Error};
use crate::datapoint::{Datapoint, DatapointArray};

pub const DATA_TABLE: &str = "timeseries";
pub const ACTIONS_TABLE: &str = "timeseries_actions";

/// DDL for one batch table. `owner` is the table whose `id` column the series belong to.
pub fn schema_sql(table: &str, owner: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            tsid VARCHAR NOT NULL,
            tstart REAL NOT NULL,
            tend REAL NOT NULL,
            length INTEGER NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (tsid, tstart),
            CONSTRAINT valid_range CHECK (tstart <= tend AND length > 0),
            CONSTRAINT {table}_owner FOREIGN KEY (tsid) REFERENCES {owner}(id)
                ON UPDATE CASCADE ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS {table}_duration ON {table}(tsid, tend, tstart);"
    )
}

/// One stored row, still encoded.
#[derive(Clone, Debug)]
pub struct EncodedBatch {
    pub start: f64,
    pub end: f64,
    pub length: i64,
    pub data: Vec<u8>,
}

/// One stored row, decoded.
#[derive(Clone, Debug)]
pub struct StoredBatch {
    pub start: f64,
    pub points: DatapointArray,
}

impl EncodedBatch {
    pub fn decode(&self, codec: &BatchCodec) -> Result<StoredBatch, Error> {
        let points = codec.decode(&self.data)?;
        if points.len() as i64 != self.length {
            return Err(Error::CorruptBatch(format!(
                "batch at {} declares {} datapoints but holds {}",
                self.start,
                self.length,
                points.len()
            )));
        }
        Ok(StoredBatch {
            start: self.start,
            points,
        })
    }
}

/// Where a logical datapoint index lives: the batch that holds it and its position inside.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexPosition {
    pub batch_start: f64,
    pub offset: usize,
}

/// Result of resolving an index against the stored batches. Indices outside the data resolve to a
/// sentinel timestamp just past the last batch (forward) or just before the first one (backward),
/// so range constraints built from them select nothing or everything instead of failing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IndexBound {
    At(IndexPosition),
    PastEnd { sentinel: f64 },
    BeforeStart { sentinel: f64 },
}

impl IndexBound {
    pub fn batch_start(&self) -> f64 {
        match self {
            IndexBound::At(pos) => pos.batch_start,
            IndexBound::PastEnd { sentinel } | IndexBound::BeforeStart { sentinel } => *sentinel,
        }
    }

    pub fn position(&self) -> Option<IndexPosition> {
        match self {
            IndexBound::At(pos) => Some(*pos),
            _ => None,
        }
    }
}

/// Constraints on `tstart`/`tend` that select a contiguous run of batches.
#[derive(Clone, Debug, Default)]
pub struct RangeScan {
    start_at_least: Option<f64>,
    start_above: Option<f64>,
    start_at_most: Option<f64>,
    start_below: Option<f64>,
    end_at_least: Option<f64>,
    end_below: Option<f64>,
    descending: bool,
}

impl RangeScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_at_least(mut self, t: f64) -> Self {
        self.start_at_least = Some(t);
        self
    }

    pub fn start_above(mut self, t: f64) -> Self {
        self.start_above = Some(t);
        self
    }

    pub fn start_at_most(mut self, t: f64) -> Self {
        self.start_at_most = Some(t);
        self
    }

    pub fn start_below(mut self, t: f64) -> Self {
        self.start_below = Some(t);
        self
    }

    pub fn end_at_least(mut self, t: f64) -> Self {
        self.end_at_least = Some(t);
        self
    }

    pub fn end_below(mut self, t: f64) -> Self {
        self.end_below = Some(t);
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    pub fn is_descending(&self) -> bool {
        self.descending
    }

    /// Builds the WHERE clause and its parameters. `after` continues a previous page: only rows
    /// past that `tstart` in scan order are selected.
    fn conditions(&self, tsid: &str, after: Option<f64>) -> (String, Vec<Value>) {
        let mut clauses = vec!["tsid=?"];
        let mut values = vec![Value::Text(tsid.to_string())];
        let bounds = [
            ("tstart>=?", self.start_at_least),
            ("tstart>?", self.start_above),
            ("tstart<=?", self.start_at_most),
            ("tstart<?", self.start_below),
            ("tend>=?", self.end_at_least),
            ("tend<?", self.end_below),
        ];
        for (clause, bound) in bounds {
            if let Some(t) = bound {
                clauses.push(clause);
                values.push(Value::Real(t));
            }
        }
        if let Some(t) = after {
            clauses.push(if self.descending { "tstart<?" } else { "tstart>?" });
            values.push(Value::Real(t));
        }
        (clauses.join(" AND "), values)
    }
}

/// Batch rows of one series in one of the two batch tables.
#[derive(Clone, Debug)]
pub struct BatchTable {
    name: &'static str,
    tsid: String,
}

impl BatchTable {
    pub fn new(tsid: impl Into<String>, actions: bool) -> Self {
        Self {
            name: if actions { ACTIONS_TABLE } else { DATA_TABLE },
            tsid: tsid.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn tsid(&self) -> &str {
        &self.tsid
    }

    /// Number of datapoints in the series (not rows).
    pub fn length(&self, conn: &Connection) -> Result<u64, Error> {
        let len: i64 = conn
            .prepare_cached(&format!(
                "SELECT COALESCE(SUM(length), 0) FROM {} WHERE tsid=?",
                self.name
            ))?
            .query_row(params![self.tsid], |row| row.get(0))?;
        Ok(len.max(0) as u64)
    }

    /// Lengths of the stored rows in ascending order.
    pub fn batch_lengths(&self, conn: &Connection) -> Result<Vec<i64>, Error> {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT length FROM {} WHERE tsid=? ORDER BY tstart ASC",
            self.name
        ))?;
        let lengths = stmt
            .query_map(params![self.tsid], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(lengths)
    }

    /// Finds the batch holding datapoint `index`. Non-negative indices count from the first
    /// datapoint, negative ones from the last (`-1` is the last datapoint).
    pub fn index_to_timestamp(&self, conn: &Connection, index: i64) -> Result<IndexBound, Error> {
        let found: Option<(f64, i64)> = if index >= 0 {
            conn.prepare_cached(&format!(
                "WITH q AS (SELECT tstart, length, SUM(length) OVER (ORDER BY tstart ASC) AS endindex
                    FROM {} WHERE tsid=?1)
                 SELECT tstart, ?2-(endindex-length) AS offset FROM q
                    WHERE endindex-length<=?2 AND endindex>?2 LIMIT 1",
                self.name
            ))?
            .query_row(params![self.tsid, index], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?
        } else if let Some(from_end) = index.checked_neg() {
            conn.prepare_cached(&format!(
                "WITH q AS (SELECT tstart, length, SUM(length) OVER (ORDER BY tstart DESC) AS negindex
                    FROM {} WHERE tsid=?1)
                 SELECT tstart, negindex-?2 AS offset FROM q
                    WHERE negindex>=?2 AND negindex-length<?2 LIMIT 1",
                self.name
            ))?
            .query_row(params![self.tsid, from_end], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?
        } else {
            // i64::MIN lies before the start of any series.
            None
        };

        let bound = match found {
            Some((batch_start, offset)) => IndexBound::At(IndexPosition {
                batch_start,
                offset: usize::try_from(offset).map_err(|_| {
                    Error::DatabaseCorrupted(format!(
                        "negative offset {offset} resolving index {index} in {}",
                        self.tsid
                    ))
                })?,
            }),
            None if index >= 0 => IndexBound::PastEnd {
                sentinel: self.sentinel(conn, "MAX(tend)+1")?,
            },
            None => IndexBound::BeforeStart {
                sentinel: self.sentinel(conn, "MIN(tstart)-1")?,
            },
        };
        log::trace!("{}[{}]: index {} resolved to {:?}", self.name, self.tsid, index, bound);
        Ok(bound)
    }

    fn sentinel(&self, conn: &Connection, expr: &str) -> Result<f64, Error> {
        let v: f64 = conn
            .prepare_cached(&format!(
                "SELECT COALESCE({expr}, 0) FROM {} WHERE tsid=?",
                self.name
            ))?
            .query_row(params![self.tsid], |row| row.get(0))?;
        Ok(v)
    }

    /// Rows matching `scan`, in scan order. `limit` caps the number of rows.
    pub fn select(
        &self,
        conn: &Connection,
        scan: &RangeScan,
        after: Option<f64>,
        limit: Option<usize>,
    ) -> Result<Vec<EncodedBatch>, Error> {
        let (clause, mut values) = scan.conditions(&self.tsid, after);
        values.push(Value::Integer(limit.map_or(-1, |l| l as i64)));
        let sql = format!(
            "SELECT tstart, tend, length, data FROM {} WHERE {} ORDER BY tstart {} LIMIT ?",
            self.name,
            clause,
            if scan.descending { "DESC" } else { "ASC" }
        );
        log::trace!("{}[{}]: {}", self.name, self.tsid, sql);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(EncodedBatch {
                    start: row.get(0)?,
                    end: row.get(1)?,
                    length: row.get(2)?,
                    data: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The batch with the greatest start at or before `t`.
    pub fn batch_at_or_before(
        &self,
        conn: &Connection,
        codec: &BatchCodec,
        t: f64,
    ) -> Result<Option<StoredBatch>, Error> {
        let scan = RangeScan::new().start_at_most(t).descending(true);
        self.select(conn, &scan, None, Some(1))?
            .first()
            .map(|row| row.decode(codec))
            .transpose()
    }

    /// Up to `limit` batches starting strictly after `after` (or from the first batch), ascending.
    pub fn batches_after(
        &self,
        conn: &Connection,
        codec: &BatchCodec,
        after: Option<f64>,
        limit: usize,
    ) -> Result<Vec<StoredBatch>, Error> {
        self.select(conn, &RangeScan::new(), after, Some(limit))?
            .iter()
            .map(|row| row.decode(codec))
            .collect()
    }

    pub fn last_datapoint(
        &self,
        conn: &Connection,
        codec: &BatchCodec,
    ) -> Result<Option<Datapoint>, Error> {
        let scan = RangeScan::new().descending(true);
        let Some(row) = self.select(conn, &scan, None, Some(1))?.pop() else {
            return Ok(None);
        };
        Ok(row.decode(codec)?.points.pop())
    }

    /// Encodes and inserts `points` as a single row.
    pub fn write_batch(
        &self,
        conn: &Connection,
        codec: &BatchCodec,
        points: &[Datapoint],
    ) -> Result<(), Error> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        let end = points
            .iter()
            .map(Datapoint::end_time)
            .fold(first.timestamp, f64::max);
        let data = codec.encode(points)?;
        self.write_encoded(conn, first.timestamp, end, points.len(), &data)
    }

    pub fn write_encoded(
        &self,
        conn: &Connection,
        start: f64,
        end: f64,
        length: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        log::debug!(
            "{}[{}]: writing batch [{}, {}] with {} datapoints",
            self.name,
            self.tsid,
            start,
            end,
            length
        );
        conn.prepare_cached(&format!(
            "INSERT INTO {}(tsid, tstart, tend, length, data) VALUES (?, ?, ?, ?, ?)",
            self.name
        ))?
        .execute(params![self.tsid, start, end, length as i64, data])?;
        Ok(())
    }

    /// Writes `points` as consecutive rows: while more than `max_batch_size` remain, the first
    /// `batch_size` become a row; whatever is left becomes the last row.
    pub fn write_split(
        &self,
        conn: &Connection,
        codec: &BatchCodec,
        batch_size: usize,
        max_batch_size: usize,
        mut points: &[Datapoint],
    ) -> Result<(), Error> {
        while points.len() > max_batch_size {
            let (head, tail) = points.split_at(batch_size);
            self.write_batch(conn, codec, head)?;
            points = tail;
        }
        self.write_batch(conn, codec, points)
    }

    pub fn delete_batch(&self, conn: &Connection, start: f64) -> Result<(), Error> {
        log::debug!("{}[{}]: deleting batch at {}", self.name, self.tsid, start);
        conn.prepare_cached(&format!(
            "DELETE FROM {} WHERE tsid=? AND tstart=?",
            self.name
        ))?
        .execute(params![self.tsid, start])?;
        Ok(())
    }

    /// Deletes every row matching `scan`, returning how many went.
    pub fn delete_where(&self, conn: &Connection, scan: &RangeScan) -> Result<usize, Error> {
        let (clause, values) = scan.conditions(&self.tsid, None);
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE {}", self.name, clause),
            params_from_iter(values.iter()),
        )?;
        log::debug!(
            "{}[{}]: deleted {} batches where {}",
            self.name,
            self.tsid,
            deleted,
            clause
        );
        Ok(deleted)
    }
}
