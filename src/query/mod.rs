//! Query shape and its translation into batch scans.

use serde::{Deserialize, Serialize};

use crate::datapoint::{DatapointArrayIterator, EmptyIterator, NumIterator};
use crate::storage::{
    BatchDatapointIterator, BatchEndOffset, BatchEndTime, BatchIterator, BatchPointLimit,
    BatchStartOffset, BatchStartTime, BatchTable, ChanBatchIterator, DescendingWindow, Error,
    RangeScan, ReverseBatches, SqlBatchIterator, TimeseriesDB,
};

mod timestamp;
mod transform;

#[cfg(test)]
mod tests;

pub use timestamp::{parse_timestamp, parse_timestamp_at, Timestamp};
pub use transform::{BoxedIterator, Transforms};

/// Selects datapoints of one series, by time (`t1`/`t2`, or exactly `t`), by position
/// (`i1`/`i2`, or exactly `i`), or both. Ranges are half-open: `t1 <= t < t2`, `i1 <= i < i2`.
/// Negative indices count back from the end, `-1` being the last datapoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Query {
    pub timeseries: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t1: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t2: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i1: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reversed: Option<bool>,
    pub actions: bool,
}

impl Query {
    pub fn new(timeseries: impl Into<String>) -> Self {
        Self {
            timeseries: timeseries.into(),
            ..Self::default()
        }
    }

    pub fn t1(mut self, t: impl Into<Timestamp>) -> Self {
        self.t1 = Some(t.into());
        self
    }

    pub fn t2(mut self, t: impl Into<Timestamp>) -> Self {
        self.t2 = Some(t.into());
        self
    }

    pub fn t(mut self, t: impl Into<Timestamp>) -> Self {
        self.t = Some(t.into());
        self
    }

    pub fn i1(mut self, i: i64) -> Self {
        self.i1 = Some(i);
        self
    }

    pub fn i2(mut self, i: i64) -> Self {
        self.i2 = Some(i);
        self
    }

    pub fn i(mut self, i: i64) -> Self {
        self.i = Some(i);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn transform(mut self, transform: impl Into<String>) -> Self {
        self.transform = Some(transform.into());
        self
    }

    pub fn reversed(mut self, reversed: bool) -> Self {
        self.reversed = Some(reversed);
        self
    }

    pub fn actions(mut self, actions: bool) -> Self {
        self.actions = actions;
        self
    }

    fn has_transform(&self) -> bool {
        self.transform.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Checks the field combinations, without touching the database.
    pub fn validate(&self) -> Result<(), Error> {
        if self.timeseries.is_empty() {
            return Err(Error::bad_query("no timeseries specified"));
        }
        let has_range =
            self.t1.is_some() || self.t2.is_some() || self.i1.is_some() || self.i2.is_some();
        if self.t.is_some() && (has_range || self.i.is_some()) {
            return Err(Error::bad_query(
                "cannot query by single timestamp together with a range or index",
            ));
        }
        if self.i.is_some() && has_range {
            return Err(Error::bad_query(
                "cannot query by single index together with a range",
            ));
        }
        if self.reversed == Some(true) && (self.limit.is_some() || self.has_transform()) {
            return Err(Error::bad_query(
                "reversed queries can't be combined with a limit or transform",
            ));
        }
        Ok(())
    }

    pub fn validate_delete(&self) -> Result<(), Error> {
        self.validate()?;
        if self.limit.is_some() || self.transform.is_some() {
            return Err(Error::bad_query(
                "transforms and limits are not supported for delete",
            ));
        }
        Ok(())
    }

    /// Queries that only bound time need no index resolution and no transaction.
    fn is_time_only(&self) -> bool {
        self.i.is_none() && self.i2.is_none() && self.i1.is_none_or(|i| i == 0)
    }
}

impl TimeseriesDB {
    /// Runs `q`, applying its transform and then its limit to the result.
    pub fn query(&self, q: &Query) -> Result<BoxedIterator, Error> {
        let mut it = self.raw_query(q)?;
        if let Some(name) = q.transform.as_deref().filter(|t| !t.is_empty()) {
            it = self.transforms.apply(name, it)?;
        }
        match q.limit {
            Some(limit) if limit > 0 => Ok(Box::new(NumIterator::new(it, limit))),
            _ => Ok(it),
        }
    }

    /// Runs `q` without its transform and limit.
    pub fn raw_query(&self, q: &Query) -> Result<BoxedIterator, Error> {
        q.validate()?;
        let table = BatchTable::new(q.timeseries.as_str(), q.actions);
        let t1 = q.t1.as_ref().map(Timestamp::resolve).transpose()?;
        let t2 = q.t2.as_ref().map(Timestamp::resolve).transpose()?;
        let reversed = q.reversed.unwrap_or(false);

        if let Some(t) = &q.t {
            return self.query_single_time(&table, t.resolve()?);
        }
        if let Some(i) = q.i {
            return self.query_single_index(&table, i);
        }
        if q.is_time_only() {
            return self.query_time_range(table, t1, t2, reversed);
        }
        self.query_index_range(table, q, t1, t2, reversed)
    }

    fn query_single_time(&self, table: &BatchTable, t: f64) -> Result<BoxedIterator, Error> {
        let scan = RangeScan::new().start_at_most(t).end_at_least(t);
        let rows = table.select(&self.conn.lock(), &scan, None, None)?;
        for row in rows {
            let batch = row.decode(&self.codec)?;
            let at = batch.points.partition_point(|dp| dp.timestamp < t);
            if let Some(dp) = batch.points.into_iter().nth(at).filter(|dp| dp.timestamp == t) {
                return Ok(Box::new(DatapointArrayIterator::new(vec![dp])));
            }
        }
        Ok(Box::new(EmptyIterator))
    }

    fn query_single_index(&self, table: &BatchTable, i: i64) -> Result<BoxedIterator, Error> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(pos) = table.index_to_timestamp(&tx, i)?.position() else {
            return Ok(Box::new(EmptyIterator));
        };
        let scan = RangeScan::new()
            .start_at_least(pos.batch_start)
            .start_at_most(pos.batch_start);
        let rows = table.select(&tx, &scan, None, Some(1))?;
        tx.commit()?;

        let Some(row) = rows.first() else {
            return Ok(Box::new(EmptyIterator));
        };
        let dp = row.decode(&self.codec)?.points.into_iter().nth(pos.offset);
        Ok(match dp {
            Some(dp) => Box::new(DatapointArrayIterator::new(vec![dp])),
            None => Box::new(EmptyIterator),
        })
    }

    fn query_time_range(
        &self,
        table: BatchTable,
        t1: Option<f64>,
        t2: Option<f64>,
        reversed: bool,
    ) -> Result<BoxedIterator, Error> {
        let mut scan = RangeScan::new().descending(reversed);
        if let Some(t1) = t1 {
            scan = scan.end_at_least(t1);
        }
        if let Some(t2) = t2 {
            scan = scan.start_below(t2);
        }
        let rows = SqlBatchIterator::paged(
            self.conn.clone(),
            table,
            self.codec.clone(),
            scan,
            self.config.query_page_size,
        );

        let mut bi: Box<dyn BatchIterator> = Box::new(rows);
        if reversed {
            bi = Box::new(DescendingWindow::new(bi, t1, t2));
        } else {
            if let Some(t1) = t1 {
                bi = Box::new(BatchStartTime::new(bi, t1));
            }
            if let Some(t2) = t2 {
                bi = Box::new(BatchEndTime::new(bi, t2));
            }
        }
        self.stream(bi)
    }

    /// Index bounds are resolved to batches first, and the batches read, within one transaction.
    fn query_index_range(
        &self,
        table: BatchTable,
        q: &Query,
        t1: Option<f64>,
        t2: Option<f64>,
        reversed: bool,
    ) -> Result<BoxedIterator, Error> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut scan = RangeScan::new();
        if let Some(t1) = t1 {
            scan = scan.end_at_least(t1);
        }
        if let Some(t2) = t2 {
            scan = scan.start_below(t2);
        }

        let mut start = None;
        let mut end = None;
        let mut point_limit = None;
        if let Some(i1) = q.i1 {
            let bound = table.index_to_timestamp(&tx, i1)?;
            scan = scan.start_at_least(bound.batch_start());
            start = bound.position();
        }
        if let Some(i2) = q.i2 {
            let same_sign = q.i1.is_some_and(|i1| (i1 < 0) == (i2 < 0));
            match (start, q.i1) {
                // Both indices count from the same end, so the range is just a count of datapoints.
                (Some(pos), Some(i1)) if same_sign && t1.is_none_or(|t1| t1 <= pos.batch_start) => {
                    if i2 <= i1 {
                        return Ok(Box::new(EmptyIterator));
                    }
                    point_limit = Some((i2 - i1) as usize);
                }
                _ => {
                    let bound = table.index_to_timestamp(&tx, i2)?;
                    scan = scan.start_at_most(bound.batch_start());
                    end = bound.position();
                }
            }
        }

        let rows = SqlBatchIterator::fetch(&tx, table, self.codec.clone(), &scan)?;
        tx.commit()?;
        drop(conn);

        let mut bi: Box<dyn BatchIterator> = Box::new(rows);
        if let Some(pos) = end {
            bi = Box::new(BatchEndOffset::new(bi, pos.batch_start, pos.offset));
        }
        if let Some(t2) = t2 {
            bi = Box::new(BatchEndTime::new(bi, t2));
        }
        if let Some(pos) = start {
            bi = Box::new(BatchStartOffset::new(bi, pos.batch_start, pos.offset));
        }
        if let Some(n) = point_limit {
            bi = Box::new(BatchPointLimit::new(bi, n));
        }
        if let Some(t1) = t1 {
            bi = Box::new(BatchStartTime::new(bi, t1));
        }
        if reversed {
            bi = Box::new(ReverseBatches::new(bi));
        }
        self.stream(bi)
    }

    fn stream(&self, bi: Box<dyn BatchIterator>) -> Result<BoxedIterator, Error> {
        let read_ahead = ChanBatchIterator::new(bi, self.config.read_ahead)?;
        Ok(Box::new(BatchDatapointIterator::new(read_ahead)))
    }
}
