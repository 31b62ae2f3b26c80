use rusqlite::TransactionBehavior;

use super::table::{BatchTable, IndexBound, IndexPosition, RangeScan};
use super::{Error, TimeseriesDB};
use crate::datapoint::DatapointArray;
use crate::query::Query;

/// A delete leaves at most two partial batches at each end of its range.
const MAX_BOUNDARY_BATCHES: usize = 4;

impl TimeseriesDB {
    /// Removes the datapoints selected by `q`: everything in `[t1, t2)` further narrowed by index
    /// bounds, or a single datapoint addressed by `t` or `i`.
    pub fn delete(&self, q: &Query) -> Result<(), Error> {
        q.validate_delete()?;
        let table = BatchTable::new(q.timeseries.as_str(), q.actions);

        let single_t = q.t.as_ref().map(|t| t.resolve()).transpose()?;
        let mut t1 = q.t1.as_ref().map(|t| t.resolve()).transpose()?;
        let mut t2 = q.t2.as_ref().map(|t| t.resolve()).transpose()?;
        if single_t.is_some() {
            (t1, t2) = (single_t, single_t);
        }
        let (i1, i2) = match q.i {
            // `i + 1` past `i64::MAX` is no upper bound, same as `-1 + 1`.
            Some(i) => (Some(i), i.checked_add(1).filter(|&end| end != 0)),
            None => (q.i1, q.i2),
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let start: Option<IndexPosition> = match i1 {
            Some(i) => match table.index_to_timestamp(&tx, i)? {
                IndexBound::At(pos) => Some(pos),
                // The range starts past the data, so nothing is in it.
                IndexBound::PastEnd { .. } => return Ok(()),
                IndexBound::BeforeStart { .. } if q.i.is_some() => return Ok(()),
                IndexBound::BeforeStart { .. } => None,
            },
            None => None,
        };
        let end: Option<IndexPosition> = match i2 {
            Some(i) => match table.index_to_timestamp(&tx, i)? {
                IndexBound::At(pos) => Some(pos),
                IndexBound::PastEnd { .. } => None,
                IndexBound::BeforeStart { .. } => return Ok(()),
            },
            None => None,
        };

        if single_t.is_none() && q.i.is_none() {
            let mut inner = RangeScan::new();
            if let Some(t) = t1 {
                inner = inner.start_at_least(t);
            }
            if let Some(t) = t2 {
                inner = inner.end_below(t);
            }
            if let Some(pos) = start {
                inner = inner.start_above(pos.batch_start);
            }
            if let Some(pos) = end {
                inner = inner.start_below(pos.batch_start);
            }
            table.delete_where(&tx, &inner)?;
        }

        let mut boundary = RangeScan::new();
        if let Some(t) = t1 {
            boundary = boundary.end_at_least(t);
        }
        if let Some(t) = t2 {
            boundary = boundary.start_at_most(t);
        }
        if let Some(pos) = start {
            boundary = boundary.start_at_least(pos.batch_start);
        }
        if let Some(pos) = end {
            boundary = boundary.start_at_most(pos.batch_start);
        }
        let rows = table.select(&tx, &boundary, None, Some(MAX_BOUNDARY_BATCHES + 1))?;
        if rows.len() > MAX_BOUNDARY_BATCHES {
            return Err(Error::DatabaseCorrupted(format!(
                "found more than {MAX_BOUNDARY_BATCHES} batches at the edges of a delete in {}",
                q.timeseries
            )));
        }

        let mut lo = t1.unwrap_or(f64::NEG_INFINITY);
        let mut hi = t2.unwrap_or(f64::INFINITY);
        let mut loaded = DatapointArray::new();
        for row in &rows {
            let batch = row.decode(&self.codec)?;
            // Index bounds become time bounds once the batch they point into is decoded.
            if let Some(pos) = start.filter(|p| p.batch_start == batch.start) {
                let dp = batch.points.get(pos.offset).ok_or_else(|| {
                    Error::DatabaseCorrupted(format!("index offset out of range in {}", q.timeseries))
                })?;
                lo = lo.max(dp.timestamp);
            }
            if let Some(pos) = end.filter(|p| p.batch_start == batch.start) {
                let dp = batch.points.get(pos.offset).ok_or_else(|| {
                    Error::DatabaseCorrupted(format!("index offset out of range in {}", q.timeseries))
                })?;
                hi = hi.min(dp.timestamp);
            }
            loaded.extend(batch.points);
        }

        let total = loaded.len();
        let kept: DatapointArray = loaded
            .into_iter()
            .filter(|dp| {
                (dp.timestamp < lo || dp.timestamp >= hi) && single_t != Some(dp.timestamp)
            })
            .collect();

        if kept.len() != total {
            table.delete_where(&tx, &boundary)?;
            table.write_split(
                &tx,
                &self.codec,
                self.config.batch_size,
                self.config.max_batch_size,
                &kept,
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}
