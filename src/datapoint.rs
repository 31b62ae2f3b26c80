use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::Error;

/// A single timestamped value. A non-zero duration turns the point into the half-open
/// interval `[timestamp, timestamp + duration)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    #[serde(rename = "t")]
    pub timestamp: f64,
    #[serde(rename = "dt", alias = "td", default, skip_serializing_if = "is_zero")]
    pub duration: f64,
    #[serde(rename = "d")]
    pub data: Value,
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

impl Datapoint {
    pub fn new(timestamp: f64, data: impl Into<Value>) -> Self {
        Self {
            timestamp,
            duration: 0.0,
            data: data.into(),
            actor: None,
        }
    }

    /// Creates a datapoint stamped with the current time.
    pub fn now(data: impl Into<Value>) -> Self {
        let now = Utc::now();
        let ts = now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9;
        Self::new(ts, data)
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        let actor = actor.into();
        self.actor = if actor.is_empty() { None } else { Some(actor) };
        self
    }

    pub fn end_time(&self) -> f64 {
        self.timestamp + self.duration
    }

    /// True when this datapoint is entirely over before `t`. Intervals may end exactly at `t`,
    /// instants must be strictly earlier.
    pub fn ends_before(&self, t: f64) -> bool {
        let end = self.end_time();
        end < t || (self.duration > 0.0 && end <= t)
    }

    /// True when this datapoint's interval covers the instant `t`.
    pub fn covers(&self, t: f64) -> bool {
        self.duration > 0.0 && self.timestamp <= t && t < self.end_time()
    }
}

impl fmt::Display for Datapoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{{\"t\":{}}}", self.timestamp),
        }
    }
}

/// An ordered run of datapoints.
pub type DatapointArray = Vec<Datapoint>;

/// A fallible stream of datapoints in ascending timestamp order (unless stated otherwise).
///
/// `close` releases whatever the stream holds (a background reader, a database handle). It must be
/// safe to call more than once; dropping an iterator without closing it is allowed too.
pub trait DatapointIterator: Send {
    fn next(&mut self) -> Result<Option<Datapoint>, Error>;

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<T: DatapointIterator + ?Sized> DatapointIterator for Box<T> {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        (**self).next()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

impl<T: DatapointIterator + ?Sized> DatapointIterator for &mut T {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        (**self).next()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

/// Drains the iterator into an array, closing it afterwards.
pub fn collect_datapoints<I: DatapointIterator + ?Sized>(it: &mut I) -> Result<DatapointArray, Error> {
    let mut out = DatapointArray::new();
    let res = loop {
        match it.next() {
            Ok(Some(dp)) => out.push(dp),
            Ok(None) => break Ok(out),
            Err(e) => break Err(e),
        }
    };
    it.close()?;
    res
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyIterator;

impl DatapointIterator for EmptyIterator {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        Ok(None)
    }
}

/// Serves datapoints out of an in-memory array.
#[derive(Debug, Clone)]
pub struct DatapointArrayIterator {
    points: std::vec::IntoIter<Datapoint>,
}

impl DatapointArrayIterator {
    pub fn new(points: DatapointArray) -> Self {
        Self {
            points: points.into_iter(),
        }
    }

    /// Everything not yet returned by `next`.
    pub fn remaining(self) -> DatapointArray {
        self.points.collect()
    }
}

impl From<DatapointArray> for DatapointArrayIterator {
    fn from(points: DatapointArray) -> Self {
        Self::new(points)
    }
}

impl DatapointIterator for DatapointArrayIterator {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        Ok(self.points.next())
    }
}

/// Returns at most `limit` datapoints from the underlying stream.
pub struct NumIterator<I> {
    inner: I,
    remaining: u64,
}

impl<I: DatapointIterator> NumIterator<I> {
    pub fn new(inner: I, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }

    /// Pulls and drops the next `n` datapoints one at a time, without collecting them and
    /// without counting them against the limit. Linear in `n`: every skipped datapoint is still
    /// decoded by the underlying stream.
    pub fn skip(&mut self, n: usize) -> Result<(), Error> {
        for _ in 0..n {
            if self.inner.next()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

impl<I: DatapointIterator> DatapointIterator for NumIterator<I> {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        if self.remaining == 0 {
            self.inner.close()?;
            return Ok(None);
        }
        self.remaining -= 1;
        self.inner.next()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Records what passed through it: how many datapoints, the first timestamp, the last end time
/// and the last datapoint itself.
pub struct InfoIterator<I> {
    inner: I,
    pub start: f64,
    pub end: f64,
    pub count: u64,
    pub last: Option<Datapoint>,
}

impl<I: DatapointIterator> InfoIterator<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            start: f64::NEG_INFINITY,
            end: f64::NEG_INFINITY,
            count: 0,
            last: None,
        }
    }
}

impl<I: DatapointIterator> DatapointIterator for InfoIterator<I> {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        let dp = self.inner.next()?;
        if let Some(dp) = &dp {
            if self.count == 0 {
                self.start = dp.timestamp;
            }
            self.count += 1;
            self.end = dp.end_time();
            self.last = Some(dp.clone());
        }
        Ok(dp)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Rejects streams that are out of order, overlapping, or carry negative durations.
///
/// After an instantaneous point the next timestamp must be strictly greater. After an interval the
/// next timestamp may equal its end, since intervals are half-open. Two input datapoints sharing a
/// timestamp are therefore always rejected.
pub struct SortChecker<I> {
    inner: I,
    end: f64,
    inclusive: bool,
}

impl<I: DatapointIterator> SortChecker<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            end: f64::NEG_INFINITY,
            inclusive: false,
        }
    }
}

impl<I: DatapointIterator> DatapointIterator for SortChecker<I> {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        let Some(dp) = self.inner.next()? else {
            return Ok(None);
        };
        if !dp.timestamp.is_finite() || !dp.duration.is_finite() {
            return Err(Error::BadQuery(format!(
                "timestamps and durations must be finite numbers (got t={}, dt={})",
                dp.timestamp, dp.duration
            )));
        }
        if dp.duration < 0.0 {
            return Err(Error::BadQuery("durations can't be negative".into()));
        }
        if (self.inclusive && dp.timestamp < self.end) || (!self.inclusive && dp.timestamp <= self.end) {
            return Err(Error::BadQuery(
                "data must be ordered with increasing timestamps, and durations must not intersect".into(),
            ));
        }
        self.inclusive = dp.duration > 0.0;
        self.end = dp.end_time();
        Ok(Some(dp))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}
