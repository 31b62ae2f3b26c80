//! Iterators over successive decoded batches, and the decorators that trim them to a query's
//! bounds.

use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use rusqlite::Connection;

use super::table::{BatchTable, EncodedBatch, RangeScan};
use super::{BatchCodec, Error};
use crate::datapoint::{Datapoint, DatapointArray, DatapointIterator};

pub type Batch = DatapointArray;

/// A stream of non-empty batches.
pub trait BatchIterator: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error>;

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<T: BatchIterator + ?Sized> BatchIterator for Box<T> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        (**self).next_batch()
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

enum Source {
    Fetched,
    Paged {
        conn: Arc<Mutex<Connection>>,
        scan: RangeScan,
        page_size: usize,
        after: Option<f64>,
        exhausted: bool,
    },
}

/// Decodes one stored row per call.
pub struct SqlBatchIterator {
    table: BatchTable,
    codec: Arc<BatchCodec>,
    rows: VecDeque<EncodedBatch>,
    source: Source,
}

impl SqlBatchIterator {
    /// Reads every matching row up front. Used inside transactions, so that the rows reflect the
    /// same snapshot the index resolution ran against.
    pub fn fetch(
        conn: &Connection,
        table: BatchTable,
        codec: Arc<BatchCodec>,
        scan: &RangeScan,
    ) -> Result<Self, Error> {
        let rows = table.select(conn, scan, None, None)?;
        Ok(Self {
            table,
            codec,
            rows: rows.into(),
            source: Source::Fetched,
        })
    }

    /// Reads `page_size` rows per round trip, holding the connection only while a page loads.
    pub fn paged(
        conn: Arc<Mutex<Connection>>,
        table: BatchTable,
        codec: Arc<BatchCodec>,
        scan: RangeScan,
        page_size: usize,
    ) -> Self {
        Self {
            table,
            codec,
            rows: VecDeque::new(),
            source: Source::Paged {
                conn,
                scan,
                page_size: page_size.max(1),
                after: None,
                exhausted: false,
            },
        }
    }

    fn fill(&mut self) -> Result<(), Error> {
        if let Source::Paged {
            conn,
            scan,
            page_size,
            after,
            exhausted,
        } = &mut self.source
        {
            if *exhausted {
                return Ok(());
            }
            let page = {
                let conn = conn.lock();
                self.table.select(&conn, scan, *after, Some(*page_size))?
            };
            *exhausted = page.len() < *page_size;
            if let Some(last) = page.last() {
                *after = Some(last.start);
            }
            self.rows.extend(page);
        }
        Ok(())
    }
}

impl BatchIterator for SqlBatchIterator {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if self.rows.is_empty() {
            self.fill()?;
        }
        match self.rows.pop_front() {
            Some(row) => Ok(Some(row.decode(&self.codec)?.points)),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.rows.clear();
        if let Source::Paged { exhausted, .. } = &mut self.source {
            *exhausted = true;
        }
        Ok(())
    }
}

/// Skips everything before `t`: whole batches first, then the leading datapoints of the batch
/// where `t` falls.
pub struct BatchStartTime<B> {
    inner: B,
    t: f64,
    found: bool,
}

impl<B: BatchIterator> BatchStartTime<B> {
    pub fn new(inner: B, t: f64) -> Self {
        Self {
            inner,
            t,
            found: false,
        }
    }
}

impl<B: BatchIterator> BatchIterator for BatchStartTime<B> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if self.found {
            return self.inner.next_batch();
        }
        while let Some(mut batch) = self.inner.next_batch()? {
            if batch.last().is_some_and(|dp| dp.timestamp >= self.t) {
                let skip = batch.partition_point(|dp| dp.timestamp < self.t);
                batch.drain(..skip);
                self.found = true;
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Truncates the stream at the first datapoint with a timestamp at or after `end`.
pub struct BatchEndTime<B> {
    inner: B,
    end: f64,
    done: bool,
}

impl<B: BatchIterator> BatchEndTime<B> {
    pub fn new(inner: B, end: f64) -> Self {
        Self {
            inner,
            end,
            done: false,
        }
    }
}

impl<B: BatchIterator> BatchIterator for BatchEndTime<B> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if self.done {
            return Ok(None);
        }
        let Some(mut batch) = self.inner.next_batch()? else {
            return Ok(None);
        };
        if batch.last().is_some_and(|dp| dp.timestamp >= self.end) {
            self.done = true;
            let keep = batch.partition_point(|dp| dp.timestamp < self.end);
            if keep == 0 {
                return Ok(None);
            }
            batch.truncate(keep);
        }
        Ok(Some(batch))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Ends the stream at a resolved index: batches before `batch_start` pass, the batch starting at
/// `batch_start` keeps its first `offset` datapoints, later batches are dropped.
pub struct BatchEndOffset<B> {
    inner: B,
    batch_start: f64,
    offset: usize,
    done: bool,
}

impl<B: BatchIterator> BatchEndOffset<B> {
    pub fn new(inner: B, batch_start: f64, offset: usize) -> Self {
        Self {
            inner,
            batch_start,
            offset,
            done: false,
        }
    }
}

impl<B: BatchIterator> BatchIterator for BatchEndOffset<B> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if self.done {
            return Ok(None);
        }
        let Some(mut batch) = self.inner.next_batch()? else {
            return Ok(None);
        };
        let start = batch.first().map_or(f64::NEG_INFINITY, |dp| dp.timestamp);
        if start < self.batch_start {
            return Ok(Some(batch));
        }
        self.done = true;
        if start > self.batch_start || self.offset == 0 {
            return Ok(None);
        }
        batch.truncate(self.offset);
        Ok(Some(batch))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Starts the stream at a resolved index: when the first batch is the one starting at
/// `batch_start`, its first `offset` datapoints are dropped. If nothing remains the stream ends.
pub struct BatchStartOffset<B> {
    inner: B,
    batch_start: f64,
    offset: usize,
    first: bool,
}

impl<B: BatchIterator> BatchStartOffset<B> {
    pub fn new(inner: B, batch_start: f64, offset: usize) -> Self {
        Self {
            inner,
            batch_start,
            offset,
            first: true,
        }
    }
}

impl<B: BatchIterator> BatchIterator for BatchStartOffset<B> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if !self.first {
            return self.inner.next_batch();
        }
        self.first = false;
        let Some(mut batch) = self.inner.next_batch()? else {
            return Ok(None);
        };
        if batch.first().is_some_and(|dp| dp.timestamp == self.batch_start) {
            if batch.len() <= self.offset {
                self.inner.close()?;
                return Ok(None);
            }
            batch.drain(..self.offset);
        }
        Ok(Some(batch))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Ends the stream once `remaining` datapoints have been returned.
pub struct BatchPointLimit<B> {
    inner: B,
    remaining: usize,
}

impl<B: BatchIterator> BatchPointLimit<B> {
    pub fn new(inner: B, limit: usize) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl<B: BatchIterator> BatchIterator for BatchPointLimit<B> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let Some(mut batch) = self.inner.next_batch()? else {
            return Ok(None);
        };
        batch.truncate(self.remaining);
        self.remaining -= batch.len();
        Ok(Some(batch))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// For descending scans: reverses each batch and keeps only `t1 <= t < t2`.
pub struct DescendingWindow<B> {
    inner: B,
    t1: f64,
    t2: f64,
}

impl<B: BatchIterator> DescendingWindow<B> {
    pub fn new(inner: B, t1: Option<f64>, t2: Option<f64>) -> Self {
        Self {
            inner,
            t1: t1.unwrap_or(f64::NEG_INFINITY),
            t2: t2.unwrap_or(f64::INFINITY),
        }
    }
}

impl<B: BatchIterator> BatchIterator for DescendingWindow<B> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        while let Some(batch) = self.inner.next_batch()? {
            let batch: Batch = batch
                .into_iter()
                .rev()
                .filter(|dp| dp.timestamp >= self.t1 && dp.timestamp < self.t2)
                .collect();
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Drains the wrapped stream on first use and replays it back to front.
pub struct ReverseBatches<B> {
    inner: B,
    drained: Option<Vec<Batch>>,
}

impl<B: BatchIterator> ReverseBatches<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            drained: None,
        }
    }
}

impl<B: BatchIterator> BatchIterator for ReverseBatches<B> {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if self.drained.is_none() {
            let mut all = Vec::new();
            while let Some(batch) = self.inner.next_batch()? {
                all.push(batch);
            }
            self.inner.close()?;
            self.drained = Some(all);
        }
        Ok(self.drained.as_mut().and_then(Vec::pop).map(|mut batch| {
            batch.reverse();
            batch
        }))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.drained = Some(Vec::new());
        self.inner.close()
    }
}

/// Decodes batches on a background thread, keeping up to `capacity` of them queued ahead of the
/// consumer.
pub struct ChanBatchIterator {
    rx: Option<Receiver<Result<Batch, Error>>>,
    handle: Option<JoinHandle<()>>,
}

impl ChanBatchIterator {
    pub fn new<B: BatchIterator + 'static>(mut inner: B, capacity: usize) -> Result<Self, Error> {
        let (tx, rx) = sync_channel(capacity.max(1));
        let handle = thread::Builder::new()
            .name("tsbatch-read-ahead".into())
            .spawn(move || {
                loop {
                    match inner.next_batch() {
                        Ok(Some(batch)) => {
                            if tx.send(Ok(batch)).is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("read-ahead stopped: {e}");
                            let _ = tx.send(Err(e));
                            break;
                        }
                    }
                }
                if let Err(e) = inner.close() {
                    log::warn!("failed to close batch source: {e}");
                }
            })?;
        Ok(Self {
            rx: Some(rx),
            handle: Some(handle),
        })
    }

    fn join(&mut self) -> Result<(), Error> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Pipeline("read-ahead thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl BatchIterator for ChanBatchIterator {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        let Some(rx) = &self.rx else {
            return Ok(None);
        };
        match rx.recv() {
            Ok(Ok(batch)) => Ok(Some(batch)),
            Ok(Err(e)) => {
                self.close()?;
                Err(e)
            }
            Err(_) => {
                self.rx = None;
                self.join()?;
                Ok(None)
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        // Dropping the receiver makes the producer's next send fail, which ends its loop.
        self.rx = None;
        self.join()
    }
}

impl Drop for ChanBatchIterator {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("{e}");
        }
    }
}

/// Flattens a batch stream into datapoints, pulling the next batch when the current one runs out.
pub struct BatchDatapointIterator<B> {
    batches: B,
    current: std::vec::IntoIter<Datapoint>,
}

impl<B: BatchIterator> BatchDatapointIterator<B> {
    pub fn new(batches: B) -> Self {
        Self {
            batches,
            current: Vec::new().into_iter(),
        }
    }
}

impl<B: BatchIterator> DatapointIterator for BatchDatapointIterator<B> {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        loop {
            if let Some(dp) = self.current.next() {
                return Ok(Some(dp));
            }
            match self.batches.next_batch()? {
                Some(batch) => self.current = batch.into_iter(),
                None => return Ok(None),
            }
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.current = Vec::new().into_iter();
        self.batches.close()
    }
}
