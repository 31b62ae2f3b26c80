use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::mpsc::sync_channel;
use std::thread;

use rusqlite::{Connection, TransactionBehavior};
use serde::Deserialize;

use super::table::{BatchTable, EncodedBatch, StoredBatch};
use super::{BatchCodec, Error, TimeseriesDB};
use crate::datapoint::{Datapoint, DatapointArray, DatapointIterator, InfoIterator, SortChecker};

/// Encoded batches the append producer may run ahead of the writer.
const APPEND_QUEUE: usize = 3;

/// How new data treats data already stored at the same timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMethod {
    /// Overwrite whatever the new data overlaps.
    #[default]
    Update,
    /// Fail on any overlap with stored data.
    Insert,
    /// Fail unless the new data starts after everything stored.
    Append,
}

impl FromStr for InsertMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "update" => Ok(InsertMethod::Update),
            "insert" => Ok(InsertMethod::Insert),
            "append" => Ok(InsertMethod::Append),
            other => Err(Error::bad_query(format!(
                "unrecognized insert method {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct InsertOptions {
    pub actions: bool,
    pub method: InsertMethod,
}

impl InsertOptions {
    pub fn method(method: InsertMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn actions(mut self, actions: bool) -> Self {
        self.actions = actions;
        self
    }
}

/// What an insert consumed: the last datapoint, the span `[start, end]` it covered, and how many
/// datapoints it held.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InsertInfo {
    pub last: Option<Datapoint>,
    pub start: f64,
    pub end: f64,
    pub count: u64,
}

impl TimeseriesDB {
    /// Merges `data` into the series inside one transaction. Nothing is written if any part fails.
    pub fn insert<I: DatapointIterator>(
        &self,
        tsid: &str,
        data: I,
        opts: InsertOptions,
    ) -> Result<InsertInfo, Error> {
        let mut input = InfoIterator::new(SortChecker::new(data));
        let res = self.insert_checked(tsid, &mut input, opts);
        let closed = input.close();
        res?;
        closed?;
        if input.count == 0 {
            return Ok(InsertInfo::default());
        }
        Ok(InsertInfo {
            last: input.last,
            start: input.start,
            end: input.end,
            count: input.count,
        })
    }

    fn insert_checked<I: DatapointIterator>(
        &self,
        tsid: &str,
        input: &mut I,
        opts: InsertOptions,
    ) -> Result<(), Error> {
        let Some(first) = input.next()? else {
            return Ok(());
        };
        let table = BatchTable::new(tsid, opts.actions);

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if opts.method == InsertMethod::Append {
            if let Some(last) = table.last_datapoint(&tx, &self.codec)? {
                if first.timestamp <= last.timestamp || first.timestamp < last.end_time() {
                    return Err(Error::Conflict {
                        series: tsid.to_string(),
                        timestamp: first.timestamp,
                    });
                }
            }
        }

        let mut merger = Merger {
            conn: &tx,
            table: &table,
            codec: &self.codec,
            batch_size: self.config.batch_size,
            max_batch_size: self.config.max_batch_size,
            method: opts.method,
            run: Run::default(),
        };
        merger.merge_stream(first, input, self.config.prefetch_batches)?;

        tx.commit()?;
        Ok(())
    }
}

/// Stored batches following a cursor, fetched a few at a time. Each round is a fresh statement,
/// so nothing holds the connection while the merger writes in between.
struct IteratedBatcher {
    cursor: Option<f64>,
    queue: VecDeque<StoredBatch>,
    prefetch: usize,
    exhausted: bool,
}

impl IteratedBatcher {
    fn new(cursor: Option<f64>, prefetch: usize) -> Self {
        Self {
            cursor,
            queue: VecDeque::new(),
            prefetch: prefetch.max(1),
            exhausted: false,
        }
    }

    fn next(
        &mut self,
        conn: &Connection,
        table: &BatchTable,
        codec: &BatchCodec,
    ) -> Result<Option<StoredBatch>, Error> {
        if self.queue.is_empty() && !self.exhausted {
            let page = table.batches_after(conn, codec, self.cursor, self.prefetch)?;
            self.exhausted = page.len() < self.prefetch;
            if let Some(last) = page.last() {
                self.cursor = Some(last.start);
            }
            self.queue.extend(page);
        }
        Ok(self.queue.pop_front())
    }
}

/// The stored batches currently being rewritten, merged with new data.
#[derive(Default)]
struct Run {
    /// Settled datapoints, in order.
    done: DatapointArray,
    /// Stored datapoints the input has not reached yet.
    ahead: VecDeque<Datapoint>,
    /// `tstart` of the stored rows folded into this run and not yet deleted.
    origins: Vec<f64>,
    modified: bool,
}

enum Overlap {
    Keep,
    Displace,
    Replace,
}

struct Merger<'a> {
    conn: &'a Connection,
    table: &'a BatchTable,
    codec: &'a BatchCodec,
    batch_size: usize,
    max_batch_size: usize,
    method: InsertMethod,
    run: Run,
}

impl Merger<'_> {
    fn merge_stream<I: DatapointIterator>(
        &mut self,
        first: Datapoint,
        input: &mut I,
        prefetch: usize,
    ) -> Result<(), Error> {
        let current = self
            .table
            .batch_at_or_before(self.conn, self.codec, first.timestamp)?;
        let mut batcher = IteratedBatcher::new(current.as_ref().map(|b| b.start), prefetch);
        if let Some(current) = current {
            self.open(current, &first);
        }
        let mut next_stored = batcher.next(self.conn, self.table, self.codec)?;

        let mut dp = first;
        loop {
            match next_stored.take() {
                Some(nb) if !dp.ends_before(nb.start) => {
                    if dp.timestamp >= nb.start {
                        self.close_run()?;
                        self.open(nb, &dp);
                    } else {
                        self.absorb(nb);
                    }
                    next_stored = batcher.next(self.conn, self.table, self.codec)?;
                    continue;
                }
                None if self.run.ahead.is_empty() => return self.append_tail(dp, input),
                other => next_stored = other,
            }
            self.merge_point(dp)?;
            match input.next()? {
                Some(next) => dp = next,
                None => break,
            }
        }
        self.close_run()
    }

    /// Starts a run on a stored batch, unless the batch is already full and the incoming
    /// datapoint lies past its end, in which case the batch is left alone.
    fn open(&mut self, batch: StoredBatch, dp: &Datapoint) {
        let untouched = batch
            .points
            .last()
            .is_some_and(|last| last.ends_before(dp.timestamp));
        if untouched && batch.points.len() >= self.batch_size {
            return;
        }
        self.absorb(batch);
    }

    fn absorb(&mut self, batch: StoredBatch) {
        self.run.origins.push(batch.start);
        self.run.ahead.extend(batch.points);
    }

    fn displace(&mut self, old: &Datapoint) -> Result<(), Error> {
        if self.method != InsertMethod::Update {
            return Err(Error::Conflict {
                series: self.table.tsid().to_string(),
                timestamp: old.timestamp,
            });
        }
        self.run.modified = true;
        Ok(())
    }

    fn merge_point(&mut self, dp: Datapoint) -> Result<(), Error> {
        let mut identical = false;
        loop {
            let Some(e) = self.run.ahead.front() else {
                break;
            };
            let overlap = if e.timestamp < dp.timestamp {
                if e.duration > 0.0 && e.end_time() > dp.timestamp {
                    Overlap::Displace
                } else {
                    Overlap::Keep
                }
            } else if e.timestamp == dp.timestamp
                || (dp.duration > 0.0 && e.timestamp < dp.end_time())
            {
                Overlap::Replace
            } else {
                break;
            };
            let Some(e) = self.run.ahead.pop_front() else {
                break;
            };
            match overlap {
                Overlap::Keep => self.run.done.push(e),
                Overlap::Displace => self.displace(&e)?,
                Overlap::Replace if e == dp => identical = true,
                Overlap::Replace => self.displace(&e)?,
            }
        }
        if !identical {
            self.run.modified = true;
        }
        self.run.done.push(dp);
        self.flush_full()
    }

    fn delete_origins(&mut self) -> Result<(), Error> {
        for start in self.run.origins.drain(..) {
            self.table.delete_batch(self.conn, start)?;
        }
        self.run.modified = true;
        Ok(())
    }

    /// Writes out full batches once the settled run grows past `max_batch_size`.
    fn flush_full(&mut self) -> Result<(), Error> {
        if self.run.done.len() <= self.max_batch_size {
            return Ok(());
        }
        self.delete_origins()?;
        while self.run.done.len() > self.max_batch_size {
            let rest = self.run.done.split_off(self.batch_size);
            self.table.write_batch(self.conn, self.codec, &self.run.done)?;
            self.run.done = rest;
        }
        Ok(())
    }

    fn close_run(&mut self) -> Result<(), Error> {
        let mut run = std::mem::take(&mut self.run);
        run.done.extend(run.ahead.drain(..));
        if !run.modified {
            return Ok(());
        }
        for start in run.origins.drain(..) {
            self.table.delete_batch(self.conn, start)?;
        }
        self.table.write_split(
            self.conn,
            self.codec,
            self.batch_size,
            self.max_batch_size,
            &run.done,
        )
    }

    /// Everything from `dp` on lies past the stored data. A producer thread cuts and encodes
    /// batches while this thread writes them.
    fn append_tail<I: DatapointIterator>(&mut self, dp: Datapoint, input: &mut I) -> Result<(), Error> {
        let mut run = std::mem::take(&mut self.run);
        for start in run.origins.drain(..) {
            self.table.delete_batch(self.conn, start)?;
        }
        let mut buf = run.done;
        buf.push(dp);

        let codec = self.codec;
        let (batch_size, max_batch_size) = (self.batch_size, self.max_batch_size);
        log::debug!(
            "{}[{}]: appending past the last stored batch",
            self.table.name(),
            self.table.tsid()
        );

        thread::scope(|s| {
            let (tx, rx) = sync_channel::<Result<EncodedBatch, Error>>(APPEND_QUEUE);
            let producer = s.spawn(move || -> Result<(), Error> {
                loop {
                    let next = input.next()?;
                    if buf.len() > max_batch_size {
                        let rest = buf.split_off(batch_size);
                        let full = std::mem::replace(&mut buf, rest);
                        if tx.send(encode_batch(codec, &full)).is_err() {
                            return Ok(());
                        }
                    }
                    match next {
                        Some(dp) => buf.push(dp),
                        None => break,
                    }
                }
                if !buf.is_empty() {
                    let _ = tx.send(encode_batch(codec, &buf));
                }
                Ok(())
            });

            let mut written = Ok(());
            for encoded in rx.iter() {
                written = encoded.and_then(|b| {
                    self.table
                        .write_encoded(self.conn, b.start, b.end, b.length as usize, &b.data)
                });
                if written.is_err() {
                    break;
                }
            }
            drop(rx);

            let produced = producer
                .join()
                .map_err(|_| Error::Pipeline("append producer panicked".into()))
                .and_then(|r| r);
            if let Err(e) = &written {
                log::warn!("append pipeline for {} stopped: {e}", self.table.tsid());
            }
            written.and(produced)
        })
    }
}

fn encode_batch(codec: &BatchCodec, points: &[Datapoint]) -> Result<EncodedBatch, Error> {
    let (start, end) = match points.first() {
        Some(first) => (
            first.timestamp,
            points
                .iter()
                .map(Datapoint::end_time)
                .fold(first.timestamp, f64::max),
        ),
        None => return Err(Error::Pipeline("attempted to encode an empty batch".into())),
    };
    Ok(EncodedBatch {
        start,
        end,
        length: points.len() as i64,
        data: codec.encode(points)?,
    })
}
