pub mod iterators;

use super::*;
use crate::datapoint::{collect_datapoints, Datapoint, DatapointArray, DatapointArrayIterator};
use crate::query::Query;
use serde_json::Value;
use tempfile::{tempdir, TempDir};

pub fn test_config(batch_size: usize, max_batch_size: usize) -> TimeseriesConfig {
    TimeseriesConfig::default()
        .with_batch_sizes(batch_size, max_batch_size)
        .with_compression(Compression::Zstd(3))
}

/// A file-backed database with series `s1` and `s2` registered. Keep the `TempDir` alive for as
/// long as the database is used.
pub fn new_db(batch_size: usize, max_batch_size: usize) -> (TimeseriesDB, TempDir) {
    let dir = tempdir().unwrap();
    let db = TimeseriesDB::open(dir.path().join("ts.db"), test_config(batch_size, max_batch_size))
        .unwrap();
    db.with_connection(|conn| {
        conn.execute_batch("INSERT INTO objects(id) VALUES ('s1'), ('s2');")?;
        Ok(())
    })
    .unwrap();
    (db, dir)
}

pub fn dp(t: f64, data: impl Into<Value>) -> Datapoint {
    Datapoint::new(t, data)
}

pub fn dpd(t: f64, duration: f64, data: impl Into<Value>) -> Datapoint {
    Datapoint::new(t, data).with_duration(duration)
}

/// `(timestamp, duration)` pairs labelled `test0`, `test1`, ...
pub fn labelled(points: &[(f64, f64)]) -> DatapointArray {
    points
        .iter()
        .enumerate()
        .map(|(i, &(t, d))| dpd(t, d, format!("test{i}")))
        .collect()
}

pub fn insert(
    db: &TimeseriesDB,
    tsid: &str,
    points: &[Datapoint],
    method: InsertMethod,
) -> Result<InsertInfo, Error> {
    db.insert(
        tsid,
        DatapointArrayIterator::new(points.to_vec()),
        InsertOptions::method(method),
    )
}

pub fn read(db: &TimeseriesDB, q: &Query) -> DatapointArray {
    let mut it = db.query(q).unwrap();
    collect_datapoints(&mut it).unwrap()
}

pub fn read_all(db: &TimeseriesDB, tsid: &str) -> DatapointArray {
    read(db, &Query::new(tsid))
}

pub fn cmp_query(db: &TimeseriesDB, q: Query, expected: &[Datapoint]) {
    let got = read(db, &q);
    assert_eq!(got, expected, "query {q:?}");
}

pub fn timestamps(points: &[Datapoint]) -> Vec<f64> {
    points.iter().map(|dp| dp.timestamp).collect()
}

/// No stored row may exceed the configured maximum.
pub fn assert_batches_bounded(db: &TimeseriesDB, tsid: &str) {
    let max = db.config().max_batch_size as i64;
    for len in db.batch_lengths(tsid, false).unwrap() {
        assert!(len > 0 && len <= max, "batch of {len} datapoints (max {max})");
    }
}
