use crate::datapoint::{collect_datapoints, Datapoint, DatapointArray, DatapointIterator};
use crate::query::{Query, Transforms};
use crate::storage::tests::{cmp_query, dp, dpd, insert, new_db, read, timestamps};
use crate::storage::{Error, InsertMethod, TimeseriesDB};
use tempfile::TempDir;

pub mod index_queries;
pub mod timestamps;

/// Series `s1` holding the points at 1..=8 after an overwrite: `d0`..`d4`, then `d6`..`d8`, in
/// batches of at most 5.
fn create_test_series() -> (TimeseriesDB, TempDir, DatapointArray) {
    let (db, dir) = new_db(3, 5);
    let dpa7 = vec![
        dpd(1.0, 1.0, "test0"),
        dpd(2.0, 0.7, "test1"),
        dpd(3.0, 0.6, "test2"),
        dpd(4.0, 0.5, "test3"),
        dpd(5.0, 0.4, "test4"),
        dpd(6.0, 1.0, "test5"),
        dpd(6.0, 0.2, "test6"),
        dpd(7.0, 0.1, "test7"),
        dpd(8.0, 0.0, "test8"),
    ];
    insert(&db, "s1", &dpa7[..6], InsertMethod::Update).unwrap();
    insert(&db, "s1", &dpa7[6..], InsertMethod::Update).unwrap();

    let mut stored = dpa7[..5].to_vec();
    stored.extend_from_slice(&dpa7[6..]);
    (db, dir, stored)
}

#[test]
fn test_full_read() {
    let (db, _dir, stored) = create_test_series();
    assert_eq!(db.length("s1", false).unwrap(), 8);
    cmp_query(&db, Query::new("s1"), &stored);
}

#[test]
fn test_limit() {
    let (db, _dir, stored) = create_test_series();
    cmp_query(&db, Query::new("s1").limit(3), &stored[..3]);
    cmp_query(&db, Query::new("s1").t1(4.0).limit(2), &stored[3..5]);
    // A zero limit means no limit.
    cmp_query(&db, Query::new("s1").limit(0), &stored);
}

#[test]
fn test_standard_transforms() {
    let (db, _dir) = new_db(3, 5);
    let points = vec![dp(1.0, 1), dp(2.0, 1), dp(3.0, 2), dp(4.0, 2), dp(5.0, 1)];
    insert(&db, "s1", &points, InsertMethod::Update).unwrap();

    cmp_query(
        &db,
        Query::new("s1").transform("distinct"),
        &[dp(1.0, 1), dp(3.0, 2), dp(5.0, 1)],
    );
    cmp_query(&db, Query::new("s1").transform("last"), &[dp(5.0, 1)]);
    cmp_query(
        &db,
        Query::new("s1").transform("distinct").limit(2),
        &[dp(1.0, 1), dp(3.0, 2)],
    );
    // Transforms run before the limit.
    cmp_query(&db, Query::new("s1").transform("last").limit(2), &[dp(5.0, 1)]);
}

#[test]
fn test_unknown_transform() {
    let (db, _dir, _) = create_test_series();
    let err = db.query(&Query::new("s1").transform("sum")).err().unwrap();
    assert!(err.is_bad_query());
}

/// Keeps only datapoints whose data is an even integer.
struct EvenOnly(Box<dyn DatapointIterator>);

impl DatapointIterator for EvenOnly {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        while let Some(dp) = self.0.next()? {
            if dp.data.as_i64().is_some_and(|v| v % 2 == 0) {
                return Ok(Some(dp));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.0.close()
    }
}

#[test]
fn test_custom_transform() {
    let (db, _dir) = new_db(3, 5);
    let db = db.with_transforms(
        Transforms::standard().with("even", |it| Ok(Box::new(EvenOnly(it)) as Box<dyn DatapointIterator>)),
    );
    let points: DatapointArray = (1..=10i32).map(|i| dp(f64::from(i), i)).collect();
    insert(&db, "s1", &points, InsertMethod::Update).unwrap();

    let got = read(&db, &Query::new("s1").transform("even"));
    assert_eq!(timestamps(&got), vec![2.0, 4.0, 6.0, 8.0, 10.0]);

    let mut transforms = Transforms::standard();
    transforms.register("last", |it| Ok(it));
    assert_eq!(transforms.names().collect::<Vec<_>>(), vec!["distinct", "last"]);
    assert!(transforms.contains("last"));
    assert!(!transforms.contains("even"));
}

#[test]
fn test_query_from_json() {
    let q: Query = serde_json::from_str(
        r#"{"timeseries": "s1", "t1": "2024-01-01", "i2": -1, "limit": 10, "reversed": false}"#,
    )
    .unwrap();
    assert_eq!(q.timeseries, "s1");
    assert_eq!(q.t1, Some("2024-01-01".into()));
    assert_eq!(q.i2, Some(-1));
    assert_eq!(q.limit, Some(10));
    assert!(!q.actions);

    let q: Query = serde_json::from_str(r#"{"timeseries": "s1", "t": 5}"#).unwrap();
    assert_eq!(q.t, Some(5.0.into()));
}

#[test]
fn test_iterator_closes_cleanly() {
    let (db, _dir, stored) = create_test_series();
    let mut it = db.query(&Query::new("s1")).unwrap();
    assert_eq!(it.next().unwrap(), Some(stored[0].clone()));
    it.close().unwrap();
    it.close().unwrap();

    let all = collect_datapoints(&mut db.query(&Query::new("s1")).unwrap()).unwrap();
    assert_eq!(all, stored);
}
