use super::*;

#[test]
fn test_index_range() {
    let (db, _dir, stored) = create_test_series();

    cmp_query(&db, Query::new("s1").i1(1).i2(-3), &stored[1..5]);
    cmp_query(&db, Query::new("s1").i1(1).i2(3), &stored[1..3]);
    cmp_query(&db, Query::new("s1").i1(-1), &stored[7..]);
    cmp_query(&db, Query::new("s1").i1(-3).i2(-1), &stored[5..7]);
    cmp_query(&db, Query::new("s1").i2(80), &stored);
    cmp_query(&db, Query::new("s1").i1(0), &stored);
}

#[test]
fn test_single_index() {
    let (db, _dir, stored) = create_test_series();

    cmp_query(&db, Query::new("s1").i(1), &stored[1..2]);
    cmp_query(&db, Query::new("s1").i(-3), &stored[5..6]);
    cmp_query(&db, Query::new("s1").i(0), &stored[..1]);
    cmp_query(&db, Query::new("s1").i(-1), &stored[7..]);
    cmp_query(&db, Query::new("s1").i(8), &[]);
    cmp_query(&db, Query::new("s1").i(-9), &[]);
}

#[test]
fn test_index_out_of_range() {
    let (db, _dir, stored) = create_test_series();

    cmp_query(&db, Query::new("s1").i1(8000), &[]);
    cmp_query(&db, Query::new("s1").i2(-8000), &[]);
    cmp_query(&db, Query::new("s1").i1(-8000), &stored);
    cmp_query(&db, Query::new("s1").i1(-8000).i2(2), &stored[..2]);
    cmp_query(&db, Query::new("s1").i1(3).i2(2), &[]);
    cmp_query(&db, Query::new("s1").i1(-2).i2(-4), &[]);
    cmp_query(&db, Query::new("s2").i1(0).i2(10), &[]);
}

#[test]
fn test_index_and_time() {
    let (db, _dir, stored) = create_test_series();

    cmp_query(&db, Query::new("s1").i1(1).i2(-1).t1(6.0).t2(40.0), &stored[5..7]);
    cmp_query(&db, Query::new("s1").i1(-4).t2(7.0), &stored[4..6]);
    cmp_query(&db, Query::new("s1").i1(2).i2(6).t1(1.0).t2(4.5), &stored[2..4]);
}

#[test]
fn test_reversed_index_range() {
    let (db, _dir, stored) = create_test_series();

    let mut expected = stored[1..5].to_vec();
    expected.reverse();
    cmp_query(&db, Query::new("s1").i1(1).i2(-3).reversed(true), &expected);

    let mut expected = stored[6..].to_vec();
    expected.reverse();
    cmp_query(&db, Query::new("s1").i1(-2).reversed(true), &expected);
}

#[test]
fn test_index_limit() {
    let (db, _dir, stored) = create_test_series();
    cmp_query(&db, Query::new("s1").i1(2).limit(3), &stored[2..5]);
}

#[test]
fn test_extreme_indices() {
    let (db, _dir, stored) = create_test_series();

    cmp_query(&db, Query::new("s1").i(i64::MIN), &[]);
    cmp_query(&db, Query::new("s1").i(i64::MAX), &[]);
    cmp_query(&db, Query::new("s1").i1(i64::MIN), &stored);
    cmp_query(&db, Query::new("s1").i1(i64::MAX), &[]);
    cmp_query(&db, Query::new("s1").i2(i64::MIN), &[]);
    cmp_query(&db, Query::new("s1").i2(i64::MAX), &stored);
    cmp_query(&db, Query::new("s1").i1(i64::MIN).i2(i64::MAX), &stored);
    cmp_query(&db, Query::new("s1").i1(i64::MIN).i2(-1), &stored[..7]);
    cmp_query(&db, Query::new("s1").i1(-2).i2(i64::MIN), &[]);
    cmp_query(&db, Query::new("s1").i1(1).i2(i64::MAX), &stored[1..]);
}
