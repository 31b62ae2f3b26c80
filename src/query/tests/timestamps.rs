use crate::query::{parse_timestamp, parse_timestamp_at, Timestamp};
use crate::storage::Error;
use chrono::{TimeZone, Utc};

fn fixed_now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

const NOW: f64 = 1_714_564_800.0;

#[test]
fn test_numeric() {
    assert_eq!(parse_timestamp("1700000000").unwrap(), 1_700_000_000.0);
    assert_eq!(parse_timestamp(" 12.5 ").unwrap(), 12.5);
    assert_eq!(parse_timestamp("-3").unwrap(), -3.0);
    assert!(matches!(parse_timestamp("inf"), Err(Error::InvalidTimestamp(_))));
    assert!(matches!(parse_timestamp("NaN"), Err(Error::InvalidTimestamp(_))));
}

#[test]
fn test_relative() {
    let now = fixed_now();
    assert_eq!(parse_timestamp_at("now", now).unwrap(), NOW);
    assert_eq!(parse_timestamp_at("now-1d", now).unwrap(), NOW - 86400.0);
    assert_eq!(parse_timestamp_at("now - 2h", now).unwrap(), NOW - 7200.0);
    assert_eq!(parse_timestamp_at("now+30m", now).unwrap(), NOW + 1800.0);
    assert_eq!(parse_timestamp_at("now-1.5w", now).unwrap(), NOW - 1.5 * 7.0 * 86400.0);
    assert_eq!(parse_timestamp_at("now-90seconds", now).unwrap(), NOW - 90.0);
}

#[test]
fn test_absolute() {
    let now = fixed_now();
    assert_eq!(parse_timestamp_at("2024-05-01T12:00:00Z", now).unwrap(), NOW);
    assert_eq!(parse_timestamp_at("2024-05-01T14:00:00+02:00", now).unwrap(), NOW);
    assert_eq!(parse_timestamp_at("2024-05-01", now).unwrap(), NOW - 12.0 * 3600.0);
    assert_eq!(
        parse_timestamp_at("2024-05-01T12:00:00.250Z", now).unwrap(),
        NOW + 0.25
    );
}

#[test]
fn test_invalid() {
    let now = fixed_now();
    for s in ["", "yesterday", "now-", "now-1y", "now*2d", "2024-13-01", "nowish", "now-é"] {
        assert!(
            matches!(parse_timestamp_at(s, now), Err(Error::InvalidTimestamp(_))),
            "{s:?} should not parse"
        );
    }
}

#[test]
fn test_timestamp_values() {
    let now = fixed_now();
    assert_eq!(Timestamp::from(5.0).resolve_at(now).unwrap(), 5.0);
    assert_eq!(Timestamp::from("now-1m").resolve_at(now).unwrap(), NOW - 60.0);
    assert!(Timestamp::Unix(f64::INFINITY).resolve_at(now).is_err());
    assert_eq!(Timestamp::from("now").to_string(), "now");
    assert_eq!(Timestamp::from(1.5).to_string(), "1.5");

    let ts: Timestamp = serde_json::from_str("12").unwrap();
    assert_eq!(ts, Timestamp::Unix(12.0));
    let ts: Timestamp = serde_json::from_str("\"now\"").unwrap();
    assert_eq!(ts, Timestamp::Text("now".into()));
}
