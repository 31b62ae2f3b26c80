use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::Error;

/// A query bound: unix seconds, or text such as `"2024-05-01T12:00:00Z"`, `"now"` or `"now-2d"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Unix(f64),
    Text(String),
}

impl Timestamp {
    /// Unix seconds, evaluating relative forms against the current time.
    pub fn resolve(&self) -> Result<f64, Error> {
        self.resolve_at(Utc::now())
    }

    pub fn resolve_at(&self, now: DateTime<Utc>) -> Result<f64, Error> {
        match self {
            Timestamp::Unix(t) if t.is_finite() => Ok(*t),
            Timestamp::Unix(t) => Err(Error::InvalidTimestamp(t.to_string())),
            Timestamp::Text(s) => parse_timestamp_at(s, now),
        }
    }
}

impl From<f64> for Timestamp {
    fn from(t: f64) -> Self {
        Timestamp::Unix(t)
    }
}

impl From<&str> for Timestamp {
    fn from(s: &str) -> Self {
        Timestamp::Text(s.to_string())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Unix(t) => write!(f, "{t}"),
            Timestamp::Text(s) => f.write_str(s),
        }
    }
}

pub fn parse_timestamp(s: &str) -> Result<f64, Error> {
    parse_timestamp_at(s, Utc::now())
}

pub fn parse_timestamp_at(s: &str, now: DateTime<Utc>) -> Result<f64, Error> {
    let s = s.trim();
    if let Ok(t) = s.parse::<f64>() {
        if t.is_finite() {
            return Ok(t);
        }
        return Err(Error::InvalidTimestamp(s.to_string()));
    }

    if let Some(rest) = s.strip_prefix("now") {
        let rest = rest.trim();
        let now = to_unix(now);
        if rest.is_empty() {
            return Ok(now);
        }
        let (sign, offset) = if let Some(offset) = rest.strip_prefix('-') {
            (-1.0, offset)
        } else if let Some(offset) = rest.strip_prefix('+') {
            (1.0, offset)
        } else {
            return Err(Error::InvalidTimestamp(s.to_string()));
        };
        let offset =
            parse_duration(offset.trim()).ok_or_else(|| Error::InvalidTimestamp(s.to_string()))?;
        return Ok(now + sign * offset);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(to_unix(dt.with_timezone(&Utc)));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(to_unix(midnight.and_utc()));
        }
    }
    Err(Error::InvalidTimestamp(s.to_string()))
}

/// `"90s"`, `"1.5h"`, `"2w"` in seconds.
fn parse_duration(s: &str) -> Option<f64> {
    let split = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = s.split_at(split);
    let number: f64 = number.trim().parse().ok()?;
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "second" | "seconds" => 1.0,
        "m" | "min" | "minute" | "minutes" => 60.0,
        "h" | "hour" | "hours" => 3600.0,
        "d" | "day" | "days" => 86400.0,
        "w" | "week" | "weeks" => 7.0 * 86400.0,
        _ => return None,
    };
    let total = number * seconds;
    total.is_finite().then_some(total)
}

fn to_unix(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) * 1e-9
}
