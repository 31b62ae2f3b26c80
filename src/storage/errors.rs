use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bad_query: {0}")]
    BadQuery(String),
    #[error("bad_query: conflict in timeseries {series}: data already exists at timestamp {timestamp}")]
    Conflict { series: String, timestamp: f64 },
    #[error("database_corrupted: {0}")]
    DatabaseCorrupted(String),
    #[error("database_corrupted: undecodable batch: {0}")]
    CorruptBatch(String),
    #[error("bad_query: invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Pipeline error: {0}")]
    Pipeline(String),
}

impl Error {
    /// Errors caused by the caller's request rather than by the store.
    pub fn is_bad_query(&self) -> bool {
        matches!(
            self,
            Error::BadQuery(_) | Error::Conflict { .. } | Error::InvalidTimestamp(_)
        )
    }

    pub fn bad_query(msg: impl Into<String>) -> Self {
        Error::BadQuery(msg.into())
    }
}
