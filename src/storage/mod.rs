//! Time-series storage implementation

use serde::Deserialize;

mod batch_iter;
mod codec;
mod database;
mod delete;
mod errors;
mod insert;
mod table;

#[cfg(test)]
pub(crate) mod tests;

pub use batch_iter::{
    Batch, BatchDatapointIterator, BatchEndOffset, BatchEndTime, BatchIterator, BatchPointLimit,
    BatchStartOffset, BatchStartTime, ChanBatchIterator, DescendingWindow, ReverseBatches,
    SqlBatchIterator,
};
pub use codec::BatchCodec;
pub use database::TimeseriesDB;
pub use errors::Error;
pub use insert::{InsertInfo, InsertMethod, InsertOptions};
pub use table::{BatchTable, EncodedBatch, IndexBound, IndexPosition, RangeScan, StoredBatch};

/// Configuration for the storage engine
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimeseriesConfig {
    /// Size of the batches cut when a run grows past `max_batch_size`.
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub compression: Compression,
    /// Rows fetched per round trip by time-range scans.
    pub query_page_size: usize,
    /// Capacity of the read-ahead queue between a batch producer and its consumer.
    pub read_ahead: usize,
    /// Batches the insert path prefetches per round trip while merging.
    pub prefetch_batches: usize,
    /// Table holding the ids the timeseries belong to.
    pub owner_table: String,
}

impl Default for TimeseriesConfig {
    fn default() -> Self {
        Self {
            batch_size: 5000,
            max_batch_size: 20000,
            compression: Compression::Zstd(3),
            query_page_size: 32,
            read_ahead: 5,
            prefetch_batches: 5,
            owner_table: "objects".to_string(),
        }
    }
}

impl TimeseriesConfig {
    pub fn with_batch_sizes(mut self, batch_size: usize, max_batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::bad_query("batch_size must be at least 1"));
        }
        if self.batch_size > self.max_batch_size {
            return Err(Error::bad_query(format!(
                "batch_size ({}) can't be larger than max_batch_size ({})",
                self.batch_size, self.max_batch_size
            )));
        }
        if self.query_page_size == 0 || self.prefetch_batches == 0 {
            return Err(Error::bad_query(
                "query_page_size and prefetch_batches must be at least 1",
            ));
        }
        if self.owner_table.is_empty()
            || !self
                .owner_table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::bad_query(format!(
                "invalid owner table name {:?}",
                self.owner_table
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Lz4,
    Zstd(i32),
}
