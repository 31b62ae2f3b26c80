//! Batched, compressed time-series storage layered over SQLite.
//!
//! Datapoints are grouped into ordered batches, each stored as one compressed row. Reads translate
//! time and index queries into range scans over those rows; writes merge new data into the
//! overlapping batches inside a single transaction.

pub mod datapoint;
pub mod query;
pub mod storage;

pub use datapoint::{Datapoint, DatapointArray, DatapointIterator};
pub use query::{Query, Timestamp, Transforms};
pub use storage::{
    Compression, Error, InsertInfo, InsertMethod, InsertOptions, TimeseriesConfig, TimeseriesDB,
};
