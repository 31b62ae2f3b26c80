use std::fmt;

use crate::datapoint::{Datapoint, DatapointIterator};
use crate::storage::Error;

pub type BoxedIterator = Box<dyn DatapointIterator>;

type TransformFn = Box<dyn Fn(BoxedIterator) -> Result<BoxedIterator, Error> + Send + Sync>;

/// Named transforms a query may request, in registration order. Build one at startup and hand it
/// to the database with `TimeseriesDB::with_transforms`.
#[derive(Default)]
pub struct Transforms {
    entries: Vec<(String, TransformFn)>,
}

impl Transforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transforms available out of the box: `distinct` and `last`.
    pub fn standard() -> Self {
        Self::new()
            .with("distinct", |it| Ok(Box::new(Distinct::new(it)) as BoxedIterator))
            .with("last", |it| Ok(Box::new(Last::new(it)) as BoxedIterator))
    }

    /// Adds a transform, replacing any earlier one with the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(BoxedIterator) -> Result<BoxedIterator, Error> + Send + Sync + 'static,
    {
        let name = name.into();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, Box::new(f)));
    }

    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(BoxedIterator) -> Result<BoxedIterator, Error> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Wraps `it` in the named transform. The iterator is closed if the name is unknown or the
    /// transform fails to build.
    pub fn apply(&self, name: &str, mut it: BoxedIterator) -> Result<BoxedIterator, Error> {
        let Some((_, f)) = self.entries.iter().find(|(n, _)| n == name) else {
            it.close()?;
            return Err(Error::bad_query(format!("unknown transform {name:?}")));
        };
        f(it)
    }
}

impl fmt::Debug for Transforms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Drops datapoints whose data repeats the previous datapoint's.
struct Distinct {
    inner: BoxedIterator,
    prev: Option<serde_json::Value>,
}

impl Distinct {
    fn new(inner: BoxedIterator) -> Self {
        Self { inner, prev: None }
    }
}

impl DatapointIterator for Distinct {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        while let Some(dp) = self.inner.next()? {
            if self.prev.as_ref() != Some(&dp.data) {
                self.prev = Some(dp.data.clone());
                return Ok(Some(dp));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}

/// Yields only the final datapoint of the stream.
struct Last {
    inner: BoxedIterator,
    done: bool,
}

impl Last {
    fn new(inner: BoxedIterator) -> Self {
        Self { inner, done: false }
    }
}

impl DatapointIterator for Last {
    fn next(&mut self) -> Result<Option<Datapoint>, Error> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut last = None;
        while let Some(dp) = self.inner.next()? {
            last = Some(dp);
        }
        Ok(last)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}
