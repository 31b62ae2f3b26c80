use super::*;
use crate::datapoint::DatapointIterator;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct VecBatches {
    batches: VecDeque<Batch>,
    fail_after: Option<usize>,
    closed: Arc<AtomicBool>,
}

impl VecBatches {
    fn new(batches: &[&[f64]]) -> Self {
        Self {
            batches: batches
                .iter()
                .map(|ts| ts.iter().map(|&t| Datapoint::new(t, t)).collect())
                .collect(),
            fail_after: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

impl BatchIterator for VecBatches {
    fn next_batch(&mut self) -> Result<Option<Batch>, Error> {
        if let Some(n) = self.fail_after.as_mut() {
            if *n == 0 {
                return Err(Error::DatabaseCorrupted("broken source".into()));
            }
            *n -= 1;
        }
        Ok(self.batches.pop_front())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn drain<B: BatchIterator>(mut it: B) -> Vec<Vec<f64>> {
    let mut out = Vec::new();
    while let Some(batch) = it.next_batch().unwrap() {
        out.push(timestamps(&batch));
    }
    it.close().unwrap();
    out
}

#[test]
fn test_start_time() {
    let src = VecBatches::new(&[&[1.0, 2.0], &[3.0, 4.0, 5.0], &[6.0]]);
    assert_eq!(
        drain(BatchStartTime::new(src, 3.5)),
        vec![vec![4.0, 5.0], vec![6.0]]
    );

    let src = VecBatches::new(&[&[1.0, 2.0]]);
    assert!(drain(BatchStartTime::new(src, 10.0)).is_empty());
}

#[test]
fn test_end_time() {
    let src = VecBatches::new(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], &[7.0]]);
    assert_eq!(
        drain(BatchEndTime::new(src, 5.0)),
        vec![vec![1.0, 2.0, 3.0], vec![4.0]]
    );

    let src = VecBatches::new(&[&[1.0, 2.0], &[4.0, 5.0]]);
    assert_eq!(drain(BatchEndTime::new(src, 4.0)), vec![vec![1.0, 2.0]]);
}

#[test]
fn test_end_offset() {
    let src = VecBatches::new(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0], &[7.0]]);
    assert_eq!(
        drain(BatchEndOffset::new(src, 4.0, 1)),
        vec![vec![1.0, 2.0, 3.0], vec![4.0]]
    );

    let src = VecBatches::new(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
    assert_eq!(
        drain(BatchEndOffset::new(src, 4.0, 0)),
        vec![vec![1.0, 2.0, 3.0]]
    );
}

#[test]
fn test_start_offset() {
    let src = VecBatches::new(&[&[1.0, 2.0, 3.0], &[4.0, 5.0]]);
    assert_eq!(
        drain(BatchStartOffset::new(src, 1.0, 2)),
        vec![vec![3.0], vec![4.0, 5.0]]
    );

    let src = VecBatches::new(&[&[1.0, 2.0, 3.0], &[4.0, 5.0]]);
    assert!(drain(BatchStartOffset::new(src, 1.0, 3)).is_empty());

    // The first batch is not the one the index points into: nothing to skip.
    let src = VecBatches::new(&[&[4.0, 5.0]]);
    assert_eq!(drain(BatchStartOffset::new(src, 1.0, 1)), vec![vec![4.0, 5.0]]);
}

#[test]
fn test_point_limit() {
    let src = VecBatches::new(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]);
    assert_eq!(
        drain(BatchPointLimit::new(src, 4)),
        vec![vec![1.0, 2.0, 3.0], vec![4.0]]
    );

    let src = VecBatches::new(&[&[1.0, 2.0, 3.0]]);
    assert!(drain(BatchPointLimit::new(src, 0)).is_empty());
}

#[test]
fn test_descending_window() {
    let src = VecBatches::new(&[&[4.0, 5.0, 6.0], &[1.0, 2.0, 3.0]]);
    assert_eq!(
        drain(DescendingWindow::new(src, Some(2.0), Some(6.0))),
        vec![vec![5.0, 4.0], vec![3.0, 2.0]]
    );

    let src = VecBatches::new(&[&[7.0, 8.0], &[4.0, 5.0], &[1.0]]);
    assert_eq!(
        drain(DescendingWindow::new(src, Some(4.5), Some(7.0))),
        vec![vec![5.0]]
    );
}

#[test]
fn test_reverse_batches() {
    let src = VecBatches::new(&[&[1.0, 2.0], &[3.0]]);
    assert_eq!(
        drain(ReverseBatches::new(src)),
        vec![vec![3.0], vec![2.0, 1.0]]
    );
}

#[test]
fn test_chan_passes_batches_in_order() {
    let src = VecBatches::new(&[&[1.0, 2.0], &[3.0], &[4.0, 5.0, 6.0]]);
    let chan = ChanBatchIterator::new(src, 1).unwrap();
    assert_eq!(
        drain(chan),
        vec![vec![1.0, 2.0], vec![3.0], vec![4.0, 5.0, 6.0]]
    );
}

#[test]
fn test_chan_forwards_errors() {
    let src = VecBatches::new(&[&[1.0], &[2.0], &[3.0]]).failing_after(1);
    let mut chan = ChanBatchIterator::new(src, 4).unwrap();
    assert_eq!(timestamps(&chan.next_batch().unwrap().unwrap()), vec![1.0]);
    assert!(matches!(chan.next_batch(), Err(Error::DatabaseCorrupted(_))));
    assert!(chan.next_batch().unwrap().is_none());
    chan.close().unwrap();
}

#[test]
fn test_chan_close_early() {
    let batches: Vec<Vec<f64>> = (0..100i32).map(|i| vec![f64::from(i)]).collect();
    let refs: Vec<&[f64]> = batches.iter().map(Vec::as_slice).collect();
    let mut chan = ChanBatchIterator::new(VecBatches::new(&refs), 2).unwrap();

    assert_eq!(timestamps(&chan.next_batch().unwrap().unwrap()), vec![0.0]);
    chan.close().unwrap();
    chan.close().unwrap();
    assert!(chan.next_batch().unwrap().is_none());
}

#[test]
fn test_batch_datapoint_iterator() {
    let src = VecBatches::new(&[&[1.0, 2.0], &[3.0]]);
    let mut it = BatchDatapointIterator::new(src);
    let points = collect_datapoints(&mut it).unwrap();
    assert_eq!(timestamps(&points), vec![1.0, 2.0, 3.0]);
    assert!(it.next().unwrap().is_none());
}

#[test]
fn test_close_reaches_source() {
    let src = VecBatches::new(&[&[1.0, 2.0], &[3.0]]);
    let closed = src.closed.clone();
    let mut limited = BatchPointLimit::new(BatchEndTime::new(src, 10.0), 1);
    assert!(limited.next_batch().unwrap().is_some());
    assert!(!closed.load(Ordering::SeqCst));
    limited.close().unwrap();
    assert!(closed.load(Ordering::SeqCst));
}
