//! Bounded ack-backpressured channel between one reader and one writer.
//!
//! A batch occupies one of `capacity` slots from the moment the reader
//! pushes it until the writer explicitly acknowledges it, so at most
//! `capacity` batches are in flight (queued or being applied) at once. The
//! reader suspends on push when every slot is taken; the writer suspends on
//! fetch when the queue is empty.
//!
//! Delivery is at-least-once: an ack retires the batch and bumps the shared
//! processed counter by the batch's data-record count. Acks are not
//! deduplicated by content, so a redelivered batch after a restart counts
//! again (known accounting caveat, kept as documented behavior).
//!
//! The end-of-stream marker flows through without taking a slot and is
//! never acknowledged.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::trace;

use shardpipe_core::{Error, Record, Result};

/// Callback invoked with the data-record count of each acked batch.
pub type AckFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Create a channel with `capacity` unacknowledged-batch slots.
pub fn channel(capacity: usize, on_ack: AckFn) -> (ChannelSender, ChannelReceiver) {
    let permits = Arc::new(Semaphore::new(capacity));
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelSender {
            tx,
            permits: permits.clone(),
        },
        ChannelReceiver {
            rx,
            permits,
            on_ack,
        },
    )
}

/// Producer half, held by the reader.
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Vec<Record>>,
    permits: Arc<Semaphore>,
}

impl ChannelSender {
    /// Push one batch, suspending until an unacknowledged-batch slot frees
    /// up. Errors when the consumer is gone.
    pub async fn push(&self, batch: Vec<Record>) -> Result<()> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Execution("channel closed by consumer".into()))?;
        // The slot stays taken until the consumer acks this batch.
        permit.forget();
        trace!(records = batch.len(), "Pushed batch to channel");
        self.tx
            .send(batch)
            .map_err(|_| Error::Execution("channel closed by consumer".into()))
    }

    /// Push the end-of-stream marker. Takes no slot and is never acked.
    pub fn push_finished(&self) -> Result<()> {
        self.tx
            .send(vec![Record::Finished])
            .map_err(|_| Error::Execution("channel closed by consumer".into()))
    }
}

/// Consumer half, held by the writer.
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Vec<Record>>,
    permits: Arc<Semaphore>,
    on_ack: AckFn,
}

impl ChannelReceiver {
    /// Fetch the next batch, suspending while the queue is empty. `None`
    /// when the producer is gone and the queue is drained.
    pub async fn fetch(&mut self) -> Option<Vec<Record>> {
        self.rx.recv().await
    }

    /// Acknowledge a fully applied batch: frees its slot and reports its
    /// data-record count to the progress counter.
    pub fn ack(&self, batch: &[Record]) {
        let data_records = batch
            .iter()
            .filter(|r| matches!(r, Record::Data(_)))
            .count() as u64;
        (self.on_ack)(data_records);
        self.permits.add_permits(1);
        trace!(records = data_records, "Acked batch");
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        // Unblocks a producer suspended on a full channel.
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use shardpipe_core::DataRecord;

    fn counter_ack() -> (AckFn, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        let ack: AckFn = Arc::new(move |n| {
            c.fetch_add(n, Ordering::SeqCst);
        });
        (ack, counter)
    }

    fn data_batch(table: &str, n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                Record::Data(DataRecord::insert(
                    table,
                    [("id".to_string(), serde_json::json!(i))].into_iter().collect(),
                ))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_push_fetch_ack_counts_data_records() {
        let (ack_fn, counter) = counter_ack();
        let (tx, mut rx) = channel(4, ack_fn);

        tx.push(data_batch("orders", 3)).await.unwrap();
        let batch = rx.fetch().await.unwrap();
        assert_eq!(batch.len(), 3);
        rx.ack(&batch);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_producer_blocks_until_ack() {
        let (ack_fn, _counter) = counter_ack();
        let (tx, mut rx) = channel(1, ack_fn);

        tx.push(data_batch("orders", 1)).await.unwrap();

        // Second push must block: the only slot is unacked.
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            tx.push(data_batch("orders", 1)),
        )
        .await;
        assert!(second.is_err(), "push should block while slot is unacked");

        let batch = rx.fetch().await.unwrap();
        rx.ack(&batch);

        // Slot freed, push goes through.
        tokio::time::timeout(Duration::from_millis(50), tx.push(data_batch("orders", 1)))
            .await
            .expect("push should proceed after ack")
            .unwrap();
    }

    #[tokio::test]
    async fn test_finished_marker_takes_no_slot_and_no_ack() {
        let (ack_fn, counter) = counter_ack();
        let (tx, mut rx) = channel(1, ack_fn);

        tx.push(data_batch("orders", 2)).await.unwrap();
        // Channel is "full", yet the end-of-stream marker still flows.
        tx.push_finished().unwrap();

        let data = rx.fetch().await.unwrap();
        rx.ack(&data);
        let finished = rx.fetch().await.unwrap();
        assert_eq!(finished, vec![Record::Finished]);
        // Marker never acked: counter only reflects the data batch.
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_push_after_consumer_dropped_errors() {
        let (ack_fn, _) = counter_ack();
        let (tx, rx) = channel(2, ack_fn);
        drop(rx);
        assert!(tx.push(data_batch("orders", 1)).await.is_err());
        assert!(tx.push_finished().is_err());
    }

    #[tokio::test]
    async fn test_fetch_none_after_producer_dropped() {
        let (ack_fn, _) = counter_ack();
        let (tx, mut rx) = channel(2, ack_fn);
        tx.push(data_batch("orders", 1)).await.unwrap();
        drop(tx);
        assert!(rx.fetch().await.is_some());
        assert!(rx.fetch().await.is_none());
    }
}
