//! Batch writer: drains the channel and applies grouped writes.
//!
//! Buffers records up to the configured batch size, applies each buffer as
//! one grouped write with a bounded per-batch retry count, then acks the
//! drained channel batches upstream. Exceeding the retry limit fails the
//! work unit; batches already applied are not rolled back and sibling units
//! are unaffected. The cancellation flag is checked only between batches —
//! there is no mid-batch abort.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use shardpipe_core::{DataRecord, Error, PipelineDataSource, Record, Result, SinkConfig};

use crate::channel::ChannelReceiver;
use crate::coordinator::CancelFlag;

/// Writer half of one work unit's pipeline.
pub struct BatchWriter {
    target: Arc<dyn PipelineDataSource>,
    sink: SinkConfig,
}

impl BatchWriter {
    pub fn new(target: Arc<dyn PipelineDataSource>, sink: SinkConfig) -> Self {
        Self { target, sink }
    }

    /// Drain the channel until the end-of-stream marker arrives.
    pub async fn run(&self, mut rx: ChannelReceiver, cancel: CancelFlag) -> Result<()> {
        // Records buffered toward the next grouped write, and the channel
        // batches they came from. Channel batches are acked only after
        // their records are durably applied.
        let mut buffer: Vec<DataRecord> = Vec::new();
        let mut pending_acks: Vec<Vec<Record>> = Vec::new();

        loop {
            let stop = cancel.is_cancelled();
            let batch = match rx.fetch().await {
                Some(batch) => batch,
                None => {
                    return Err(Error::Execution(
                        "channel closed before end-of-stream marker".into(),
                    ))
                }
            };

            let mut finished = false;
            let mut has_data = false;
            for record in &batch {
                match record {
                    Record::Data(data) => {
                        has_data = true;
                        buffer.push(data.clone());
                    }
                    Record::Finished => finished = true,
                }
            }
            if has_data {
                pending_acks.push(batch);
            }

            if buffer.len() >= self.sink.write_batch_size || finished || stop {
                self.flush(&mut buffer, &mut pending_acks, &rx).await?;
            }
            if finished {
                debug!("Writer saw end-of-stream marker");
                return Ok(());
            }
            if stop {
                debug!("Writer stopping cooperatively after in-flight batch");
                return Ok(());
            }
        }
    }

    /// Apply the buffered records as one grouped write, then ack the
    /// channel batches they came from.
    async fn flush(
        &self,
        buffer: &mut Vec<DataRecord>,
        pending_acks: &mut Vec<Vec<Record>>,
        rx: &ChannelReceiver,
    ) -> Result<()> {
        if !buffer.is_empty() {
            self.apply_with_retry(buffer).await?;
            buffer.clear();
        }
        for batch in pending_acks.drain(..) {
            rx.ack(&batch);
        }
        Ok(())
    }

    /// Apply one batch, retrying up to the configured limit with backoff.
    async fn apply_with_retry(&self, records: &[DataRecord]) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.target.apply_batch(records).await {
                Ok(()) => {
                    debug!(records = records.len(), attempt, "Applied batch");
                    return Ok(());
                }
                Err(e) if attempt < self.sink.max_retries => {
                    attempt += 1;
                    warn!(
                        records = records.len(),
                        attempt,
                        max_retries = self.sink.max_retries,
                        error = %e,
                        "Batch apply failed, retrying"
                    );
                    sleep(Duration::from_millis(self.sink.retry_backoff_ms)).await;
                }
                Err(e) => {
                    return Err(Error::Execution(format!(
                        "batch apply failed after {} retries: {e}",
                        self.sink.max_retries
                    )));
                }
            }
        }
    }
}
