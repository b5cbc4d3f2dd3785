//! Snapshot reader: streams one work unit's rows into the channel.
//!
//! Issues one (optionally range-filtered) paged query per work unit and
//! pushes rows downstream as insert records. Query resources are scoped
//! inside the data source's `fetch_rows` and released on every exit path,
//! including error. There is no mid-range checkpoint: a restarted unit
//! re-reads its range from the beginning.

use std::sync::Arc;

use tracing::{debug, info};

use shardpipe_core::{DataRecord, PipelineDataSource, Record, Result, WorkUnit};

use crate::channel::ChannelSender;
use crate::coordinator::CancelFlag;

/// Reader half of one work unit's pipeline.
pub struct SnapshotReader {
    source: Arc<dyn PipelineDataSource>,
    unit: WorkUnit,
    pk_column: Option<String>,
    batch_size: usize,
}

impl SnapshotReader {
    pub fn new(
        source: Arc<dyn PipelineDataSource>,
        unit: WorkUnit,
        pk_column: Option<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            unit,
            pk_column,
            batch_size,
        }
    }

    /// Stream the unit's rows until exhausted or cancelled, then push the
    /// end-of-stream marker. Errors are propagated to the coordinator; the
    /// reader itself never retries.
    pub async fn run(self, tx: ChannelSender, cancel: CancelFlag) -> Result<()> {
        let mut offset = 0u64;
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                info!(
                    table = %self.unit.table,
                    work_unit = self.unit.index,
                    "Reader stopping cooperatively"
                );
                break;
            }
            let rows = self
                .source
                .fetch_rows(
                    &self.unit.table,
                    self.pk_column.as_deref(),
                    self.unit.range,
                    offset,
                    self.batch_size,
                )
                .await?;
            if rows.is_empty() {
                break;
            }
            offset += rows.len() as u64;
            total += rows.len() as u64;
            let batch: Vec<Record> = rows
                .into_iter()
                .map(|row| Record::Data(DataRecord::insert(self.unit.table.clone(), row)))
                .collect();
            tx.push(batch).await?;
        }
        tx.push_finished()?;
        debug!(
            table = %self.unit.table,
            work_unit = self.unit.index,
            records = total,
            "Reader finished"
        );
        Ok(())
    }
}
