//! CDC sink manager: at-least-once change streaming to one consumer per job.
//!
//! A sink is created against a persisted subscription, then bound to exactly
//! one consumer connection at a time. Rebinding (a reconnecting consumer)
//! discards all outstanding unacked state; batches the old consumer never
//! acked are redelivered by the upstream capture position, not by this
//! module. Acks arriving for a gone sink and stops carrying a stale
//! connection id are swallowed: both are normal races around reconnects.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shardpipe_core::{
    defaults, CdcRequest, CoordinationStore, DataChangeBatch, DataRecord, Error, Result,
};

use crate::keys;

/// Lifecycle state of one CDC sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdcSinkState {
    Created,
    Streaming,
    Stopped,
}

struct SinkState {
    state: CdcSinkState,
    /// Connection currently owning the stream.
    connection_id: Option<Uuid>,
    sender: Option<mpsc::Sender<DataChangeBatch>>,
    /// Published but not yet acked batches.
    unacked: HashMap<Uuid, DataChangeBatch>,
}

impl SinkState {
    fn created() -> Self {
        Self {
            state: CdcSinkState::Created,
            connection_id: None,
            sender: None,
            unacked: HashMap::new(),
        }
    }
}

/// Manager for the CDC sinks of all jobs sharing one coordination store.
#[derive(Clone)]
pub struct CdcSinkManager {
    store: Arc<dyn CoordinationStore>,
    sinks: Arc<RwLock<HashMap<String, SinkState>>>,
    /// Global ack-id index: which job's sink an ack belongs to, and the
    /// waiter to wake.
    acks: Arc<RwLock<HashMap<Uuid, (String, Arc<Notify>)>>>,
    ack_timeout: Duration,
}

impl CdcSinkManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            sinks: Arc::new(RwLock::new(HashMap::new())),
            acks: Arc::new(RwLock::new(HashMap::new())),
            ack_timeout: Duration::from_secs(defaults::CDC_ACK_TIMEOUT_SECS),
        }
    }

    /// Override the publish ack wait (used by tests).
    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Create a sink for `job_id`, persisting its subscription.
    pub async fn create(&self, job_id: &str, request: &CdcRequest) -> Result<()> {
        if self.sinks.read().await.contains_key(job_id) {
            return Err(Error::Conflict(format!("CDC sink already exists: {job_id}")));
        }
        self.store
            .put(&keys::cdc_config(job_id), &serde_json::to_string(request)?)
            .await?;
        self.sinks
            .write()
            .await
            .insert(job_id.to_string(), SinkState::created());
        info!(job_id, database = %request.database, "Created CDC sink");
        Ok(())
    }

    /// Bind a consumer connection to the sink and start streaming.
    ///
    /// Rebinding replaces the previous connection and discards all unacked
    /// state; the displaced consumer's channel closes.
    pub async fn start(
        &self,
        job_id: &str,
    ) -> Result<(Uuid, mpsc::Receiver<DataChangeBatch>)> {
        let mut sinks = self.sinks.write().await;
        if !sinks.contains_key(job_id) {
            // A sink created by a previous process: rebuild from the
            // persisted subscription.
            if self.store.get(&keys::cdc_config(job_id)).await?.is_none() {
                return Err(Error::NotFound(format!("CDC sink: {job_id}")));
            }
        }
        let sink = sinks
            .entry(job_id.to_string())
            .or_insert_with(SinkState::created);

        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(defaults::CDC_QUEUE_CAPACITY);
        let rebind = sink.connection_id.is_some();
        sink.state = CdcSinkState::Streaming;
        sink.connection_id = Some(connection_id);
        sink.sender = Some(tx);
        sink.unacked.clear();
        drop(sinks);
        self.clear_job_acks(job_id).await;

        info!(job_id, connection_id = %connection_id, rebind, "CDC sink streaming");
        Ok((connection_id, rx))
    }

    /// Push one batch to the bound consumer and wait for its ack, bounded
    /// by the ack timeout. A timeout is soft: the batch stays unacked and
    /// the returned ack id remains valid.
    pub async fn publish(&self, job_id: &str, records: Vec<DataRecord>) -> Result<Uuid> {
        let batch = DataChangeBatch {
            ack_id: Uuid::new_v4(),
            records,
        };
        let notify = Arc::new(Notify::new());

        let sender = {
            let mut sinks = self.sinks.write().await;
            let sink = sinks
                .get_mut(job_id)
                .ok_or_else(|| Error::NotFound(format!("CDC sink: {job_id}")))?;
            if sink.state != CdcSinkState::Streaming {
                return Err(Error::Execution(format!(
                    "CDC sink not streaming: {job_id}"
                )));
            }
            sink.unacked.insert(batch.ack_id, batch.clone());
            sink.sender.clone().ok_or_else(|| {
                Error::Internal(format!("streaming CDC sink without a sender: {job_id}"))
            })?
        };
        self.acks
            .write()
            .await
            .insert(batch.ack_id, (job_id.to_string(), notify.clone()));

        let ack_id = batch.ack_id;
        // The queue send is bounded by the same timeout as the ack wait: a
        // consumer that stopped draining must not block publishers forever.
        match timeout(self.ack_timeout, sender.send(batch)).await {
            Err(_) => {
                warn!(job_id, ack_id = %ack_id, "CDC queue full past the ack timeout, batch stays unacked");
                return Ok(ack_id);
            }
            Ok(Err(_)) => {
                warn!(job_id, ack_id = %ack_id, "CDC consumer channel closed, batch stays unacked");
                return Ok(ack_id);
            }
            Ok(Ok(())) => {}
        }
        if timeout(self.ack_timeout, notify.notified()).await.is_err() {
            warn!(job_id, ack_id = %ack_id, "CDC ack timed out, batch stays unacked");
        }
        Ok(ack_id)
    }

    /// Acknowledge one batch. Unknown ack ids (the sink was rebound or
    /// dropped meanwhile) are swallowed.
    pub async fn ack(&self, ack_id: Uuid) {
        let entry = self.acks.write().await.remove(&ack_id);
        let Some((job_id, notify)) = entry else {
            debug!(ack_id = %ack_id, "Ignoring ack for unknown batch");
            return;
        };
        if let Some(sink) = self.sinks.write().await.get_mut(&job_id) {
            sink.unacked.remove(&ack_id);
        }
        notify.notify_one();
    }

    /// Stop streaming for the connection that owns the stream. A stale
    /// connection id (the stream was rebound since) is swallowed so a
    /// displaced consumer's late stop cannot kill its successor.
    pub async fn stop(&self, job_id: &str, connection_id: Uuid) -> Result<()> {
        let mut sinks = self.sinks.write().await;
        let Some(sink) = sinks.get_mut(job_id) else {
            return Ok(());
        };
        if sink.connection_id != Some(connection_id) {
            debug!(job_id, connection_id = %connection_id, "Ignoring stop from stale connection");
            return Ok(());
        }
        sink.state = CdcSinkState::Stopped;
        sink.connection_id = None;
        sink.sender = None;
        sink.unacked.clear();
        drop(sinks);
        self.clear_job_acks(job_id).await;
        info!(job_id, "CDC sink stopped");
        Ok(())
    }

    /// Remove the sink and purge its persisted subscription.
    pub async fn drop_sink(&self, job_id: &str) -> Result<()> {
        let existing = self.sinks.write().await.remove(job_id);
        if existing.is_none() && self.store.get(&keys::cdc_config(job_id)).await?.is_none() {
            return Err(Error::NotFound(format!("CDC sink: {job_id}")));
        }
        self.store.delete(&keys::cdc_config(job_id)).await?;
        self.clear_job_acks(job_id).await;
        info!(job_id, "Dropped CDC sink");
        Ok(())
    }

    /// Current sink state.
    pub async fn state(&self, job_id: &str) -> Result<CdcSinkState> {
        self.sinks
            .read()
            .await
            .get(job_id)
            .map(|sink| sink.state)
            .ok_or_else(|| Error::NotFound(format!("CDC sink: {job_id}")))
    }

    /// Number of published-but-unacked batches.
    pub async fn pending_count(&self, job_id: &str) -> usize {
        self.sinks
            .read()
            .await
            .get(job_id)
            .map(|sink| sink.unacked.len())
            .unwrap_or(0)
    }

    async fn clear_job_acks(&self, job_id: &str) {
        let mut acks = self.acks.write().await;
        acks.retain(|_, (owner, notify)| {
            if owner.as_str() == job_id {
                // Wake any publisher still waiting on a discarded batch.
                notify.notify_one();
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use shardpipe_db::fixtures::{int_row, MemoryCoordinationStore};

    fn request() -> CdcRequest {
        CdcRequest {
            database: "shop".into(),
            tables: vec!["orders".into()],
        }
    }

    fn insert(id: i64) -> DataRecord {
        DataRecord::insert("orders", int_row(&[("id", id)]))
    }

    fn manager() -> (CdcSinkManager, Arc<MemoryCoordinationStore>) {
        let store = Arc::new(MemoryCoordinationStore::new());
        let manager = CdcSinkManager::new(store.clone())
            .with_ack_timeout(Duration::from_millis(50));
        (manager, store)
    }

    #[tokio::test]
    async fn test_create_start_publish_ack() {
        let (manager, store) = manager();
        manager.create("j1", &request()).await.unwrap();
        assert_eq!(manager.state("j1").await.unwrap(), CdcSinkState::Created);
        assert!(store.get(&keys::cdc_config("j1")).await.unwrap().is_some());

        let (_connection, mut rx) = manager.start("j1").await.unwrap();
        assert_eq!(manager.state("j1").await.unwrap(), CdcSinkState::Streaming);

        // Consumer acks every delivered batch.
        let consumer_manager = manager.clone();
        let consumer = tokio::spawn(async move {
            let batch = rx.recv().await.unwrap();
            assert_eq!(batch.records.len(), 2);
            consumer_manager.ack(batch.ack_id).await;
            batch.ack_id
        });

        let ack_id = manager
            .publish("j1", vec![insert(1), insert(2)])
            .await
            .unwrap();
        assert_eq!(consumer.await.unwrap(), ack_id);
        assert_eq!(manager.pending_count("j1").await, 0);
    }

    #[tokio::test]
    async fn test_publish_without_streaming_fails() {
        let (manager, _) = manager();
        manager.create("j1", &request()).await.unwrap();
        let err = manager.publish("j1", vec![insert(1)]).await.unwrap_err();
        assert!(matches!(err, Error::Execution(_)));

        let err = manager.publish("ghost", vec![insert(1)]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ack_timeout_is_soft() {
        let (manager, _) = manager();
        manager.create("j1", &request()).await.unwrap();
        let (_connection, _rx) = manager.start("j1").await.unwrap();

        // Nobody acks: publish returns after the timeout with the batch
        // still pending.
        manager.publish("j1", vec![insert(1)]).await.unwrap();
        assert_eq!(manager.pending_count("j1").await, 1);
    }

    #[tokio::test]
    async fn test_publish_is_bounded_when_consumer_stops_draining() {
        let (manager, _) = manager();
        manager.create("j1", &request()).await.unwrap();
        // Consumer never reads: once the queue fills, each publish must
        // still return within its timeouts instead of blocking on the send.
        let (_connection, _rx) = manager.start("j1").await.unwrap();

        let total = defaults::CDC_QUEUE_CAPACITY + 1;
        let publishes = async {
            for i in 0..total {
                manager.publish("j1", vec![insert(i as i64)]).await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(10), publishes)
            .await
            .expect("publish must not block indefinitely on a full queue");
        assert_eq!(manager.pending_count("j1").await, total);
    }

    #[tokio::test]
    async fn test_rebind_discards_unacked_state() {
        let (manager, _) = manager();
        manager.create("j1", &request()).await.unwrap();
        let (first, _rx1) = manager.start("j1").await.unwrap();
        let ack_id = manager.publish("j1", vec![insert(1)]).await.unwrap();
        assert_eq!(manager.pending_count("j1").await, 1);

        let (second, _rx2) = manager.start("j1").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.pending_count("j1").await, 0);
        // Ack from the displaced consumer is swallowed.
        manager.ack(ack_id).await;
    }

    #[tokio::test]
    async fn test_stop_requires_owning_connection() {
        let (manager, _) = manager();
        manager.create("j1", &request()).await.unwrap();
        let (first, _rx1) = manager.start("j1").await.unwrap();
        let (second, _rx2) = manager.start("j1").await.unwrap();

        // The displaced consumer's late stop is ignored.
        manager.stop("j1", first).await.unwrap();
        assert_eq!(manager.state("j1").await.unwrap(), CdcSinkState::Streaming);

        manager.stop("j1", second).await.unwrap();
        assert_eq!(manager.state("j1").await.unwrap(), CdcSinkState::Stopped);
        assert!(manager.publish("j1", vec![insert(1)]).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_sink_purges_subscription() {
        let (manager, store) = manager();
        manager.create("j1", &request()).await.unwrap();
        manager.drop_sink("j1").await.unwrap();

        assert!(store.get(&keys::cdc_config("j1")).await.unwrap().is_none());
        assert!(matches!(
            manager.state("j1").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            manager.drop_sink("j1").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_create_conflicts() {
        let (manager, _) = manager();
        manager.create("j1", &request()).await.unwrap();
        assert!(matches!(
            manager.create("j1", &request()).await.unwrap_err(),
            Error::Conflict(_)
        ));
    }
}
