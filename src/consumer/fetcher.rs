use std::sync::Arc;

use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use kafka_protocol::{
    error::ParseResponseErrorCode,
    messages::{
        fetch_request::{FetchPartition, FetchTopic},
        list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic},
        BrokerId, FetchRequest, ListOffsetsRequest,
    },
    records::{Record, RecordBatchDecoder},
    ResponseError,
};
use tracing::{debug, error, info, warn};

use crate::{
    broker::BrokerPool,
    config::Config,
    consumer::{ConsumerRecord, MuxEvent},
    error::{Error, Result},
    metadata::{MetadataCache, Node, TopicPartition},
};

const EARLIEST_TIMESTAMP: i64 = -2;
const LATEST_TIMESTAMP: i64 = -1;

/// Where a partition fetcher starts when no concrete offset is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    Oldest,
    Newest,
    At(i64),
}

/// A disruption observed by a partition fetcher. Only emitted when the error
/// channel is enabled; the fetch loop recovers on its own either way.
#[derive(Debug)]
pub struct PartitionError {
    pub partition: TopicPartition,
    pub error: Error,
}

impl std::fmt::Display for PartitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.partition, self.error)
    }
}

/// Single-partition consumer. Tracks the partition's leader, drives the
/// fetch loop and emits messages with strictly increasing offsets on a
/// bounded channel. Channel closure means the fetcher terminated and no more
/// messages are coming.
pub struct PartitionFetcher {
    partition: TopicPartition,
    messages: mpsc::Receiver<ConsumerRecord>,
    errors: Option<mpsc::Receiver<PartitionError>>,
    shutdown: Option<oneshot::Sender<()>>,
    done: oneshot::Receiver<()>,
}

impl PartitionFetcher {
    /// Creates the fetcher and spawns its fetch loop. The start offset is
    /// resolved up front: sentinels and out-of-range concrete offsets snap to
    /// the partition's oldest/newest available offset, and the concrete
    /// result is returned so the creator can persist it. Fails synchronously
    /// when the cluster does not know the topic or partition.
    pub async fn spawn(
        pool: Arc<BrokerPool>,
        metadata: Arc<MetadataCache>,
        config: Arc<Config>,
        partition: TopicPartition,
        start: StartOffset,
    ) -> Result<(Self, i64)> {
        Self::spawn_inner(pool, metadata, config, partition, start, None).await
    }

    pub(crate) async fn spawn_with_notify(
        pool: Arc<BrokerPool>,
        metadata: Arc<MetadataCache>,
        config: Arc<Config>,
        partition: TopicPartition,
        start: StartOffset,
        notify: mpsc::UnboundedSender<MuxEvent>,
    ) -> Result<(Self, i64)> {
        Self::spawn_inner(pool, metadata, config, partition, start, Some(notify)).await
    }

    async fn spawn_inner(
        pool: Arc<BrokerPool>,
        metadata: Arc<MetadataCache>,
        config: Arc<Config>,
        partition: TopicPartition,
        start: StartOffset,
        notify: Option<mpsc::UnboundedSender<MuxEvent>>,
    ) -> Result<(Self, i64)> {
        let leader = metadata.leader(&partition).await?;
        let oldest = offset_at(&pool, &leader, &partition, EARLIEST_TIMESTAMP).await?;
        let newest = offset_at(&pool, &leader, &partition, LATEST_TIMESTAMP).await?;
        let resolved = match start {
            StartOffset::Oldest => oldest,
            StartOffset::Newest => newest,
            StartOffset::At(offset) if offset < oldest => oldest,
            StartOffset::At(offset) if offset > newest => newest,
            StartOffset::At(offset) => offset,
        };
        debug!(
            "start offset for {partition} resolved to {resolved} (oldest {oldest}, newest {newest})"
        );

        let (messages_tx, messages_rx) = mpsc::channel(config.channel_buffer_size);
        let (errors_tx, errors_rx) = if config.return_errors {
            let (tx, rx) = mpsc::channel(config.channel_buffer_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let fetch_loop = FetchLoop {
            pool,
            metadata,
            config,
            partition: partition.clone(),
            next_offset: resolved,
            messages: messages_tx,
            errors: errors_tx,
            notify,
        };
        tokio::spawn(fetch_loop.run(shutdown_rx, done_tx));

        Ok((
            Self {
                partition,
                messages: messages_rx,
                errors: errors_rx,
                shutdown: Some(shutdown_tx),
                done: done_rx,
            },
            resolved,
        ))
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Ordered message stream. `None` means the fetcher terminated.
    pub fn messages(&mut self) -> &mut mpsc::Receiver<ConsumerRecord> {
        &mut self.messages
    }

    /// Disruption stream; present only with `Config.return_errors`.
    pub fn errors(&mut self) -> Option<&mut mpsc::Receiver<PartitionError>> {
        self.errors.as_mut()
    }

    /// Signals the fetch loop to stop and waits for it to wind down. Any
    /// fetched but undelivered messages are discarded.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.done.await;
    }
}

enum FetchOutcome {
    /// Nothing new; fetch again right away.
    Continue,
    Deliver(Vec<ConsumerRecord>),
    /// The requested offset fell out of the partition's range; terminal.
    Closed,
}

struct FetchLoop {
    pool: Arc<BrokerPool>,
    metadata: Arc<MetadataCache>,
    config: Arc<Config>,
    partition: TopicPartition,
    next_offset: i64,
    messages: mpsc::Sender<ConsumerRecord>,
    errors: Option<mpsc::Sender<PartitionError>>,
    notify: Option<mpsc::UnboundedSender<MuxEvent>>,
}

impl FetchLoop {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>, done: oneshot::Sender<()>) {
        debug!(
            "fetcher for {} starting at offset {}",
            self.partition, self.next_offset
        );
        'outer: loop {
            // resolve the current leader, backing off while none is known
            let leader = loop {
                let resolved = tokio::select! {
                    _ = &mut shutdown => break 'outer,
                    resolved = self.metadata.leader(&self.partition) => resolved,
                };
                match resolved {
                    Ok(node) => break node,
                    Err(e) => {
                        warn!("no leader available for {}: {e}", self.partition);
                        self.report(e);
                        if self.pause(&mut shutdown).await {
                            break 'outer;
                        }
                    }
                }
            };

            loop {
                let outcome = tokio::select! {
                    _ = &mut shutdown => break 'outer,
                    outcome = self.fetch_once(&leader) => outcome,
                };
                match outcome {
                    Ok(FetchOutcome::Continue) => {}
                    Ok(FetchOutcome::Deliver(records)) => {
                        if self.deliver(records, &mut shutdown).await.is_err() {
                            break 'outer;
                        }
                    }
                    Ok(FetchOutcome::Closed) => {
                        info!(
                            "offset {} is out of range for {}, shutting down",
                            self.next_offset, self.partition
                        );
                        break 'outer;
                    }
                    Err(e) if e.is_leader_error() => {
                        warn!("fetch for {} disrupted: {e}", self.partition);
                        self.report(e);
                        self.metadata.mark_stale(&self.partition);
                        if self.pause(&mut shutdown).await {
                            break 'outer;
                        }
                        continue 'outer;
                    }
                    Err(e) => {
                        error!("fetch for {} failed: {e}", self.partition);
                        self.report(e);
                        if self.pause(&mut shutdown).await {
                            break 'outer;
                        }
                    }
                }
            }
        }
        debug!("fetcher for {} stopped", self.partition);
        let _ = done.send(());
    }

    async fn fetch_once(&mut self, leader: &Node) -> Result<FetchOutcome> {
        let response = self.pool.fetch(leader, self.fetch_request()).await?;
        let data = response
            .responses
            .into_iter()
            .filter(|topic| topic.topic == self.partition.topic)
            .flat_map(|topic| topic.partitions)
            .find(|p| p.partition_index == self.partition.partition)
            .ok_or_else(|| Error::PartitionNotAvailable {
                topic: self.partition.topic.clone(),
                partition: self.partition.partition,
            })?;

        match data.error_code.err() {
            None => {
                let Some(mut records) = data.records else {
                    return Ok(FetchOutcome::Continue);
                };
                if records.is_empty() {
                    return Ok(FetchOutcome::Continue);
                }
                let records = RecordBatchDecoder::decode(&mut records)?;
                // brokers may hand back the head of a compressed batch, so
                // anything before next_offset is dropped here
                let deliverable: Vec<ConsumerRecord> = records
                    .into_iter()
                    .filter(|record| record.offset >= self.next_offset)
                    .map(|record| self.convert(record, data.high_watermark))
                    .collect();
                if deliverable.is_empty() {
                    Ok(FetchOutcome::Continue)
                } else {
                    debug!(
                        "fetched {} records for {} from offset {}",
                        deliverable.len(),
                        self.partition,
                        self.next_offset
                    );
                    Ok(FetchOutcome::Deliver(deliverable))
                }
            }
            Some(ResponseError::OffsetOutOfRange) => Ok(FetchOutcome::Closed),
            Some(error) => Err(error.into()),
        }
    }

    /// Pushes records out in order, bumping next_offset as each one is
    /// accepted. Returns Err when the loop should stop.
    async fn deliver(
        &mut self,
        records: Vec<ConsumerRecord>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> std::result::Result<(), ()> {
        for record in records {
            let offset = record.offset;
            tokio::select! {
                _ = &mut *shutdown => return Err(()),
                sent = self.messages.send(record) => {
                    if sent.is_err() {
                        return Err(());
                    }
                }
            }
            self.next_offset = offset + 1;
            if let Some(notify) = &self.notify {
                let _ = notify.unbounded_send(MuxEvent::Ready(self.partition.partition));
            }
        }
        Ok(())
    }

    fn fetch_request(&self) -> FetchRequest {
        let mut partition = FetchPartition::default();
        partition.partition = self.partition.partition;
        partition.fetch_offset = self.next_offset;
        partition.partition_max_bytes = self.config.fetch_max_partition_bytes;
        partition.current_leader_epoch = -1;
        partition.log_start_offset = -1;

        let mut topic = FetchTopic::default();
        topic.topic = self.partition.topic.clone();
        topic.partitions = vec![partition];

        let mut request = FetchRequest::default();
        request.replica_id = BrokerId(-1);
        request.max_wait_ms = self.config.fetch_max_wait.as_millis() as i32;
        request.min_bytes = self.config.fetch_min_bytes;
        request.max_bytes = self.config.fetch_max_bytes;
        request.session_epoch = -1;
        request.topics = vec![topic];
        request
    }

    fn convert(&self, record: Record, high_water_mark: i64) -> ConsumerRecord {
        ConsumerRecord {
            topic: self.partition.topic.clone(),
            partition: self.partition.partition,
            offset: record.offset,
            key: record.key,
            value: record.value,
            high_water_mark,
        }
    }

    fn report(&mut self, error: Error) {
        if let Some(errors) = &mut self.errors {
            let record = PartitionError {
                partition: self.partition.clone(),
                error,
            };
            // best effort: observers that fall behind lose error records,
            // never fetch progress
            let _ = errors.try_send(record);
        }
    }

    /// Sleeps for the retry backoff; true when shutdown arrived instead.
    async fn pause(&self, shutdown: &mut oneshot::Receiver<()>) -> bool {
        tokio::select! {
            _ = &mut *shutdown => true,
            _ = tokio::time::sleep(self.config.retry_backoff) => false,
        }
    }
}

async fn offset_at(
    pool: &BrokerPool,
    leader: &Node,
    tp: &TopicPartition,
    timestamp: i64,
) -> Result<i64> {
    let mut partition = ListOffsetsPartition::default();
    partition.partition_index = tp.partition;
    partition.current_leader_epoch = -1;
    partition.timestamp = timestamp;

    let mut topic = ListOffsetsTopic::default();
    topic.name = tp.topic.clone();
    topic.partitions = vec![partition];

    let mut request = ListOffsetsRequest::default();
    request.replica_id = BrokerId(-1);
    request.isolation_level = 0;
    request.topics = vec![topic];

    let response = pool.list_offsets(leader, request).await?;
    let data = response
        .topics
        .into_iter()
        .filter(|topic| topic.name == tp.topic)
        .flat_map(|topic| topic.partitions)
        .find(|p| p.partition_index == tp.partition)
        .ok_or_else(|| Error::PartitionNotAvailable {
            topic: tp.topic.clone(),
            partition: tp.partition,
        })?;
    if let Some(error) = data.error_code.err() {
        return Err(error.into());
    }
    Ok(data.offset)
}
