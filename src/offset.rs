use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{channel::mpsc, StreamExt};
use kafka_protocol::{
    error::ParseResponseErrorCode,
    messages::{
        offset_commit_request::{OffsetCommitRequestPartition, OffsetCommitRequestTopic},
        offset_fetch_request::OffsetFetchRequestTopic,
        GroupId, OffsetCommitRequest, OffsetFetchRequest,
    },
};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::{
    broker::BrokerPool,
    config::Config,
    consumer::StartOffset,
    error::{Error, Result},
    metadata::TopicPartition,
    ToStrBytes,
};

/// Committed position of one (group, topic, partition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRecord {
    pub offset: i64,
    pub metadata: String,
}

/// Durable storage for committed offsets.
#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    async fn fetch(&self, group: &GroupId, tp: &TopicPartition) -> Result<Option<OffsetRecord>>;

    async fn commit(
        &self,
        group: &GroupId,
        tp: &TopicPartition,
        offset: i64,
        metadata: &str,
    ) -> Result<()>;
}

/// In-memory offset store. Service instances sharing one value see each
/// other's commits, which is what consumer handoff within a process needs.
#[derive(Default)]
pub struct MemoryOffsetStore {
    offsets: DashMap<(GroupId, TopicPartition), OffsetRecord>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn fetch(&self, group: &GroupId, tp: &TopicPartition) -> Result<Option<OffsetRecord>> {
        Ok(self
            .offsets
            .get(&(group.clone(), tp.clone()))
            .map(|record| record.clone()))
    }

    async fn commit(
        &self,
        group: &GroupId,
        tp: &TopicPartition,
        offset: i64,
        metadata: &str,
    ) -> Result<()> {
        self.offsets.insert(
            (group.clone(), tp.clone()),
            OffsetRecord {
                offset,
                metadata: metadata.to_string(),
            },
        );
        Ok(())
    }
}

/// Offset store backed by the cluster itself through the broker capability's
/// OffsetCommit/OffsetFetch pair.
pub struct KafkaOffsetStore {
    pool: Arc<BrokerPool>,
}

impl KafkaOffsetStore {
    pub fn new(pool: Arc<BrokerPool>) -> Self {
        Self { pool }
    }

    fn coordinator(&self) -> Result<String> {
        self.pool
            .bootstrap()
            .first()
            .cloned()
            .ok_or_else(|| Error::Custom("no bootstrap broker for offset requests".into()))
    }
}

#[async_trait]
impl OffsetStore for KafkaOffsetStore {
    async fn fetch(&self, group: &GroupId, tp: &TopicPartition) -> Result<Option<OffsetRecord>> {
        let mut request = OffsetFetchRequest::default();
        request.group_id = group.clone();
        let mut offset_fetch_topic = OffsetFetchRequestTopic::default();
        offset_fetch_topic.name = tp.topic.clone();
        offset_fetch_topic.partition_indexes = vec![tp.partition];
        request.topics = Some(vec![offset_fetch_topic]);

        let response = self.pool.offset_fetch(&self.coordinator()?, request).await?;
        if let Some(error) = response.error_code.err() {
            return Err(error.into());
        }
        for topic in response.topics {
            for partition in topic.partitions {
                if partition.partition_index != tp.partition {
                    continue;
                }
                if let Some(error) = partition.error_code.err() {
                    return Err(error.into());
                }
                if partition.committed_offset < 0 {
                    return Ok(None);
                }
                return Ok(Some(OffsetRecord {
                    offset: partition.committed_offset,
                    metadata: partition
                        .metadata
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_default(),
                }));
            }
        }
        Ok(None)
    }

    async fn commit(
        &self,
        group: &GroupId,
        tp: &TopicPartition,
        offset: i64,
        metadata: &str,
    ) -> Result<()> {
        let mut partition = OffsetCommitRequestPartition::default();
        partition.partition_index = tp.partition;
        partition.committed_offset = offset;
        partition.committed_leader_epoch = -1;
        partition.commit_timestamp = -1;
        partition.committed_metadata = Some(metadata.to_string().to_str_bytes());

        let mut request = OffsetCommitRequest::default();
        request.group_id = group.clone();
        request.generation_id = -1;
        request.retention_time_ms = -1;
        let mut offset_commit_topic = OffsetCommitRequestTopic::default();
        offset_commit_topic.name = tp.topic.clone();
        offset_commit_topic.partitions = vec![partition];
        request.topics = vec![offset_commit_topic];

        let response = self.pool.offset_commit(&self.coordinator()?, request).await?;
        for topic in response.topics {
            for partition in topic.partitions {
                if let Some(error) = partition.error_code.err() {
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct OffsetEntry {
    /// Next offset to commit; only ever advances.
    target: i64,
    /// Last value known to be in the store.
    committed: i64,
    metadata: String,
}

type GroupPartition = (GroupId, TopicPartition);

struct ManagerInner {
    store: Arc<dyn OffsetStore>,
    entries: DashMap<GroupPartition, OffsetEntry>,
    dirty_tx: mpsc::UnboundedSender<GroupPartition>,
    retry_backoff: Duration,
}

impl ManagerInner {
    /// Pushes the entry's latest target to the store. Retries until it lands;
    /// commit failures never propagate to consume callers.
    async fn commit_entry(&self, key: &GroupPartition) {
        loop {
            let (target, committed, metadata) = match self.entries.get(key) {
                Some(entry) => (entry.target, entry.committed, entry.metadata.clone()),
                None => return,
            };
            if target <= committed {
                return;
            }
            match self.store.commit(&key.0, &key.1, target, &metadata).await {
                Ok(()) => {
                    if let Some(mut entry) = self.entries.get_mut(key) {
                        if target > entry.committed {
                            entry.committed = target;
                        }
                    }
                    debug!("committed offset {target} for {}/{}", key.0 .0, key.1);
                    // a newer target may have arrived while committing
                }
                Err(e) => {
                    error!(
                        "offset commit failed for {}/{}: {e}, retrying",
                        key.0 .0, key.1
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }
}

/// Tracks the committed offset of every (group, topic, partition) in use.
/// Submissions are merged by latest and written through asynchronously;
/// `flush` forces a write-through inline.
#[derive(Clone)]
pub struct OffsetManager {
    inner: Arc<ManagerInner>,
}

impl OffsetManager {
    pub fn new(
        store: Arc<dyn OffsetStore>,
        config: &Config,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded();
        let inner = Arc::new(ManagerInner {
            store,
            entries: DashMap::new(),
            dirty_tx,
            retry_backoff: config.retry_backoff,
        });

        let committer = inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    key = dirty_rx.next() => match key {
                        Some(key) => committer.commit_entry(&key).await,
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
            debug!("offset committer finished");
        });

        Self { inner }
    }

    /// Committed offset at startup, falling back to the oldest available
    /// position when the store has none.
    pub async fn initial_offset(&self, group: &GroupId, tp: &TopicPartition) -> Result<StartOffset> {
        let key = (group.clone(), tp.clone());
        let record = self.inner.store.fetch(group, tp).await?;
        match record {
            Some(record) => {
                info!(
                    "resuming {}/{} from committed offset {}",
                    group.0, tp, record.offset
                );
                self.inner.entries.entry(key).or_insert(OffsetEntry {
                    target: record.offset,
                    committed: record.offset,
                    metadata: record.metadata,
                });
                Ok(StartOffset::At(record.offset))
            }
            None => {
                self.inner.entries.entry(key).or_insert(OffsetEntry {
                    target: -1,
                    committed: -1,
                    metadata: String::new(),
                });
                Ok(StartOffset::Oldest)
            }
        }
    }

    /// Records a new commit target. Regressions are ignored; progress is
    /// monotonic per partition.
    pub fn update(&self, group: &GroupId, tp: &TopicPartition, offset: i64) {
        let key = (group.clone(), tp.clone());
        let mut advanced = false;
        {
            let mut entry = self.inner.entries.entry(key.clone()).or_insert(OffsetEntry {
                target: -1,
                committed: -1,
                metadata: String::new(),
            });
            if offset > entry.target {
                entry.target = offset;
                advanced = true;
            }
        }
        if advanced {
            let _ = self.inner.dirty_tx.unbounded_send(key);
        }
    }

    /// Writes the partition's pending commit through before returning.
    pub async fn flush(&self, group: &GroupId, tp: &TopicPartition) {
        let key = (group.clone(), tp.clone());
        self.inner.commit_entry(&key).await;
    }

    /// Writes every pending commit through; called on service shutdown.
    pub async fn flush_all(&self) {
        let keys: Vec<GroupPartition> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.target > entry.committed)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.inner.commit_entry(&key).await;
        }
        if !self.inner.entries.is_empty() {
            debug!("flushed pending offset commits");
        }
    }
}
