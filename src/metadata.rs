use std::{
    fmt::{Debug, Display, Formatter},
    sync::{Arc, Mutex},
    time::Duration,
};

use dashmap::DashMap;
use futures::channel::oneshot;
use kafka_protocol::{
    error::ParseResponseErrorCode,
    messages::{
        metadata_response::{MetadataResponseBroker, MetadataResponsePartition},
        BrokerId, MetadataRequest, MetadataResponse, TopicName,
    },
    protocol::StrBytes,
};
use tracing::{debug, warn};

use crate::{
    broker::BrokerPool,
    config::Config,
    error::{Error, Result},
    NodeId, PartitionId,
};

#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct Node {
    pub id: NodeId,
    address: String,
}

impl Node {
    pub fn new(id: BrokerId, host: StrBytes, port: i32) -> Self {
        Self {
            id: id.0,
            address: format!("{host}:{port}"),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl From<(&BrokerId, &MetadataResponseBroker)> for Node {
    fn from((id, broker): (&BrokerId, &MetadataResponseBroker)) -> Self {
        Node::new(*id, broker.host.clone(), broker.port)
    }
}

#[derive(Clone, Default, Eq, PartialEq, Hash)]
pub struct TopicPartition {
    pub topic: TopicName,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new(topic: TopicName, partition: PartitionId) -> Self {
        Self { topic, partition }
    }
}

impl Debug for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicPartition")
            .field("topic", &self.topic.0)
            .field("partition", &self.partition)
            .finish()
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "partition [{} - {}]", self.topic.0, self.partition)
    }
}

enum RefreshState {
    Idle,
    InFlight(Vec<oneshot::Sender<Result<()>>>),
}

struct CacheInner {
    pool: Arc<BrokerPool>,
    nodes: DashMap<NodeId, Node>,
    leaders: DashMap<TopicPartition, NodeId>,
    partitions: DashMap<TopicName, Vec<PartitionId>>,
    refresh_state: Mutex<RefreshState>,
    retry_backoff: Duration,
    retry_max: u32,
}

/// Snapshot of (broker id -> address) and (topic, partition -> leader).
/// Lookups that miss trigger a refresh. Refreshes are coalesced: every
/// concurrent caller subscribes to the single in-flight attempt, which runs
/// detached so an impatient caller cannot strand the rest.
pub struct MetadataCache {
    inner: Arc<CacheInner>,
}

impl MetadataCache {
    pub fn new(pool: Arc<BrokerPool>, config: &Config) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                pool,
                nodes: DashMap::new(),
                leaders: DashMap::new(),
                partitions: DashMap::new(),
                refresh_state: Mutex::new(RefreshState::Idle),
                retry_backoff: config.retry_backoff,
                retry_max: config.metadata_retry_max,
            }),
        }
    }

    /// Current leader of the partition, refreshing the snapshot if the
    /// mapping is absent.
    pub async fn leader(&self, tp: &TopicPartition) -> Result<Node> {
        if let Some(node) = self.inner.lookup_leader(tp) {
            return Ok(node);
        }
        self.refresh().await?;
        match self.inner.lookup_leader(tp) {
            Some(node) => Ok(node),
            None if self.inner.partitions.contains_key(&tp.topic) => {
                Err(Error::PartitionNotAvailable {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                })
            }
            None => Err(Error::TopicNotAvailable {
                topic: tp.topic.clone(),
            }),
        }
    }

    /// Sorted partition ids of the topic, refreshing if the topic is absent.
    pub async fn partitions(&self, topic: &TopicName) -> Result<Vec<PartitionId>> {
        if let Some(partitions) = self.inner.partitions.get(topic) {
            return Ok(partitions.clone());
        }
        self.refresh().await?;
        match self.inner.partitions.get(topic) {
            Some(partitions) => Ok(partitions.clone()),
            None => Err(Error::TopicNotAvailable {
                topic: topic.clone(),
            }),
        }
    }

    /// Drops the partition's leader mapping (and the topic's partition list)
    /// so the next lookup resolves against fresh cluster state.
    pub fn mark_stale(&self, tp: &TopicPartition) {
        debug!("marking metadata stale for {tp}");
        self.inner.leaders.remove(tp);
        self.inner.partitions.remove(&tp.topic);
    }

    async fn refresh(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let spawn_refresh = {
            let mut state = self.inner.refresh_state.lock().unwrap();
            match &mut *state {
                RefreshState::InFlight(waiters) => {
                    waiters.push(tx);
                    false
                }
                RefreshState::Idle => {
                    *state = RefreshState::InFlight(vec![tx]);
                    true
                }
            }
        };

        if spawn_refresh {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let result = inner.do_refresh().await;
                let waiters = {
                    let mut state = inner.refresh_state.lock().unwrap();
                    match std::mem::replace(&mut *state, RefreshState::Idle) {
                        RefreshState::InFlight(waiters) => waiters,
                        RefreshState::Idle => Vec::new(),
                    }
                };
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Custom("metadata refresh canceled".into())),
        }
    }
}

impl CacheInner {
    fn lookup_leader(&self, tp: &TopicPartition) -> Option<Node> {
        let leader = *self.leaders.get(tp)?;
        self.nodes.get(&leader).map(|node| node.clone())
    }

    async fn do_refresh(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.fetch_metadata().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry_max => {
                    attempt += 1;
                    warn!("metadata refresh failed (attempt {attempt}): {e}");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => {
                    warn!("metadata refresh gave up: {e}");
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_metadata(&self) -> Result<()> {
        let mut candidates: Vec<String> = self
            .nodes
            .iter()
            .map(|node| node.address().to_string())
            .collect();
        for addr in self.pool.bootstrap() {
            if !candidates.contains(addr) {
                candidates.push(addr.clone());
            }
        }

        let mut request = MetadataRequest::default();
        request.topics = None;
        request.allow_auto_topic_creation = false;

        let mut last_err = None;
        for addr in candidates {
            match self.pool.metadata(&addr, request.clone()).await {
                Ok(response) => {
                    self.merge(response);
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Custom("no brokers to query metadata from".into())))
    }

    fn merge(&self, response: MetadataResponse) {
        self.nodes.clear();
        for broker in response.brokers.iter() {
            self.nodes.insert(**broker.0, broker.into());
        }

        self.leaders.clear();
        self.partitions.clear();
        for (topic_name, topic) in response.topics.iter() {
            if !topic.error_code.is_ok() {
                debug!(
                    "metadata for topic {:?} carries error {:?}",
                    topic_name.0,
                    topic.error_code.err()
                );
                continue;
            }
            let mut ids: Vec<PartitionId> = Vec::with_capacity(topic.partitions.len());
            for partition in topic.partitions.iter() {
                if !partition.error_code.is_ok() {
                    continue;
                }
                ids.push(partition.partition_index);
                self.record_leader(topic_name, partition);
            }
            ids.sort_unstable();
            self.partitions.insert(topic_name.clone(), ids);
        }
        debug!(
            "metadata refreshed: {} brokers, {} topics",
            self.nodes.len(),
            self.partitions.len()
        );
    }

    fn record_leader(&self, topic: &TopicName, partition: &MetadataResponsePartition) {
        if partition.leader_id.0 < 0 {
            return;
        }
        let tp = TopicPartition::new(topic.clone(), partition.partition_index);
        self.leaders.insert(tp, partition.leader_id.0);
    }
}
