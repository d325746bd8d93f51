pub mod assignor;
mod dispatcher;
mod fetcher;

pub use fetcher::{PartitionError, PartitionFetcher, StartOffset};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{
    channel::{mpsc, oneshot},
    future::{BoxFuture, Shared},
};
use kafka_protocol::messages::TopicName;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::{
    broker::{BrokerConnector, BrokerPool},
    config::Config,
    consumer::dispatcher::{Dispatcher, DispatcherCmd},
    error::{ConsumeError, Result},
    metadata::MetadataCache,
    offset::{KafkaOffsetStore, OffsetManager, OffsetStore},
    registry::GroupRegistry,
    PartitionId,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One message handed to a consume caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: TopicName,
    pub partition: PartitionId,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub high_water_mark: i64,
}

/// Internal dispatcher wake-ups: a fetcher buffered a message, a draining
/// fetcher terminated, or a failed fetcher spawn wants another attempt.
pub(crate) enum MuxEvent {
    Ready(PartitionId),
    Drained(PartitionId),
    RetrySpawn(PartitionId),
}

/// Capabilities shared by every dispatcher of one service instance.
#[derive(Clone)]
pub(crate) struct ServiceContext {
    pub(crate) config: Arc<Config>,
    pub(crate) pool: Arc<BrokerPool>,
    pub(crate) metadata: Arc<MetadataCache>,
    pub(crate) offsets: OffsetManager,
    pub(crate) registry: Arc<dyn GroupRegistry>,
    pub(crate) member_id: String,
}

#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    pub(crate) cmd_tx: mpsc::Sender<DispatcherCmd>,
    pub(crate) done: Shared<BoxFuture<'static, ()>>,
}

struct ServiceInner {
    ctx: ServiceContext,
    dispatchers: DashMap<(String, String), DispatcherHandle>,
    notify_shutdown: broadcast::Sender<()>,
    stopping: AtomicBool,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        let _ = self.notify_shutdown.send(());
    }
}

/// Multiplexing consumer service. Callers pull one message at a time from a
/// (group, topic) and the service maintains group membership, partition
/// fetchers and committed offsets behind the scenes.
///
/// Cloning is cheap; all clones drive the same service instance.
#[derive(Clone)]
pub struct MuxConsumer {
    inner: Arc<ServiceInner>,
}

impl MuxConsumer {
    /// Creates a service that keeps committed offsets in the cluster itself
    /// via OffsetCommit/OffsetFetch.
    pub async fn new(
        connector: Arc<dyn BrokerConnector>,
        bootstrap: Vec<String>,
        registry: Arc<dyn GroupRegistry>,
        config: Config,
    ) -> Result<MuxConsumer> {
        let config = Arc::new(config);
        let pool = Arc::new(BrokerPool::new(connector, bootstrap, &config));
        let store = Arc::new(KafkaOffsetStore::new(pool.clone()));
        Ok(Self::build(pool, registry, store, config))
    }

    /// Same service with an external offset store capability.
    pub async fn with_offset_store(
        connector: Arc<dyn BrokerConnector>,
        bootstrap: Vec<String>,
        registry: Arc<dyn GroupRegistry>,
        store: Arc<dyn OffsetStore>,
        config: Config,
    ) -> Result<MuxConsumer> {
        let config = Arc::new(config);
        let pool = Arc::new(BrokerPool::new(connector, bootstrap, &config));
        Ok(Self::build(pool, registry, store, config))
    }

    fn build(
        pool: Arc<BrokerPool>,
        registry: Arc<dyn GroupRegistry>,
        store: Arc<dyn OffsetStore>,
        config: Arc<Config>,
    ) -> MuxConsumer {
        let (notify_shutdown, _) = broadcast::channel(1);
        let metadata = Arc::new(MetadataCache::new(pool.clone(), &config));
        let offsets = OffsetManager::new(store, &config, notify_shutdown.subscribe());
        let member_id = format!("{}-{}", config.client_id, Uuid::new_v4());
        info!("consumer service starting as member {member_id}");

        let inner = Arc::new(ServiceInner {
            ctx: ServiceContext {
                config,
                pool,
                metadata,
                offsets,
                registry,
                member_id,
            },
            dispatchers: DashMap::new(),
            notify_shutdown,
            stopping: AtomicBool::new(false),
        });

        // prune handles of dispatchers that retired on their own
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        inner.dispatchers.retain(|_, handle| !handle.cmd_tx.is_closed());
                    }
                    None => break,
                }
            }
        });

        MuxConsumer { inner }
    }

    pub fn member_id(&self) -> &str {
        &self.inner.ctx.member_id
    }

    /// Returns the next message from one of the partitions currently
    /// assigned to this process under the group, parking the request up to
    /// the long-polling timeout when none is buffered.
    pub async fn consume<G, T>(
        &self,
        group: G,
        topic: T,
    ) -> std::result::Result<ConsumerRecord, ConsumeError>
    where
        G: AsRef<str>,
        T: AsRef<str>,
    {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(ConsumeError::Shutdown);
        }
        let key = (group.as_ref().to_string(), topic.as_ref().to_string());

        // a dispatcher can retire between lookup and send; one retry against
        // a freshly spawned one covers that window
        for _ in 0..2 {
            let handle = self
                .inner
                .dispatchers
                .entry(key.clone())
                .or_insert_with(|| {
                    Dispatcher::spawn(
                        self.inner.ctx.clone(),
                        key.0.clone(),
                        key.1.clone(),
                        self.inner.notify_shutdown.subscribe(),
                    )
                })
                .clone();

            let (reply_tx, reply_rx) = oneshot::channel();
            let mut cmd_tx = handle.cmd_tx.clone();
            match cmd_tx.try_send(DispatcherCmd::Consume { reply: reply_tx }) {
                Ok(()) => match reply_rx.await {
                    Ok(result) => return result,
                    Err(_) => {
                        if self.inner.stopping.load(Ordering::Acquire) {
                            return Err(ConsumeError::Shutdown);
                        }
                        self.remove_if_dead(&key);
                    }
                },
                Err(e) if e.is_full() => return Err(ConsumeError::BufferOverflow),
                Err(_) => self.remove_if_dead(&key),
            }
        }
        Err(ConsumeError::RequestTimeout)
    }

    fn remove_if_dead(&self, key: &(String, String)) {
        self.inner
            .dispatchers
            .remove_if(key, |_, handle| handle.cmd_tx.is_closed());
    }

    /// Stops the service: dispatchers deregister and stop their fetchers,
    /// pending commits are flushed, and the call returns once everything has
    /// drained. Safe to call more than once.
    pub async fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        let _ = self.inner.notify_shutdown.send(());

        let draining: Vec<_> = self
            .inner
            .dispatchers
            .iter()
            .map(|entry| entry.done.clone())
            .collect();
        for done in draining {
            done.await;
        }
        self.inner.ctx.offsets.flush_all().await;
        info!("consumer service stopped");
    }
}
