use std::collections::{HashMap, HashSet, VecDeque};

use futures::{
    channel::{mpsc, oneshot},
    future::FutureExt,
    StreamExt,
};
use kafka_protocol::messages::{GroupId, TopicName};
use tokio::{
    sync::broadcast,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    consumer::{
        assignor::resolve_assignments,
        fetcher::PartitionFetcher,
        ConsumerRecord, DispatcherHandle, MuxEvent, ServiceContext,
    },
    error::ConsumeError,
    metadata::TopicPartition,
    registry::Members,
    PartitionId,
};

pub(crate) type ConsumeReply = oneshot::Sender<Result<ConsumerRecord, ConsumeError>>;

pub(crate) enum DispatcherCmd {
    Consume { reply: ConsumeReply },
}

struct Parked {
    reply: ConsumeReply,
    deadline: Instant,
}

enum Wake {
    Cmd(Option<DispatcherCmd>),
    Membership,
    Event(Option<MuxEvent>),
    Timer,
    Shutdown,
}

/// Serves `consume` requests for one (group, topic): owns the partition
/// fetchers matching the current assignment, parks requests while no message
/// is ready and reacts to membership changes.
///
/// The dispatcher registers with the group lazily on the first request and
/// deregisters again after `registration_timeout` without caller activity;
/// after a further idle interval the task retires entirely and the router
/// recreates it on demand.
pub(crate) struct Dispatcher {
    ctx: ServiceContext,
    group: GroupId,
    topic: TopicName,
    group_str: String,
    topic_str: String,
    registered: bool,
    members: Members,
    assigned: Vec<PartitionId>,
    fetchers: HashMap<PartitionId, PartitionFetcher>,
    draining: HashSet<PartitionId>,
    /// Successor fetchers decided on but parked until the draining
    /// predecessor of the same partition has terminated.
    cold: HashSet<PartitionId>,
    pending: VecDeque<Parked>,
    cursor: usize,
    last_activity: Instant,
    events_tx: mpsc::UnboundedSender<MuxEvent>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        ctx: ServiceContext,
        group_str: String,
        topic_str: String,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> DispatcherHandle {
        let buffer = ctx.config.channel_buffer_size;
        let (cmd_tx, cmd_rx) = mpsc::channel(buffer);
        let (events_tx, events_rx) = mpsc::unbounded();
        let (done_tx, done_rx) = oneshot::channel();
        let members_rx = ctx.registry.watch(&group_str, &topic_str);
        let members = members_rx.borrow().clone();

        let dispatcher = Dispatcher {
            group: crate::group_id(&group_str),
            topic: crate::topic_name(&topic_str),
            group_str,
            topic_str,
            ctx,
            registered: false,
            members,
            assigned: Vec::new(),
            fetchers: HashMap::new(),
            draining: HashSet::new(),
            cold: HashSet::new(),
            pending: VecDeque::new(),
            cursor: 0,
            last_activity: Instant::now(),
            events_tx,
        };
        tokio::spawn(dispatcher.run(cmd_rx, events_rx, members_rx, shutdown_rx, done_tx));

        DispatcherHandle {
            cmd_tx,
            done: done_rx.map(|_| ()).boxed().shared(),
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<DispatcherCmd>,
        mut events_rx: mpsc::UnboundedReceiver<MuxEvent>,
        mut members_rx: tokio::sync::watch::Receiver<Members>,
        mut shutdown_rx: broadcast::Receiver<()>,
        done_tx: oneshot::Sender<()>,
    ) {
        info!("dispatcher for [{}/{}] started", self.group_str, self.topic_str);
        loop {
            let deadline = self.next_deadline();
            let wake = tokio::select! {
                cmd = cmd_rx.next() => Wake::Cmd(cmd),
                changed = members_rx.changed() => match changed {
                    Ok(()) => Wake::Membership,
                    Err(_) => Wake::Shutdown,
                },
                event = events_rx.next() => Wake::Event(event),
                _ = sleep_until(deadline) => Wake::Timer,
                _ = shutdown_rx.recv() => Wake::Shutdown,
            };
            match wake {
                Wake::Cmd(Some(DispatcherCmd::Consume { reply })) => {
                    self.handle_consume(reply).await;
                }
                Wake::Cmd(None) | Wake::Shutdown => {
                    self.shutdown(&mut cmd_rx, &mut events_rx).await;
                    break;
                }
                Wake::Membership => {
                    self.members = members_rx.borrow_and_update().clone();
                    debug!(
                        "membership of [{}/{}] is now {:?}",
                        self.group_str, self.topic_str, self.members
                    );
                    self.apply_assignment().await;
                }
                Wake::Event(Some(event)) => self.handle_event(event).await,
                Wake::Event(None) => {}
                Wake::Timer => {
                    if self.handle_timer().await {
                        // retire: reject whatever raced into the queue
                        cmd_rx.close();
                        while let Ok(Some(DispatcherCmd::Consume { reply })) = cmd_rx.try_next() {
                            let _ = reply.send(Err(ConsumeError::RequestTimeout));
                        }
                        break;
                    }
                }
            }
        }
        info!("dispatcher for [{}/{}] finished", self.group_str, self.topic_str);
        let _ = done_tx.send(());
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.last_activity + self.ctx.config.registration_timeout;
        if let Some(front) = self.pending.front() {
            deadline = deadline.min(front.deadline);
        }
        deadline
    }

    async fn handle_consume(&mut self, reply: ConsumeReply) {
        self.last_activity = Instant::now();
        if !self.registered {
            match self
                .ctx
                .registry
                .register(&self.group_str, &self.topic_str, &self.ctx.member_id)
                .await
            {
                Ok(()) => {
                    self.registered = true;
                    self.apply_assignment().await;
                }
                Err(e) => {
                    // the request parks and the next one retries registration
                    warn!(
                        "registration of [{}/{}] failed: {e}",
                        self.group_str, self.topic_str
                    );
                }
            }
        }

        self.pending.retain(|parked| !parked.reply.is_canceled());
        if self.pending.len() >= self.ctx.config.channel_buffer_size {
            debug!(
                "pending queue of [{}/{}] is full",
                self.group_str, self.topic_str
            );
            let _ = reply.send(Err(ConsumeError::BufferOverflow));
            return;
        }
        self.pending.push_back(Parked {
            reply,
            deadline: Instant::now() + self.ctx.config.long_polling_timeout,
        });
        self.drain_ready();
    }

    async fn handle_event(&mut self, event: MuxEvent) {
        match event {
            MuxEvent::Ready(_) => self.drain_ready(),
            MuxEvent::Drained(partition) => {
                self.draining.remove(&partition);
                if self.cold.remove(&partition)
                    && self.assigned.contains(&partition)
                    && !self.fetchers.contains_key(&partition)
                {
                    debug!("predecessor of partition {partition} drained, starting successor");
                    self.spawn_fetcher(partition).await;
                }
            }
            MuxEvent::RetrySpawn(partition) => {
                if self.assigned.contains(&partition)
                    && !self.fetchers.contains_key(&partition)
                    && !self.draining.contains(&partition)
                {
                    self.spawn_fetcher(partition).await;
                }
            }
        }
    }

    /// Expires parked requests and drives the registration / retirement
    /// timers. Returns true when the dispatcher should retire.
    async fn handle_timer(&mut self) -> bool {
        let now = Instant::now();
        while self
            .pending
            .front()
            .map(|front| front.deadline <= now)
            .unwrap_or(false)
        {
            if let Some(parked) = self.pending.pop_front() {
                let _ = parked.reply.send(Err(ConsumeError::RequestTimeout));
            }
        }

        if self.pending.is_empty() && now >= self.last_activity + self.ctx.config.registration_timeout
        {
            if self.registered {
                self.deregister().await;
            } else if self.fetchers.is_empty() && self.draining.is_empty() {
                info!(
                    "dispatcher for [{}/{}] idle, retiring",
                    self.group_str, self.topic_str
                );
                return true;
            } else {
                // still draining; check again a full interval later
                self.last_activity = now;
            }
        }
        false
    }

    async fn deregister(&mut self) {
        info!(
            "no requests for [{}/{}] within the registration timeout, deregistering",
            self.group_str, self.topic_str
        );
        // land this dispatcher's pending commits before peers can pick the
        // partitions up
        for partition in self.assigned.clone() {
            let tp = TopicPartition::new(self.topic.clone(), partition);
            self.ctx.offsets.flush(&self.group, &tp).await;
        }
        if let Err(e) = self
            .ctx
            .registry
            .unregister(&self.group_str, &self.topic_str, &self.ctx.member_id)
            .await
        {
            warn!("deregistration of [{}/{}] failed: {e}", self.group_str, self.topic_str);
        }
        self.registered = false;
        self.last_activity = Instant::now();
        self.apply_target(Vec::new());
    }

    async fn apply_assignment(&mut self) {
        let in_group = self.registered && self.members.iter().any(|m| *m == self.ctx.member_id);
        let partitions = if in_group {
            match self.ctx.metadata.partitions(&self.topic).await {
                Ok(partitions) => partitions,
                Err(e) if e.is_unknown_topic() => {
                    debug!("topic {:?} has no metadata: {e}", self.topic_str);
                    Vec::new()
                }
                Err(e) => {
                    warn!("partition lookup for {:?} failed: {e}", self.topic_str);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let target = resolve_assignments(&partitions, &self.members)
            .remove(&self.ctx.member_id)
            .unwrap_or_default();
        info!(
            "assignment of [{}/{}] for member {} is now {:?}",
            self.group_str, self.topic_str, self.ctx.member_id, target
        );
        self.apply_target(target);
        for partition in self.assigned.clone() {
            if !self.fetchers.contains_key(&partition) && !self.draining.contains(&partition) {
                self.spawn_fetcher(partition).await;
            }
        }
        self.drain_ready();
    }

    /// Reconciles the fetcher set with the target assignment. Fetchers that
    /// lost their partition start draining; additions blocked by a draining
    /// predecessor are parked in `cold` and spawned once it signals
    /// termination.
    fn apply_target(&mut self, target: Vec<PartitionId>) {
        let current: Vec<PartitionId> = self.fetchers.keys().copied().collect();
        for partition in current {
            if !target.contains(&partition) {
                self.begin_stop(partition);
            }
        }
        self.cold.retain(|partition| target.contains(partition));
        for &partition in &target {
            if self.draining.contains(&partition) && self.cold.insert(partition) {
                debug!("successor for partition {partition} parked until predecessor drains");
            }
        }
        self.assigned = target;
        self.cursor = 0;
    }

    fn begin_stop(&mut self, partition: PartitionId) {
        if let Some(fetcher) = self.fetchers.remove(&partition) {
            debug!(
                "stopping fetcher for partition {partition} of {:?}",
                self.topic_str
            );
            self.draining.insert(partition);
            let offsets = self.ctx.offsets.clone();
            let group = self.group.clone();
            let tp = TopicPartition::new(self.topic.clone(), partition);
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                fetcher.stop().await;
                offsets.flush(&group, &tp).await;
                let _ = events.unbounded_send(MuxEvent::Drained(tp.partition));
            });
        }
    }

    async fn spawn_fetcher(&mut self, partition: PartitionId) {
        if self.cold.contains(&partition) {
            return;
        }
        let tp = TopicPartition::new(self.topic.clone(), partition);
        let start = match self.ctx.offsets.initial_offset(&self.group, &tp).await {
            Ok(start) => start,
            Err(e) => {
                warn!("initial offset lookup for {tp} failed: {e}");
                self.schedule_spawn_retry(partition);
                return;
            }
        };
        let spawned = PartitionFetcher::spawn_with_notify(
            self.ctx.pool.clone(),
            self.ctx.metadata.clone(),
            self.ctx.config.clone(),
            tp.clone(),
            start,
            self.events_tx.clone(),
        )
        .await;
        match spawned {
            Ok((fetcher, resolved)) => {
                self.ctx.offsets.update(&self.group, &tp, resolved);
                self.fetchers.insert(partition, fetcher);
            }
            Err(e) if e.is_unknown_topic() => {
                warn!("broker rejected {tp}: {e}");
                self.fail_pending(ConsumeError::UnknownTopic {
                    topic: self.topic.clone(),
                });
            }
            Err(e) => {
                warn!("could not start fetcher for {tp}: {e}");
                self.schedule_spawn_retry(partition);
            }
        }
    }

    fn schedule_spawn_retry(&self, partition: PartitionId) {
        let events = self.events_tx.clone();
        let backoff = self.ctx.config.retry_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = events.unbounded_send(MuxEvent::RetrySpawn(partition));
        });
    }

    fn fail_pending(&mut self, error: ConsumeError) {
        for parked in self.pending.drain(..) {
            let _ = parked.reply.send(Err(error.clone()));
        }
    }

    /// Matches buffered messages with parked requests, rotating over the
    /// assigned partitions so no single partition monopolizes the callers.
    fn drain_ready(&mut self) {
        'outer: loop {
            while let Some(front) = self.pending.front() {
                if front.reply.is_canceled() {
                    self.pending.pop_front();
                } else {
                    break;
                }
            }
            if self.pending.is_empty() || self.assigned.is_empty() {
                return;
            }

            let n = self.assigned.len();
            for i in 0..n {
                let idx = (self.cursor + i) % n;
                let partition = self.assigned[idx];
                let Some(fetcher) = self.fetchers.get_mut(&partition) else {
                    continue;
                };
                match fetcher.messages().try_next() {
                    Ok(Some(record)) => {
                        self.cursor = (idx + 1) % n;
                        let Some(parked) = self.pending.pop_front() else {
                            return;
                        };
                        let offset = record.offset;
                        if parked.reply.send(Ok(record)).is_ok() {
                            let tp = TopicPartition::new(self.topic.clone(), partition);
                            self.ctx.offsets.update(&self.group, &tp, offset + 1);
                            self.last_activity = Instant::now();
                        } else {
                            // the caller is gone; the message stays
                            // uncommitted and a future fetcher re-fetches it
                            debug!(
                                "request canceled, dropping offset {offset} of partition {partition} uncommitted"
                            );
                        }
                        continue 'outer;
                    }
                    Ok(None) => {
                        debug!(
                            "fetcher for partition {partition} of {:?} terminated",
                            self.topic_str
                        );
                        self.fetchers.remove(&partition);
                    }
                    Err(_) => {}
                }
            }
            return;
        }
    }

    async fn shutdown(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<DispatcherCmd>,
        events_rx: &mut mpsc::UnboundedReceiver<MuxEvent>,
    ) {
        info!(
            "dispatcher for [{}/{}] shutting down",
            self.group_str, self.topic_str
        );
        self.fail_pending(ConsumeError::Shutdown);
        cmd_rx.close();
        while let Ok(Some(DispatcherCmd::Consume { reply })) = cmd_rx.try_next() {
            let _ = reply.send(Err(ConsumeError::Shutdown));
        }

        let current: Vec<PartitionId> = self.fetchers.keys().copied().collect();
        for partition in current {
            self.begin_stop(partition);
        }
        while !self.draining.is_empty() {
            match events_rx.next().await {
                Some(MuxEvent::Drained(partition)) => {
                    self.draining.remove(&partition);
                }
                Some(_) => {}
                None => break,
            }
        }

        if self.registered {
            let _ = self
                .ctx
                .registry
                .unregister(&self.group_str, &self.topic_str, &self.ctx.member_id)
                .await;
            self.registered = false;
        }
    }
}
