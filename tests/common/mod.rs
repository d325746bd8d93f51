#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use kafka_mux::{
    kafka_protocol::{
        messages::{
            fetch_response::{FetchableTopicResponse, PartitionData},
            list_offsets_response::{ListOffsetsPartitionResponse, ListOffsetsTopicResponse},
            metadata_response::{MetadataResponseBroker, MetadataResponsePartition},
            offset_commit_response::{OffsetCommitResponsePartition, OffsetCommitResponseTopic},
            offset_fetch_response::{OffsetFetchResponsePartition, OffsetFetchResponseTopic},
            BrokerId, FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
            MetadataResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
            OffsetFetchResponse, TopicName,
        },
        records::{
            Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
        },
    },
    topic_name, BrokerConnector, BrokerTransport, ConsumeError, ConsumerRecord, MuxConsumer,
    RequestKind, ResponseError, ResponseKind, ToStrBytes, TransportError,
};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
struct PartitionLog {
    records: BTreeMap<i64, (Option<Bytes>, Option<Bytes>)>,
    oldest_override: Option<i64>,
    newest_override: Option<i64>,
    high_water_mark: Option<i64>,
}

impl PartitionLog {
    fn oldest(&self) -> i64 {
        self.oldest_override
            .unwrap_or_else(|| self.records.keys().next().copied().unwrap_or(0))
    }

    fn log_end(&self) -> i64 {
        self.newest_override
            .unwrap_or_else(|| self.records.keys().last().map(|o| o + 1).unwrap_or(0))
    }

    fn high_water_mark(&self) -> i64 {
        self.high_water_mark.unwrap_or_else(|| self.log_end())
    }
}

#[derive(Default)]
struct ClusterState {
    brokers: Mutex<Vec<(i32, String)>>,
    down: Mutex<HashSet<i32>>,
    leaders: Mutex<HashMap<(String, i32), i32>>,
    logs: Mutex<HashMap<(String, i32), PartitionLog>>,
    fetch_errors: Mutex<HashMap<(i32, String, i32), ResponseError>>,
    group_offsets: Mutex<HashMap<(String, String, i32), (i64, String)>>,
    /// When set, fetch responses start at the head of the stored log rather
    /// than the requested offset, the way a compressed batch would.
    serve_from_log_start: Mutex<bool>,
    fetch_limit: Mutex<usize>,
}

/// In-memory stand-in for a Kafka cluster: implements the typed broker
/// transport against shared partition logs, with switchable leadership,
/// per-broker error injection and broker outages.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<ClusterState>,
}

impl MockCluster {
    pub fn new() -> Self {
        let cluster = MockCluster::default();
        *cluster.state.fetch_limit.lock().unwrap() = 5;
        cluster
    }

    pub fn add_broker(&self, id: i32) -> String {
        let addr = format!("broker-{id}:9092");
        self.state.brokers.lock().unwrap().push((id, addr.clone()));
        addr
    }

    pub fn bootstrap(&self) -> Vec<String> {
        self.state
            .brokers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, addr)| addr.clone())
            .collect()
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    pub fn set_leader(&self, topic: &str, partition: i32, node: i32) {
        self.state
            .leaders
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition), node);
        self.state
            .logs
            .lock()
            .unwrap()
            .entry((topic.to_string(), partition))
            .or_default();
    }

    pub fn produce(&self, topic: &str, partition: i32, base: i64, values: &[&str]) {
        let mut logs = self.state.logs.lock().unwrap();
        let log = logs.entry((topic.to_string(), partition)).or_default();
        for (i, value) in values.iter().enumerate() {
            log.records.insert(
                base + i as i64,
                (None, Some(Bytes::copy_from_slice(value.as_bytes()))),
            );
        }
    }

    pub fn produce_at(&self, topic: &str, partition: i32, entries: &[(i64, &str)]) {
        let mut logs = self.state.logs.lock().unwrap();
        let log = logs.entry((topic.to_string(), partition)).or_default();
        for (offset, value) in entries {
            log.records.insert(
                *offset,
                (None, Some(Bytes::copy_from_slice(value.as_bytes()))),
            );
        }
    }

    pub fn set_offsets(&self, topic: &str, partition: i32, oldest: i64, newest: i64) {
        let mut logs = self.state.logs.lock().unwrap();
        let log = logs.entry((topic.to_string(), partition)).or_default();
        log.oldest_override = Some(oldest);
        log.newest_override = Some(newest);
    }

    pub fn set_high_water_mark(&self, topic: &str, partition: i32, hwm: i64) {
        let mut logs = self.state.logs.lock().unwrap();
        let log = logs.entry((topic.to_string(), partition)).or_default();
        log.high_water_mark = Some(hwm);
    }

    pub fn set_fetch_error(&self, node: i32, topic: &str, partition: i32, error: ResponseError) {
        self.state
            .fetch_errors
            .lock()
            .unwrap()
            .insert((node, topic.to_string(), partition), error);
    }

    pub fn clear_fetch_error(&self, node: i32, topic: &str, partition: i32) {
        self.state
            .fetch_errors
            .lock()
            .unwrap()
            .remove(&(node, topic.to_string(), partition));
    }

    /// Keeps the topic in metadata but makes brokers reject its offsets and
    /// fetches with UnknownTopicOrPartition.
    pub fn remove_log(&self, topic: &str, partition: i32) {
        self.state
            .logs
            .lock()
            .unwrap()
            .remove(&(topic.to_string(), partition));
    }

    pub fn set_down(&self, node: i32, down: bool) {
        let mut set = self.state.down.lock().unwrap();
        if down {
            set.insert(node);
        } else {
            set.remove(&node);
        }
    }

    pub fn set_serve_from_log_start(&self, enabled: bool) {
        *self.state.serve_from_log_start.lock().unwrap() = enabled;
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .group_offsets
            .lock()
            .unwrap()
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|(offset, _)| *offset)
    }
}

struct MockConnector {
    state: Arc<ClusterState>,
}

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(
        &self,
        addr: &str,
    ) -> Result<Arc<dyn BrokerTransport>, TransportError> {
        let node = self
            .state
            .brokers
            .lock()
            .unwrap()
            .iter()
            .find(|(_, a)| a == addr)
            .map(|(id, _)| *id)
            .ok_or_else(|| TransportError::Unexpected(format!("unknown broker {addr}")))?;
        if self.state.down.lock().unwrap().contains(&node) {
            return Err(TransportError::Disconnected);
        }
        Ok(Arc::new(MockTransport {
            node,
            state: self.state.clone(),
        }))
    }
}

struct MockTransport {
    node: i32,
    state: Arc<ClusterState>,
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn send(&self, request: RequestKind) -> Result<ResponseKind, TransportError> {
        if self.state.down.lock().unwrap().contains(&self.node) {
            return Err(TransportError::Disconnected);
        }
        match request {
            RequestKind::MetadataRequest(_) => {
                Ok(ResponseKind::MetadataResponse(self.metadata()))
            }
            RequestKind::ListOffsetsRequest(request) => {
                Ok(ResponseKind::ListOffsetsResponse(self.list_offsets(request)))
            }
            RequestKind::FetchRequest(request) => {
                Ok(ResponseKind::FetchResponse(self.fetch(request).await))
            }
            RequestKind::OffsetCommitRequest(request) => {
                Ok(ResponseKind::OffsetCommitResponse(self.offset_commit(request)))
            }
            RequestKind::OffsetFetchRequest(request) => {
                Ok(ResponseKind::OffsetFetchResponse(self.offset_fetch(request)))
            }
            other => Err(TransportError::Unexpected(format!(
                "unsupported request: {other:?}"
            ))),
        }
    }
}

impl MockTransport {
    fn metadata(&self) -> MetadataResponse {
        let mut response = MetadataResponse::default();
        for (id, addr) in self.state.brokers.lock().unwrap().iter() {
            let (host, port) = addr.split_once(':').unwrap();
            let mut broker = MetadataResponseBroker::default();
            broker.host = host.to_string().to_str_bytes();
            broker.port = port.parse().unwrap();
            response.brokers.insert(BrokerId(*id), broker);
        }
        response.controller_id = BrokerId(self.node);

        for ((topic, partition), leader) in self.state.leaders.lock().unwrap().iter() {
            let entry = response.topics.entry(topic_name(topic)).or_default();
            let mut p = MetadataResponsePartition::default();
            p.partition_index = *partition;
            p.leader_id = BrokerId(*leader);
            entry.partitions.push(p);
        }
        response
    }

    fn list_offsets(&self, request: ListOffsetsRequest) -> ListOffsetsResponse {
        let logs = self.state.logs.lock().unwrap();
        let mut response = ListOffsetsResponse::default();
        for topic in request.topics {
            let mut partitions = Vec::new();
            for partition in topic.partitions {
                let mut p = ListOffsetsPartitionResponse::default();
                p.partition_index = partition.partition_index;
                p.timestamp = -1;
                match logs.get(&(topic.name.to_string(), partition.partition_index)) {
                    Some(log) => {
                        p.offset = match partition.timestamp {
                            -2 => log.oldest(),
                            _ => log.log_end(),
                        };
                    }
                    None => {
                        p.error_code = ResponseError::UnknownTopicOrPartition.code();
                    }
                }
                partitions.push(p);
            }
            let mut topic_response = ListOffsetsTopicResponse::default();
            topic_response.name = topic.name;
            topic_response.partitions = partitions;
            response.topics.push(topic_response);
        }
        response
    }

    async fn fetch(&self, request: FetchRequest) -> FetchResponse {
        let mut response = FetchResponse::default();
        let mut served_records = false;
        for topic in &request.topics {
            let mut partitions = Vec::new();
            for partition in &topic.partitions {
                let data =
                    self.fetch_partition(&topic.topic, partition.partition, partition.fetch_offset);
                if data.records.is_some() {
                    served_records = true;
                }
                partitions.push(data);
            }
            let mut topic_response = FetchableTopicResponse::default();
            topic_response.topic = topic.topic.clone();
            topic_response.partitions = partitions;
            response.responses.push(topic_response);
        }
        if !served_records {
            // emulate broker-side long polling so empty fetches don't spin
            let max_wait = Duration::from_millis((request.max_wait_ms.max(0) as u64).min(100));
            tokio::time::sleep(max_wait).await;
        }
        response
    }

    fn fetch_partition(&self, topic: &TopicName, partition: i32, fetch_offset: i64) -> PartitionData {
        let mut data = PartitionData::default();
        data.partition_index = partition;

        let key = (self.node, topic.to_string(), partition);
        if let Some(error) = self.state.fetch_errors.lock().unwrap().get(&key) {
            data.error_code = error.code();
            return data;
        }

        let logs = self.state.logs.lock().unwrap();
        let Some(log) = logs.get(&(topic.to_string(), partition)) else {
            data.error_code = ResponseError::UnknownTopicOrPartition.code();
            return data;
        };
        if fetch_offset < log.oldest() || fetch_offset > log.log_end() {
            data.error_code = ResponseError::OffsetOutOfRange.code();
            return data;
        }

        data.high_watermark = log.high_water_mark();
        data.last_stable_offset = log.high_water_mark();
        data.log_start_offset = log.oldest();

        let from = if *self.state.serve_from_log_start.lock().unwrap() {
            i64::MIN
        } else {
            fetch_offset
        };
        let limit = *self.state.fetch_limit.lock().unwrap();
        let batch: Vec<Record> = log
            .records
            .range(from.max(log.records.keys().next().copied().unwrap_or(0))..)
            .take(limit)
            .map(|(offset, (key, value))| Record {
                transactional: false,
                control: false,
                partition_leader_epoch: 0,
                producer_id: -1,
                producer_epoch: -1,
                timestamp_type: TimestampType::Creation,
                offset: *offset,
                sequence: *offset as i32,
                timestamp: 0,
                key: key.clone(),
                value: value.clone(),
                headers: Default::default(),
            })
            .collect();
        if !batch.is_empty() && batch.iter().any(|record| record.offset >= fetch_offset) {
            let mut buf = BytesMut::new();
            RecordBatchEncoder::encode(
                &mut buf,
                batch.iter(),
                &RecordEncodeOptions {
                    version: 2,
                    compression: Compression::None,
                },
            )
            .expect("record batch encoding");
            data.records = Some(buf.freeze());
        }
        data
    }

    fn offset_commit(&self, request: OffsetCommitRequest) -> OffsetCommitResponse {
        let mut offsets = self.state.group_offsets.lock().unwrap();
        let mut response = OffsetCommitResponse::default();
        let group = request.group_id.0.to_string();
        for topic in request.topics {
            let mut partitions = Vec::new();
            for partition in topic.partitions {
                offsets.insert(
                    (group.clone(), topic.name.to_string(), partition.partition_index),
                    (
                        partition.committed_offset,
                        partition
                            .committed_metadata
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_default(),
                    ),
                );
                let mut p = OffsetCommitResponsePartition::default();
                p.partition_index = partition.partition_index;
                partitions.push(p);
            }
            let mut topic_response = OffsetCommitResponseTopic::default();
            topic_response.name = topic.name;
            topic_response.partitions = partitions;
            response.topics.push(topic_response);
        }
        response
    }

    fn offset_fetch(&self, request: OffsetFetchRequest) -> OffsetFetchResponse {
        let offsets = self.state.group_offsets.lock().unwrap();
        let mut response = OffsetFetchResponse::default();
        let group = request.group_id.0.to_string();
        for topic in request.topics.unwrap_or_default() {
            let mut partitions = Vec::new();
            for partition in topic.partition_indexes {
                let mut p = OffsetFetchResponsePartition::default();
                p.partition_index = partition;
                match offsets.get(&(group.clone(), topic.name.to_string(), partition)) {
                    Some((offset, metadata)) => {
                        p.committed_offset = *offset;
                        p.metadata = Some(metadata.clone().to_str_bytes());
                    }
                    None => p.committed_offset = -1,
                }
                partitions.push(p);
            }
            let mut topic_response = OffsetFetchResponseTopic::default();
            topic_response.name = topic.name;
            topic_response.partitions = partitions;
            response.topics.push(topic_response);
        }
        response
    }
}

/// Drains a consumer until a long poll times out, grouping what it got by
/// partition.
pub async fn consume_all(
    consumer: &MuxConsumer,
    group: &str,
    topic: &str,
) -> HashMap<i32, Vec<ConsumerRecord>> {
    let mut consumed: HashMap<i32, Vec<ConsumerRecord>> = HashMap::new();
    loop {
        match consumer.consume(group, topic).await {
            Ok(record) => consumed.entry(record.partition).or_default().push(record),
            Err(ConsumeError::RequestTimeout) => return consumed,
            Err(e) => panic!("unexpected consume error: {e}"),
        }
    }
}

pub fn record_value(record: &ConsumerRecord) -> String {
    String::from_utf8(record.value.clone().unwrap_or_default().to_vec()).unwrap()
}
