#![allow(clippy::mutable_key_type)]

use bytes::Bytes;
use kafka_protocol::{messages::TopicName, protocol::StrBytes};

mod broker;
pub use broker::{BrokerConnector, BrokerPool, BrokerTransport};

mod config;
pub use config::Config;

mod consumer;
pub use consumer::{
    ConsumerRecord, MuxConsumer, PartitionError, PartitionFetcher, StartOffset,
};
pub use consumer::assignor::resolve_assignments;

mod error;
pub use error::{ConsumeError, Error, Result, TransportError};

mod metadata;
pub use metadata::{MetadataCache, Node, TopicPartition};

mod offset;
pub use offset::{KafkaOffsetStore, MemoryOffsetStore, OffsetManager, OffsetRecord, OffsetStore};

mod registry;
pub use registry::{GroupRegistry, LocalRegistry};

// typed kafka surface consumed by transport implementations
pub use kafka_protocol;
pub use kafka_protocol::{
    messages::{GroupId, RequestKind, ResponseKind},
    ResponseError,
};

pub type NodeId = i32;
pub type PartitionId = i32;

pub trait ToStrBytes {
    fn to_str_bytes(self) -> StrBytes;
}

impl ToStrBytes for String {
    fn to_str_bytes(self) -> StrBytes {
        unsafe { StrBytes::from_utf8_unchecked(Bytes::from(self)) }
    }
}

pub fn topic_name<S: AsRef<str>>(topic: S) -> TopicName {
    let topic = topic.as_ref().to_string().to_str_bytes();
    TopicName(topic)
}

pub fn group_id<S: AsRef<str>>(group: S) -> GroupId {
    let group = group.as_ref().to_string().to_str_bytes();
    GroupId(group)
}
