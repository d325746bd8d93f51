use std::sync::Arc;

use kafka_protocol::{
    messages::TopicName,
    protocol::{DecodeError, EncodeError},
    ResponseError,
};

use crate::metadata::Node;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub enum Error {
    Custom(String),
    Transport(TransportError),
    TopicNotAvailable {
        topic: TopicName,
    },
    PartitionNotAvailable {
        topic: TopicName,
        partition: i32,
    },
    NodeNotAvailable {
        node: Node,
    },
    Consume(ConsumeError),
    Response {
        error: ResponseError,
        msg: Option<String>,
    },
}

impl Error {
    /// True when a broker answered with a code that invalidates our leader
    /// mapping and is expected to clear up after a metadata refresh.
    pub(crate) fn is_leader_error(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::NodeNotAvailable { .. }
                | Error::Response {
                    error: ResponseError::NotLeaderOrFollower
                        | ResponseError::LeaderNotAvailable
                        | ResponseError::ReplicaNotAvailable
                        | ResponseError::KafkaStorageError
                        | ResponseError::FencedLeaderEpoch
                        | ResponseError::UnknownLeaderEpoch
                        | ResponseError::UnknownTopicOrPartition,
                    ..
                }
        )
    }

    pub(crate) fn is_unknown_topic(&self) -> bool {
        matches!(
            self,
            Error::TopicNotAvailable { .. }
                | Error::Response {
                    error: ResponseError::UnknownTopicOrPartition,
                    ..
                }
        )
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<ConsumeError> for Error {
    fn from(err: ConsumeError) -> Self {
        Self::Consume(err)
    }
}

impl From<EncodeError> for Error {
    fn from(_: EncodeError) -> Self {
        Error::Transport(TransportError::Encoding("encode error".into()))
    }
}

impl From<DecodeError> for Error {
    fn from(_: DecodeError) -> Self {
        Error::Transport(TransportError::Decoding("decode error".into()))
    }
}

impl From<ResponseError> for Error {
    fn from(error: ResponseError) -> Self {
        Error::Response { error, msg: None }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Custom(e) => write!(f, "{e}"),
            Error::Transport(e) => write!(f, "Transport error: {e}"),
            Error::Consume(e) => write!(f, "Consume error: {e}"),
            Error::PartitionNotAvailable { topic, partition } => {
                write!(f, "Partition {partition} not available, topic: {topic:?}")
            }
            Error::TopicNotAvailable { topic } => {
                write!(f, "Topic not available, topic: {topic:?}")
            }
            Error::NodeNotAvailable { node } => {
                write!(f, "Node not available, node: {node:?}")
            }
            Error::Response { error, msg } => write!(f, "Error code: {error:?}, msg: {msg:?}"),
        }
    }
}

impl std::error::Error for Error {}

/// Failures of a single broker transport. `Io` carries the error behind an
/// `Arc` so the value stays cloneable for coalesced metadata waiters.
#[derive(Debug, Clone)]
pub enum TransportError {
    Io(Arc<std::io::Error>),
    Disconnected,
    Unexpected(String),
    Decoding(String),
    Encoding(String),
    UnexpectedResponse(String),
    Canceled,
    Shutdown,
    Timeout,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "{e}"),
            TransportError::Disconnected => write!(f, "Disconnected"),
            TransportError::Unexpected(e) => write!(f, "{e}"),
            TransportError::Decoding(e) => write!(f, "Error decoding message: {e}"),
            TransportError::Encoding(e) => write!(f, "Error encoding message: {e}"),
            TransportError::UnexpectedResponse(e) => {
                write!(f, "Unexpected response from kafka: {e}")
            }
            TransportError::Canceled => write!(f, "Canceled request"),
            TransportError::Shutdown => write!(f, "The transport was shut down"),
            TransportError::Timeout => write!(f, "Request timeout"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The only error kinds a `consume` caller ever sees. Everything recoverable
/// is retried internally and never crosses the public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    /// No message became available within the long-polling timeout, or the
    /// caller's group+topic has no partitions assigned to this process.
    RequestTimeout,
    /// Internal queues are saturated; back off and retry.
    BufferOverflow,
    /// A broker explicitly reported the topic as nonexistent.
    UnknownTopic { topic: TopicName },
    /// The service is stopping.
    Shutdown,
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConsumeError::RequestTimeout => write!(f, "Long polling timeout"),
            ConsumeError::BufferOverflow => write!(f, "Consume request buffer overflow"),
            ConsumeError::UnknownTopic { topic } => write!(f, "Unknown topic: {:?}", topic.0),
            ConsumeError::Shutdown => write!(f, "The consumer service is shutting down"),
        }
    }
}

impl std::error::Error for ConsumeError {}
