use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::channel::oneshot;
use kafka_protocol::messages::{
    FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse, MetadataRequest,
    MetadataResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, RequestKind, ResponseKind,
};
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::{Error, Result, TransportError},
    metadata::Node,
};

/// One logical connection to one broker: a typed request goes in, the
/// matching typed response comes out. Wire encoding lives behind this trait
/// and is not this crate's concern.
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn send(&self, request: RequestKind) -> std::result::Result<ResponseKind, TransportError>;
}

/// Opens transports by broker address. The pool calls this lazily, once per
/// broker, and again after it drops a failed transport.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        addr: &str,
    ) -> std::result::Result<Arc<dyn BrokerTransport>, TransportError>;
}

type ConnectResult = std::result::Result<Arc<BrokerHandle>, TransportError>;

enum ConnectionStatus {
    Connected(Arc<BrokerHandle>),
    Connecting(Vec<oneshot::Sender<ConnectResult>>),
}

struct BrokerHandle {
    transport: Arc<dyn BrokerTransport>,
    // requests to one broker are serialized
    serial: futures::lock::Mutex<()>,
}

struct PoolInner {
    connector: Arc<dyn BrokerConnector>,
    bootstrap: Vec<String>,
    connections: Mutex<HashMap<String, ConnectionStatus>>,
    read_timeout: Duration,
    fetch_max_wait: Duration,
}

/// Maintains one transport per broker and routes typed requests to them.
/// A transport that errors or times out is dropped on the spot, so the next
/// request to that broker reconnects. Concurrent connection attempts to one
/// broker are coalesced, and the attempt itself runs detached: a caller that
/// gives up waiting never wedges the others.
pub struct BrokerPool {
    inner: Arc<PoolInner>,
}

impl BrokerPool {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        bootstrap: Vec<String>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                bootstrap,
                connections: Mutex::new(HashMap::new()),
                read_timeout: config.read_timeout,
                fetch_max_wait: config.fetch_max_wait,
            }),
        }
    }

    pub fn bootstrap(&self) -> &[String] {
        &self.inner.bootstrap
    }

    pub async fn invoke(
        &self,
        addr: &str,
        request: RequestKind,
    ) -> std::result::Result<ResponseKind, TransportError> {
        // a fetch legitimately parks at the broker for max_wait
        let budget = match request {
            RequestKind::FetchRequest(_) => self.inner.read_timeout + self.inner.fetch_max_wait,
            _ => self.inner.read_timeout,
        };
        let handle = self.get_or_connect(addr).await?;
        let _serial = handle.serial.lock().await;
        match tokio::time::timeout(budget, handle.transport.send(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!("request to broker {addr} failed: {e}");
                self.inner.disconnect(addr);
                Err(e)
            }
            Err(_) => {
                warn!("request to broker {addr} timed out after {budget:?}");
                self.inner.disconnect(addr);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn get_or_connect(&self, addr: &str) -> ConnectResult {
        let (tx, rx) = oneshot::channel();
        let spawn_connect = {
            let mut conns = self.inner.connections.lock().unwrap();
            match conns.get_mut(addr) {
                Some(ConnectionStatus::Connected(handle)) => return Ok(handle.clone()),
                Some(ConnectionStatus::Connecting(waiters)) => {
                    waiters.push(tx);
                    false
                }
                None => {
                    conns.insert(addr.to_string(), ConnectionStatus::Connecting(vec![tx]));
                    true
                }
            }
        };

        if spawn_connect {
            let inner = self.inner.clone();
            let addr = addr.to_string();
            tokio::spawn(async move {
                let connected = match tokio::time::timeout(
                    inner.read_timeout,
                    inner.connector.connect(&addr),
                )
                .await
                {
                    Ok(Ok(transport)) => Ok(Arc::new(BrokerHandle {
                        transport,
                        serial: futures::lock::Mutex::new(()),
                    })),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(TransportError::Timeout),
                };

                let mut conns = inner.connections.lock().unwrap();
                let waiters = match conns.remove(&addr) {
                    Some(ConnectionStatus::Connecting(waiters)) => waiters,
                    _ => Vec::new(),
                };
                match connected {
                    Ok(handle) => {
                        debug!("connected to broker {addr}");
                        conns.insert(addr.clone(), ConnectionStatus::Connected(handle.clone()));
                        for waiter in waiters {
                            let _ = waiter.send(Ok(handle.clone()));
                        }
                    }
                    Err(e) => {
                        for waiter in waiters {
                            let _ = waiter.send(Err(e.clone()));
                        }
                    }
                }
            });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Canceled),
        }
    }
}

impl PoolInner {
    fn disconnect(&self, addr: &str) {
        let mut conns = self.connections.lock().unwrap();
        if let Some(ConnectionStatus::Connected(_)) = conns.get(addr) {
            conns.remove(addr);
        }
    }
}

impl BrokerPool {
    pub async fn fetch(&self, node: &Node, request: FetchRequest) -> Result<FetchResponse> {
        let request = RequestKind::FetchRequest(request);
        let response = self.invoke(node.address(), request).await?;
        if let ResponseKind::FetchResponse(response) = response {
            Ok(response)
        } else {
            Err(Error::Transport(TransportError::UnexpectedResponse(
                format!("{response:?}"),
            )))
        }
    }

    pub async fn list_offsets(
        &self,
        node: &Node,
        request: ListOffsetsRequest,
    ) -> Result<ListOffsetsResponse> {
        let request = RequestKind::ListOffsetsRequest(request);
        let response = self.invoke(node.address(), request).await?;
        if let ResponseKind::ListOffsetsResponse(response) = response {
            Ok(response)
        } else {
            Err(Error::Transport(TransportError::UnexpectedResponse(
                format!("{response:?}"),
            )))
        }
    }

    pub async fn metadata(&self, addr: &str, request: MetadataRequest) -> Result<MetadataResponse> {
        let request = RequestKind::MetadataRequest(request);
        let response = self.invoke(addr, request).await?;
        if let ResponseKind::MetadataResponse(response) = response {
            Ok(response)
        } else {
            Err(Error::Transport(TransportError::UnexpectedResponse(
                format!("{response:?}"),
            )))
        }
    }

    pub async fn offset_commit(
        &self,
        addr: &str,
        request: OffsetCommitRequest,
    ) -> Result<OffsetCommitResponse> {
        let request = RequestKind::OffsetCommitRequest(request);
        let response = self.invoke(addr, request).await?;
        if let ResponseKind::OffsetCommitResponse(response) = response {
            Ok(response)
        } else {
            Err(Error::Transport(TransportError::UnexpectedResponse(
                format!("{response:?}"),
            )))
        }
    }

    pub async fn offset_fetch(
        &self,
        addr: &str,
        request: OffsetFetchRequest,
    ) -> Result<OffsetFetchResponse> {
        let request = RequestKind::OffsetFetchRequest(request);
        let response = self.invoke(addr, request).await?;
        if let ResponseKind::OffsetFetchResponse(response) = response {
            Ok(response)
        } else {
            Err(Error::Transport(TransportError::UnexpectedResponse(
                format!("{response:?}"),
            )))
        }
    }
}
